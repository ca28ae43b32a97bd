//! Conditioning signals
//!
//! A [`Conditioning`] is one guidance target: the prompt embedding plus
//! named attachments (image-conditioning latent, its mask, vision
//! embedding). It is immutable; [`Conditioning::with_values`] returns a new
//! signal, so one sampling run can share both signals by reference.

use std::collections::BTreeMap;
use std::fmt;

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::config::{latent_frames_for, TEMPORAL_COMPRESSION};
use crate::error::{ConfigError, SampleError};
use crate::imageops;
use crate::model::VideoVae;

/// Names of conditioning attachments
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttachmentKey {
    ConcatLatentImage,
    ConcatMask,
    ClipVisionOutput,
}

impl AttachmentKey {
    pub fn name(&self) -> &'static str {
        match self {
            AttachmentKey::ConcatLatentImage => "concat_latent_image",
            AttachmentKey::ConcatMask => "concat_mask",
            AttachmentKey::ClipVisionOutput => "clip_vision_output",
        }
    }
}

impl fmt::Display for AttachmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Attachment payload
#[derive(Debug, Clone)]
pub enum Attachment<B: Backend> {
    /// Latent-shaped tensor `[1, C, T, H, W]`
    Latent(Tensor<B, 5>),
    /// Token embedding `[1, L, D]`
    Embedding(Tensor<B, 3>),
}

/// One guidance target
#[derive(Debug, Clone)]
pub struct Conditioning<B: Backend> {
    embedding: Tensor<B, 3>,
    attachments: BTreeMap<AttachmentKey, Attachment<B>>,
}

impl<B: Backend> Conditioning<B> {
    /// Conditioning from a prompt embedding `[1, L, D]`
    pub fn new(embedding: Tensor<B, 3>) -> Self {
        Self {
            embedding,
            attachments: BTreeMap::new(),
        }
    }

    /// Copy of this signal with the given attachments set or replaced
    pub fn with_values(&self, values: impl IntoIterator<Item = (AttachmentKey, Attachment<B>)>) -> Self {
        let mut attachments = self.attachments.clone();
        attachments.extend(values);
        Self {
            embedding: self.embedding.clone(),
            attachments,
        }
    }

    pub fn embedding(&self) -> &Tensor<B, 3> {
        &self.embedding
    }

    pub fn get(&self, key: AttachmentKey) -> Option<&Attachment<B>> {
        self.attachments.get(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = AttachmentKey> + '_ {
        self.attachments.keys().copied()
    }

    pub fn concat_latent_image(&self) -> Option<&Tensor<B, 5>> {
        match self.attachments.get(&AttachmentKey::ConcatLatentImage) {
            Some(Attachment::Latent(t)) => Some(t),
            _ => None,
        }
    }

    pub fn concat_mask(&self) -> Option<&Tensor<B, 5>> {
        match self.attachments.get(&AttachmentKey::ConcatMask) {
            Some(Attachment::Latent(t)) => Some(t),
            _ => None,
        }
    }

    pub fn clip_vision_output(&self) -> Option<&Tensor<B, 3>> {
        match self.attachments.get(&AttachmentKey::ClipVisionOutput) {
            Some(Attachment::Embedding(t)) => Some(t),
            _ => None,
        }
    }
}

/// Image-to-video conditioning latents
#[derive(Debug, Clone)]
pub struct ImageConditioning<B: Backend> {
    /// VAE latent of the guide clip (start/end frames, grey elsewhere)
    pub concat_latent_image: Tensor<B, 5>,
    /// 0 on latent frames fixed by guide images, 1 where the model is free
    pub concat_mask: Tensor<B, 5>,
}

impl<B: Backend> ImageConditioning<B> {
    /// Attachments to merge into both conditioning signals
    pub fn attachments(&self, vision: Option<Tensor<B, 3>>) -> Vec<(AttachmentKey, Attachment<B>)> {
        let mut values = vec![
            (
                AttachmentKey::ConcatLatentImage,
                Attachment::Latent(self.concat_latent_image.clone()),
            ),
            (AttachmentKey::ConcatMask, Attachment::Latent(self.concat_mask.clone())),
        ];
        if let Some(vision) = vision {
            values.push((AttachmentKey::ClipVisionOutput, Attachment::Embedding(vision)));
        }
        values
    }
}

/// Latent frame that pixel frame `p` is compressed into
fn latent_index(pixel: usize) -> usize {
    if pixel == 0 {
        0
    } else {
        (pixel - 1) / TEMPORAL_COMPRESSION + 1
    }
}

/// Build the guide clip from optional start and end frames and encode it
///
/// Start frames occupy the head of a `length`-frame clip, end frames its
/// tail, and everything in between is mid-grey. The mask is zero on every
/// latent frame touched by a guide frame.
pub fn encode_guide_frames<B: Backend>(
    vae: &dyn VideoVae<B>,
    width: usize,
    height: usize,
    length: usize,
    start: Option<Tensor<B, 4>>,
    end: Option<Tensor<B, 4>>,
    device: &B::Device,
) -> Result<ImageConditioning<B>, SampleError> {
    if length == 0 {
        return Err(ConfigError::InvalidValue {
            name: "length",
            reason: "guide clip needs at least one frame".into(),
        }
        .into());
    }

    let start = start.map(|frames| take_rgb(frames, length)).map(|f| imageops::fit_center(f, width, height));
    let start_count = start.as_ref().map(|f| f.dims()[0]).unwrap_or(0);

    let end = end
        .map(|frames| take_rgb(frames, length - start_count))
        .filter(|f| f.dims()[0] > 0)
        .map(|f| imageops::fit_center(f, width, height));
    let end_count = end.as_ref().map(|f| f.dims()[0]).unwrap_or(0);

    let grey_count = length - start_count - end_count;
    let mut parts = Vec::with_capacity(3);
    if let Some(start) = start {
        parts.push(start);
    }
    if grey_count > 0 {
        parts.push(Tensor::<B, 4>::ones([grey_count, height, width, 3], device) * 0.5);
    }
    if let Some(end) = end {
        parts.push(end);
    }
    let clip = Tensor::cat(parts, 0);

    let concat_latent_image = vae.encode(clip)?;
    let [_, _, latent_t, latent_h, latent_w] = concat_latent_image.dims();

    let expected_t = latent_frames_for(length);
    if latent_t != expected_t {
        return Err(ConfigError::ShapeMismatch {
            what: "guide latent frames",
            expected: vec![expected_t],
            actual: vec![latent_t],
        }
        .into());
    }

    let mut mask = vec![1.0f32; latent_t];
    if start_count > 0 {
        for m in mask.iter_mut().take(latent_index(start_count - 1) + 1) {
            *m = 0.0;
        }
    }
    if end_count > 0 {
        for m in mask.iter_mut().skip(latent_index(length - end_count)) {
            *m = 0.0;
        }
    }
    let concat_mask = Tensor::<B, 5>::from_data(TensorData::new(mask, [1, 1, latent_t, 1, 1]), device)
        .repeat_dim(3, latent_h)
        .repeat_dim(4, latent_w);

    Ok(ImageConditioning {
        concat_latent_image,
        concat_mask,
    })
}

/// First `max` frames, RGB channels only
fn take_rgb<B: Backend>(frames: Tensor<B, 4>, max: usize) -> Tensor<B, 4> {
    let [n, h, w, c] = frames.dims();
    frames.slice([0..n.min(max), 0..h, 0..w, 0..c.min(3)])
}
