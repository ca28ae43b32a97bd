//! Model patch chain
//!
//! A [`PatchedModel`] wraps one base diffusion model with at most one patch
//! of each [`PatchKind`]. Patches compose in a fixed order:
//!
//! ```text
//! schedule shift -> enhance -> skip-layer -> zero-star -> step cache -> compile
//! ```
//!
//! The first four shape what a single evaluation computes; the step cache
//! then wraps that complete evaluation, and compilation is requested last so
//! it sees the final effective function. Applying a patch of a kind that is
//! already present replaces it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use burn::prelude::*;
use tracing::{debug, info};

use crate::conditioning::Conditioning;
use crate::config::{CompileMode, TeaCacheMode};
use crate::error::{ConfigError, SampleError};
use crate::model::{Branch, CompileSettings, DiffusionModel, TransformerOptions};
use crate::modules::cfg_zero_star::{cfg, cfg_zero_star};
use crate::modules::{CfgZeroStar, EnhanceVideo, SkipLayerGuidance, TeaCache, TeaCacheConfig};
use crate::schedule::ModelSampling;

/// Flow shift of the unpatched Wan 2.1 model
pub const DEFAULT_SHIFT: f32 = 8.0;

/// Patch kinds in composition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PatchKind {
    ScheduleShift,
    Enhance,
    SkipLayer,
    CfgZeroStar,
    TeaCache,
    Compile,
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PatchKind::ScheduleShift => "schedule_shift",
            PatchKind::Enhance => "enhance",
            PatchKind::SkipLayer => "skip_layer",
            PatchKind::CfgZeroStar => "cfg_zero_star",
            PatchKind::TeaCache => "teacache",
            PatchKind::Compile => "compile",
        };
        f.write_str(name)
    }
}

/// One transform of the base model
#[derive(Debug, Clone, PartialEq)]
pub enum ModelPatch {
    /// Replace the flow shift used to build schedules and timesteps
    ScheduleShift { shift: f32 },
    Enhance(EnhanceVideo),
    SkipLayer(SkipLayerGuidance),
    CfgZeroStar(CfgZeroStar),
    TeaCache(TeaCacheMode),
    Compile(CompileMode),
}

impl ModelPatch {
    pub fn kind(&self) -> PatchKind {
        match self {
            ModelPatch::ScheduleShift { .. } => PatchKind::ScheduleShift,
            ModelPatch::Enhance(_) => PatchKind::Enhance,
            ModelPatch::SkipLayer(_) => PatchKind::SkipLayer,
            ModelPatch::CfgZeroStar(_) => PatchKind::CfgZeroStar,
            ModelPatch::TeaCache(_) => PatchKind::TeaCache,
            ModelPatch::Compile(_) => PatchKind::Compile,
        }
    }

    /// Patches with no effect are never stored
    fn is_noop(&self) -> bool {
        match self {
            ModelPatch::ScheduleShift { .. } => false,
            ModelPatch::Enhance(e) => !e.is_enabled(),
            ModelPatch::SkipLayer(s) => s.layers.is_empty(),
            ModelPatch::CfgZeroStar(z) => z.steps == 0,
            ModelPatch::TeaCache(mode) => *mode == TeaCacheMode::Disabled,
            ModelPatch::Compile(mode) => *mode == CompileMode::Disabled,
        }
    }
}

/// Position of one evaluation inside a sampling run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepContext {
    pub step: usize,
    pub total_steps: usize,
    /// `step / total_steps`
    pub progress: f32,
}

/// Base model plus its patch chain
pub struct PatchedModel<B: Backend> {
    base: Arc<dyn DiffusionModel<B>>,
    patches: BTreeMap<PatchKind, ModelPatch>,
    teacache: Option<TeaCache<B>>,
    compiled: AtomicBool,
}

impl<B: Backend> PatchedModel<B> {
    pub fn new(base: Arc<dyn DiffusionModel<B>>) -> Self {
        Self {
            base,
            patches: BTreeMap::new(),
            teacache: None,
            compiled: AtomicBool::new(false),
        }
    }

    /// Apply a list of patches to a base model
    pub fn apply(base: Arc<dyn DiffusionModel<B>>, patches: impl IntoIterator<Item = ModelPatch>) -> Self {
        let mut model = Self::new(base);
        for patch in patches {
            model.patch(patch);
        }
        model
    }

    pub fn with_patch(mut self, patch: ModelPatch) -> Self {
        self.patch(patch);
        self
    }

    /// Add or replace the patch of this kind
    ///
    /// Re-applying an identical patch is a no-op, and a no-op patch removes
    /// any existing patch of its kind. Compilation, once performed, is
    /// never undone.
    pub fn patch(&mut self, patch: ModelPatch) {
        let kind = patch.kind();
        if self.patches.get(&kind) == Some(&patch) {
            debug!("Patch {} already applied", kind);
            return;
        }
        if patch.is_noop() {
            self.patches.remove(&kind);
            if kind == PatchKind::TeaCache {
                self.teacache = None;
            }
            return;
        }

        if let ModelPatch::TeaCache(mode) = &patch {
            self.teacache = Some(TeaCache::new(*mode, TeaCacheConfig::for_model(self.base.name())));
        }
        if kind == PatchKind::Compile && self.compiled.load(Ordering::Acquire) {
            debug!("Model {} is already compiled", self.base.name());
        }
        debug!("Applied patch {}", kind);
        self.patches.insert(kind, patch);
    }

    pub fn base(&self) -> &Arc<dyn DiffusionModel<B>> {
        &self.base
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn patch_kinds(&self) -> Vec<PatchKind> {
        self.patches.keys().copied().collect()
    }

    pub fn get(&self, kind: PatchKind) -> Option<&ModelPatch> {
        self.patches.get(&kind)
    }

    /// Noise-level mapping after the schedule shift patch
    pub fn model_sampling(&self) -> ModelSampling {
        match self.patches.get(&PatchKind::ScheduleShift) {
            Some(ModelPatch::ScheduleShift { shift }) => ModelSampling::with_shift(*shift),
            _ => ModelSampling::with_shift(DEFAULT_SHIFT),
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.load(Ordering::Acquire)
    }

    /// Prepare for a new sampling run
    ///
    /// Clears the step cache and performs the one-time compilation.
    pub fn begin_run(&self) -> Result<(), SampleError> {
        if let Some(cache) = &self.teacache {
            cache.reset();
        }
        if let Some(ModelPatch::Compile(mode)) = self.patches.get(&PatchKind::Compile) {
            if self
                .compiled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                info!("Compiling {} ({})", self.base.name(), mode.as_str());
                if let Err(err) = self.base.compile(&CompileSettings::new(mode.as_str())) {
                    self.compiled.store(false, Ordering::Release);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Drop per-run state held between steps
    pub fn end_run(&self) {
        if let Some(cache) = &self.teacache {
            cache.reset();
        }
    }

    fn options(&self, branch: Branch, ctx: &StepContext) -> TransformerOptions {
        let skip_layers = match (branch, self.patches.get(&PatchKind::SkipLayer)) {
            (Branch::Negative, Some(ModelPatch::SkipLayer(slg))) => slg.layers_at(ctx.progress),
            _ => Vec::new(),
        };
        let enhance = match self.patches.get(&PatchKind::Enhance) {
            Some(ModelPatch::Enhance(e)) => Some(*e),
            _ => None,
        };
        TransformerOptions {
            branch,
            step: ctx.step,
            progress: ctx.progress,
            skip_layers,
            enhance,
        }
    }

    /// Velocity prediction for one branch at noise level `sigma`
    pub fn forward_branch(
        &self,
        x: Tensor<B, 5>,
        sigma: f32,
        cond: &Conditioning<B>,
        branch: Branch,
        ctx: &StepContext,
    ) -> Result<Tensor<B, 5>, SampleError> {
        if let Some(cache) = &self.teacache {
            if let Some(cached) = cache.lookup(branch, &x, ctx.step, ctx.total_steps) {
                debug!("Step {} {:?}: reused cached residual", ctx.step, branch);
                return Ok(cached);
            }
        }

        let timestep = self.model_sampling().timestep(sigma);
        let options = self.options(branch, ctx);
        let out = self.base.forward(x.clone(), timestep, cond, &options)?;

        if out.dims() != x.dims() {
            return Err(ConfigError::ShapeMismatch {
                what: "model output",
                expected: x.dims().to_vec(),
                actual: out.dims().to_vec(),
            }
            .into());
        }

        if let Some(cache) = &self.teacache {
            cache.record(branch, &x, &out);
        }
        Ok(out)
    }

    /// Guidance combination for `step`, zero-star corrected when active
    pub fn combine(&self, cond: Tensor<B, 5>, uncond: Tensor<B, 5>, scale: f32, step: usize) -> Tensor<B, 5> {
        match self.patches.get(&PatchKind::CfgZeroStar) {
            Some(ModelPatch::CfgZeroStar(zero)) if zero.is_active(step) => cfg_zero_star(cond, uncond, scale),
            _ => cfg(cond, uncond, scale),
        }
    }
}
