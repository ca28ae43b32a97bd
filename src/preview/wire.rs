//! Preview wire format
//!
//! Each frame travels as one binary message: three big-endian `u32`
//! (`1`, `1`, frame index) followed by a JPEG image.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::error::PreviewError;

/// Header length in bytes
pub const HEADER_LEN: usize = 12;

/// Event type and format tag of preview images
const IMAGE_TAG: u32 = 1;

/// Frame header: event tag, format tag, frame index
pub fn frame_header(index: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&IMAGE_TAG.to_be_bytes());
    header[4..8].copy_from_slice(&IMAGE_TAG.to_be_bytes());
    header[8..12].copy_from_slice(&index.to_be_bytes());
    header
}

/// Index carried by a frame message
pub fn frame_index(message: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = message.get(8..12)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Header plus JPEG of one packed RGB frame
pub fn encode_frame(rgb: &[u8], width: usize, height: usize, index: u32, quality: u8) -> Result<Vec<u8>, PreviewError> {
    if rgb.len() != width * height * 3 {
        return Err(PreviewError::Encode(format!(
            "{} bytes do not form a {}x{} RGB image",
            rgb.len(),
            width,
            height
        )));
    }
    let mut message = Vec::with_capacity(HEADER_LEN + rgb.len() / 4);
    message.extend_from_slice(&frame_header(index));
    JpegEncoder::new_with_quality(&mut message, quality)
        .encode(rgb, width as u32, height as u32, ExtendedColorType::Rgb8)
        .map_err(|e| PreviewError::Encode(e.to_string()))?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(
            frame_header(258),
            [0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 1, 2]
        );
    }

    #[test]
    fn test_encoded_frame_is_jpeg() {
        let rgb = vec![128u8; 8 * 4 * 3];
        let message = encode_frame(&rgb, 8, 4, 7, 90).unwrap();
        assert_eq!(frame_index(&message), Some(7));
        // JPEG start-of-image marker follows the header
        assert_eq!(&message[HEADER_LEN..HEADER_LEN + 2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_rejects_wrong_buffer_size() {
        assert!(matches!(encode_frame(&[0u8; 5], 2, 2, 0, 90), Err(PreviewError::Encode(_))));
    }
}
