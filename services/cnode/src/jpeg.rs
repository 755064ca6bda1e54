//! JPEG encoding of captured stills.

use crate::capture::{CaptureMetadata, EncodeError, PixelFormat, StillEncoder, StreamInfo};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use std::borrow::Cow;
use tracing::trace;

/// Encodes packed RGB or grayscale planes to JPEG; JPEG streams pass through.
#[derive(Debug, Clone)]
pub struct JpegStillEncoder {
    quality: u8,
}

impl JpegStillEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl StillEncoder for JpegStillEncoder {
    fn encode(
        &self,
        planes: &[&[u8]],
        info: &StreamInfo,
        _metadata: &CaptureMetadata,
    ) -> Result<Vec<u8>, EncodeError> {
        let plane = planes
            .first()
            .copied()
            .ok_or(EncodeError::BufferTooSmall {
                expected: 1,
                actual: 0,
            })?;

        let (bpp, color) = match info.format {
            PixelFormat::Jpeg => return Ok(plane.to_vec()),
            PixelFormat::Rgb => (3, ExtendedColorType::Rgb8),
            PixelFormat::Gray8 => (1, ExtendedColorType::L8),
        };

        let pixels = pack_rows(plane, info, bpp)?;

        let mut out = Vec::with_capacity(pixels.len() / 8);
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .write_image(&pixels, info.width, info.height, color)
            .map_err(|e| EncodeError::Encoding(e.to_string()))?;

        trace!(
            raw_bytes = pixels.len(),
            jpeg_bytes = out.len(),
            quality = self.quality,
            "Encoded still"
        );

        Ok(out)
    }
}

/// Strip row padding so rows are exactly `width * bpp` bytes.
fn pack_rows<'a>(plane: &'a [u8], info: &StreamInfo, bpp: usize) -> Result<Cow<'a, [u8]>, EncodeError> {
    let row = info.width as usize * bpp;
    let height = info.height as usize;
    let stride = (info.stride as usize).max(row);

    if row == 0 || height == 0 {
        return Err(EncodeError::UnsupportedFormat(format!(
            "{}x{} frame",
            info.width, info.height
        )));
    }

    let expected = stride * (height - 1) + row;
    if plane.len() < expected {
        return Err(EncodeError::BufferTooSmall {
            expected,
            actual: plane.len(),
        });
    }

    if stride == row {
        return Ok(Cow::Borrowed(&plane[..row * height]));
    }

    let mut packed = Vec::with_capacity(row * height);
    for line in plane.chunks(stride).take(height) {
        packed.extend_from_slice(&line[..row]);
    }
    Ok(Cow::Owned(packed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(width: u32, height: u32, stride: u32, format: PixelFormat) -> StreamInfo {
        StreamInfo {
            width,
            height,
            stride,
            format,
        }
    }

    fn is_jpeg(bytes: &[u8]) -> bool {
        bytes.starts_with(&[0xFF, 0xD8]) && bytes.ends_with(&[0xFF, 0xD9])
    }

    #[test]
    fn test_encode_rgb() {
        let encoder = JpegStillEncoder::new(90);
        let frame = vec![128u8; 8 * 4 * 3];
        let jpeg = encoder
            .encode(&[&frame], &info(8, 4, 24, PixelFormat::Rgb), &CaptureMetadata::new())
            .unwrap();
        assert!(is_jpeg(&jpeg));
    }

    #[test]
    fn test_encode_strided_gray() {
        let encoder = JpegStillEncoder::new(75);
        // 4 pixels wide, 8 byte stride
        let frame = vec![200u8; 8 * 3 + 4];
        let jpeg = encoder
            .encode(&[&frame], &info(4, 4, 8, PixelFormat::Gray8), &CaptureMetadata::new())
            .unwrap();
        assert!(is_jpeg(&jpeg));
    }

    #[test]
    fn test_jpeg_passthrough() {
        let encoder = JpegStillEncoder::new(90);
        let frame = [0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];
        let out = encoder
            .encode(&[&frame], &info(2, 2, 0, PixelFormat::Jpeg), &CaptureMetadata::new())
            .unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let encoder = JpegStillEncoder::new(90);
        let frame = vec![0u8; 10];
        let err = encoder
            .encode(&[&frame], &info(8, 4, 24, PixelFormat::Rgb), &CaptureMetadata::new())
            .unwrap_err();
        assert!(matches!(
            err,
            EncodeError::BufferTooSmall {
                expected: 96,
                actual: 10
            }
        ));
    }

    #[test]
    fn test_missing_plane_rejected() {
        let encoder = JpegStillEncoder::new(90);
        assert!(encoder
            .encode(&[], &info(8, 4, 24, PixelFormat::Rgb), &CaptureMetadata::new())
            .is_err());
    }

    #[test]
    fn test_pack_rows_strips_padding() {
        let plane = [1, 2, 0, 0, 3, 4, 0, 0];
        let packed = pack_rows(&plane, &info(2, 2, 4, PixelFormat::Gray8), 1).unwrap();
        assert_eq!(packed.as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_quality_is_clamped() {
        assert_eq!(JpegStillEncoder::new(0).quality(), 1);
        assert_eq!(JpegStillEncoder::new(150).quality(), 100);
    }
}
