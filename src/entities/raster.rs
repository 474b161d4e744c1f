//! Decoded preview raster.
//!
//! Decompression is delegated to the `image` crate; the engine only decides
//! when to decode and how large the preview copy may be.

use image::RgbaImage;
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result};

/// Decoded RGBA8 frame. Cheap to clone (shared pixel buffer).
#[derive(Clone)]
pub struct Raster {
    pixels: Arc<RgbaImage>,
}

impl Raster {
    pub fn from_rgba(image: RgbaImage) -> Self {
        Self { pixels: Arc::new(image) }
    }

    /// Decode encoded frame bytes, downscaling so neither edge exceeds `max_edge`.
    pub fn decode(frame: u32, bytes: &[u8], max_edge: Option<u32>) -> Result<Self> {
        let decoded = image::load_from_memory(bytes).map_err(|e| EngineError::Decode {
            frame,
            reason: e.to_string(),
        })?;

        let decoded = match max_edge {
            Some(edge) if decoded.width() > edge || decoded.height() > edge => {
                decoded.thumbnail(edge, edge)
            }
            _ => decoded,
        };

        Ok(Self::from_rgba(decoded.to_rgba8()))
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Retained bytes of the pixel buffer.
    pub fn mem(&self) -> usize {
        self.pixels.as_raw().len()
    }
}

impl fmt::Debug for Raster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Raster")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// Encode a solid-colour PNG, used to fabricate frame payloads in tests.
#[cfg(test)]
pub(crate) fn test_png(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, image::Rgba([shade, shade / 2, 0, 255]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_png() {
        let raster = Raster::decode(1, &test_png(8, 4, 200), None).unwrap();
        assert_eq!((raster.width(), raster.height()), (8, 4));
        assert_eq!(raster.mem(), 8 * 4 * 4);
        assert_eq!(raster.pixels().get_pixel(0, 0)[0], 200);
    }

    #[test]
    fn test_decode_downscales_to_preview_edge() {
        let raster = Raster::decode(1, &test_png(64, 32, 10), Some(16)).unwrap();
        assert!(raster.width() <= 16 && raster.height() <= 16);
        assert_eq!(raster.width(), 16);
    }

    #[test]
    fn test_small_frames_are_not_upscaled() {
        let raster = Raster::decode(1, &test_png(8, 8, 10), Some(128)).unwrap();
        assert_eq!(raster.width(), 8);
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        let err = Raster::decode(7, b"not an image", None).unwrap_err();
        assert!(matches!(err, EngineError::Decode { frame: 7, .. }));
    }
}
