//! Raster images and the frames pushed to keys.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::RgbColor;
use image::codecs::png::PngEncoder;
use image::ImageEncoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Native key image size on most keypads.
pub const DEFAULT_KEY_SIZE: u32 = 144;

/// Pixel size of a key image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_SIZE, DEFAULT_KEY_SIZE)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("PNG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Immutable RGBA8 image, row-major.
#[derive(Clone, PartialEq, Eq)]
pub struct RasterImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl RasterImage {
    /// Wrap a raw RGBA buffer. A buffer of the wrong length is padded or
    /// truncated to `width * height * 4`.
    pub fn from_rgba(width: u32, height: u32, mut pixels: Vec<u8>) -> Self {
        pixels.resize(width as usize * height as usize * 4, 0);
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Single-colour image.
    pub fn solid(dims: Dimensions, color: Rgb888) -> Self {
        let pixel = [color.r(), color.g(), color.b(), 255];
        let count = dims.width as usize * dims.height as usize;
        Self {
            width: dims.width,
            height: dims.height,
            pixels: pixel.repeat(count),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    /// Raw RGBA bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// RGBA of one pixel; out-of-bounds reads return transparent black.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        if x >= self.width || y >= self.height {
            return [0; 4];
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }

    pub fn to_png(&self) -> Result<Vec<u8>, FrameError> {
        let mut output = Vec::new();
        PngEncoder::new(&mut output).write_image(
            &self.pixels,
            self.width,
            self.height,
            image::ExtendedColorType::Rgba8,
        )?;
        Ok(output)
    }

    /// `data:image/png;base64,...` form the host expects in `setImage`.
    pub fn to_data_uri(&self) -> Result<String, FrameError> {
        let png = self.to_png()?;
        Ok(format!("data:image/png;base64,{}", BASE64_STANDARD.encode(png)))
    }
}

impl fmt::Debug for RasterImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasterImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Versions of the inputs a frame was rendered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameStamp {
    pub settings_version: u64,
    pub store_version: u64,
}

/// A rendered image plus the input versions it reflects.
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub image: Arc<RasterImage>,
    pub stamp: FrameStamp,
    pub rendered_at: DateTime<Utc>,
    /// True when the renderer failed and this is the solid fallback
    pub fallback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solid_image() {
        let image = RasterImage::solid(Dimensions::new(4, 3), Rgb888::new(1, 2, 3));
        assert_eq!(image.pixels().len(), 48);
        assert_eq!(image.pixel(3, 2), [1, 2, 3, 255]);
        assert_eq!(image.pixel(4, 0), [0, 0, 0, 0]);
    }

    #[test]
    fn test_png_signature_and_data_uri() {
        let image = RasterImage::solid(Dimensions::default(), Rgb888::BLACK);
        let png = image.to_png().unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");

        let uri = image.to_data_uri().unwrap();
        assert!(uri.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_from_rgba_normalises_length() {
        let image = RasterImage::from_rgba(2, 2, vec![255; 5]);
        assert_eq!(image.pixels().len(), 16);
        assert_eq!(image.pixel(1, 1), [0, 0, 0, 0]);
    }
}
