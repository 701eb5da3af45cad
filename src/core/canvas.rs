//! Drawing surface for key images.
//!
//! Wraps an opaque RGBA buffer as an `embedded-graphics` draw target so the
//! renderer can use its primitives and fonts, and adds alpha blending for
//! the area gradient.

use crate::core::frame::RasterImage;
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use image::{Rgba, RgbaImage};

pub struct Canvas {
    image: RgbaImage,
}

fn opaque(color: Rgb888) -> Rgba<u8> {
    Rgba([color.r(), color.g(), color.b(), 255])
}

impl Canvas {
    /// Canvas of the given size filled with `background`.
    pub fn new(width: u32, height: u32, background: Rgb888) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, opaque(background)),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Composite `color` at `alpha` (0..=1) over the existing pixel.
    pub fn blend_pixel(&mut self, x: i32, y: i32, color: Rgb888, alpha: f32) {
        if x < 0 || y < 0 || alpha <= 0.0 {
            return;
        }
        let (x, y) = (x as u32, y as u32);
        if x >= self.image.width() || y >= self.image.height() {
            return;
        }
        let alpha = alpha.min(1.0);
        let bg = self.image.get_pixel(x, y).0;
        let fg = [color.r(), color.g(), color.b()];
        let mut out = [0u8, 0, 0, 255];
        for i in 0..3 {
            let mixed = f32::from(fg[i]) * alpha + f32::from(bg[i]) * (1.0 - alpha);
            out[i] = mixed.round().clamp(0.0, 255.0) as u8;
        }
        self.image.put_pixel(x, y, Rgba(out));
    }

    pub fn into_raster(self) -> RasterImage {
        let (width, height) = self.image.dimensions();
        RasterImage::from_rgba(width, height, self.image.into_raw())
    }
}

impl OriginDimensions for Canvas {
    fn size(&self) -> Size {
        Size::new(self.image.width(), self.image.height())
    }
}

impl DrawTarget for Canvas {
    type Color = Rgb888;
    type Error = std::convert::Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let (width, height) = self.image.dimensions();
        for Pixel(point, color) in pixels {
            if point.x >= 0 && point.y >= 0 && (point.x as u32) < width && (point.y as u32) < height {
                self.image.put_pixel(point.x as u32, point.y as u32, opaque(color));
            }
        }
        Ok(())
    }
}
