//! In-memory RGBA overlay surface.
//!
//! Pixels are straight RGBA. Translucent fills and strokes are blended
//! source-over onto whatever is already there; everything is clipped to the
//! surface bounds.

use std::path::Path;

use image::{Rgba as Px, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, Blend};
use imageproc::rect::Rect;

use crate::error::Result;
use crate::overlay::{OverlaySurface, PixelRect, Rgba};

pub struct RgbaSurface {
    image: RgbaImage,
}

impl RgbaSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
        }
    }

    /// Copy of the current layer.
    pub fn snapshot(&self) -> RgbaImage {
        self.image.clone()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x < self.image.width() && y < self.image.height() {
            Some(self.image.get_pixel(x, y).0)
        } else {
            None
        }
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        self.image.save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }

    /// Paint the half-open pixel span `[x0, x1) × [y0, y1)`.
    fn paint(&mut self, x0: i32, y0: i32, x1: i32, y1: i32, colour: Rgba) {
        let (w, h) = self.image.dimensions();
        if w == 0 || h == 0 || colour.a == 0 || x1 <= x0 || y1 <= y0 {
            return;
        }
        let rect = Rect::at(x0, y0).of_size((x1 - x0) as u32, (y1 - y0) as u32);
        let px = Px([colour.r, colour.g, colour.b, colour.a]);
        if colour.a == u8::MAX {
            draw_filled_rect_mut(&mut self.image, rect, px);
        } else {
            let mut canvas = Blend(std::mem::take(&mut self.image));
            draw_filled_rect_mut(&mut canvas, rect, px);
            self.image = canvas.0;
        }
    }
}

impl Default for RgbaSurface {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl OverlaySurface for RgbaSurface {
    fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn resize(&mut self, width: u32, height: u32) {
        if self.image.dimensions() != (width, height) {
            self.image = RgbaImage::new(width, height);
        }
    }

    fn clear(&mut self) {
        for px in self.image.pixels_mut() {
            *px = Px([0, 0, 0, 0]);
        }
    }

    fn fill_rect(&mut self, rect: PixelRect, colour: Rgba) {
        let r = rect.normalized();
        if r.area() <= 0.0 {
            return;
        }
        let (x0, y0, x1, y1) = pixel_edges(r);
        self.paint(x0, y0, x1, y1, colour);
    }

    fn stroke_rect(&mut self, rect: PixelRect, colour: Rgba, line_width: u32) {
        let r = rect.normalized();
        if r.area() <= 0.0 || line_width == 0 {
            return;
        }
        let (x0, y0, x1, y1) = pixel_edges(r);
        if x1 <= x0 || y1 <= y0 {
            return;
        }
        // Stroke is centred on the rectangle edge.
        let lw = line_width as i32;
        let half = lw / 2;
        let (left, top) = (x0 - half, y0 - half);
        let (right, bottom) = (x1 + lw - half, y1 + lw - half);
        let (inner_top, inner_bottom) = (top + lw, bottom - lw);

        if inner_bottom <= inner_top {
            self.paint(left, top, right, bottom, colour);
            return;
        }
        // Top and bottom bands span the full outer width; side bands fill
        // the gap between them so corners are painted once.
        self.paint(left, top, right, inner_top, colour);
        self.paint(left, inner_bottom, right, bottom, colour);
        self.paint(left, inner_top, left + lw, inner_bottom, colour);
        self.paint(right - lw, inner_top, right, inner_bottom, colour);
    }
}

/// Round a non-negative rectangle to whole-pixel edges.
fn pixel_edges(r: PixelRect) -> (i32, i32, i32, i32) {
    (
        r.x.round() as i32,
        r.y.round() as i32,
        (r.x + r.w).round() as i32,
        (r.y + r.h).round() as i32,
    )
}
