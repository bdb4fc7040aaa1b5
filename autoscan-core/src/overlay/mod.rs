//! Bounding-box overlay.
//!
//! Boxes arrive in frame-relative coordinates and are scaled to the pixel
//! size of the frame they were detected on. Every draw resizes the surface to
//! that size and clears it first, so nothing accumulates across cycles and an
//! empty box list leaves a clean layer.

pub mod raster;

pub use raster::RgbaSurface;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::detect::BoundingBox;

/// A box scaled to surface pixels. `w`/`h` may be zero or negative when the
/// service returned inverted coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl PixelRect {
    /// Same rectangle with non-negative width and height.
    pub fn normalized(self) -> Self {
        let (x, w) = if self.w < 0.0 {
            (self.x + self.w, -self.w)
        } else {
            (self.x, self.w)
        };
        let (y, h) = if self.h < 0.0 {
            (self.y + self.h, -self.h)
        } else {
            (self.y, self.h)
        };
        Self { x, y, w, h }
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }
}

/// Scale a normalized box onto a `width` × `height` surface.
pub fn scale_box(bbox: &BoundingBox, width: u32, height: u32) -> PixelRect {
    let (w, h) = (width as f32, height as f32);
    PixelRect {
        x: bbox.x_min * w,
        y: bbox.y_min * h,
        w: (bbox.x_max - bbox.x_min) * w,
        h: (bbox.y_max - bbox.y_min) * h,
    }
}

/// What the overlay currently shows: the rectangles last drawn and the
/// frame size they were scaled to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlayFrame {
    pub width: u32,
    pub height: u32,
    pub rects: Vec<PixelRect>,
}

/// Straight (non-premultiplied) RGBA colour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlayStyle {
    pub stroke: Rgba,
    pub line_width: u32,
    pub fill: Rgba,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            // cyan-500, translucent fill at 20 %
            stroke: Rgba::new(6, 182, 212, 255),
            line_width: 4,
            fill: Rgba::new(6, 182, 212, 51),
        }
    }
}

/// Transparent drawing layer aligned to the video.
pub trait OverlaySurface: Send + 'static {
    fn size(&self) -> (u32, u32);

    /// Resize to `width` × `height`. Contents after a resize are unspecified
    /// until the next `clear`.
    fn resize(&mut self, width: u32, height: u32);

    /// Make every pixel fully transparent.
    fn clear(&mut self);

    fn fill_rect(&mut self, rect: PixelRect, colour: Rgba);

    fn stroke_rect(&mut self, rect: PixelRect, colour: Rgba, line_width: u32);
}

/// Draws box lists onto an [`OverlaySurface`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayRenderer {
    pub style: OverlayStyle,
}

impl OverlayRenderer {
    /// Replace the overlay with `boxes` scaled to `width` × `height`.
    ///
    /// Returns the pixel rectangles that were drawn, in input order.
    pub fn draw(
        &self,
        surface: &mut dyn OverlaySurface,
        boxes: &[BoundingBox],
        width: u32,
        height: u32,
    ) -> Vec<PixelRect> {
        surface.resize(width, height);
        surface.clear();

        let rects: Vec<PixelRect> = boxes.iter().map(|b| scale_box(b, width, height)).collect();
        for rect in &rects {
            surface.fill_rect(*rect, self.style.fill);
            surface.stroke_rect(*rect, self.style.stroke, self.style.line_width);
        }
        rects
    }

    /// Clear the overlay without changing its size.
    pub fn clear(&self, surface: &mut dyn OverlaySurface) {
        surface.clear();
    }
}

/// Shared handle to the engine's overlay surface.
#[derive(Clone)]
pub struct SurfaceHandle(pub Arc<Mutex<dyn OverlaySurface>>);

impl SurfaceHandle {
    pub fn new<S: OverlaySurface>(surface: S) -> Self {
        Self(Arc::new(Mutex::new(surface)))
    }
}

impl std::fmt::Debug for SurfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceHandle")
            .field("size", &self.0.lock().size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[derive(Default)]
    struct RecordingSurface {
        size: (u32, u32),
        ops: Vec<String>,
    }

    impl OverlaySurface for RecordingSurface {
        fn size(&self) -> (u32, u32) {
            self.size
        }

        fn resize(&mut self, width: u32, height: u32) {
            self.size = (width, height);
            self.ops.push(format!("resize {width}x{height}"));
        }

        fn clear(&mut self) {
            self.ops.push("clear".into());
        }

        fn fill_rect(&mut self, _rect: PixelRect, _colour: Rgba) {
            self.ops.push("fill".into());
        }

        fn stroke_rect(&mut self, _rect: PixelRect, _colour: Rgba, _line_width: u32) {
            self.ops.push("stroke".into());
        }
    }

    #[test]
    fn scale_box_matches_formula() {
        let rect = scale_box(&BoundingBox::new(0.1, 0.2, 0.3, 0.6), 1280, 720);
        assert_relative_eq!(rect.x, 0.2 * 1280.0, epsilon = 1e-3);
        assert_relative_eq!(rect.y, 0.1 * 720.0, epsilon = 1e-3);
        assert_relative_eq!(rect.w, 0.4 * 1280.0, epsilon = 1e-3);
        assert_relative_eq!(rect.h, 0.2 * 720.0, epsilon = 1e-3);
    }

    #[test]
    fn inverted_box_scales_to_negative_area_and_normalizes() {
        let rect = scale_box(&BoundingBox::new(0.5, 0.5, 0.25, 0.25), 100, 100);
        assert!(rect.w < 0.0 && rect.h < 0.0);

        let n = rect.normalized();
        assert_relative_eq!(n.x, 25.0, epsilon = 1e-4);
        assert_relative_eq!(n.w, 25.0, epsilon = 1e-4);
    }

    #[test]
    fn draw_resizes_and_clears_before_boxes() {
        let renderer = OverlayRenderer::default();
        let mut surface = RecordingSurface::default();
        let rects = renderer.draw(
            &mut surface,
            &[BoundingBox::new(0.1, 0.1, 0.5, 0.5)],
            640,
            480,
        );

        assert_eq!(rects.len(), 1);
        assert_eq!(surface.ops, vec!["resize 640x480", "clear", "fill", "stroke"]);
    }

    #[test]
    fn empty_draw_still_clears() {
        let renderer = OverlayRenderer::default();
        let mut surface = RecordingSurface::default();
        let rects = renderer.draw(&mut surface, &[], 320, 240);

        assert!(rects.is_empty());
        assert_eq!(surface.ops, vec!["resize 320x240", "clear"]);
    }
}
