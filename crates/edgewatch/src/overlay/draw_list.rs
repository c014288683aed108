//! Recording surface
//!
//! Keeps the draw calls of the current frame instead of rasterizing them.
//! Text is measured as a monospace face.

use super::{Font, Rect, Rgba, Surface};
use crate::media::FrameSize;

/// Advance width of one glyph relative to the font size
const GLYPH_ASPECT: f64 = 0.6;

#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    StrokeRect {
        rect: Rect,
        color: Rgba,
        line_width: f64,
    },
    FillRect {
        rect: Rect,
        color: Rgba,
    },
    FillText {
        text: String,
        x: f64,
        y: f64,
        font: Font,
        color: Rgba,
    },
}

#[derive(Debug, Default)]
pub struct DrawList {
    size: Option<FrameSize>,
    ops: Vec<DrawOp>,
    clears: u64,
}

impl DrawList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw calls since the last clear
    pub fn ops(&self) -> &[DrawOp] {
        &self.ops
    }

    /// Number of frames started
    pub fn clears(&self) -> u64 {
        self.clears
    }

    pub fn stroke_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, DrawOp::StrokeRect { .. }))
            .count()
    }

    pub fn fill_rects(&self) -> Vec<Rect> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DrawOp::FillRect { rect, .. } => Some(*rect),
                _ => None,
            })
            .collect()
    }

    pub fn texts(&self) -> Vec<&str> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DrawOp::FillText { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl Surface for DrawList {
    fn resize(&mut self, size: FrameSize) {
        self.size = Some(size);
    }

    fn size(&self) -> FrameSize {
        self.size.unwrap_or_default()
    }

    fn clear(&mut self) {
        self.ops.clear();
        self.clears += 1;
    }

    fn stroke_rect(&mut self, rect: Rect, color: Rgba, line_width: f64) {
        self.ops.push(DrawOp::StrokeRect {
            rect,
            color,
            line_width,
        });
    }

    fn fill_rect(&mut self, rect: Rect, color: Rgba) {
        self.ops.push(DrawOp::FillRect { rect, color });
    }

    fn fill_text(&mut self, text: &str, x: f64, y: f64, font: Font, color: Rgba) {
        self.ops.push(DrawOp::FillText {
            text: text.to_string(),
            x,
            y,
            font,
            color,
        });
    }

    fn measure_text(&self, text: &str, font: Font) -> f64 {
        text.chars().count() as f64 * font.size * GLYPH_ASPECT
    }
}
