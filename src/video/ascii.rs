//! Character-art rendering
//!
//! Perceptual quality is not a goal; the built-in renderer maps luminance
//! onto a fixed character ramp, optionally with 24-bit ANSI colour.

use std::fmt::Write as _;

use super::image::{luminance, RgbImage};
use crate::protocol::RenderMode;

/// Dark-to-bright character ramp
pub const DEFAULT_PALETTE: &str = "   ...',;:clodxkO0KXNWM";

const RESET: &str = "\x1b[0m";

/// Rendering options for one recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub color: bool,
    pub mode: RenderMode,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            color: false,
            mode: RenderMode::Foreground,
        }
    }
}

/// Turns a composed image into terminal text.
pub trait FrameRenderer: Send + Sync {
    /// Render `image`, already sized to `width` x `height * 2` pixels, as
    /// `height` newline-separated rows of `width` cells.
    fn render(&self, image: &RgbImage, width: u16, height: u16, options: RenderOptions) -> String;
}

/// Luminance-ramp renderer
#[derive(Debug, Clone)]
pub struct LuminanceRenderer {
    palette: Vec<char>,
}

impl LuminanceRenderer {
    pub fn new(palette: &str) -> Self {
        let palette: Vec<char> = palette.chars().collect();
        Self {
            palette: if palette.is_empty() {
                DEFAULT_PALETTE.chars().collect()
            } else {
                palette
            },
        }
    }

    #[inline]
    fn glyph(&self, luma: u8) -> char {
        let idx = luma as usize * (self.palette.len() - 1) / 255;
        self.palette[idx]
    }

    fn average(a: [u8; 3], b: [u8; 3]) -> [u8; 3] {
        [
            ((a[0] as u16 + b[0] as u16) / 2) as u8,
            ((a[1] as u16 + b[1] as u16) / 2) as u8,
            ((a[2] as u16 + b[2] as u16) / 2) as u8,
        ]
    }
}

impl Default for LuminanceRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_PALETTE)
    }
}

impl FrameRenderer for LuminanceRenderer {
    fn render(&self, image: &RgbImage, width: u16, height: u16, options: RenderOptions) -> String {
        let width = width.max(1) as u32;
        let height = height.max(1) as u32;
        let image = image.resize(width, height * 2);

        let mut out = String::with_capacity((width as usize + 1) * height as usize * if options.color { 20 } else { 1 });
        for row in 0..height {
            for col in 0..width {
                let top = image.pixel(col, row * 2);
                let bottom = image.pixel(col, row * 2 + 1);
                let cell = Self::average(top, bottom);

                if !options.color {
                    out.push(self.glyph(luminance(cell)));
                    continue;
                }
                match options.mode {
                    RenderMode::Foreground => {
                        let _ = write!(out, "\x1b[38;2;{};{};{}m{}", cell[0], cell[1], cell[2], self.glyph(luminance(cell)));
                    }
                    RenderMode::Background => {
                        let _ = write!(out, "\x1b[48;2;{};{};{}m ", cell[0], cell[1], cell[2]);
                    }
                    RenderMode::HalfBlock => {
                        let _ = write!(
                            out,
                            "\x1b[38;2;{};{};{};48;2;{};{};{}m\u{2580}",
                            top[0], top[1], top[2], bottom[0], bottom[1], bottom[2]
                        );
                    }
                }
            }
            if options.color {
                out.push_str(RESET);
            }
            if row + 1 < height {
                out.push('\n');
            }
        }
        out
    }
}
