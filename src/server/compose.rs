//! Per-recipient frame composition
//!
//! Sources are laid out in a grid sized by how many there are, each cell fit
//! and centered independently, then the canvas is rendered to characters at
//! the recipient's terminal size. Two vertical pixels map to one cell.

use bytes::Bytes;

use super::session::SessionInfo;
use crate::constants::MAX_GRID_SOURCES;
use crate::protocol::messages::FRAME_FLAG_COLOR;
use crate::protocol::AsciiFrame;
use crate::video::{Canvas, FrameRenderer, RgbImage};

/// Frames with fewer visible characters than this are not sent.
pub const BLANK_MIN_VISIBLE: usize = 10;

/// Only this prefix of a rendered frame is inspected for blankness.
pub const BLANK_SCAN_BYTES: usize = 1024;

/// `(columns, rows)` of the grid for `sources` tiles
pub fn grid_dimensions(sources: usize) -> (u32, u32) {
    match sources {
        0 | 1 => (1, 1),
        2 => (2, 1),
        3 | 4 => (2, 2),
        n => {
            let n = n.min(MAX_GRID_SOURCES) as u32;
            (3, n.div_ceil(3))
        }
    }
}

/// Lay out `sources` on a `width` x `height` pixel canvas.
///
/// With `stretch` a lone source fills the canvas; otherwise every source
/// keeps its aspect ratio.
pub fn compose(sources: &[RgbImage], width: u32, height: u32, stretch: bool) -> RgbImage {
    let width = width.max(1);
    let height = height.max(1);
    let sources = &sources[..sources.len().min(MAX_GRID_SOURCES)];

    if let [only] = sources {
        if stretch {
            return only.resize(width, height);
        }
    }

    let mut canvas = Canvas::new(width, height);
    let (cols, rows) = grid_dimensions(sources.len());
    let cell_w = (width / cols).max(1);
    let cell_h = (height / rows).max(1);
    for (i, image) in sources.iter().enumerate() {
        let i = i as u32;
        let x = (i % cols) * cell_w;
        let y = (i / cols) * cell_h;
        canvas.blit_centered(image, x, y, cell_w, cell_h);
    }
    canvas.into_image()
}

/// True when the first [`BLANK_SCAN_BYTES`] of `text` hold fewer than
/// [`BLANK_MIN_VISIBLE`] non-whitespace characters. ANSI escape sequences
/// are not counted.
pub fn is_blank(text: &str) -> bool {
    let mut end = text.len().min(BLANK_SCAN_BYTES);
    while !text.is_char_boundary(end) {
        end -= 1;
    }

    let mut visible = 0;
    let mut chars = text[..end].chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // CSI: ESC [ params final-byte
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        if !c.is_whitespace() {
            visible += 1;
            if visible >= BLANK_MIN_VISIBLE {
                return false;
            }
        }
    }
    true
}

/// Outcome of composing for one recipient
#[derive(Debug)]
pub enum Composition {
    /// Recipient has not reported a terminal size yet
    NotReady,
    NoSources,
    /// Rendered but suppressed as blank
    Blank,
    Frame(AsciiFrame),
}

pub struct Compositor {
    renderer: Box<dyn FrameRenderer>,
}

impl Compositor {
    pub fn new(renderer: Box<dyn FrameRenderer>) -> Self {
        Self { renderer }
    }

    pub fn compose_for(&self, sources: &[RgbImage], recipient: &SessionInfo) -> Composition {
        let Some(size) = recipient.size else {
            return Composition::NotReady;
        };
        if sources.is_empty() {
            return Composition::NoSources;
        }

        let options = recipient.render_options();
        let canvas = compose(
            sources,
            size.width as u32,
            size.height as u32 * 2,
            recipient.capabilities.stretch(),
        );
        let text = self.renderer.render(&canvas, size.width, size.height, options);
        if is_blank(&text) {
            return Composition::Blank;
        }

        Composition::Frame(AsciiFrame {
            width: size.width as u32,
            height: size.height as u32,
            flags: if options.color { FRAME_FLAG_COLOR } else { 0 },
            data: Bytes::from(text),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CapabilityFlags, TerminalSize};
    use crate::video::LuminanceRenderer;

    fn recipient(width: u16, height: u16) -> SessionInfo {
        SessionInfo {
            size: Some(TerminalSize { width, height }),
            capabilities: CapabilityFlags::new(true, false, false, false),
            ..SessionInfo::default()
        }
    }

    #[test]
    fn test_grid_dimensions() {
        assert_eq!(grid_dimensions(1), (1, 1));
        assert_eq!(grid_dimensions(2), (2, 1));
        assert_eq!(grid_dimensions(3), (2, 2));
        assert_eq!(grid_dimensions(4), (2, 2));
        assert_eq!(grid_dimensions(5), (3, 2));
        assert_eq!(grid_dimensions(7), (3, 3));
        assert_eq!(grid_dimensions(9), (3, 3));
        assert_eq!(grid_dimensions(12), (3, 3));
    }

    #[test]
    fn test_single_source_keeps_aspect() {
        let wide = RgbImage::solid(40, 10, [255, 255, 255]);
        let canvas = compose(&[wide], 20, 20, false);
        assert_eq!((canvas.width(), canvas.height()), (20, 20));
        // letterboxed: 20x5 band centered vertically
        assert_eq!(canvas.pixel(10, 0), [0, 0, 0]);
        assert_eq!(canvas.pixel(10, 10), [255, 255, 255]);
    }

    #[test]
    fn test_stretch_fills_canvas() {
        let wide = RgbImage::solid(40, 10, [255, 255, 255]);
        let canvas = compose(&[wide], 20, 20, true);
        assert_eq!(canvas.pixel(10, 0), [255, 255, 255]);
    }

    #[test]
    fn test_two_sources_side_by_side() {
        let red = RgbImage::solid(10, 10, [255, 0, 0]);
        let blue = RgbImage::solid(10, 10, [0, 0, 255]);
        let canvas = compose(&[red, blue], 40, 20, false);
        assert_eq!(canvas.pixel(10, 10), [255, 0, 0]);
        assert_eq!(canvas.pixel(30, 10), [0, 0, 255]);
    }

    #[test]
    fn test_is_blank() {
        assert!(is_blank(""));
        assert!(is_blank("   \n  ...  \n"));
        assert!(!is_blank("clodxkO0KXNWM"));
        // content past the scanned prefix does not count
        let late = format!("{}{}", " ".repeat(BLANK_SCAN_BYTES), "MMMMMMMMMMMM");
        assert!(is_blank(&late));
        // escapes alone are invisible
        assert!(is_blank(&"\x1b[48;2;0;0;0m ".repeat(20)));
    }

    #[test]
    fn test_compositor_outcomes() {
        let compositor = Compositor::new(Box::new(LuminanceRenderer::default()));
        let white = RgbImage::solid(16, 16, [255, 255, 255]);
        let black = RgbImage::solid(16, 16, [0, 0, 0]);

        assert!(matches!(
            compositor.compose_for(&[white.clone()], &SessionInfo::default()),
            Composition::NotReady
        ));
        assert!(matches!(compositor.compose_for(&[], &recipient(20, 10)), Composition::NoSources));
        assert!(matches!(compositor.compose_for(&[black], &recipient(20, 10)), Composition::Blank));

        match compositor.compose_for(&[white], &recipient(20, 10)) {
            Composition::Frame(frame) => {
                assert_eq!((frame.width, frame.height), (20, 10));
                assert_eq!(frame.flags, 0);
                assert_eq!(frame.data.iter().filter(|&&b| b == b'\n').count(), 9);
            }
            other => panic!("expected a frame, got {:?}", other),
        }
    }
}
