//! Video collaborators: images, scaling, character rendering, sources

pub mod ascii;
pub mod image;
pub mod source;

pub use ascii::{FrameRenderer, LuminanceRenderer, RenderOptions, DEFAULT_PALETTE};
pub use image::{fit_dimensions, Canvas, RgbImage};
pub use source::{TestPattern, VideoSource};
