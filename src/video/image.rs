//! RGB24 images, scaling and aspect-preserving fit

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::protocol::messages::RGB_BYTES;
use crate::protocol::ImageFrame;

/// Immutable packed RGB24 image. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    width: u32,
    height: u32,
    data: Bytes,
}

impl RgbImage {
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let data = data.into();
        let expected = width as usize * height as usize * RGB_BYTES;
        if width == 0 || height == 0 || data.len() != expected {
            return Err(ProtocolError::Malformed(format!(
                "{}x{} image needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut canvas = Canvas::new(width.max(1), height.max(1));
        canvas.fill(rgb);
        canvas.into_image()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * RGB_BYTES;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Nearest-neighbour scale
    pub fn resize(&self, width: u32, height: u32) -> RgbImage {
        let width = width.max(1);
        let height = height.max(1);
        if width == self.width && height == self.height {
            return self.clone();
        }
        let mut canvas = Canvas::new(width, height);
        for y in 0..height {
            let sy = (y as u64 * self.height as u64 / height as u64) as u32;
            for x in 0..width {
                let sx = (x as u64 * self.width as u64 / width as u64) as u32;
                canvas.set(x, y, self.pixel(sx, sy));
            }
        }
        canvas.into_image()
    }

    /// Scale to fit inside `width` x `height` keeping the aspect ratio.
    pub fn fit(&self, width: u32, height: u32) -> RgbImage {
        let (w, h) = fit_dimensions(self.width, self.height, width, height);
        self.resize(w, h)
    }
}

impl From<ImageFrame> for RgbImage {
    fn from(frame: ImageFrame) -> Self {
        // ImageFrame::decode has already checked the size
        Self {
            width: frame.width,
            height: frame.height,
            data: frame.pixels,
        }
    }
}

/// Largest size with the source aspect ratio that fits in the box.
pub fn fit_dimensions(src_w: u32, src_h: u32, box_w: u32, box_h: u32) -> (u32, u32) {
    if src_w == 0 || src_h == 0 || box_w == 0 || box_h == 0 {
        return (box_w.max(1), box_h.max(1));
    }
    let src_aspect = src_w as f64 / src_h as f64;
    let box_aspect = box_w as f64 / box_h as f64;
    if src_aspect > box_aspect {
        let h = (box_w as f64 / src_aspect).round() as u32;
        (box_w, h.clamp(1, box_h))
    } else {
        let w = (box_h as f64 * src_aspect).round() as u32;
        (w.clamp(1, box_w), box_h)
    }
}

/// Mutable drawing surface
#[derive(Debug, Clone)]
pub struct Canvas {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Canvas {
    /// Black canvas
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * RGB_BYTES],
        }
    }

    pub fn fill(&mut self, rgb: [u8; 3]) {
        for px in self.data.chunks_exact_mut(RGB_BYTES) {
            px.copy_from_slice(&rgb);
        }
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        let i = (y as usize * self.width as usize + x as usize) * RGB_BYTES;
        self.data[i..i + RGB_BYTES].copy_from_slice(&rgb);
    }

    /// Copy `image` with its top-left corner at (x, y), clipped to the canvas.
    pub fn blit(&mut self, image: &RgbImage, x: u32, y: u32) {
        let max_w = self.width.saturating_sub(x).min(image.width);
        let max_h = self.height.saturating_sub(y).min(image.height);
        let row_bytes = max_w as usize * RGB_BYTES;
        for row in 0..max_h {
            let src = row as usize * image.width as usize * RGB_BYTES;
            let dst = ((y + row) as usize * self.width as usize + x as usize) * RGB_BYTES;
            self.data[dst..dst + row_bytes].copy_from_slice(&image.data[src..src + row_bytes]);
        }
    }

    /// Fit `image` into the box and center it there.
    pub fn blit_centered(&mut self, image: &RgbImage, x: u32, y: u32, box_w: u32, box_h: u32) {
        let fitted = image.fit(box_w, box_h);
        let off_x = x + (box_w.saturating_sub(fitted.width)) / 2;
        let off_y = y + (box_h.saturating_sub(fitted.height)) / 2;
        self.blit(&fitted, off_x, off_y);
    }

    pub fn into_image(self) -> RgbImage {
        RgbImage {
            width: self.width,
            height: self.height,
            data: Bytes::from(self.data),
        }
    }
}

/// Rec. 601 luma
#[inline]
pub fn luminance([r, g, b]: [u8; 3]) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
}
