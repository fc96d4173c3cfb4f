//! Local video sources
//!
//! Camera drivers are external; [`TestPattern`] stands in for one.

use std::time::{Duration, Instant};

use super::image::{Canvas, RgbImage};

/// Pull-based frame producer
pub trait VideoSource: Send {
    /// Next frame, or `None` if the source has nothing new yet
    fn next_frame(&mut self) -> Option<RgbImage>;

    fn dimensions(&self) -> (u32, u32);
}

/// Moving gradient with a bouncing block, paced to a frame rate
pub struct TestPattern {
    width: u32,
    height: u32,
    frame_interval: Duration,
    last_frame: Option<Instant>,
    tick: u32,
}

impl TestPattern {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width: width.max(8),
            height: height.max(8),
            frame_interval: Duration::from_secs(1) / fps.max(1),
            last_frame: None,
            tick: 0,
        }
    }

    /// Render the pattern for `tick` regardless of pacing.
    pub fn frame_at(&self, tick: u32) -> RgbImage {
        let mut canvas = Canvas::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let r = ((x + tick) * 255 / self.width) as u8;
                let g = (y * 255 / self.height) as u8;
                let b = (tick.wrapping_mul(3) % 256) as u8;
                canvas.set(x, y, [r, g, b]);
            }
        }

        let size = self.height / 4;
        let span = self.width.saturating_sub(size).max(1);
        let phase = tick % (span * 2);
        let bx = if phase < span { phase } else { span * 2 - phase };
        let by = (self.height - size) / 2;
        for y in by..by + size {
            for x in bx..(bx + size).min(self.width) {
                canvas.set(x, y, [255, 255, 255]);
            }
        }
        canvas.into_image()
    }
}

impl VideoSource for TestPattern {
    fn next_frame(&mut self) -> Option<RgbImage> {
        let now = Instant::now();
        if let Some(last) = self.last_frame {
            if now.duration_since(last) < self.frame_interval {
                return None;
            }
        }
        self.last_frame = Some(now);
        self.tick = self.tick.wrapping_add(1);
        Some(self.frame_at(self.tick))
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_dimensions_and_motion() {
        let pattern = TestPattern::new(32, 16, 30);
        let a = pattern.frame_at(1);
        let b = pattern.frame_at(2);
        assert_eq!((a.width(), a.height()), (32, 16));
        assert_ne!(a, b);
    }

    #[test]
    fn test_pacing() {
        let mut pattern = TestPattern::new(16, 16, 1);
        assert!(pattern.next_frame().is_some());
        assert!(pattern.next_frame().is_none());
    }
}
