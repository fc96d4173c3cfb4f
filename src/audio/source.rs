//! Pull-based media sources for local-mirror playback

/// Something the output callback can pull samples from directly.
///
/// `read` must not block or allocate: it runs inside the device callback.
pub trait MediaSource: Send {
    /// Fill up to `out.len()` samples, returning how many were produced.
    /// Fewer than requested is normal; the caller pads.
    fn read(&mut self, out: &mut [f32]) -> usize;

    /// True once the source will never produce again
    fn is_finished(&self) -> bool {
        false
    }
}

/// Endless sine tone
pub struct ToneSource {
    phase: f32,
    step: f32,
    amplitude: f32,
}

impl ToneSource {
    pub fn new(frequency: f32, sample_rate: u32, amplitude: f32) -> Self {
        Self {
            phase: 0.0,
            step: std::f32::consts::TAU * frequency / sample_rate.max(1) as f32,
            amplitude,
        }
    }
}

impl MediaSource for ToneSource {
    fn read(&mut self, out: &mut [f32]) -> usize {
        for sample in out.iter_mut() {
            *sample = self.phase.sin() * self.amplitude;
            self.phase = (self.phase + self.step) % std::f32::consts::TAU;
        }
        out.len()
    }
}

/// Finite in-memory clip
pub struct BufferSource {
    samples: Vec<f32>,
    position: usize,
}

impl BufferSource {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            position: 0,
        }
    }
}

impl MediaSource for BufferSource {
    fn read(&mut self, out: &mut [f32]) -> usize {
        let n = (self.samples.len() - self.position).min(out.len());
        out[..n].copy_from_slice(&self.samples[self.position..self.position + n]);
        self.position += n;
        n
    }

    fn is_finished(&self) -> bool {
        self.position >= self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_source_short_reads() {
        let mut source = BufferSource::new(vec![1.0, 2.0, 3.0]);
        let mut out = [0.0; 2];
        assert_eq!(source.read(&mut out), 2);
        assert_eq!(source.read(&mut out), 1);
        assert_eq!(out[0], 3.0);
        assert!(source.is_finished());
        assert_eq!(source.read(&mut out), 0);
    }

    #[test]
    fn test_tone_is_bounded() {
        let mut tone = ToneSource::new(440.0, 48000, 0.5);
        let mut out = [0.0; 512];
        assert_eq!(tone.read(&mut out), 512);
        assert!(out.iter().all(|s| s.abs() <= 0.5));
        assert!(out.iter().any(|s| s.abs() > 0.4));
    }
}
