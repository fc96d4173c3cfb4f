//! Worker-side signal processing: echo cancellation, gain, resampling

/// Normalised LMS adaptive filter removing the rendered output (the echo
/// reference) from captured input.
pub struct EchoCanceller {
    weights: Vec<f32>,
    /// Reference history, newest sample at `head`
    history: Vec<f32>,
    head: usize,
    step_size: f32,
    frames_processed: u64,
    frames_skipped: u64,
}

impl EchoCanceller {
    pub const DEFAULT_FILTER_LEN: usize = 256;
    pub const DEFAULT_STEP_SIZE: f32 = 0.1;

    pub fn new(filter_len: usize, step_size: f32) -> Self {
        let filter_len = filter_len.max(1);
        Self {
            weights: vec![0.0; filter_len],
            history: vec![0.0; filter_len],
            head: 0,
            step_size,
            frames_processed: 0,
            frames_skipped: 0,
        }
    }

    /// Cancel echo in place. With no reference the capture passes through
    /// unchanged; returns whether cancellation ran.
    pub fn process(&mut self, capture: &mut [f32], reference: Option<&[f32]>) -> bool {
        let reference = match reference {
            Some(r) if !r.is_empty() => r,
            _ => {
                self.frames_skipped += 1;
                return false;
            }
        };

        let len = self.weights.len();
        for (i, sample) in capture.iter_mut().enumerate() {
            let far = reference.get(i).copied().unwrap_or(0.0);
            self.head = (self.head + len - 1) % len;
            self.history[self.head] = far;

            let mut estimate = 0.0f32;
            let mut energy = 1e-6f32;
            for k in 0..len {
                let x = self.history[(self.head + k) % len];
                estimate += self.weights[k] * x;
                energy += x * x;
            }

            let error = *sample - estimate;
            let mu = self.step_size * error / energy;
            for k in 0..len {
                let x = self.history[(self.head + k) % len];
                self.weights[k] += mu * x;
            }
            *sample = error;
        }
        self.frames_processed += 1;
        true
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped
    }

    pub fn reset(&mut self) {
        self.weights.fill(0.0);
        self.history.fill(0.0);
        self.head = 0;
    }
}

/// Scale by `gain` and clamp to [-1, 1].
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        for s in samples.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
        return;
    }
    for s in samples.iter_mut() {
        *s = (*s * gain).clamp(-1.0, 1.0);
    }
}

/// Average interleaved channels down to mono.
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Largest expansion `resample_linear` produces per input sample
pub const MAX_RESAMPLE_FACTOR: usize =
    (crate::constants::MAX_SAMPLE_RATE / crate::constants::MIN_SAMPLE_RATE) as usize;

/// Linear interpolation resampler. Output never exceeds
/// [`MAX_RESAMPLE_FACTOR`] samples per input sample.
pub fn resample_linear(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || samples.is_empty() || source_rate == 0 || target_rate == 0 {
        return samples.to_vec();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let output_len = (((samples.len() as f64) / ratio).ceil() as usize)
        .min(samples.len().saturating_mul(MAX_RESAMPLE_FACTOR));
    let last = samples.len() - 1;

    (0..output_len)
        .filter_map(|i| {
            let pos = i as f64 * ratio;
            let idx0 = pos.floor() as usize;
            if idx0 > last {
                return None;
            }
            let idx1 = (idx0 + 1).min(last);
            let frac = (pos - idx0 as f64) as f32;
            Some(samples[idx0] * (1.0 - frac) + samples[idx1] * frac)
        })
        .collect()
}

/// Root-mean-square level
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_canceller_skips_without_reference() {
        let mut aec = EchoCanceller::new(16, 0.5);
        let mut capture = [0.3f32; 8];
        assert!(!aec.process(&mut capture, None));
        assert_eq!(capture, [0.3; 8]);
        assert_eq!(aec.frames_skipped(), 1);
    }

    #[test]
    fn test_echo_canceller_converges_on_pure_echo() {
        let mut aec = EchoCanceller::new(8, 0.5);
        let reference: Vec<f32> = (0..256).map(|i| ((i as f32) * 0.37).sin() * 0.5).collect();

        let mut first_rms = 0.0;
        let mut last_rms = 0.0;
        for block in 0..40 {
            // Echo path: attenuated copy of the reference
            let mut capture: Vec<f32> = reference.iter().map(|r| r * 0.6).collect();
            aec.process(&mut capture, Some(&reference));
            let level = rms(&capture);
            if block == 0 {
                first_rms = level;
            }
            last_rms = level;
        }
        assert!(last_rms < first_rms * 0.1, "residual {} vs {}", last_rms, first_rms);
    }

    #[test]
    fn test_gain_clamps() {
        let mut samples = [0.2, -0.6, 0.9];
        apply_gain(&mut samples, 2.0);
        assert_eq!(samples, [0.4, -1.0, 1.0]);
    }

    #[test]
    fn test_downmix() {
        assert_eq!(downmix_to_mono(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
    }

    #[test]
    fn test_resample_same_rate() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&samples, 48000, 48000), samples);
    }

    #[test]
    fn test_resample_downsample() {
        let samples: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let out = resample_linear(&samples, 96000, 48000);
        assert_eq!(out.len(), 50);
        assert_eq!(out[1], 2.0);
    }

    #[test]
    fn test_resample_upsample() {
        let samples = vec![0.0, 1.0];
        let out = resample_linear(&samples, 24000, 48000);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn test_resample_output_is_bounded() {
        let out = resample_linear(&vec![0.0; 1000], 1, 48_000);
        assert_eq!(out.len(), 1000 * MAX_RESAMPLE_FACTOR);
    }
}
