//! Channel and rate adaptation for devices that refuse the capture constraints

/// Average interleaved channels down to a single mono channel.
pub fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Integer-ratio decimator for a continuous stream.
///
/// Each output sample is the mean of `ratio` consecutive inputs. Inputs that
/// don't complete a group are carried into the next call, so the output
/// length across calls is always `total_input / ratio`.
#[derive(Debug)]
pub struct Decimator {
    ratio: usize,
    carry: Vec<f32>,
}

impl Decimator {
    /// `None` unless `source_rate` is a positive integer multiple of `target_rate`.
    pub fn new(source_rate: u32, target_rate: u32) -> Option<Self> {
        if target_rate == 0 || source_rate == 0 || source_rate % target_rate != 0 {
            log::warn!(
                "Unsupported resample ratio {}:{}",
                source_rate,
                target_rate
            );
            return None;
        }

        let ratio = (source_rate / target_rate) as usize;
        Some(Self {
            ratio,
            carry: Vec::with_capacity(ratio),
        })
    }

    pub fn ratio(&self) -> usize {
        self.ratio
    }

    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.ratio == 1 {
            return samples.to_vec();
        }

        let mut out = Vec::with_capacity((self.carry.len() + samples.len()) / self.ratio);
        let mut rest = samples;

        if !self.carry.is_empty() {
            let needed = self.ratio - self.carry.len();
            if rest.len() < needed {
                self.carry.extend_from_slice(rest);
                return out;
            }
            self.carry.extend_from_slice(&rest[..needed]);
            out.push(mean(&self.carry));
            self.carry.clear();
            rest = &rest[needed..];
        }

        let whole = rest.len() - rest.len() % self.ratio;
        out.extend(rest[..whole].chunks_exact(self.ratio).map(mean));
        self.carry.extend_from_slice(&rest[whole..]);
        out
    }
}

fn mean(group: &[f32]) -> f32 {
    group.iter().sum::<f32>() / group.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo() {
        let input = vec![0.2, 0.4, -1.0, 1.0, 0.5, 0.5];
        let output = downmix_to_mono(&input, 2);
        assert_eq!(output.len(), 3);
        assert!((output[0] - 0.3).abs() < 1e-6);
        assert_eq!(output[1], 0.0);
        assert_eq!(output[2], 0.5);
    }

    #[test]
    fn test_downmix_mono_passthrough() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(downmix_to_mono(&input, 1), input);
    }

    #[test]
    fn test_decimate_3x() {
        // 48kHz → 16kHz (3:1)
        let mut decimator = Decimator::new(48000, 16000).unwrap();
        let output = decimator.process(&[0.3, 0.6, 0.9, -0.3, -0.6, -0.9]);

        assert_eq!(decimator.ratio(), 3);
        assert_eq!(output.len(), 2);
        assert!((output[0] - 0.6).abs() < 1e-6);
        assert!((output[1] + 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_decimate_carries_partial_groups() {
        let mut decimator = Decimator::new(48000, 16000).unwrap();

        assert!(decimator.process(&[0.3, 0.6]).is_empty());
        let output = decimator.process(&[0.9, -0.3, -0.6, -0.9, 0.5]);

        assert_eq!(output.len(), 2);
        assert!((output[0] - 0.6).abs() < 1e-6);
        assert!((output[1] + 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_decimate_keeps_rate_over_odd_callbacks() {
        let mut decimator = Decimator::new(48000, 16000).unwrap();
        let produced: usize = (0..141)
            .map(|_| decimator.process(&vec![0.1; 1024]).len())
            .sum();

        assert_eq!(produced, 141 * 1024 / 3);
    }

    #[test]
    fn test_decimate_same_rate() {
        let mut decimator = Decimator::new(16000, 16000).unwrap();
        let input = vec![0.1, 0.2, 0.3];

        assert_eq!(decimator.process(&input), input);
    }

    #[test]
    fn test_decimate_rejects_bad_ratios() {
        // 44.1kHz → 16kHz is not an integer ratio
        assert!(Decimator::new(44100, 16000).is_none());
        assert!(Decimator::new(48000, 0).is_none());
        assert!(Decimator::new(0, 16000).is_none());
        assert!(Decimator::new(8000, 16000).is_none());
    }
}
