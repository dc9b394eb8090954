//! Speaking detection from microphone PCM.
//!
//! RNNoise (via `nnnoiseless`) yields a voice-activity probability per 10ms
//! frame at 48kHz. A plain threshold flickers on every breath, so the state
//! switches on at a high probability and only switches off after a run of
//! quiet frames.

use nnnoiseless::DenoiseState;

/// Samples per RNNoise frame (10ms at 48kHz)
pub const FRAME_SIZE: usize = DenoiseState::FRAME_SIZE;

const ON_THRESHOLD: f32 = 0.6;
const OFF_THRESHOLD: f32 = 0.3;
/// Quiet frames before speaking ends (250ms)
const HANGOVER_FRAMES: u32 = 25;

pub struct SpeakingDetector {
    denoise: Box<DenoiseState<'static>>,
    pending: Vec<f32>,
    output: Vec<f32>,
    speaking: bool,
    quiet_frames: u32,
}

impl Default for SpeakingDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeakingDetector {
    pub fn new() -> Self {
        Self {
            denoise: DenoiseState::new(),
            pending: Vec::with_capacity(FRAME_SIZE),
            output: vec![0.0; FRAME_SIZE],
            speaking: false,
            quiet_frames: 0,
        }
    }

    /// Feed mono 48kHz samples. Returns the new speaking state when it
    /// changed.
    pub fn push_samples(&mut self, samples: &[i16]) -> Option<bool> {
        let mut changed = None;
        for &sample in samples {
            // RNNoise works on i16-range floats
            self.pending.push(f32::from(sample));
            if self.pending.len() == FRAME_SIZE {
                let probability = self.denoise.process_frame(&mut self.output, &self.pending);
                self.pending.clear();
                if let Some(state) = self.update(probability) {
                    changed = Some(state);
                }
            }
        }
        changed
    }

    /// Apply one frame's voice probability.
    pub fn update(&mut self, probability: f32) -> Option<bool> {
        if probability >= ON_THRESHOLD {
            self.quiet_frames = 0;
            if !self.speaking {
                self.speaking = true;
                return Some(true);
            }
        } else if self.speaking && probability < OFF_THRESHOLD {
            self.quiet_frames += 1;
            if self.quiet_frames >= HANGOVER_FRAMES {
                self.speaking = false;
                self.quiet_frames = 0;
                return Some(false);
            }
        }
        None
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.speaking = false;
        self.quiet_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hysteresis() {
        let mut vad = SpeakingDetector::new();
        assert_eq!(vad.update(0.9), Some(true));
        assert_eq!(vad.update(0.95), None);

        // Mid-range probability neither starts nor ends speech
        for _ in 0..100 {
            assert_eq!(vad.update(0.45), None);
        }
        assert!(vad.is_speaking());

        for _ in 0..HANGOVER_FRAMES - 1 {
            assert_eq!(vad.update(0.1), None);
        }
        assert_eq!(vad.update(0.1), Some(false));
    }

    #[test]
    fn test_single_loud_frame_resets_hangover() {
        let mut vad = SpeakingDetector::new();
        vad.update(0.9);
        for _ in 0..HANGOVER_FRAMES - 1 {
            vad.update(0.0);
        }
        vad.update(0.8);
        for _ in 0..HANGOVER_FRAMES - 1 {
            assert_eq!(vad.update(0.0), None);
        }
        assert!(vad.is_speaking());
    }

    #[test]
    fn test_silence_never_speaks() {
        let mut vad = SpeakingDetector::new();
        let silence = vec![0i16; FRAME_SIZE * 20];
        assert_eq!(vad.push_samples(&silence), None);
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_partial_frames_are_buffered() {
        let mut vad = SpeakingDetector::new();
        vad.push_samples(&[0; FRAME_SIZE / 2]);
        assert_eq!(vad.pending.len(), FRAME_SIZE / 2);
        vad.push_samples(&[0; FRAME_SIZE / 2]);
        assert!(vad.pending.is_empty());
    }
}
