//! Energy-based VAD using RMS threshold + hangover counter.
//!
//! ## Algorithm
//!
//! 1. Compute RMS of the frame (samples normalised to [-1, 1]).
//! 2. If RMS ≥ `threshold` → `Speech`, reload the hangover counter.
//! 3. If RMS < `threshold` and hangover counter > 0 → `Speech`, decrement.
//! 4. Otherwise → `Silence`.

use super::{VadAggressiveness, VadDecision, VoiceActivityDetector};
use crate::buffering::frame::{i16_to_f32, AudioFrame};
use crate::error::{Result, VoiceError};

/// ≈ 90 ms of hangover at 30 ms frames.
pub const DEFAULT_HANGOVER_FRAMES: u32 = 3;

#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// RMS threshold in normalised units. Typical range: 0.005–0.05.
    threshold: f32,
    hangover_frames: u32,
    hangover_counter: u32,
}

impl EnergyVad {
    pub fn new(threshold: f32, hangover_frames: u32) -> Self {
        Self {
            threshold,
            hangover_frames,
            hangover_counter: 0,
        }
    }

    /// Map the WebRTC-style aggressiveness scale onto an RMS threshold.
    pub fn threshold_for(aggressiveness: VadAggressiveness) -> f32 {
        match aggressiveness {
            VadAggressiveness::Quality => 0.006,
            VadAggressiveness::LowBitrate => 0.01,
            VadAggressiveness::Aggressive => 0.015,
            VadAggressiveness::VeryAggressive => 0.02,
        }
    }

    fn rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples
            .iter()
            .map(|&s| {
                let v = i16_to_f32(s);
                v * v
            })
            .sum();
        (sum_sq / samples.len() as f32).sqrt()
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(0.02, DEFAULT_HANGOVER_FRAMES)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, frame: &AudioFrame) -> Result<VadDecision> {
        if frame.samples.is_empty() {
            return Err(VoiceError::InvalidFrameLength {
                expected: crate::buffering::frame::FRAME_SAMPLES,
                actual: 0,
            });
        }

        let rms = Self::rms(&frame.samples);
        let decision = if rms >= self.threshold {
            self.hangover_counter = self.hangover_frames;
            VadDecision::Speech
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            VadDecision::Speech
        } else {
            VadDecision::Silence
        };
        Ok(decision)
    }

    fn reset(&mut self) {
        self.hangover_counter = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::frame::FRAME_SAMPLES;
    use approx::assert_relative_eq;

    fn silent_frame() -> AudioFrame {
        AudioFrame::new(0, vec![0; FRAME_SAMPLES])
    }

    fn loud_frame(amplitude: i16) -> AudioFrame {
        AudioFrame::new(0, vec![amplitude; FRAME_SAMPLES])
    }

    #[test]
    fn silence_below_threshold() {
        let mut vad = EnergyVad::new(0.02, 0);
        assert_eq!(vad.classify(&silent_frame()).unwrap(), VadDecision::Silence);
    }

    #[test]
    fn speech_above_threshold() {
        let mut vad = EnergyVad::new(0.02, 0);
        assert_eq!(vad.classify(&loud_frame(8_000)).unwrap(), VadDecision::Speech);
    }

    #[test]
    fn hangover_extends_speech() {
        let mut vad = EnergyVad::new(0.02, 2);
        assert_eq!(vad.classify(&loud_frame(8_000)).unwrap(), VadDecision::Speech);
        assert_eq!(vad.classify(&silent_frame()).unwrap(), VadDecision::Speech);
        assert_eq!(vad.classify(&silent_frame()).unwrap(), VadDecision::Speech);
        assert_eq!(vad.classify(&silent_frame()).unwrap(), VadDecision::Silence);
    }

    #[test]
    fn reset_clears_hangover() {
        let mut vad = EnergyVad::new(0.02, 5);
        vad.classify(&loud_frame(8_000)).unwrap();
        vad.reset();
        assert_eq!(vad.classify(&silent_frame()).unwrap(), VadDecision::Silence);
    }

    #[test]
    fn empty_frame_is_an_error() {
        let mut vad = EnergyVad::default();
        assert!(vad.classify(&AudioFrame::new(0, vec![])).is_err());
    }

    #[test]
    fn rms_of_square_wave() {
        let samples: Vec<i16> = (0..256)
            .map(|i| if i % 2 == 0 { 16_384 } else { -16_384 })
            .collect();
        assert_relative_eq!(EnergyVad::rms(&samples), 0.5, epsilon = 1e-5);
    }
}
