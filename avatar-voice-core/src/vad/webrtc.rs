//! WebRTC voice-activity classifier.
//!
//! Accepts exactly one 30 ms frame (480 samples) of 16 kHz mono i16 audio.

use webrtc_vad::{SampleRate, Vad, VadMode};

use super::{VadAggressiveness, VadDecision, VoiceActivityDetector};
use crate::buffering::frame::{AudioFrame, FRAME_SAMPLES};
use crate::error::{Result, VoiceError};

impl From<VadAggressiveness> for VadMode {
    fn from(mode: VadAggressiveness) -> Self {
        match mode {
            VadAggressiveness::Quality => VadMode::Quality,
            VadAggressiveness::LowBitrate => VadMode::LowBitrate,
            VadAggressiveness::Aggressive => VadMode::Aggressive,
            VadAggressiveness::VeryAggressive => VadMode::VeryAggressive,
        }
    }
}

/// `!Send`: build it on the thread that classifies.
pub struct WebRtcVad {
    vad: Vad,
    aggressiveness: VadAggressiveness,
}

impl WebRtcVad {
    pub fn new(aggressiveness: VadAggressiveness) -> Self {
        Self {
            vad: Vad::new_with_rate_and_mode(SampleRate::Rate16kHz, aggressiveness.into()),
            aggressiveness,
        }
    }
}

impl VoiceActivityDetector for WebRtcVad {
    fn classify(&mut self, frame: &AudioFrame) -> Result<VadDecision> {
        if frame.samples.len() != FRAME_SAMPLES {
            return Err(VoiceError::InvalidFrameLength {
                expected: FRAME_SAMPLES,
                actual: frame.samples.len(),
            });
        }
        self.vad
            .is_voice_segment(&frame.samples)
            .map(VadDecision::from)
            .map_err(|()| VoiceError::Vad("webrtc classifier rejected frame".into()))
    }

    fn reset(&mut self) {
        self.vad = Vad::new_with_rate_and_mode(SampleRate::Rate16kHz, self.aggressiveness.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digital_silence_is_not_speech() {
        let mut vad = WebRtcVad::new(VadAggressiveness::VeryAggressive);
        let frame = AudioFrame::new(0, vec![0; FRAME_SAMPLES]);
        assert_eq!(vad.classify(&frame).unwrap(), VadDecision::Silence);
    }

    #[test]
    fn wrong_length_frame_is_rejected() {
        let mut vad = WebRtcVad::new(VadAggressiveness::Aggressive);
        let frame = AudioFrame::new(0, vec![0; 100]);
        assert!(matches!(
            vad.classify(&frame),
            Err(VoiceError::InvalidFrameLength { expected: 480, actual: 100 })
        ));
    }
}
