//! Voice Activity Detection (VAD) abstraction.
//!
//! The `VoiceActivityDetector` trait is the seam between the segmentation loop
//! and whatever classifier produces the per-frame verdict: `WebRtcVad`
//! (default), `EnergyVad`, or a scripted detector in tests.
//!
//! # Threading note
//!
//! The WebRTC classifier wraps a raw C handle and is `!Send`. Detectors are
//! therefore not required to be `Send`; the engine receives a [`VadFactory`]
//! and builds the detector on the VAD loop thread that uses it.

pub mod energy;

#[cfg(feature = "webrtc-vad")]
pub mod webrtc;

#[cfg(feature = "webrtc-vad")]
pub use webrtc::WebRtcVad;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffering::frame::AudioFrame;
use crate::error::Result;

/// Whether a given audio frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

impl From<bool> for VadDecision {
    fn from(is_speech: bool) -> Self {
        if is_speech {
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }
}

/// Classifier sensitivity. Higher modes are stricter about what counts as
/// speech in noisy rooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VadAggressiveness {
    Quality,
    LowBitrate,
    Aggressive,
    #[default]
    VeryAggressive,
}

impl VadAggressiveness {
    /// Parse the 0..=3 numeric scale used by WebRTC tooling.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Quality,
            1 => Self::LowBitrate,
            2 => Self::Aggressive,
            _ => Self::VeryAggressive,
        }
    }
}

/// Trait for all VAD implementations.
///
/// Implementors may be stateful (hangover counters, filter state, etc.).
pub trait VoiceActivityDetector {
    /// Classify one capture frame.
    ///
    /// # Errors
    /// Returns an error for frames the classifier cannot process (wrong
    /// length, internal failure). The caller drops that frame.
    fn classify(&mut self, frame: &AudioFrame) -> Result<VadDecision>;

    /// Reset any internal state.
    fn reset(&mut self);
}

/// Builds a detector on the thread that will own it.
pub type VadFactory = Arc<dyn Fn() -> Result<Box<dyn VoiceActivityDetector>> + Send + Sync>;

/// Default factory: WebRTC when compiled in, energy classifier otherwise.
pub fn default_factory(aggressiveness: VadAggressiveness) -> VadFactory {
    #[cfg(feature = "webrtc-vad")]
    {
        Arc::new(move || Ok(Box::new(WebRtcVad::new(aggressiveness)) as Box<dyn VoiceActivityDetector>))
    }
    #[cfg(not(feature = "webrtc-vad"))]
    {
        let threshold = energy::EnergyVad::threshold_for(aggressiveness);
        Arc::new(move || {
            Ok(Box::new(energy::EnergyVad::new(threshold, energy::DEFAULT_HANGOVER_FRAMES))
                as Box<dyn VoiceActivityDetector>)
        })
    }
}
