//! Speech synthesis seam.
//!
//! A synthesis server turns text into 32 kHz mono 16-bit audio. The playback
//! engine uses it two ways: streamed per sentence for live playback, and once
//! non-streamed for the full text when a copy is saved.

pub mod http;
pub mod sentence;

pub use http::{HttpSynthesisBackend, HttpSynthesisConfig};
pub use sentence::{speed_for_sentence, split_sentences};

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Sample rate of synthesized audio (Hz).
pub const SYNTHESIS_SAMPLE_RATE: u32 = 32_000;

/// Request body sent to the synthesis server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub character: String,
    pub emotion: String,
    pub text_language: String,
    pub speed: f32,
    pub stream: bool,
}

/// Voice parameters shared by every request of one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceProfile {
    pub character: String,
    pub emotion: String,
    pub language: String,
    /// Speed multiplier sent for short sentences and full-text saves.
    pub base_speed: f32,
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self {
            character: "default".to_string(),
            emotion: "default".to_string(),
            language: "多语种混合".to_string(),
            base_speed: 1.0,
        }
    }
}

impl VoiceProfile {
    pub fn request(&self, text: &str, speed: f32, stream: bool) -> SynthesisRequest {
        SynthesisRequest {
            text: text.to_string(),
            character: self.character.clone(),
            emotion: self.emotion.clone(),
            text_language: self.language.clone(),
            speed,
            stream,
        }
    }
}

/// Contract for synthesis backends.
pub trait SynthesisBackend: Send + Sync + 'static {
    /// Start a streamed synthesis. Audio bytes are read incrementally from
    /// the returned reader; a read error means the stream broke mid-sentence.
    fn stream(&self, request: &SynthesisRequest) -> Result<Box<dyn Read + Send>>;

    /// Complete synthesis in one payload.
    fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>>;
}
