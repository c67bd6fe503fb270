//! `StubRecognizer`: placeholder backend that reports what it was given.
//!
//! Lets the whole capture path run end-to-end without a recognition server.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use super::RecognitionBackend;
use crate::error::Result;

/// Segments shorter than 10 ms are reported as empty.
const MIN_SAMPLES: u32 = 160;

/// Returns `"[stub: <N> samples @ <SR> Hz]"` for every segment.
#[derive(Debug, Default)]
pub struct StubRecognizer {
    calls: AtomicU32,
}

impl StubRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl RecognitionBackend for StubRecognizer {
    fn recognize(&self, wav_path: &Path) -> Result<String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let reader = hound::WavReader::open(wav_path)?;
        let samples = reader.len();
        let rate = reader.spec().sample_rate;
        debug!(samples, rate, "stub recognition");
        if samples < MIN_SAMPLES {
            return Ok(String::new());
        }
        Ok(format!("[stub: {samples} samples @ {rate} Hz]"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::write_pcm16_wav;

    #[test]
    fn describes_segment() {
        let path = std::env::temp_dir().join(format!("avatar-voice-stub-{}.wav", std::process::id()));
        write_pcm16_wav(&path, &[0; 480], 16_000).unwrap();
        let stub = StubRecognizer::new();
        assert_eq!(stub.recognize(&path).unwrap(), "[stub: 480 samples @ 16000 Hz]");
        assert_eq!(stub.calls(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_is_an_error() {
        let stub = StubRecognizer::new();
        assert!(stub.recognize(Path::new("/nonexistent/avatar-voice.wav")).is_err());
    }
}
