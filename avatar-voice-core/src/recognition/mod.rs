//! Speech recognition seam.
//!
//! The capture engine hands each closed segment to a [`RecognitionBackend`]
//! as a 16 kHz mono WAV file and expects plain text back. An empty string
//! means "nothing recognised" and is not stored.

pub mod http;
pub mod stub;

pub use http::{HttpRecognitionBackend, HttpRecognitionConfig};
pub use stub::StubRecognizer;

use std::path::Path;

use crate::error::Result;

/// Contract for recognition backends.
///
/// Called from the recognition loop thread, once per closed segment.
pub trait RecognitionBackend: Send + Sync + 'static {
    /// Transcribe the WAV file at `wav_path`.
    ///
    /// # Errors
    /// Any failure; the caller logs it and skips the segment.
    fn recognize(&self, wav_path: &Path) -> Result<String>;
}
