//! Recognition over HTTP: multipart WAV upload, JSON `{"text": ...}` reply.

use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{multipart, Client};
use tracing::{debug, warn};

use super::RecognitionBackend;
use crate::error::{Result, VoiceError};

#[derive(Debug, Clone)]
pub struct HttpRecognitionConfig {
    /// Full URL of the transcription endpoint.
    pub url: String,
    /// Sent as the `language` form field when set.
    pub language: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpRecognitionConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000/api/asr".to_string(),
            language: None,
            timeout: Duration::from_secs(20),
        }
    }
}

pub struct HttpRecognitionBackend {
    config: HttpRecognitionConfig,
    client: Client,
}

impl HttpRecognitionBackend {
    pub fn new(config: HttpRecognitionConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }
}

impl RecognitionBackend for HttpRecognitionBackend {
    fn recognize(&self, wav_path: &Path) -> Result<String> {
        let wav_bytes = std::fs::read(wav_path)?;
        let file_name = wav_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "segment.wav".to_string());

        let file_part = multipart::Part::bytes(wav_bytes)
            .file_name(file_name)
            .mime_str("audio/wav")?;
        let mut form = multipart::Form::new()
            .text("response_format", "json")
            .part("file", file_part);
        if let Some(language) = &self.config.language {
            form = form.text("language", language.clone());
        }

        let response = self.client.post(&self.config.url).multipart(form).send()?;
        let status = response.status();
        if !status.is_success() {
            warn!(%status, "recognition request returned non-success status");
            return Err(VoiceError::Recognition(format!("server returned {status}")));
        }

        let payload: serde_json::Value = response.json()?;
        let text = payload
            .get("text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| VoiceError::Recognition("response has no `text` field".into()))?
            .trim()
            .to_string();
        debug!(chars = text.chars().count(), "recognition reply");
        Ok(text)
    }
}
