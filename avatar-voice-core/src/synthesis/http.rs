//! Synthesis over HTTP with reqwest's blocking client.
//!
//! The blocking `Response` implements `Read`, so a streamed reply is handed
//! to the playback engine as-is and consumed chunk by chunk.

use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use tracing::{debug, warn};

use super::{SynthesisBackend, SynthesisRequest};
use crate::error::{Result, VoiceError};

#[derive(Debug, Clone)]
pub struct HttpSynthesisConfig {
    pub url: String,
    /// Connect timeout for every request.
    pub connect_timeout: Duration,
    /// Total timeout for non-streamed requests. Streamed replies are bounded
    /// by the playback engine instead.
    pub request_timeout: Duration,
}

impl Default for HttpSynthesisConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000/api/tts".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
        }
    }
}

pub struct HttpSynthesisBackend {
    config: HttpSynthesisConfig,
    client: Client,
}

impl HttpSynthesisBackend {
    pub fn new(config: HttpSynthesisConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(None)
            .build()?;
        Ok(Self { config, client })
    }

    fn send(&self, request: &SynthesisRequest, timeout: Option<Duration>) -> Result<Response> {
        let mut builder = self.client.post(&self.config.url).json(request);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder.send()?;
        let status = response.status();
        if !status.is_success() {
            warn!(%status, stream = request.stream, "synthesis request returned non-success status");
            return Err(VoiceError::Synthesis(format!("server returned {status}")));
        }
        Ok(response)
    }
}

impl SynthesisBackend for HttpSynthesisBackend {
    fn stream(&self, request: &SynthesisRequest) -> Result<Box<dyn Read + Send>> {
        let response = self.send(request, None)?;
        debug!(chars = request.text.chars().count(), "synthesis stream opened");
        Ok(Box::new(response))
    }

    fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        let response = self.send(request, Some(self.config.request_timeout))?;
        let bytes = response.bytes()?;
        debug!(bytes = bytes.len(), "synthesis payload received");
        Ok(bytes.to_vec())
    }
}
