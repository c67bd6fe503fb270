//! `PlaybackEngine`: response text → streamed speech on the speakers, plus
//! a saved copy of the whole response.
//!
//! ## One `speak` call
//!
//! 1. Split the text into sentences.
//! 2. `synthesis` streams each sentence from the backend in order, shows it
//!    through `on_chunk` (via `display`), then queues its PCM.
//! 3. `playback` writes queued PCM to the output device.
//! 4. Meanwhile the calling thread requests the full text once, non-streamed,
//!    and writes it to `response_<YYYYmmdd_HHMMSS_mmm>.wav`.
//! 5. `playback` reports done once everything was sent and no audio arrived
//!    for `idle_timeout`, after a `grace_period` for the device to drain.
//!
//! The saved file never comes from the streamed sentence audio.

pub mod pipeline;

use std::fs;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, info_span, warn};

use crate::audio::{wav, DeviceClaim, OutputDevice};
use crate::error::{Result, VoiceError};
use crate::lifecycle::{LifecycleManager, DEFAULT_JOIN_TIMEOUT};
use crate::synthesis::{split_sentences, SynthesisBackend, VoiceProfile, SYNTHESIS_SAMPLE_RATE};

use pipeline::{DisplayLoop, DisplayRequest, PlaybackLoop, SpeakState, SynthesisLoop};

/// One sentence as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentenceChunk {
    pub index: usize,
    pub text: String,
}

/// A block of 16-bit PCM belonging to one sentence.
#[derive(Debug, Clone)]
pub struct PcmChunk {
    pub sentence: usize,
    pub bytes: Vec<u8>,
}

/// Called on the display loop thread, once per sentence, before its audio plays.
pub type ChunkCallback = Arc<dyn Fn(&SentenceChunk) + Send + Sync>;

#[derive(Clone)]
pub struct SpeakOptions {
    pub save_to_file: bool,
    pub play_audio: bool,
    pub on_chunk: Option<ChunkCallback>,
}

impl Default for SpeakOptions {
    fn default() -> Self {
        Self {
            save_to_file: true,
            play_audio: true,
            on_chunk: None,
        }
    }
}

impl std::fmt::Debug for SpeakOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeakOptions")
            .field("save_to_file", &self.save_to_file)
            .field("play_audio", &self.play_audio)
            .field("on_chunk", &self.on_chunk.is_some())
            .finish()
    }
}

/// What one `speak` call achieved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakOutcome {
    pub sentences_total: usize,
    pub sentences_failed: usize,
    pub bytes_enqueued: u64,
    pub bytes_played: u64,
    /// `None` when saving was not requested or failed.
    pub saved_path: Option<PathBuf>,
    /// `false` when playback did not report done within `completion_timeout`.
    pub completed: bool,
}

/// Configuration for `PlaybackEngine`.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub responses_dir: PathBuf,
    pub voice: VoiceProfile,
    /// Rate of the PCM the synthesis server returns. Default: 32 kHz.
    pub output_sample_rate: u32,
    /// Bounded wait on every queue operation. Default: 100 ms.
    pub queue_timeout: Duration,
    /// Silence on the audio queue that ends playback. Default: 2 s.
    pub idle_timeout: Duration,
    /// Extra time for the device to play out its buffer. Default: 500 ms.
    pub grace_period: Duration,
    /// Longest `speak` waits for playback to finish. Default: 120 s.
    pub completion_timeout: Duration,
    /// A display callback slower than this is logged. Audio of the sentence
    /// keeps waiting for it regardless. Default: 1 s.
    pub slow_display_warning: Duration,
    pub read_chunk_bytes: usize,
    pub audio_capacity: usize,
    pub text_capacity: usize,
    /// Output reopen attempts per `speak` after write failures. Default: 3.
    pub max_reopen_attempts: u32,
    pub reopen_backoff: Duration,
    pub join_timeout: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            responses_dir: PathBuf::from("responses"),
            voice: VoiceProfile::default(),
            output_sample_rate: SYNTHESIS_SAMPLE_RATE,
            queue_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(2),
            grace_period: Duration::from_millis(500),
            completion_timeout: Duration::from_secs(120),
            slow_display_warning: Duration::from_secs(1),
            read_chunk_bytes: 4096,
            audio_capacity: 256,
            text_capacity: 64,
            max_reopen_attempts: 3,
            reopen_backoff: Duration::from_millis(100),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Clears the busy flag when a `speak` call ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The playback half of the voice engine. `Send + Sync`.
pub struct PlaybackEngine {
    config: PlaybackConfig,
    device: Arc<dyn OutputDevice>,
    backend: Arc<dyn SynthesisBackend>,
    busy: AtomicBool,
}

impl PlaybackEngine {
    pub fn new(
        config: PlaybackConfig,
        device: Arc<dyn OutputDevice>,
        backend: Arc<dyn SynthesisBackend>,
    ) -> Self {
        Self {
            config,
            device,
            backend,
            busy: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn is_speaking(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Speak `text`, blocking until playback finished or timed out.
    ///
    /// # Errors
    /// - `VoiceError::Busy` if another `speak` is running on this engine.
    /// - `VoiceError::DeviceBusy` if the output device is claimed elsewhere.
    ///
    /// Every other failure is reported in the returned [`SpeakOutcome`].
    pub fn speak(&self, text: &str, options: SpeakOptions) -> Result<SpeakOutcome> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(VoiceError::Busy);
        }
        let _busy = BusyGuard(&self.busy);

        let sentences = split_sentences(text);
        let span = info_span!("speak", sentences = sentences.len());
        let _enter = span.enter();

        let playing = options.play_audio && !sentences.is_empty();
        let _claim = if playing {
            Some(DeviceClaim::acquire(self.device.id())?)
        } else {
            None
        };

        let cfg = &self.config;
        let state = Arc::new(SpeakState::new());
        let manager = LifecycleManager::with_join_timeout(cfg.join_timeout);
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        if playing {
            let audio = manager.create_queue("audio", cfg.audio_capacity);
            let text_queue = manager.create_queue::<DisplayRequest>("text", cfg.text_capacity);

            let synthesis = SynthesisLoop {
                sentences: sentences.clone(),
                voice: cfg.voice.clone(),
                backend: Arc::clone(&self.backend),
                read_chunk_bytes: cfg.read_chunk_bytes,
                queue_timeout: cfg.queue_timeout,
                slow_display_warning: cfg.slow_display_warning,
                text: Arc::clone(&text_queue),
                audio: Arc::clone(&audio),
                state: Arc::clone(&state),
            };
            let display = DisplayLoop {
                on_chunk: options.on_chunk.clone(),
                queue_timeout: cfg.queue_timeout,
                text: text_queue,
            };
            let playback = PlaybackLoop {
                device: Arc::clone(&self.device),
                sample_rate: cfg.output_sample_rate,
                queue_timeout: cfg.queue_timeout,
                idle_timeout: cfg.idle_timeout,
                grace_period: cfg.grace_period,
                max_reopen_attempts: cfg.max_reopen_attempts,
                reopen_backoff: cfg.reopen_backoff,
                audio,
                state: Arc::clone(&state),
                done: done_tx,
            };

            manager.create_thread("display", move |stop| display.run(stop));
            manager.create_thread("playback", move |stop| playback.run(stop));
            manager.create_thread("synthesis", move |stop| synthesis.run(stop));
            for name in ["display", "playback", "synthesis"] {
                manager.start(name);
            }
        }

        let saved_path = if options.save_to_file {
            match self.save_full_text(text) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("failed to save response audio: {e}");
                    None
                }
            }
        } else {
            None
        };

        let completed = if playing {
            match done_rx.recv_timeout(cfg.completion_timeout) {
                Ok(()) => true,
                Err(_) => {
                    warn!(timeout = ?cfg.completion_timeout, "playback did not finish in time");
                    false
                }
            }
        } else {
            true
        };
        manager.stop_all(true);

        let outcome = SpeakOutcome {
            sentences_total: sentences.len(),
            sentences_failed: state.sentences_failed.load(Ordering::Relaxed),
            bytes_enqueued: state.bytes_enqueued.load(Ordering::Relaxed),
            bytes_played: state.bytes_played.load(Ordering::Relaxed),
            saved_path,
            completed,
        };
        info!(
            failed = outcome.sentences_failed,
            bytes = outcome.bytes_enqueued,
            completed,
            "speak finished"
        );
        Ok(outcome)
    }

    /// Synthesize the full text in one request and write it as a WAV file.
    fn save_full_text(&self, text: &str) -> Result<PathBuf> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::Synthesis("nothing to save for empty text".into()));
        }
        let voice = &self.config.voice;
        let payload = self
            .backend
            .synthesize(&voice.request(text, voice.base_speed, false))?;
        if payload.is_empty() {
            return Err(VoiceError::Synthesis("backend returned no audio".into()));
        }

        let bytes = if wav::is_riff(&payload) {
            payload
        } else {
            wav::wav_bytes_from_pcm(&payload, self.config.output_sample_rate)?
        };

        fs::create_dir_all(&self.config.responses_dir)?;
        let path = wav::timestamped_path(&self.config.responses_dir, "response", "%Y%m%d_%H%M%S_%3f", "");
        fs::write(&path, &bytes)?;
        info!(path = %path.display(), bytes = bytes.len(), "response audio saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_save_and_play() {
        let options = SpeakOptions::default();
        assert!(options.save_to_file);
        assert!(options.play_audio);
        assert!(options.on_chunk.is_none());
    }

    #[test]
    fn outcome_serializes_camel_case() {
        let outcome = SpeakOutcome {
            sentences_total: 3,
            sentences_failed: 1,
            bytes_enqueued: 10,
            bytes_played: 10,
            saved_path: None,
            completed: true,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["sentencesFailed"], 1);
        assert!(json["savedPath"].is_null());
    }
}
