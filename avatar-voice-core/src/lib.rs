//! # avatar-voice-core
//!
//! Real-time audio streaming engine for a voice avatar.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → InputStream → [capture] → [vad] → [recognition] → Mailbox<String>
//!                                                      │
//!                                     RecognitionBackend::recognize (one call per segment)
//!
//! response text → split_sentences → [synthesis] → [playback] → OutputSink
//!                                        │
//!                                   [display] → on_chunk
//! ```
//!
//! Every loop runs on a named thread owned by a `LifecycleManager` and talks
//! to its neighbours only through bounded queues.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod error;
pub mod ipc;
pub mod lifecycle;
pub mod mailbox;
pub mod playback;
pub mod recognition;
pub mod synthesis;
pub mod vad;

// Convenience re-exports for downstream crates
pub use audio::{CpalInputDevice, CpalOutputDevice, InputDevice, OutputDevice};
pub use capture::{CaptureConfig, CaptureEngine, DiagnosticsSnapshot};
pub use error::{Result, VoiceError};
pub use ipc::events::{EngineStatus, EngineStatusEvent, RecognitionEvent};
pub use lifecycle::{LifecycleManager, ManagedQueue, StopSignal};
pub use mailbox::Mailbox;
pub use playback::{PlaybackConfig, PlaybackEngine, SentenceChunk, SpeakOptions, SpeakOutcome};
pub use recognition::RecognitionBackend;
pub use synthesis::{SynthesisBackend, SynthesisRequest, VoiceProfile};
pub use vad::{VadAggressiveness, VadDecision, VoiceActivityDetector};
