//! Command handlers.
//!
//! Each handler backs one stdin command and maps engine errors to strings,
//! which the command loop turns into `{"ok": false, "error": ...}` replies.

use std::path::PathBuf;
use std::sync::{atomic::Ordering, Arc};
use std::time::Instant;

use avatar_voice_core::audio::device::{list_input_devices, list_output_devices, DeviceInfo};
use avatar_voice_core::{EngineStatus, SentenceChunk, SpeakOptions, SpeakOutcome};
use serde::Serialize;
use tracing::{info, warn};

use crate::settings::{save_settings, AppSettings};
use crate::state::{AppDiagnostics, AppState};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReply {
    pub capture: EngineStatus,
    pub recording: bool,
    pub speech_active: bool,
    pub speaking: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicesReply {
    pub inputs: Vec<DeviceInfo>,
    pub outputs: Vec<DeviceInfo>,
}

/// Start capture and segmentation.
pub fn start_capture(state: &AppState) -> Result<(), String> {
    state.capture.start().map_err(|e| e.to_string())
}

/// Stop capture. Returns the path of the saved session recording.
pub fn stop_capture(state: &AppState) -> Result<PathBuf, String> {
    let started = Instant::now();
    let path = state.capture.stop().map_err(|e| e.to_string())?;
    state
        .perf_metrics
        .lock()
        .record_stop(started.elapsed().as_secs_f64() * 1000.0);
    let diag = state.capture.diagnostics();
    info!(
        frames_read = diag.frames_read,
        segments_closed = diag.segments_closed,
        segments_dropped = diag.segments_dropped,
        recognition_calls = diag.recognition_calls,
        "capture diagnostics snapshot on stop"
    );
    Ok(path)
}

pub fn get_volume(state: &AppState) -> Result<f32, String> {
    Ok(state.capture.current_volume())
}

/// Whether the user is currently talking.
pub fn get_speech_active(state: &AppState) -> Result<bool, String> {
    Ok(state.capture.is_speech_active())
}

pub fn take_result(state: &AppState) -> Result<Option<String>, String> {
    Ok(state.capture.take_recognition_result())
}

pub fn peek_result(state: &AppState) -> Result<Option<String>, String> {
    Ok(state.capture.peek_recognition_result())
}

pub fn clear_result(state: &AppState) -> Result<(), String> {
    state.capture.clear_recognition_result();
    Ok(())
}

pub fn get_status(state: &AppState) -> Result<StatusReply, String> {
    Ok(StatusReply {
        capture: state.capture.status(),
        recording: state.capture.is_recording(),
        speech_active: state.capture.is_speech_active(),
        speaking: state.playback.is_speaking(),
    })
}

pub fn list_devices(_state: &AppState) -> Result<DevicesReply, String> {
    Ok(DevicesReply {
        inputs: list_input_devices(),
        outputs: list_output_devices(),
    })
}

pub fn get_diagnostics(state: &AppState) -> Result<AppDiagnostics, String> {
    Ok(state.diagnostics_snapshot())
}

/// Current settings, after environment overrides.
pub fn get_settings(state: &AppState) -> Result<AppSettings, String> {
    Ok(state.settings.lock().clone())
}

/// Persist the current settings to `settings.json`.
pub fn persist_settings(state: &AppState) -> Result<PathBuf, String> {
    let settings = state.settings.lock();
    save_settings(&state.settings_path, &settings).map_err(|e| e.to_string())?;
    info!(path = %state.settings_path.display(), "settings saved");
    Ok(state.settings_path.clone())
}

/// Speak `text` on a background thread.
///
/// Returns as soon as the request is accepted. `on_chunk` sees each sentence
/// as it is shown; `on_done` receives the final outcome or error.
pub fn speak(
    state: &AppState,
    text: &str,
    save_to_file: bool,
    on_chunk: impl Fn(&SentenceChunk) + Send + Sync + 'static,
    on_done: impl FnOnce(Result<SpeakOutcome, String>) + Send + 'static,
) -> Result<(), String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("nothing to say".into());
    }
    if state.playback.is_speaking() {
        state.speak_rejected.fetch_add(1, Ordering::Relaxed);
        return Err(avatar_voice_core::VoiceError::Busy.to_string());
    }
    state.speak_requests.fetch_add(1, Ordering::Relaxed);

    let playback = Arc::clone(&state.playback);
    let perf = Arc::clone(&state.perf_metrics);
    let rejected = Arc::clone(&state.speak_rejected);
    let text = text.to_string();
    let options = SpeakOptions {
        save_to_file,
        play_audio: true,
        on_chunk: Some(Arc::new(on_chunk)),
    };

    std::thread::Builder::new()
        .name("speak".into())
        .spawn(move || {
            let started = Instant::now();
            let outcome = playback.speak(&text, options);
            match &outcome {
                Ok(done) => {
                    perf.lock()
                        .record_speak(started.elapsed().as_secs_f64() * 1000.0);
                    info!(
                        sentences = done.sentences_total,
                        failed = done.sentences_failed,
                        completed = done.completed,
                        "response spoken"
                    );
                }
                Err(avatar_voice_core::VoiceError::Busy) => {
                    rejected.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("speak failed: {e}"),
            }
            on_done(outcome.map_err(|e| e.to_string()));
        })
        .map(|_| ())
        .map_err(|e| format!("failed to spawn speak thread: {e}"))
}
