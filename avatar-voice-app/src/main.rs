//! Avatar voice host entry point.
//!
//! ## Protocol
//!
//! One command per stdin line, one JSON reply per line on stdout:
//!
//! ```text
//! > start                       {"ok":true,"data":null}
//! > say 你好。今天天气很好！     {"ok":true,"data":"accepted"}
//!                               {"event":"sentence","data":{"index":0,"text":"你好。"}}
//!                               {"event":"spoken","data":{...SpeakOutcome}}
//! > result                      {"ok":true,"data":"..."}
//! ```
//!
//! Asynchronous events (`status`, `recognition`, `sentence`, `spoken`) are
//! interleaved with replies as `{"event": ..., "data": ...}` lines. Logs go
//! to stderr.

mod commands;
mod settings;
mod state;

use std::io::{BufRead, Write};
use std::sync::{atomic::AtomicUsize, atomic::Ordering, Arc};

use anyhow::Context;
use avatar_voice_core::recognition::{HttpRecognitionBackend, StubRecognizer};
use avatar_voice_core::synthesis::HttpSynthesisBackend;
use avatar_voice_core::{
    vad, CaptureEngine, CpalInputDevice, CpalOutputDevice, PlaybackEngine, RecognitionBackend,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use settings::{default_settings_path, load_settings};
use state::{AppState, PerfMetrics};
use tracing::{info, warn};

#[derive(Serialize)]
struct Reply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Write one JSON line to stdout.
fn emit_line(value: &impl Serialize) {
    let line = match serde_json::to_string(value) {
        Ok(line) => line,
        Err(e) => {
            warn!("failed to serialize output line: {e}");
            return;
        }
    };
    let mut out = std::io::stdout().lock();
    if writeln!(out, "{line}").and_then(|_| out.flush()).is_err() {
        warn!("stdout closed");
    }
}

fn emit_event(event: &str, data: impl Serialize) {
    emit_line(&json!({ "event": event, "data": data }));
}

fn reply<T: Serialize>(result: Result<T, String>) -> Reply {
    match result.and_then(|v| serde_json::to_value(v).map_err(|e| e.to_string())) {
        Ok(data) => Reply {
            ok: true,
            data: Some(data),
            error: None,
        },
        Err(error) => Reply {
            ok: false,
            data: None,
            error: Some(error),
        },
    }
}

/// Run one command line. Returns `None` for `quit`.
fn dispatch(state: &AppState, line: &str) -> Option<Reply> {
    let (command, arg) = line
        .trim()
        .split_once(char::is_whitespace)
        .map(|(c, a)| (c, a.trim()))
        .unwrap_or((line.trim(), ""));

    let result = match command {
        "start" => reply(commands::start_capture(state)),
        "stop" => reply(commands::stop_capture(state)),
        "volume" => reply(commands::get_volume(state)),
        "speaking" => reply(commands::get_speech_active(state)),
        "result" => reply(commands::take_result(state)),
        "peek" => reply(commands::peek_result(state)),
        "clear" => reply(commands::clear_result(state)),
        "status" => reply(commands::get_status(state)),
        "devices" => reply(commands::list_devices(state)),
        "diagnostics" => reply(commands::get_diagnostics(state)),
        "settings" => reply(commands::get_settings(state)),
        "save-settings" => reply(commands::persist_settings(state)),
        "say" | "say-quiet" => reply(
            commands::speak(
                state,
                arg,
                command == "say",
                |chunk| emit_event("sentence", chunk),
                |outcome| match outcome {
                    Ok(done) => emit_event("spoken", done),
                    Err(error) => emit_event("speakFailed", error),
                },
            )
            .map(|()| "accepted"),
        ),
        "quit" | "exit" => return None,
        "" => reply(Err::<(), _>("empty command".to_string())),
        other => reply(Err::<(), _>(format!("unknown command: {other}"))),
    };

    state.commands_handled.fetch_add(1, Ordering::Relaxed);
    if !result.ok {
        state.commands_failed.fetch_add(1, Ordering::Relaxed);
    }
    Some(result)
}

/// Forward engine broadcasts to stdout until the engine goes away.
fn spawn_event_forwarders(capture: &CaptureEngine) -> anyhow::Result<()> {
    let mut status_rx = capture.subscribe_status();
    std::thread::Builder::new()
        .name("status-events".into())
        .spawn(move || loop {
            match status_rx.blocking_recv() {
                Ok(event) => emit_event("status", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("status forwarder lagged by {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        })
        .context("spawning status forwarder")?;

    let mut recognition_rx = capture.subscribe_recognitions();
    std::thread::Builder::new()
        .name("recognition-events".into())
        .spawn(move || loop {
            match recognition_rx.blocking_recv() {
                Ok(event) => emit_event("recognition", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("recognition forwarder lagged by {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        })
        .context("spawning recognition forwarder")?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("avatar_voice=info,avatar_voice_core=info")),
        )
        .init();

    info!("avatar voice host starting");

    let settings_path = default_settings_path();
    let mut app_settings = load_settings(&settings_path);
    app_settings.apply_env_overrides();
    info!(
        settings_path = ?settings_path,
        recognition_url = %app_settings.recognition_url,
        synthesis_url = %app_settings.synthesis_url,
        vad_level = app_settings.vad_level,
        "settings loaded"
    );

    // ── Engine setup ──────────────────────────────────────────────────────
    let recognizer: Arc<dyn RecognitionBackend> = if app_settings.use_stub_recognizer {
        warn!("stub recognizer selected, segments will not be transcribed");
        Arc::new(StubRecognizer::new())
    } else {
        match HttpRecognitionBackend::new(app_settings.recognition_config()) {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                warn!("recognition client unavailable ({e}), using StubRecognizer");
                Arc::new(StubRecognizer::new())
            }
        }
    };
    let synthesizer = HttpSynthesisBackend::new(app_settings.synthesis_config())
        .context("building synthesis client")?;

    let capture = Arc::new(CaptureEngine::new(
        app_settings.capture_config(),
        Arc::new(CpalInputDevice::new(app_settings.preferred_input_device.clone())),
        vad::default_factory(app_settings.vad_aggressiveness()),
        recognizer,
    ));
    let playback = Arc::new(PlaybackEngine::new(
        app_settings.playback_config(),
        Arc::new(CpalOutputDevice::new(app_settings.preferred_output_device.clone())),
        Arc::new(synthesizer),
    ));
    spawn_event_forwarders(&capture)?;

    let state = AppState {
        capture,
        playback,
        settings: Arc::new(Mutex::new(app_settings)),
        settings_path,
        commands_handled: AtomicUsize::new(0),
        commands_failed: AtomicUsize::new(0),
        speak_requests: AtomicUsize::new(0),
        speak_rejected: Arc::new(AtomicUsize::new(0)),
        perf_metrics: Arc::new(Mutex::new(PerfMetrics::default())),
    };

    // ── Command loop ──────────────────────────────────────────────────────
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        match dispatch(&state, &line) {
            Some(result) => emit_line(&result),
            None => break,
        }
    }

    if state.capture.is_recording() {
        if let Err(e) = commands::stop_capture(&state) {
            warn!("stop on exit failed: {e}");
        }
    }
    let diag = state.diagnostics_snapshot();
    info!(
        commands = diag.commands_handled,
        failed = diag.commands_failed,
        speak_requests = diag.speak_requests,
        settings_path = ?state.settings_path,
        "avatar voice host exiting"
    );
    Ok(())
}
