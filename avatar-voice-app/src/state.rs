//! Host application state shared by the command loop and the event forwarders.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use avatar_voice_core::{CaptureEngine, DiagnosticsSnapshot, PlaybackEngine};
use parking_lot::Mutex;
use serde::Serialize;

use crate::settings::AppSettings;

pub struct AppState {
    pub capture: Arc<CaptureEngine>,
    pub playback: Arc<PlaybackEngine>,
    /// Persisted settings cache.
    pub settings: Arc<Mutex<AppSettings>>,
    /// Absolute path to `settings.json`.
    pub settings_path: PathBuf,
    pub commands_handled: AtomicUsize,
    pub commands_failed: AtomicUsize,
    /// `say` requests accepted for playback.
    pub speak_requests: AtomicUsize,
    /// `say` requests rejected because another response was playing.
    pub speak_rejected: Arc<AtomicUsize>,
    /// Rolling stage latency metrics.
    pub perf_metrics: Arc<Mutex<PerfMetrics>>,
}

impl AppState {
    pub fn diagnostics_snapshot(&self) -> AppDiagnostics {
        AppDiagnostics {
            commands_handled: self.commands_handled.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            speak_requests: self.speak_requests.load(Ordering::Relaxed),
            speak_rejected: self.speak_rejected.load(Ordering::Relaxed),
            capture: self.capture.diagnostics(),
            perf: self.perf_metrics.lock().snapshot(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDiagnostics {
    pub commands_handled: usize,
    pub commands_failed: usize,
    pub speak_requests: usize,
    pub speak_rejected: usize,
    pub capture: DiagnosticsSnapshot,
    pub perf: PerfMetricsSnapshot,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfStageSnapshot {
    pub count: usize,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Default)]
pub struct PerfMetrics {
    speak_ms: StageWindow,
    stop_ms: StageWindow,
}

impl PerfMetrics {
    /// Wall time of one `say`, from request to playback done.
    pub fn record_speak(&mut self, elapsed_ms: f64) {
        self.speak_ms.record(elapsed_ms);
    }

    /// Wall time of `stop`, including the session recording write.
    pub fn record_stop(&mut self, elapsed_ms: f64) {
        self.stop_ms.record(elapsed_ms);
    }

    pub fn snapshot(&self) -> PerfMetricsSnapshot {
        PerfMetricsSnapshot {
            speak_ms: self.speak_ms.snapshot(),
            stop_ms: self.stop_ms.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfMetricsSnapshot {
    pub speak_ms: PerfStageSnapshot,
    pub stop_ms: PerfStageSnapshot,
}

#[derive(Debug)]
struct StageWindow {
    samples: VecDeque<f64>,
    cap: usize,
    count: usize,
    sum_ms: f64,
    max_ms: f64,
}

impl Default for StageWindow {
    fn default() -> Self {
        Self {
            samples: VecDeque::with_capacity(128),
            cap: 128,
            count: 0,
            sum_ms: 0.0,
            max_ms: 0.0,
        }
    }
}

impl StageWindow {
    fn record(&mut self, elapsed_ms: f64) {
        let v = if elapsed_ms.is_finite() {
            elapsed_ms.max(0.0)
        } else {
            0.0
        };
        if self.samples.len() == self.cap {
            let _ = self.samples.pop_front();
        }
        self.samples.push_back(v);
        self.count = self.count.saturating_add(1);
        self.sum_ms += v;
        self.max_ms = self.max_ms.max(v);
    }

    fn snapshot(&self) -> PerfStageSnapshot {
        if self.samples.is_empty() {
            return PerfStageSnapshot {
                count: 0,
                mean_ms: 0.0,
                p50_ms: 0.0,
                p95_ms: 0.0,
                max_ms: 0.0,
            };
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let percentile = |p: f64| -> f64 {
            let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };

        PerfStageSnapshot {
            count: self.count,
            mean_ms: self.sum_ms / self.count as f64,
            p50_ms: percentile(0.50),
            p95_ms: percentile(0.95),
            max_ms: self.max_ms,
        }
    }
}
