//! Persistent host settings (JSON file in the app data directory).
//!
//! `AVATAR_VOICE_*` environment variables override the file for URLs,
//! directories and device names.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use avatar_voice_core::buffering::frame::FRAME_MS;
use avatar_voice_core::recognition::HttpRecognitionConfig;
use avatar_voice_core::synthesis::HttpSynthesisConfig;
use avatar_voice_core::{CaptureConfig, PlaybackConfig, VadAggressiveness, VoiceProfile};
use serde::{Deserialize, Serialize};

const DEFAULT_RECOGNITION_URL: &str = "http://127.0.0.1:8000/api/asr";
const DEFAULT_SYNTHESIS_URL: &str = "http://127.0.0.1:8000/api/tts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub recordings_dir: String,
    pub responses_dir: String,
    pub recognition_url: String,
    pub recognition_language: Option<String>,
    /// Skip the recognition server and describe segments instead.
    pub use_stub_recognizer: bool,
    pub synthesis_url: String,
    pub voice: VoiceProfile,
    /// WebRTC classifier mode, 0 (lenient) ..= 3 (strict).
    pub vad_level: u8,
    pub trailing_silence_ms: u64,
    pub min_speech_ms: u64,
    pub idle_timeout_ms: u64,
    pub keep_segment_files: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            preferred_output_device: None,
            recordings_dir: "recordings".into(),
            responses_dir: "responses".into(),
            recognition_url: DEFAULT_RECOGNITION_URL.into(),
            recognition_language: None,
            use_stub_recognizer: false,
            synthesis_url: DEFAULT_SYNTHESIS_URL.into(),
            voice: VoiceProfile::default(),
            vad_level: 3,
            trailing_silence_ms: 1_800,
            min_speech_ms: 500,
            idle_timeout_ms: 2_000,
            keep_segment_files: false,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.preferred_input_device = normalize_optional(self.preferred_input_device.take());
        self.preferred_output_device = normalize_optional(self.preferred_output_device.take());
        self.recognition_language = normalize_optional(self.recognition_language.take());
        self.recordings_dir = normalize_or(&self.recordings_dir, "recordings");
        self.responses_dir = normalize_or(&self.responses_dir, "responses");
        self.recognition_url = normalize_or(&self.recognition_url, DEFAULT_RECOGNITION_URL);
        self.synthesis_url = normalize_or(&self.synthesis_url, DEFAULT_SYNTHESIS_URL);

        let voice_defaults = VoiceProfile::default();
        self.voice.character = normalize_or(&self.voice.character, &voice_defaults.character);
        self.voice.emotion = normalize_or(&self.voice.emotion, &voice_defaults.emotion);
        self.voice.language = normalize_or(&self.voice.language, &voice_defaults.language);
        self.voice.base_speed = if self.voice.base_speed.is_finite() {
            self.voice.base_speed.clamp(0.5, 2.0)
        } else {
            voice_defaults.base_speed
        };

        self.vad_level = self.vad_level.min(3);
        self.trailing_silence_ms = self.trailing_silence_ms.clamp(300, 10_000);
        self.min_speech_ms = self.min_speech_ms.min(10_000);
        self.idle_timeout_ms = self.idle_timeout_ms.clamp(200, 30_000);
    }

    /// Apply `AVATAR_VOICE_*` overrides, then normalize again.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("AVATAR_VOICE_RECOGNITION_URL") {
            self.recognition_url = v;
        }
        if let Some(v) = lookup("AVATAR_VOICE_SYNTHESIS_URL") {
            self.synthesis_url = v;
        }
        if let Some(v) = lookup("AVATAR_VOICE_RECORDINGS_DIR") {
            self.recordings_dir = v;
        }
        if let Some(v) = lookup("AVATAR_VOICE_RESPONSES_DIR") {
            self.responses_dir = v;
        }
        if let Some(v) = lookup("AVATAR_VOICE_INPUT_DEVICE") {
            self.preferred_input_device = Some(v);
        }
        if let Some(v) = lookup("AVATAR_VOICE_OUTPUT_DEVICE") {
            self.preferred_output_device = Some(v);
        }
        if let Some(v) = lookup("AVATAR_VOICE_STUB_RECOGNIZER") {
            self.use_stub_recognizer = matches!(v.trim(), "1" | "true" | "yes");
        }
        self.normalize();
    }

    pub fn vad_aggressiveness(&self) -> VadAggressiveness {
        VadAggressiveness::from_level(self.vad_level)
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            recordings_dir: PathBuf::from(&self.recordings_dir),
            trailing_silence_frames: (self.trailing_silence_ms / FRAME_MS as u64).max(1) as u32,
            min_speech_ms: self.min_speech_ms,
            keep_segment_files: self.keep_segment_files,
            ..CaptureConfig::default()
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            responses_dir: PathBuf::from(&self.responses_dir),
            voice: self.voice.clone(),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            ..PlaybackConfig::default()
        }
    }

    pub fn recognition_config(&self) -> HttpRecognitionConfig {
        HttpRecognitionConfig {
            url: self.recognition_url.clone(),
            language: self.recognition_language.clone(),
            ..HttpRecognitionConfig::default()
        }
    }

    pub fn synthesis_config(&self) -> HttpSynthesisConfig {
        HttpSynthesisConfig {
            url: self.synthesis_url.clone(),
            ..HttpSynthesisConfig::default()
        }
    }
}

fn normalize_optional(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn normalize_or(raw: &str, fallback: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        fallback.into()
    } else {
        trimmed.into()
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("AvatarVoice")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("avatar-voice")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn normalize_clamps_and_restores_blanks() {
        let mut settings = AppSettings {
            preferred_input_device: Some("   ".into()),
            recognition_url: " ".into(),
            vad_level: 9,
            trailing_silence_ms: 10,
            idle_timeout_ms: 999_999,
            ..AppSettings::default()
        };
        settings.voice.base_speed = f32::NAN;
        settings.voice.character = "  hutao ".into();
        settings.normalize();

        assert_eq!(settings.preferred_input_device, None);
        assert_eq!(settings.recognition_url, DEFAULT_RECOGNITION_URL);
        assert_eq!(settings.vad_level, 3);
        assert_eq!(settings.trailing_silence_ms, 300);
        assert_eq!(settings.idle_timeout_ms, 30_000);
        assert_eq!(settings.voice.base_speed, 1.0);
        assert_eq!(settings.voice.character, "hutao");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"synthesisUrl":"http://tts.local/api","vadLevel":1}"#)
                .expect("parse settings");
        assert_eq!(settings.synthesis_url, "http://tts.local/api");
        assert_eq!(settings.vad_aggressiveness(), VadAggressiveness::LowBitrate);
        assert_eq!(settings.min_speech_ms, 500);
        assert_eq!(settings.voice, VoiceProfile::default());
    }

    #[test]
    fn env_overrides_win_over_file() {
        let env: HashMap<&str, &str> = [
            ("AVATAR_VOICE_SYNTHESIS_URL", " http://10.0.0.2:9880/tts "),
            ("AVATAR_VOICE_INPUT_DEVICE", "USB Mic"),
            ("AVATAR_VOICE_STUB_RECOGNIZER", "1"),
        ]
        .into_iter()
        .collect();
        let mut settings = AppSettings::default();
        settings.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.synthesis_url, "http://10.0.0.2:9880/tts");
        assert_eq!(settings.preferred_input_device.as_deref(), Some("USB Mic"));
        assert!(settings.use_stub_recognizer);
        assert_eq!(settings.recognition_url, DEFAULT_RECOGNITION_URL);
    }

    #[test]
    fn trailing_silence_maps_to_frames() {
        let settings = AppSettings::default();
        assert_eq!(settings.capture_config().trailing_silence_frames, 60);
        assert_eq!(
            settings.playback_config().idle_timeout,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = std::env::temp_dir()
            .join(format!("avatar-voice-settings-{}", std::process::id()))
            .join("settings.json");
        let mut settings = AppSettings::default();
        settings.keep_segment_files = true;
        save_settings(&path, &settings).expect("save");
        assert_eq!(load_settings(&path), settings);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
