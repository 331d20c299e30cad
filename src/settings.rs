use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TranscribeBackendKind {
    Soniox,
    Deepgram,
}

impl TranscribeBackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TranscribeBackendKind::Soniox => "soniox",
            TranscribeBackendKind::Deepgram => "deepgram",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppSettings {
    /// Input device by name. `None` (or a stale name) selects the system
    /// default, and the effective name is written back here.
    #[serde(default)]
    pub input_device: Option<String>,
    #[serde(default = "default_sample_rate")]
    pub target_sample_rate: u32,

    #[serde(default = "default_backend")]
    pub backend: TranscribeBackendKind,
    #[serde(default)]
    pub soniox_api_key: String,
    #[serde(default = "default_soniox_model")]
    pub soniox_model: String,
    #[serde(default = "default_soniox_stability")]
    pub soniox_interim_stability: f64,
    #[serde(default)]
    pub deepgram_api_key: String,
    #[serde(default = "default_deepgram_model")]
    pub deepgram_model: String,
    #[serde(default = "default_deepgram_stability")]
    pub deepgram_interim_stability: f64,
    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_show_interim_results")]
    pub show_interim_results: bool,
    #[serde(default = "default_enable_censorship")]
    pub enable_censorship: bool,
    #[serde(default)]
    pub censored_words: Vec<String>,

    #[serde(default = "default_save_recordings")]
    pub save_recordings: bool,
    #[serde(default = "default_transcripts_folder")]
    pub transcripts_folder: PathBuf,
    #[serde(default = "default_recordings_folder")]
    pub recordings_folder: PathBuf,
    #[serde(default = "default_logs_folder")]
    pub logs_folder: PathBuf,
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_backend() -> TranscribeBackendKind {
    TranscribeBackendKind::Soniox
}

fn default_soniox_model() -> String {
    "stt-rt-preview".to_string()
}

fn default_soniox_stability() -> f64 {
    0.75
}

fn default_deepgram_model() -> String {
    "nova-2".to_string()
}

// Deepgram interims stabilize later than Soniox's token stream; the two
// thresholds are deliberately separate settings.
fn default_deepgram_stability() -> f64 {
    0.80
}

fn default_language() -> String {
    "en".to_string()
}

fn default_show_interim_results() -> bool {
    true
}

fn default_enable_censorship() -> bool {
    true
}

fn default_save_recordings() -> bool {
    false
}

fn default_transcripts_folder() -> PathBuf {
    PathBuf::from("transcripts")
}

fn default_recordings_folder() -> PathBuf {
    PathBuf::from("recordings")
}

fn default_logs_folder() -> PathBuf {
    PathBuf::from("logs")
}

pub fn get_default_settings() -> AppSettings {
    AppSettings {
        input_device: None,
        target_sample_rate: default_sample_rate(),
        backend: default_backend(),
        soniox_api_key: String::new(),
        soniox_model: default_soniox_model(),
        soniox_interim_stability: default_soniox_stability(),
        deepgram_api_key: String::new(),
        deepgram_model: default_deepgram_model(),
        deepgram_interim_stability: default_deepgram_stability(),
        language: default_language(),
        show_interim_results: default_show_interim_results(),
        enable_censorship: default_enable_censorship(),
        censored_words: Vec::new(),
        save_recordings: default_save_recordings(),
        transcripts_folder: default_transcripts_folder(),
        recordings_folder: default_recordings_folder(),
        logs_folder: default_logs_folder(),
    }
}

pub fn load_or_create_settings(path: &Path) -> anyhow::Result<AppSettings> {
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<AppSettings>(&raw) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                log::warn!("Failed to parse settings, falling back to defaults: {}", e);
                let defaults = get_default_settings();
                write_settings(path, &defaults)?;
                Ok(defaults)
            }
        },
        Err(_) => {
            let defaults = get_default_settings();
            write_settings(path, &defaults)?;
            Ok(defaults)
        }
    }
}

pub fn write_settings(path: &Path, settings: &AppSettings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let created = load_or_create_settings(&path).unwrap();
        assert_eq!(created.target_sample_rate, 16000);
        assert_eq!(created.backend, TranscribeBackendKind::Soniox);

        let reloaded = load_or_create_settings(&path).unwrap();
        assert_eq!(reloaded.soniox_interim_stability, 0.75);
        assert_eq!(reloaded.deepgram_interim_stability, 0.80);
    }

    #[test]
    fn test_garbage_settings_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();

        let settings = load_or_create_settings(&path).unwrap();
        assert!(settings.censored_words.is_empty());
    }
}
