use anyhow::{Context, Result};
use likeness_core::{BackendKind, RecognitionSettings};
use serde::Deserialize;
use std::path::PathBuf;

/// CLI configuration: an optional TOML file, then `LIKENESS_*` environment
/// variables, then command-line flags (applied in `main`).
#[derive(Debug)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing the ArcFace ONNX model.
    pub model_dir: PathBuf,
    pub recognition: RecognitionSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    db_path: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    recognition: RecognitionSettings,
}

impl Config {
    /// Load the file named by `LIKENESS_CONFIG` (if set) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let file = match std::env::var("LIKENESS_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {path}"))?;
                toml::from_str(&text).with_context(|| format!("parsing config file {path}"))?
            }
            Err(_) => FileConfig::default(),
        };
        Ok(Self::from_env(file))
    }

    fn from_env(file: FileConfig) -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("likeness");

        let db_path = std::env::var("LIKENESS_DB_PATH")
            .map(PathBuf::from)
            .ok()
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("faces.db"));

        let model_dir = std::env::var("LIKENESS_MODEL_DIR")
            .map(PathBuf::from)
            .ok()
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));

        let mut recognition = file.recognition;
        if let Some(backend) = env_parse::<BackendKind>("LIKENESS_BACKEND") {
            recognition.backend = backend;
        }
        if let Some(threshold) = env_parse::<f64>("LIKENESS_THRESHOLD") {
            recognition.set_threshold_setting(recognition.backend, threshold);
        }

        Self {
            db_path,
            model_dir,
            recognition,
        }
    }

    /// Path to the ArcFace recognition model.
    #[cfg_attr(not(feature = "arcface"), allow(dead_code))]
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
