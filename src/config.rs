//! Settings
//!
//! Process-wide configuration, resolved once at start-up and shared read-only.
//! Values are layered: built-in defaults, then `settings.json` in the data
//! directory, then `.env`, then the process environment.

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::BackendKind;
use crate::safety::ReplyPolicy;

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\FilterChat\FilterChat`
/// - macOS: `/Users/{user}/Library/Application Support/com.FilterChat.FilterChat`
/// - Linux: `/home/{user}/.local/share/filterchat`
pub fn get_data_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("com", "FilterChat", "FilterChat")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| ConfigError::DataDirError("Could not determine data directory".to_string()))
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Default model reference: a model directory (dense) or a GGUF file/directory (native)
    pub model_path: PathBuf,
    /// Optional fine-tuning adapter attached on top of the dense model
    pub adapter_path: Option<PathBuf>,
    /// Requested compute device: "cpu", "cuda", "cuda:1", "metal"
    pub device: String,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Backend used when a request does not name one
    pub backend: BackendKind,
    /// Number of layers offloaded to an accelerator by the native engine
    pub gpu_layers: u32,
    /// Context window size for the native engine
    pub context_size: u32,
    /// Prompt token budget for safety classification
    pub classifier_prompt_tokens: usize,
    /// Load the default backend at start-up instead of on first request
    pub eager_init: bool,
    /// What the safety gate answers when a message is judged safe
    pub reply_policy: ReplyPolicy,
    /// Fixed sampling seed; random when absent
    pub seed: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/base"),
            adapter_path: None,
            device: "cpu".to_string(),
            max_tokens: 128,
            temperature: 0.7,
            top_p: 0.9,
            backend: BackendKind::LocalDense,
            gpu_layers: 99,
            context_size: 4096,
            classifier_prompt_tokens: 256,
            eager_init: false,
            reply_policy: ReplyPolicy::Acknowledge,
            seed: None,
        }
    }
}

impl Settings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.max_tokens == 0 {
            self.max_tokens = 128;
        }

        if self.context_size == 0 {
            self.context_size = 4096;
        }

        if self.classifier_prompt_tokens == 0 {
            self.classifier_prompt_tokens = 256;
        }

        if self.device.trim().is_empty() {
            self.device = "cpu".to_string();
        }
    }

    /// Overlays environment variables on top of the current values.
    ///
    /// `lookup` returns the raw value of a variable, if set. Values that fail
    /// to parse are ignored and the previous value is kept.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("MODEL_PATH") {
            self.model_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("ADAPTER_PATH") {
            self.adapter_path = if path.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
        if let Some(device) = lookup("DEVICE") {
            self.device = device;
        }
        if let Some(value) = parse_env(&lookup, "MAX_TOKENS") {
            self.max_tokens = value;
        }
        if let Some(value) = parse_env(&lookup, "TEMPERATURE") {
            self.temperature = value;
        }
        if let Some(value) = parse_env(&lookup, "TOP_P") {
            self.top_p = value;
        }
        if let Some(value) = parse_env(&lookup, "MODEL_BACKEND") {
            self.backend = value;
        }
        if let Some(value) = parse_env(&lookup, "GPU_LAYERS") {
            self.gpu_layers = value;
        }
        if let Some(value) = parse_env(&lookup, "CONTEXT_SIZE") {
            self.context_size = value;
        }
        if let Some(value) = parse_env(&lookup, "CLASSIFIER_PROMPT_TOKENS") {
            self.classifier_prompt_tokens = value;
        }
        if let Some(value) = parse_env(&lookup, "EAGER_INIT") {
            self.eager_init = value;
        }
        if let Some(value) = parse_env(&lookup, "REPLY_POLICY") {
            self.reply_policy = value;
        }
        if let Some(value) = parse_env(&lookup, "SEED") {
            self.seed = Some(value);
        }
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring {key}={raw:?}: {e}");
            None
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, ConfigError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings
///
/// Never fails: a missing or corrupted settings file falls back to defaults,
/// and the environment (including `.env`) is applied on top.
pub fn load_settings() -> Settings {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!("Loaded environment from {}", path.display());
    }

    let mut settings = match load_settings_file() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Settings::default()
        }
    };

    settings.apply_env(|key| std::env::var(key).ok());
    settings.validate();
    settings
}

/// Internal settings loading with error propagation
fn load_settings_file() -> Result<Settings, ConfigError> {
    let path = get_settings_path()?;

    if !path.exists() {
        tracing::debug!("Settings file not found, using defaults");
        return Ok(Settings::default());
    }

    let json = fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&json)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.device, "cpu");
        assert_eq!(settings.max_tokens, 128);
        assert_eq!(settings.temperature, 0.7);
        assert_eq!(settings.top_p, 0.9);
        assert_eq!(settings.backend, BackendKind::LocalDense);
        assert!(settings.adapter_path.is_none());
        assert!(!settings.eager_init);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();

        settings.temperature = 5.0;
        settings.validate();
        assert_eq!(settings.temperature, 2.0);

        settings.temperature = -1.0;
        settings.validate();
        assert_eq!(settings.temperature, 0.0);

        settings.top_p = 2.0;
        settings.validate();
        assert_eq!(settings.top_p, 1.0);

        settings.max_tokens = 0;
        settings.device = "  ".to_string();
        settings.validate();
        assert_eq!(settings.max_tokens, 128);
        assert_eq!(settings.device, "cpu");
    }

    #[test]
    fn test_env_overlay() {
        let mut settings = Settings::default();
        settings.apply_env(env(&[
            ("MODEL_PATH", "/models/mistral"),
            ("ADAPTER_PATH", "/models/adapter"),
            ("DEVICE", "cuda:0"),
            ("MAX_TOKENS", "256"),
            ("TEMPERATURE", "0.2"),
            ("MODEL_BACKEND", "llama"),
            ("EAGER_INIT", "true"),
            ("REPLY_POLICY", "generate"),
            ("SEED", "42"),
        ]));

        assert_eq!(settings.model_path, PathBuf::from("/models/mistral"));
        assert_eq!(settings.adapter_path, Some(PathBuf::from("/models/adapter")));
        assert_eq!(settings.device, "cuda:0");
        assert_eq!(settings.max_tokens, 256);
        assert!((settings.temperature - 0.2).abs() < 0.001);
        assert_eq!(settings.backend, BackendKind::QuantizedNative);
        assert!(settings.eager_init);
        assert_eq!(settings.reply_policy, ReplyPolicy::Generate);
        assert_eq!(settings.seed, Some(42));
    }

    #[test]
    fn test_env_overlay_ignores_garbage() {
        let mut settings = Settings::default();
        settings.apply_env(env(&[
            ("MAX_TOKENS", "lots"),
            ("MODEL_BACKEND", "onnx"),
            ("TOP_P", ""),
        ]));

        assert_eq!(settings.max_tokens, 128);
        assert_eq!(settings.backend, BackendKind::LocalDense);
        assert_eq!(settings.top_p, 0.9);
    }

    #[test]
    fn test_empty_adapter_path_clears_adapter() {
        let mut settings = Settings {
            adapter_path: Some(PathBuf::from("/models/adapter")),
            ..Settings::default()
        };
        settings.apply_env(env(&[("ADAPTER_PATH", "")]));
        assert!(settings.adapter_path.is_none());
    }

    #[test]
    fn test_settings_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings {
            backend: BackendKind::QuantizedNative,
            gpu_layers: 0,
            ..Settings::default()
        };
        fs::write(&path, serde_json::to_string_pretty(&settings).unwrap()).unwrap();

        let loaded: Settings = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_settings_file_uses_defaults() {
        let loaded: Settings =
            serde_json::from_str(r#"{"backend":"transformers","max_tokens":64}"#).unwrap();
        assert_eq!(loaded.backend, BackendKind::LocalDense);
        assert_eq!(loaded.max_tokens, 64);
        assert_eq!(loaded.device, "cpu");
    }
}
