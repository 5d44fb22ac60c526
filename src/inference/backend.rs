//! Backend selection

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::inference::GenerationError;

/// The inference engines a request can be routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Full-precision safetensors model run through the candle pipeline
    #[serde(alias = "transformers", alias = "dense")]
    LocalDense,
    /// GGUF model run through llama.cpp
    #[serde(alias = "llama", alias = "native")]
    QuantizedNative,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::LocalDense, BackendKind::QuantizedNative];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::LocalDense => "local-dense",
            BackendKind::QuantizedNative => "quantized-native",
        }
    }

    /// Resolves an optional selector against the process default.
    pub fn resolve(selector: Option<&str>, default: BackendKind) -> Result<Self, GenerationError> {
        match selector {
            Some(raw) => raw.parse(),
            None => Ok(default),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local-dense" | "transformers" | "dense" => Ok(BackendKind::LocalDense),
            "quantized-native" | "llama" | "native" => Ok(BackendKind::QuantizedNative),
            _ => Err(GenerationError::UnsupportedBackend(s.to_string())),
        }
    }
}
