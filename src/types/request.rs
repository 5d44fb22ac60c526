//! Request and result shapes exchanged with the transport layer.

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::types::message::Message;

/// Sampling parameters shared by every backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Maximum number of new tokens to generate
    pub max_tokens: u32,
    /// Sampling temperature (0.0 = greedy)
    pub temperature: f32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
}

impl SamplingParams {
    /// Process-wide defaults taken from the settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            top_p: settings.top_p,
        }
        .clamped()
    }

    /// Applies per-request overrides on top of these parameters.
    pub fn with_overrides(
        self,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        top_p: Option<f32>,
    ) -> Self {
        Self {
            max_tokens: max_tokens.unwrap_or(self.max_tokens),
            temperature: temperature.unwrap_or(self.temperature),
            top_p: top_p.unwrap_or(self.top_p),
        }
        .clamped()
    }

    fn clamped(self) -> Self {
        Self {
            max_tokens: self.max_tokens.max(1),
            temperature: if self.temperature.is_finite() {
                self.temperature.clamp(0.0, 2.0)
            } else {
                0.0
            },
            top_p: if self.top_p.is_finite() {
                self.top_p.clamp(0.0, 1.0)
            } else {
                1.0
            },
        }
    }
}

/// A generation request as received from a client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Conversation history, oldest first
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Maximum number of new tokens to generate
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Top-p nucleus sampling
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Optional model name or path override
    #[serde(default)]
    pub model: Option<String>,
    /// Optional backend selector, exactly as the client sent it
    #[serde(default)]
    pub backend: Option<String>,
}

impl GenerationRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Resolves the sampling parameters against the process defaults.
    pub fn sampling(&self, settings: &Settings) -> SamplingParams {
        SamplingParams::from_settings(settings).with_overrides(
            self.max_tokens,
            self.temperature,
            self.top_p,
        )
    }
}

/// The outcome of a generation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// The exact prompt handed to the engine
    pub prompt: String,
    /// The completion, never prefixed by the prompt
    pub output: String,
}
