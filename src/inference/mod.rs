//! LLM inference
//!
//! Backend selection, engine lifecycle, prompt construction, generation
//! dispatch and simulated streaming.

pub mod adapter;
pub mod backend;
pub mod dense;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod gguf;
pub mod llama;
pub mod loader;
pub mod prompt;
pub mod registry;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

// Re-export main types for convenience
pub use adapter::{AdapterError, AdapterStatus, Attachment};
pub use backend::BackendKind;
pub use dispatch::Generator;
pub use engine::{DenseEngine, EngineError, EngineLoader, NativeEngine};
pub use loader::NativeLoader;
pub use prompt::build_prompt;
pub use registry::{BackendHandle, BackendRegistry, BackendStatus};
pub use streaming::{StreamToken, DONE_SENTINEL};

/// Failures surfaced to the caller of a generation request
#[derive(Debug, Error, Clone)]
pub enum GenerationError {
    /// A configured model path does not exist
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The engine could not be constructed; a later request may retry
    #[error("Backend {kind} unavailable: {reason}")]
    BackendUnavailable { kind: BackendKind, reason: String },

    /// The requested backend selector is not recognized
    #[error("Unsupported backend '{0}'")]
    UnsupportedBackend(String),

    /// The engine failed while generating
    #[error("Inference failed: {0}")]
    Inference(String),

    /// A blocking task panicked or was cancelled
    #[error("Worker error: {0}")]
    Worker(String),
}

impl GenerationError {
    /// Classifies an engine construction failure for `kind`.
    pub fn from_load(kind: BackendKind, error: EngineError) -> Self {
        match error {
            EngineError::MissingPath(_) => GenerationError::Configuration(error.to_string()),
            other => GenerationError::BackendUnavailable {
                kind,
                reason: other.to_string(),
            },
        }
    }
}

impl From<EngineError> for GenerationError {
    fn from(error: EngineError) -> Self {
        GenerationError::Inference(error.to_string())
    }
}

impl From<tokio::task::JoinError> for GenerationError {
    fn from(error: tokio::task::JoinError) -> Self {
        GenerationError::Worker(error.to_string())
    }
}
