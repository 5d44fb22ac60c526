//! Engine call conventions
//!
//! Each backend keeps its own native calling convention: the dense pipeline
//! echoes the prompt in front of its continuation, the native engine answers
//! with a list of completion choices. The dispatcher translates between these
//! and the generic [`SamplingParams`](crate::types::SamplingParams).
//!
//! Engines are blocking. Callers run them on `spawn_blocking`.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::inference::adapter::Attachment;
use crate::inference::device::DeviceProfile;
use crate::inference::gguf::GgufError;

/// Errors that can occur while constructing or running an engine
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Model path does not exist: {}", .0.display())]
    MissingPath(PathBuf),

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<GgufError> for EngineError {
    fn from(e: GgufError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Options for one dense pipeline call
#[derive(Debug, Clone, PartialEq)]
pub struct DenseGenerateOptions {
    /// Upper bound on generated tokens
    pub max_new_tokens: usize,
    /// Sampling temperature; ignored when `do_sample` is false
    pub temperature: f64,
    /// Nucleus sampling mass; ignored when `do_sample` is false
    pub top_p: f64,
    /// Stochastic sampling when true, greedy decoding when false
    pub do_sample: bool,
    /// Token that ends generation
    pub eos_token_id: Option<u32>,
    /// Truncate the tokenized prompt to this many tokens
    pub max_prompt_tokens: Option<usize>,
}

/// Keeps the first `limit` prompt tokens, and never fewer than one.
pub fn truncate_prompt<T>(tokens: &mut Vec<T>, limit: Option<usize>) {
    if let Some(limit) = limit {
        tokens.truncate(limit.max(1));
    }
}

/// One pipeline output: the prompt followed by the generated continuation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutput {
    pub generated_text: String,
}

/// A dense text-generation pipeline
pub trait DenseEngine: Send + Sync {
    /// End-of-sequence token of the loaded tokenizer
    fn eos_token_id(&self) -> Option<u32>;

    fn generate(
        &self,
        prompt: &str,
        options: &DenseGenerateOptions,
    ) -> Result<Vec<PipelineOutput>, EngineError>;
}

/// A completion call against the native engine
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    /// Truncate the tokenized prompt to this many tokens
    pub max_prompt_tokens: Option<usize>,
}

/// Why a completion stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-generation token sampled
    Stop,
    /// Token budget or context window exhausted
    Length,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionChoice {
    pub text: String,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub choices: Vec<CompletionChoice>,
}

/// A quantized native inference engine
pub trait NativeEngine: Send + Sync {
    fn create_completion(&self, request: CompletionRequest) -> Result<Completion, EngineError>;
}

/// Constructs engines for the registry
///
/// Construction is blocking and may take a long time; the registry calls it
/// at most once per backend kind at a time.
pub trait EngineLoader: Send + Sync {
    fn load_dense(
        &self,
        model_ref: &str,
        device: &DeviceProfile,
    ) -> Result<Attachment<Arc<dyn DenseEngine>>, EngineError>;

    fn load_native(
        &self,
        model_ref: &str,
        device: &DeviceProfile,
    ) -> Result<Arc<dyn NativeEngine>, EngineError>;
}
