//! Quantized native engine backed by llama.cpp
//!
//! # Architecture
//!
//! Since llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain
//! raw pointers that are not `Send`, the backend and model live on a dedicated
//! worker thread for the whole lifetime of the engine. Completion requests are
//! sent over a channel and answered one at a time.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;

use crate::inference::engine::{
    truncate_prompt, Completion, CompletionChoice, CompletionRequest, EngineError, FinishReason,
    NativeEngine,
};

/// Smallest context window created for a completion
const MIN_CONTEXT: u32 = 2048;

/// Top-k applied ahead of nucleus sampling
const TOP_K: i32 = 40;

/// Load-time options for the native engine
#[derive(Debug, Clone)]
pub struct NativeOptions {
    /// Number of layers to offload to an accelerator (0 = CPU only)
    pub gpu_layers: u32,
    /// Requested context window size
    pub context_size: u32,
    /// Random seed for sampling (None = random per call)
    pub seed: Option<u64>,
}

/// Model information after loading
#[derive(Debug, Clone)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Complete {
        request: CompletionRequest,
        response_tx: Sender<Result<Completion, EngineError>>,
    },
    Shutdown,
}

/// A GGUF model loaded into llama.cpp
pub struct LlamaCppEngine {
    command_tx: Sender<WorkerCommand>,
    worker_handle: Option<JoinHandle<()>>,
    info: LoadedModelInfo,
}

impl LlamaCppEngine {
    /// Starts the worker thread and loads the model on it.
    ///
    /// Returns once the model is ready, or with the error that prevented it.
    pub fn load(path: &Path, options: NativeOptions) -> Result<Self, EngineError> {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let model_path = path.to_path_buf();

        let handle = thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || worker_thread_main(model_path, options, ready_tx, command_rx))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(info)) => {
                tracing::info!("LlamaCppEngine worker thread ready");
                Ok(Self {
                    command_tx,
                    worker_handle: Some(handle),
                    info,
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(e) => {
                let _ = handle.join();
                Err(EngineError::WorkerError(e.to_string()))
            }
        }
    }

    /// Returns information about the loaded model
    pub fn model_info(&self) -> &LoadedModelInfo {
        &self.info
    }
}

impl NativeEngine for LlamaCppEngine {
    fn create_completion(&self, request: CompletionRequest) -> Result<Completion, EngineError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.command_tx
            .send(WorkerCommand::Complete {
                request,
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))?
    }
}

impl Drop for LlamaCppEngine {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the LlamaBackend and LlamaModel until shutdown.
fn worker_thread_main(
    path: PathBuf,
    options: NativeOptions,
    ready_tx: Sender<Result<LoadedModelInfo, EngineError>>,
    command_rx: Receiver<WorkerCommand>,
) {
    let backend = match LlamaBackend::init() {
        Ok(backend) => backend,
        Err(e) => {
            let _ = ready_tx.send(Err(EngineError::BackendInit(e.to_string())));
            return;
        }
    };

    let model_params = LlamaModelParams::default().with_n_gpu_layers(options.gpu_layers);
    let model = match LlamaModel::load_from_file(&backend, &path, &model_params) {
        Ok(model) => model,
        Err(e) => {
            let _ = ready_tx.send(Err(EngineError::ModelLoad(e.to_string())));
            return;
        }
    };

    let info = LoadedModelInfo {
        path: path.to_string_lossy().to_string(),
        vocab_size: model.n_vocab(),
        context_length: model.n_ctx_train(),
        param_count: model.n_params() as u64,
        size_bytes: model.size() as u64,
    };
    tracing::info!(
        "Model loaded: {} ({} params, {} vocab, {} ctx)",
        info.path,
        info.param_count,
        info.vocab_size,
        info.context_length
    );

    if ready_tx.send(Ok(info)).is_err() {
        return;
    }

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Complete {
                request,
                response_tx,
            }) => {
                let result = run_completion(&backend, &model, &options, &request);
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

/// Runs one completion (called from worker thread)
fn run_completion(
    backend: &LlamaBackend,
    model: &LlamaModel,
    options: &NativeOptions,
    request: &CompletionRequest,
) -> Result<Completion, EngineError> {
    let mut tokens = model
        .str_to_token(&request.prompt, AddBos::Always)
        .map_err(|e| EngineError::Tokenization(e.to_string()))?;
    truncate_prompt(&mut tokens, request.max_prompt_tokens);
    if tokens.is_empty() {
        return Err(EngineError::Tokenization("prompt produced no tokens".to_string()));
    }
    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

    let n_ctx = options.context_size.min(model.n_ctx_train()).max(MIN_CONTEXT);
    if tokens.len() as u32 >= n_ctx {
        return Err(EngineError::ContextCreate(format!(
            "prompt of {} tokens does not fit a {n_ctx} token context",
            tokens.len()
        )));
    }

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(n_ctx);
    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

    let mut batch = LlamaBatch::new(n_ctx as usize, 1);
    let last_index = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        batch
            .add(*token, i as i32, &[0], i == last_index)
            .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {e}")))?;
    }
    ctx.decode(&mut batch)
        .map_err(|e| EngineError::Inference(format!("Failed to decode prompt: {e}")))?;

    let mut sampler = if request.temperature < 0.01 || request.top_p <= 0.0 {
        LlamaSampler::greedy()
    } else {
        let seed = options.seed.map(|s| s as u32).unwrap_or_else(rand_seed);
        LlamaSampler::chain_simple([
            LlamaSampler::top_k(TOP_K),
            LlamaSampler::top_p(request.top_p, 1),
            LlamaSampler::temp(request.temperature),
            LlamaSampler::dist(seed),
        ])
    };

    let mut n_cur = tokens.len() as i32;
    let mut bytes: Vec<u8> = Vec::new();
    let mut finish_reason = FinishReason::Length;

    for _ in 0..request.max_tokens {
        if n_cur as u32 >= n_ctx {
            tracing::debug!("Context window exhausted at {n_cur} tokens");
            break;
        }

        let new_token = sampler.sample(&ctx, batch.n_tokens() - 1);
        sampler.accept(new_token);

        if model.is_eog_token(new_token) {
            finish_reason = FinishReason::Stop;
            break;
        }

        let token_bytes = model
            .token_to_bytes(new_token, Special::Tokenize)
            .map_err(|e| EngineError::Inference(format!("Failed to convert token: {e}")))?;
        bytes.extend_from_slice(&token_bytes);

        batch.clear();
        batch
            .add(new_token, n_cur, &[0], true)
            .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Inference(format!("Failed to decode: {e}")))?;

        n_cur += 1;
    }

    Ok(Completion {
        choices: vec![CompletionChoice {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            finish_reason,
        }],
    })
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
