//! Generation dispatch
//!
//! Routes a prompt to the selected backend and maps the generic sampling
//! parameters onto that backend's calling convention.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::config::Settings;
use crate::inference::backend::BackendKind;
use crate::inference::engine::{
    CompletionRequest, DenseEngine, DenseGenerateOptions, NativeEngine,
};
use crate::inference::prompt::build_prompt;
use crate::inference::registry::{BackendHandle, BackendRegistry};
use crate::inference::GenerationError;
use crate::types::{GenerationRequest, GenerationResult, SamplingParams};

/// Token budget for constrained (classification) generation
pub const CONSTRAINED_MAX_TOKENS: u32 = 4;

#[derive(Debug, Clone, Copy)]
enum Mode {
    Sampling(SamplingParams),
    /// Greedy, short output for label-style answers
    Constrained { prompt_tokens: usize },
}

#[derive(Clone)]
pub struct Generator {
    registry: Arc<BackendRegistry>,
    settings: Arc<Settings>,
}

impl Generator {
    pub fn new(registry: Arc<BackendRegistry>, settings: Arc<Settings>) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Generates a completion for `prompt`.
    ///
    /// `backend` falls back to the configured default; an unknown selector is
    /// rejected before any engine is touched.
    pub async fn generate(
        &self,
        prompt: &str,
        params: SamplingParams,
        backend: Option<&str>,
        model_ref: Option<&str>,
    ) -> Result<GenerationResult, GenerationError> {
        self.run(prompt, Mode::Sampling(params), backend, model_ref)
            .await
    }

    /// Builds the prompt from the conversation and generates a reply.
    pub async fn generate_request(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        let prompt = build_prompt(&request.messages);
        let params = request.sampling(&self.settings);
        self.generate(
            &prompt,
            params,
            request.backend.as_deref(),
            request.model.as_deref(),
        )
        .await
    }

    /// Greedy generation of at most [`CONSTRAINED_MAX_TOKENS`] tokens.
    ///
    /// Caller sampling parameters do not apply. The output is trimmed.
    pub async fn generate_constrained(
        &self,
        prompt: &str,
        backend: Option<&str>,
    ) -> Result<GenerationResult, GenerationError> {
        let mode = Mode::Constrained {
            prompt_tokens: self.settings.classifier_prompt_tokens,
        };
        let mut result = self.run(prompt, mode, backend, None).await?;
        result.output = result.output.trim().to_string();
        Ok(result)
    }

    async fn run(
        &self,
        prompt: &str,
        mode: Mode,
        backend: Option<&str>,
        model_ref: Option<&str>,
    ) -> Result<GenerationResult, GenerationError> {
        let kind = BackendKind::resolve(backend, self.settings.backend)?;
        let span = info_span!("generate", request_id = %Uuid::new_v4(), backend = %kind);

        async move {
            let handle = self.registry.ensure_ready(kind, model_ref).await?;
            let started = Instant::now();
            let owned_prompt = prompt.to_string();

            let output = match handle {
                BackendHandle::Dense(engine) => {
                    let options = dense_options(mode, engine.eos_token_id());
                    debug!("Dense call: {options:?}");
                    tokio::task::spawn_blocking(move || {
                        run_dense(engine.as_ref(), &owned_prompt, &options)
                    })
                    .await??
                }
                BackendHandle::Native(engine) => {
                    let request = completion_request(owned_prompt, mode);
                    debug!(
                        "Native call: max_tokens={} temperature={} top_p={}",
                        request.max_tokens, request.temperature, request.top_p
                    );
                    tokio::task::spawn_blocking(move || run_native(engine.as_ref(), request))
                        .await??
                }
            };

            debug!(
                "Generated {} chars in {:.2}s",
                output.len(),
                started.elapsed().as_secs_f64()
            );
            Ok(GenerationResult {
                prompt: prompt.to_string(),
                output,
            })
        }
        .instrument(span)
        .await
    }
}

fn dense_options(mode: Mode, eos_token_id: Option<u32>) -> DenseGenerateOptions {
    match mode {
        Mode::Sampling(params) => DenseGenerateOptions {
            max_new_tokens: params.max_tokens as usize,
            temperature: f64::from(params.temperature),
            top_p: f64::from(params.top_p),
            do_sample: true,
            eos_token_id,
            max_prompt_tokens: None,
        },
        Mode::Constrained { prompt_tokens } => DenseGenerateOptions {
            max_new_tokens: CONSTRAINED_MAX_TOKENS as usize,
            temperature: 0.0,
            top_p: 1.0,
            do_sample: false,
            eos_token_id,
            max_prompt_tokens: Some(prompt_tokens),
        },
    }
}

fn completion_request(prompt: String, mode: Mode) -> CompletionRequest {
    match mode {
        Mode::Sampling(params) => CompletionRequest {
            prompt,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            max_prompt_tokens: None,
        },
        Mode::Constrained { prompt_tokens } => CompletionRequest {
            prompt,
            max_tokens: CONSTRAINED_MAX_TOKENS,
            temperature: 0.0,
            top_p: 1.0,
            max_prompt_tokens: Some(prompt_tokens),
        },
    }
}

fn run_dense(
    engine: &dyn DenseEngine,
    prompt: &str,
    options: &DenseGenerateOptions,
) -> Result<String, GenerationError> {
    let output = engine
        .generate(prompt, options)?
        .into_iter()
        .next()
        .ok_or_else(|| GenerationError::Inference("pipeline returned no output".to_string()))?;
    Ok(strip_prompt(prompt, &output.generated_text))
}

fn run_native(
    engine: &dyn NativeEngine,
    request: CompletionRequest,
) -> Result<String, GenerationError> {
    let completion = engine.create_completion(request)?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GenerationError::Inference("completion returned no choices".to_string()))?;
    Ok(choice.text.trim().to_string())
}

/// Removes the echoed prompt from a pipeline output.
///
/// Output that does not start with the prompt verbatim is returned as is.
fn strip_prompt(prompt: &str, generated: &str) -> String {
    match generated.strip_prefix(prompt) {
        Some(continuation) => continuation.trim().to_string(),
        None => generated.to_string(),
    }
}
