//! Dense local-inference pipeline
//!
//! Loads a Llama-family checkpoint (Llama, Mistral and compatible) from a
//! Hugging Face style directory: `config.json`, `tokenizer.json` and either
//! `model.safetensors` or a sharded `model.safetensors.index.json`.
//!
//! Like a text-generation pipeline, [`DensePipeline::generate`] returns the
//! prompt followed by the generated continuation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::{
    Cache, Config as LlamaRuntimeConfig, Llama, LlamaConfig, LlamaEosToks,
};
use serde_json::Value;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::inference::adapter::{Attachment, LoraAdapter};
use crate::inference::device::DeviceProfile;
use crate::inference::engine::{
    truncate_prompt, DenseEngine, DenseGenerateOptions, EngineError, PipelineOutput,
};

/// Tokens commonly used as end-of-sequence markers when the config names none
const FALLBACK_EOS_TOKENS: [&str; 4] = ["</s>", "<|endoftext|>", "<|end_of_text|>", "<|eot_id|>"];

pub struct DensePipeline {
    model: Llama,
    config: LlamaRuntimeConfig,
    tokenizer: Tokenizer,
    device: DeviceProfile,
    dtype: DType,
    eos_token_ids: Vec<u32>,
    seed: Option<u64>,
}

impl DensePipeline {
    /// Loads the base model and, if given, attaches a LoRA adapter.
    ///
    /// Base model failures are errors. Adapter failures are logged and the
    /// base model is returned as [`Attachment::BaseOnly`].
    pub fn load(
        model_dir: &Path,
        adapter_dir: Option<&Path>,
        device: &DeviceProfile,
        seed: Option<u64>,
    ) -> Result<Attachment<Self>, EngineError> {
        if !model_dir.exists() {
            return Err(EngineError::MissingPath(model_dir.to_path_buf()));
        }

        let tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| EngineError::ModelLoad(format!("tokenizer.json: {e}")))?;

        let config_str = fs::read_to_string(model_dir.join("config.json"))
            .map_err(|e| EngineError::ModelLoad(format!("config.json: {e}")))?;
        let llama_config: LlamaConfig = serde_json::from_str(&config_str)
            .map_err(|e| EngineError::ModelValidation(format!("config.json: {e}")))?;
        let config = llama_config.into_config(false);

        let dtype = device.dtype();
        let weights = weight_files(model_dir)?;

        let (vb, attachment) = match adapter_dir {
            Some(adapter_dir) => {
                let mut tensors = HashMap::new();
                for file in &weights {
                    let shard = candle_core::safetensors::load(file, &device.device)
                        .map_err(|e| EngineError::ModelLoad(format!("{}: {e}", file.display())))?;
                    tensors.extend(shard);
                }

                let attachment = attach_adapter(&mut tensors, adapter_dir, &device.device);
                (
                    VarBuilder::from_tensors(tensors, dtype, &device.device),
                    attachment,
                )
            }
            None => {
                let vb = unsafe {
                    VarBuilder::from_mmaped_safetensors(&weights, dtype, &device.device)
                        .map_err(|e| EngineError::ModelLoad(e.to_string()))?
                };
                (vb, Attachment::Unadapted(()))
            }
        };

        let model =
            Llama::load(vb, &config).map_err(|e| EngineError::ModelLoad(e.to_string()))?;
        let eos_token_ids = resolve_eos_tokens(config.eos_token_id.as_ref(), &tokenizer);

        info!(
            "Loaded dense model {} on {:?} ({} layers, eos {:?})",
            model_dir.display(),
            device.kind,
            config.num_hidden_layers,
            eos_token_ids
        );

        let pipeline = Self {
            model,
            config,
            tokenizer,
            device: device.clone(),
            dtype,
            eos_token_ids,
            seed,
        };
        Ok(attachment.map(|()| pipeline))
    }

    fn is_eos(&self, token: u32, extra: Option<u32>) -> bool {
        self.eos_token_ids.contains(&token) || extra == Some(token)
    }
}

impl DenseEngine for DensePipeline {
    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_ids.first().copied()
    }

    fn generate(
        &self,
        prompt: &str,
        options: &DenseGenerateOptions,
    ) -> Result<Vec<PipelineOutput>, EngineError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        let mut prompt_ids = encoding.get_ids().to_vec();
        truncate_prompt(&mut prompt_ids, options.max_prompt_tokens);
        if prompt_ids.is_empty() {
            return Err(EngineError::Tokenization("prompt produced no tokens".to_string()));
        }
        debug!("Tokenized prompt into {} tokens", prompt_ids.len());

        let inference = |e: candle_core::Error| EngineError::Inference(e.to_string());

        let mut cache = Cache::new(true, self.dtype, &self.config, &self.device.device)
            .map_err(inference)?;
        let seed = self.seed.unwrap_or_else(rand_seed);
        let mut processor = LogitsProcessor::from_sampling(seed, sampling_for(options));

        let mut generated: Vec<u32> = Vec::new();
        let mut input = prompt_ids;
        let mut index_pos = 0usize;

        for _ in 0..options.max_new_tokens {
            if index_pos + input.len() > self.config.max_position_embeddings {
                debug!("Context window exhausted at {index_pos} tokens");
                break;
            }

            let tensor = Tensor::new(input.as_slice(), &self.device.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(inference)?;
            let logits = self
                .model
                .forward(&tensor, index_pos, &mut cache)
                .and_then(|l| l.squeeze(0))
                .and_then(|l| l.to_dtype(DType::F32))
                .map_err(inference)?;
            index_pos += input.len();

            let next = processor.sample(&logits).map_err(inference)?;
            if self.is_eos(next, options.eos_token_id) {
                break;
            }
            generated.push(next);
            input = vec![next];
        }

        let continuation = self
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;

        Ok(vec![PipelineOutput {
            generated_text: format!("{prompt}{continuation}"),
        }])
    }
}

/// Merges the adapter at `adapter_dir` into the base weights.
///
/// On any adapter failure the weights are left as they were and the result
/// is [`Attachment::BaseOnly`].
fn attach_adapter(
    tensors: &mut HashMap<String, Tensor>,
    adapter_dir: &Path,
    device: &Device,
) -> Attachment<()> {
    let merged =
        LoraAdapter::load(adapter_dir, device).and_then(|adapter| adapter.merge_into(tensors));
    match merged {
        Ok(count) => {
            info!(
                "Attached adapter {} ({count} weights)",
                adapter_dir.display()
            );
            Attachment::Attached(())
        }
        Err(e) => {
            warn!(
                "Adapter {} not attached, using base model only: {e}",
                adapter_dir.display()
            );
            Attachment::BaseOnly(())
        }
    }
}

/// Maps pipeline options to a candle sampling strategy.
fn sampling_for(options: &DenseGenerateOptions) -> Sampling {
    if !options.do_sample || options.temperature <= 0.0 || options.top_p <= 0.0 {
        Sampling::ArgMax
    } else if options.top_p >= 1.0 {
        Sampling::All {
            temperature: options.temperature,
        }
    } else {
        Sampling::TopP {
            p: options.top_p,
            temperature: options.temperature,
        }
    }
}

fn resolve_eos_tokens(configured: Option<&LlamaEosToks>, tokenizer: &Tokenizer) -> Vec<u32> {
    match configured {
        Some(LlamaEosToks::Single(id)) => vec![*id],
        Some(LlamaEosToks::Multiple(ids)) if !ids.is_empty() => ids.clone(),
        _ => FALLBACK_EOS_TOKENS
            .iter()
            .find_map(|token| tokenizer.token_to_id(token))
            .into_iter()
            .collect(),
    }
}

/// Lists the safetensors files of a checkpoint, sharded or not.
fn weight_files(model_dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let index_path = model_dir.join("model.safetensors.index.json");
    if index_path.exists() {
        let index_data = fs::read_to_string(&index_path)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;
        let index: Value = serde_json::from_str(&index_data)
            .map_err(|e| EngineError::ModelValidation(e.to_string()))?;
        let weight_map = index
            .get("weight_map")
            .and_then(|m| m.as_object())
            .ok_or_else(|| {
                EngineError::ModelValidation(
                    "Invalid model.safetensors.index.json format".to_string(),
                )
            })?;

        let mut shard_files: Vec<String> = weight_map
            .values()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
        shard_files.sort();
        shard_files.dedup();

        return Ok(shard_files.iter().map(|f| model_dir.join(f)).collect());
    }

    let single = model_dir.join("model.safetensors");
    if single.exists() {
        Ok(vec![single])
    } else {
        Err(EngineError::ModelValidation(format!(
            "No safetensors weights in {}",
            model_dir.display()
        )))
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish()
}
