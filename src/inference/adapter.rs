//! Fine-tuning adapters
//!
//! LoRA adapters in the PEFT layout (`adapter_config.json` and
//! `adapter_model.safetensors`) are merged into the base weights before the
//! model is built: `W' = W + scale * (B @ A)`.
//!
//! Attachment failure is recoverable. The dense loader keeps the base weights
//! and reports [`Attachment::BaseOnly`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use thiserror::Error;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// Adapter attachment failures. These never abort model loading.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Adapter path does not exist: {}", .0.display())]
    MissingPath(PathBuf),

    #[error("Invalid adapter config: {0}")]
    Config(String),

    #[error("Failed to read adapter weights: {0}")]
    Weights(String),

    #[error("Adapter targets unknown base tensor: {0}")]
    UnknownTarget(String),

    #[error("Adapter tensor {name} does not fit the base model: {reason}")]
    Shape { name: String, reason: String },
}

/// The outcome of loading a base model with an optional adapter
#[derive(Debug, Clone)]
pub enum Attachment<E> {
    /// The adapter was merged into the base weights
    Attached(E),
    /// An adapter was configured but could not be attached
    BaseOnly(E),
    /// No adapter was configured
    Unadapted(E),
}

/// Adapter state reported by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterStatus {
    Attached,
    BaseOnly,
    Unadapted,
    NotApplicable,
}

impl<E> Attachment<E> {
    pub fn status(&self) -> AdapterStatus {
        match self {
            Attachment::Attached(_) => AdapterStatus::Attached,
            Attachment::BaseOnly(_) => AdapterStatus::BaseOnly,
            Attachment::Unadapted(_) => AdapterStatus::Unadapted,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            Attachment::Attached(e) | Attachment::BaseOnly(e) | Attachment::Unadapted(e) => e,
        }
    }

    pub fn map<F, T>(self, f: F) -> Attachment<T>
    where
        F: FnOnce(E) -> T,
    {
        match self {
            Attachment::Attached(e) => Attachment::Attached(f(e)),
            Attachment::BaseOnly(e) => Attachment::BaseOnly(f(e)),
            Attachment::Unadapted(e) => Attachment::Unadapted(f(e)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AdapterConfig {
    r: usize,
    lora_alpha: f64,
    #[serde(default)]
    use_rslora: bool,
    #[serde(default)]
    base_model_name_or_path: Option<String>,
}

impl AdapterConfig {
    fn scale(&self) -> f64 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f64).sqrt()
        } else {
            self.lora_alpha / self.r as f64
        }
    }
}

/// Maps a PEFT `lora_A` key to the base weight it modifies.
///
/// `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight`
/// becomes `model.layers.0.self_attn.q_proj.weight`.
pub fn base_weight_name(lora_a_key: &str) -> Option<String> {
    let stem = lora_a_key
        .strip_suffix(".lora_A.weight")
        .or_else(|| lora_a_key.strip_suffix(".lora_A.default.weight"))?;
    let stem = stem.strip_prefix("base_model.model.").unwrap_or(stem);
    Some(format!("{stem}.weight"))
}

/// A LoRA adapter loaded into memory
pub struct LoraAdapter {
    config: AdapterConfig,
    tensors: HashMap<String, Tensor>,
}

impl LoraAdapter {
    pub fn load(dir: &Path, device: &Device) -> Result<Self, AdapterError> {
        if !dir.exists() {
            return Err(AdapterError::MissingPath(dir.to_path_buf()));
        }

        let config_str = fs::read_to_string(dir.join(ADAPTER_CONFIG_FILE))
            .map_err(|e| AdapterError::Config(e.to_string()))?;
        let config: AdapterConfig =
            serde_json::from_str(&config_str).map_err(|e| AdapterError::Config(e.to_string()))?;
        if config.r == 0 {
            return Err(AdapterError::Config("rank must be positive".to_string()));
        }

        let tensors = candle_core::safetensors::load(dir.join(ADAPTER_WEIGHTS_FILE), device)
            .map_err(|e| AdapterError::Weights(e.to_string()))?;

        if let Some(base) = &config.base_model_name_or_path {
            tracing::debug!("Adapter at {} was trained on {base}", dir.display());
        }

        Ok(Self { config, tensors })
    }

    /// Merges every LoRA pair into `base`, returning the number of weights touched.
    ///
    /// Either every pair merges or `base` is left untouched.
    pub fn merge_into(&self, base: &mut HashMap<String, Tensor>) -> Result<usize, AdapterError> {
        let scale = self.config.scale();
        let mut merged = Vec::new();

        for (a_key, lora_a) in &self.tensors {
            let Some(target) = base_weight_name(a_key) else {
                continue;
            };
            let b_key = a_key.replace("lora_A", "lora_B");
            let lora_b = self
                .tensors
                .get(&b_key)
                .ok_or_else(|| AdapterError::Weights(format!("missing {b_key}")))?;
            let weight = base
                .get(&target)
                .ok_or_else(|| AdapterError::UnknownTarget(target.clone()))?;

            let updated = merge_pair(weight, lora_a, lora_b, scale).map_err(|e| {
                AdapterError::Shape {
                    name: target.clone(),
                    reason: e.to_string(),
                }
            })?;
            merged.push((target, updated));
        }

        if merged.is_empty() {
            return Err(AdapterError::Weights("no LoRA tensors found".to_string()));
        }

        let count = merged.len();
        base.extend(merged);
        Ok(count)
    }
}

fn merge_pair(
    weight: &Tensor,
    lora_a: &Tensor,
    lora_b: &Tensor,
    scale: f64,
) -> candle_core::Result<Tensor> {
    let delta = lora_b
        .to_dtype(DType::F32)?
        .matmul(&lora_a.to_dtype(DType::F32)?)?
        .affine(scale, 0.0)?;
    if delta.dims() != weight.dims() {
        candle_core::bail!("delta {:?} vs weight {:?}", delta.dims(), weight.dims());
    }
    weight
        .to_dtype(DType::F32)?
        .add(&delta)?
        .to_dtype(weight.dtype())
}
