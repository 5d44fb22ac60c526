//! Production engine construction

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Settings;
use crate::inference::adapter::Attachment;
use crate::inference::dense::DensePipeline;
use crate::inference::device::DeviceProfile;
use crate::inference::engine::{DenseEngine, EngineError, EngineLoader, NativeEngine};
use crate::inference::gguf::resolve_model_file;
use crate::inference::llama::{LlamaCppEngine, NativeOptions};

/// Builds the candle pipeline and the llama.cpp engine from settings
#[derive(Debug, Clone)]
pub struct NativeLoader {
    adapter_path: Option<PathBuf>,
    gpu_layers: u32,
    context_size: u32,
    seed: Option<u64>,
}

impl NativeLoader {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            adapter_path: settings.adapter_path.clone(),
            gpu_layers: settings.gpu_layers,
            context_size: settings.context_size,
            seed: settings.seed,
        }
    }
}

impl EngineLoader for NativeLoader {
    fn load_dense(
        &self,
        model_ref: &str,
        device: &DeviceProfile,
    ) -> Result<Attachment<Arc<dyn DenseEngine>>, EngineError> {
        let pipeline = DensePipeline::load(
            Path::new(model_ref),
            self.adapter_path.as_deref(),
            device,
            self.seed,
        )?;
        Ok(pipeline.map(|p| Arc::new(p) as Arc<dyn DenseEngine>))
    }

    fn load_native(
        &self,
        model_ref: &str,
        device: &DeviceProfile,
    ) -> Result<Arc<dyn NativeEngine>, EngineError> {
        let path = resolve_model_file(model_ref)?;
        let engine = LlamaCppEngine::load(
            &path,
            NativeOptions {
                gpu_layers: device.gpu_layers(self.gpu_layers),
                context_size: self.context_size,
                seed: self.seed,
            },
        )?;
        tracing::debug!("Native model info: {:?}", engine.model_info());
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_paths_are_reported_as_missing() {
        let loader = NativeLoader::from_settings(&Settings::default());
        let device = DeviceProfile::cpu();

        assert!(matches!(
            loader.load_dense("/no/such/dense", &device),
            Err(EngineError::MissingPath(_))
        ));
        assert!(matches!(
            loader.load_native("/no/such/model.gguf", &device),
            Err(EngineError::MissingPath(_))
        ));
    }
}
