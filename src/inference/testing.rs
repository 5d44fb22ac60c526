//! Stub engines and loaders for unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Settings;
use crate::inference::adapter::{AdapterStatus, Attachment};
use crate::inference::device::DeviceProfile;
use crate::inference::engine::{
    Completion, CompletionChoice, CompletionRequest, DenseEngine, DenseGenerateOptions,
    EngineError, EngineLoader, FinishReason, NativeEngine, PipelineOutput,
};
use crate::inference::{BackendRegistry, Generator};

pub(crate) const STUB_EOS: u32 = 2;

/// How the stub dense engine shapes its output
#[derive(Debug, Clone)]
pub(crate) enum DenseReply {
    /// Prompt followed by the text, like a real pipeline
    Echo(String),
    /// The text alone, as if the engine reformatted the prompt
    Raw(String),
    Fail(String),
}

pub(crate) struct StubDense {
    reply: DenseReply,
    calls: Mutex<Vec<(String, DenseGenerateOptions)>>,
}

impl StubDense {
    pub(crate) fn new(reply: DenseReply) -> Self {
        Self {
            reply,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<(String, DenseGenerateOptions)> {
        self.calls.lock().unwrap().clone()
    }
}

impl DenseEngine for StubDense {
    fn eos_token_id(&self) -> Option<u32> {
        Some(STUB_EOS)
    }

    fn generate(
        &self,
        prompt: &str,
        options: &DenseGenerateOptions,
    ) -> Result<Vec<PipelineOutput>, EngineError> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), options.clone()));
        let generated_text = match &self.reply {
            DenseReply::Echo(text) => format!("{prompt}{text}"),
            DenseReply::Raw(text) => text.clone(),
            DenseReply::Fail(reason) => return Err(EngineError::Inference(reason.clone())),
        };
        Ok(vec![PipelineOutput { generated_text }])
    }
}

pub(crate) struct StubNative {
    choices: Vec<String>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl StubNative {
    pub(crate) fn new(choices: &[&str]) -> Self {
        Self {
            choices: choices.iter().map(|c| c.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().unwrap().clone()
    }
}

impl NativeEngine for StubNative {
    fn create_completion(&self, request: CompletionRequest) -> Result<Completion, EngineError> {
        self.calls.lock().unwrap().push(request);
        Ok(Completion {
            choices: self
                .choices
                .iter()
                .map(|text| CompletionChoice {
                    text: text.clone(),
                    finish_reason: FinishReason::Stop,
                })
                .collect(),
        })
    }
}

/// Counts constructions and hands out shared stub engines.
///
/// Model references starting with `missing` fail as a missing path, those
/// starting with `broken` fail to load.
pub(crate) struct StubLoader {
    pub(crate) dense: Arc<StubDense>,
    pub(crate) native: Arc<StubNative>,
    pub(crate) dense_loads: AtomicUsize,
    pub(crate) native_loads: AtomicUsize,
    adapter: AdapterStatus,
    delay: Duration,
    loaded_refs: Mutex<Vec<String>>,
}

impl StubLoader {
    pub(crate) fn new() -> Self {
        Self::with_engines(
            StubDense::new(DenseReply::Echo(" stub reply".to_string())),
            StubNative::new(&["stub reply"]),
        )
    }

    pub(crate) fn with_engines(dense: StubDense, native: StubNative) -> Self {
        Self {
            dense: Arc::new(dense),
            native: Arc::new(native),
            dense_loads: AtomicUsize::new(0),
            native_loads: AtomicUsize::new(0),
            adapter: AdapterStatus::Unadapted,
            delay: Duration::ZERO,
            loaded_refs: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_adapter(mut self, adapter: AdapterStatus) -> Self {
        self.adapter = adapter;
        self
    }

    pub(crate) fn loaded_refs(&self) -> Vec<String> {
        self.loaded_refs.lock().unwrap().clone()
    }

    pub(crate) fn total_loads(&self) -> usize {
        self.dense_loads.load(Ordering::SeqCst) + self.native_loads.load(Ordering::SeqCst)
    }

    fn attempt(&self, counter: &AtomicUsize, model_ref: &str) -> Result<(), EngineError> {
        std::thread::sleep(self.delay);
        counter.fetch_add(1, Ordering::SeqCst);
        self.loaded_refs.lock().unwrap().push(model_ref.to_string());
        if model_ref.starts_with("missing") {
            Err(EngineError::MissingPath(model_ref.into()))
        } else if model_ref.starts_with("broken") {
            Err(EngineError::ModelLoad(format!("cannot read {model_ref}")))
        } else {
            Ok(())
        }
    }
}

impl EngineLoader for StubLoader {
    fn load_dense(
        &self,
        model_ref: &str,
        _device: &DeviceProfile,
    ) -> Result<Attachment<Arc<dyn DenseEngine>>, EngineError> {
        self.attempt(&self.dense_loads, model_ref)?;
        let engine: Arc<dyn DenseEngine> = self.dense.clone();
        Ok(match self.adapter {
            AdapterStatus::Attached => Attachment::Attached(engine),
            AdapterStatus::BaseOnly => Attachment::BaseOnly(engine),
            AdapterStatus::Unadapted | AdapterStatus::NotApplicable => {
                Attachment::Unadapted(engine)
            }
        })
    }

    fn load_native(
        &self,
        model_ref: &str,
        _device: &DeviceProfile,
    ) -> Result<Arc<dyn NativeEngine>, EngineError> {
        self.attempt(&self.native_loads, model_ref)?;
        Ok(self.native.clone())
    }
}

/// A generator over a registry that builds engines with `loader`
pub(crate) fn stub_generator(loader: Arc<StubLoader>, settings: Settings) -> Generator {
    let settings = Arc::new(settings);
    let registry = Arc::new(BackendRegistry::with_loader(&settings, loader));
    Generator::new(registry, settings)
}
