//! Backend registry
//!
//! Holds at most one engine per [`BackendKind`]. Engines are built on first
//! use (or eagerly through [`BackendRegistry::initialize_default`]) and then
//! live as long as the registry.
//!
//! The model reference of the first successful load wins: later requests for
//! the same kind get the existing engine even if they name another model.

use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn, Instrument};

use crate::config::Settings;
use crate::inference::adapter::AdapterStatus;
use crate::inference::backend::BackendKind;
use crate::inference::device::{select_device, DeviceProfile};
use crate::inference::engine::{DenseEngine, EngineLoader, NativeEngine};
use crate::inference::loader::NativeLoader;
use crate::inference::GenerationError;

/// A ready-to-use engine
#[derive(Clone)]
pub enum BackendHandle {
    Dense(Arc<dyn DenseEngine>),
    Native(Arc<dyn NativeEngine>),
}

impl BackendHandle {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendHandle::Dense(_) => BackendKind::LocalDense,
            BackendHandle::Native(_) => BackendKind::QuantizedNative,
        }
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BackendHandle").field(&self.kind()).finish()
    }
}

/// A loaded engine as reported by [`BackendRegistry::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub kind: BackendKind,
    pub model_ref: String,
    pub adapter: AdapterStatus,
}

struct Loaded {
    handle: BackendHandle,
    model_ref: String,
    adapter: AdapterStatus,
}

type Slot = Arc<Mutex<Option<Loaded>>>;

/// One engine construction, run to completion even if its requester goes away
struct Build {
    kind: BackendKind,
    model_ref: String,
    device: DeviceProfile,
    loader: Arc<dyn EngineLoader>,
}

impl Build {
    async fn fill(
        self,
        mut slot: OwnedMutexGuard<Option<Loaded>>,
    ) -> Result<BackendHandle, GenerationError> {
        let Build {
            kind,
            model_ref,
            device,
            loader,
        } = self;

        info!("Initializing {kind} backend from {model_ref}");
        let started = Instant::now();
        let load_ref = model_ref.clone();

        let result = tokio::task::spawn_blocking(move || match kind {
            BackendKind::LocalDense => loader.load_dense(&load_ref, &device).map(|attachment| {
                let status = attachment.status();
                (BackendHandle::Dense(attachment.into_inner()), status)
            }),
            BackendKind::QuantizedNative => loader
                .load_native(&load_ref, &device)
                .map(|engine| (BackendHandle::Native(engine), AdapterStatus::NotApplicable)),
        })
        .await?;

        let (handle, adapter) = match result {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Failed to initialize {kind} backend from {model_ref}: {e}");
                return Err(GenerationError::from_load(kind, e));
            }
        };

        info!(
            "{kind} backend ready in {:.2}s (adapter: {adapter:?})",
            started.elapsed().as_secs_f64()
        );

        *slot = Some(Loaded {
            handle: handle.clone(),
            model_ref,
            adapter,
        });
        Ok(handle)
    }
}

pub struct BackendRegistry {
    loader: Arc<dyn EngineLoader>,
    default_backend: BackendKind,
    default_model: String,
    device_request: String,
    device: OnceCell<DeviceProfile>,
    dense: Slot,
    native: Slot,
}

impl BackendRegistry {
    /// Creates a registry that builds real engines
    pub fn new(settings: &Settings) -> Self {
        Self::with_loader(settings, Arc::new(NativeLoader::from_settings(settings)))
    }

    pub fn with_loader(settings: &Settings, loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            loader,
            default_backend: settings.backend,
            default_model: settings.model_path.to_string_lossy().into_owned(),
            device_request: settings.device.clone(),
            device: OnceCell::new(),
            dense: Arc::new(Mutex::new(None)),
            native: Arc::new(Mutex::new(None)),
        }
    }

    pub fn default_backend(&self) -> BackendKind {
        self.default_backend
    }

    /// The compute device, resolved on first use and then fixed
    pub fn device(&self) -> &DeviceProfile {
        self.device
            .get_or_init(|| select_device(&self.device_request))
    }

    fn slot(&self, kind: BackendKind) -> &Slot {
        match kind {
            BackendKind::LocalDense => &self.dense,
            BackendKind::QuantizedNative => &self.native,
        }
    }

    /// Returns the engine for `kind`, constructing it on first use.
    ///
    /// The slot stays locked while the engine is built, so concurrent first
    /// callers wait for one construction instead of racing. The lock and the
    /// build belong to a spawned task, so a caller that stops waiting does not
    /// release the slot early. A failed construction leaves the slot empty for
    /// a later retry.
    pub async fn ensure_ready(
        &self,
        kind: BackendKind,
        model_ref: Option<&str>,
    ) -> Result<BackendHandle, GenerationError> {
        let slot = Arc::clone(self.slot(kind)).lock_owned().await;

        if let Some(loaded) = slot.as_ref() {
            if let Some(requested) = model_ref {
                if requested != loaded.model_ref {
                    debug!(
                        "{kind} already loaded from {}; ignoring requested model {requested}",
                        loaded.model_ref
                    );
                }
            }
            return Ok(loaded.handle.clone());
        }

        let build = Build {
            kind,
            model_ref: model_ref.unwrap_or(&self.default_model).to_string(),
            device: self.device().clone(),
            loader: Arc::clone(&self.loader),
        };
        tokio::spawn(build.fill(slot).in_current_span()).await?
    }

    /// Loads the default backend with the default model
    pub async fn initialize_default(&self) -> Result<BackendHandle, GenerationError> {
        self.ensure_ready(self.default_backend, None).await
    }

    pub async fn is_loaded(&self, kind: BackendKind) -> bool {
        self.slot(kind).lock().await.is_some()
    }

    /// Lists the engines loaded so far
    pub async fn status(&self) -> Vec<BackendStatus> {
        let mut statuses = Vec::new();
        for kind in BackendKind::ALL {
            if let Some(loaded) = self.slot(kind).lock().await.as_ref() {
                statuses.push(BackendStatus {
                    kind,
                    model_ref: loaded.model_ref.clone(),
                    adapter: loaded.adapter,
                });
            }
        }
        statuses
    }
}
