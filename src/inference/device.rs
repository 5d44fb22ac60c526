//! Device selection for native inference.

use candle_core::{DType, Device};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cuda,
    Metal,
    Cpu,
}

impl DeviceKind {
    pub fn is_cpu(&self) -> bool {
        matches!(self, DeviceKind::Cpu)
    }
}

#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub device: Device,
    pub kind: DeviceKind,
}

impl DeviceProfile {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            kind: DeviceKind::Cpu,
        }
    }

    /// Weight dtype for dense models on this device.
    pub fn dtype(&self) -> DType {
        match self.kind {
            DeviceKind::Cpu => DType::F32,
            DeviceKind::Cuda | DeviceKind::Metal => DType::F16,
        }
    }

    /// Layers the native engine should offload; nothing is offloaded on CPU.
    pub fn gpu_layers(&self, configured: u32) -> u32 {
        if self.kind.is_cpu() {
            0
        } else {
            configured
        }
    }
}

/// Splits "cuda:1" into ("cuda", 1). A missing or malformed ordinal means 0.
fn parse_device_string(requested: &str) -> (String, usize) {
    let requested = requested.trim().to_ascii_lowercase();
    match requested.split_once(':') {
        Some((name, ordinal)) => (name.to_string(), ordinal.parse().unwrap_or(0)),
        None => (requested, 0),
    }
}

/// Resolves the configured device string to a concrete device.
///
/// An accelerator is used only when it is both requested and available;
/// everything else runs on the CPU.
pub fn select_device(requested: &str) -> DeviceProfile {
    let (name, ordinal) = parse_device_string(requested);

    let profile = match name.as_str() {
        "cuda" | "gpu" => match Device::cuda_if_available(ordinal) {
            Ok(device) if device.is_cuda() => Some(DeviceProfile {
                device,
                kind: DeviceKind::Cuda,
            }),
            Ok(_) => None,
            Err(e) => {
                warn!("CUDA device {ordinal} unavailable: {e}");
                None
            }
        },
        "metal" | "mps" => match Device::metal_if_available(ordinal) {
            Ok(device) if device.is_metal() => Some(DeviceProfile {
                device,
                kind: DeviceKind::Metal,
            }),
            Ok(_) => None,
            Err(e) => {
                warn!("Metal device {ordinal} unavailable: {e}");
                None
            }
        },
        _ => None,
    };

    match profile {
        Some(profile) => {
            info!("Using {:?} device for inference", profile.kind);
            profile
        }
        None => {
            info!("Falling back to CPU for inference (requested {requested:?})");
            DeviceProfile::cpu()
        }
    }
}
