//! GGUF artifacts
//!
//! Header validation and model-reference resolution for the native engine.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::inference::engine::EngineError;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Smallest valid header: magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: u64 = 24;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Fields read from a GGUF file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

fn read_u32(file: &mut File) -> Result<u32, GgufError> {
    let mut bytes = [0u8; 4];
    file.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(file: &mut File) -> Result<u64, GgufError> {
    let mut bytes = [0u8; 8];
    file.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Reads and checks the GGUF header. Versions 2 and 3 are accepted.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, GgufError> {
    let mut file = File::open(path)?;

    if file.seek(SeekFrom::End(0))? < HEADER_LEN {
        return Err(GgufError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    let magic = read_u32(&mut file)?;
    if magic != GGUF_MAGIC {
        return Err(GgufError::InvalidMagic(magic));
    }

    let version = read_u32(&mut file)?;
    if !(2..=3).contains(&version) {
        return Err(GgufError::UnsupportedVersion(version));
    }

    Ok(GgufHeader {
        version,
        tensor_count: read_u64(&mut file)?,
        metadata_kv_count: read_u64(&mut file)?,
    })
}

fn has_gguf_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

/// Resolves a native model reference to a single GGUF file.
///
/// A file reference is used as-is. A directory reference picks the first
/// `.gguf` file by name. The chosen file must carry a valid header.
pub fn resolve_model_file(model_ref: &str) -> Result<PathBuf, EngineError> {
    let path = PathBuf::from(model_ref);
    if !path.exists() {
        return Err(EngineError::MissingPath(path));
    }

    let file = if path.is_dir() {
        let mut candidates: Vec<PathBuf> = fs::read_dir(&path)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && has_gguf_extension(p))
            .collect();
        candidates.sort();
        candidates.into_iter().next().ok_or_else(|| {
            EngineError::ModelValidation(format!("No .gguf file in {}", path.display()))
        })?
    } else {
        path
    };

    let header = validate_gguf(&file)?;
    tracing::debug!(
        "GGUF v{} with {} tensors at {}",
        header.version,
        header.tensor_count,
        file.display()
    );
    Ok(file)
}

#[cfg(test)]
pub(crate) fn write_test_gguf(path: &Path) {
    use std::io::Write;

    let mut file = File::create(path).unwrap();
    file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
    file.write_all(&3u32.to_le_bytes()).unwrap();
    file.write_all(&10u64.to_le_bytes()).unwrap();
    file.write_all(&5u64.to_le_bytes()).unwrap();
    file.flush().unwrap();
}
