//! On-disk JSON documents with atomic replacement.
//!
//! Every persisted document in the system (status document, weight
//! document, blacklist, histories, alert journal) goes through these
//! helpers: writes land in a sibling temp file and are published with
//! a single `rename`, so readers never observe a torn document.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
/// Parent directories are created as needed.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), DocError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read and parse a JSON document.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, DocError> {
    let body = fs::read(path)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Read a JSON document, re-reading once if the first parse fails.
/// Writers publish atomically, so a parse failure means the read raced
/// a rename; the second read sees a complete document.
pub fn read_json_retry<T: DeserializeOwned>(path: &Path) -> Result<T, DocError> {
    match read_json(path) {
        Ok(v) => Ok(v),
        Err(DocError::Parse(_)) => read_json(path),
        Err(e) => Err(e),
    }
}
