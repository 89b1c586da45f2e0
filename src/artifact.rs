//! Atomic artifact persistence.
//!
//! Every durable pipeline artifact (split lists, feature tables, manifests,
//! result documents) is written to a temporary file in the destination
//! directory and atomically renamed into place. Readers never observe a
//! partially written artifact, which is what makes stage re-entry safe.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{PrepError, PrepResult};

/// Atomically replace `path` with `contents`.
pub fn write_atomic(path: &Path, contents: &str) -> PrepResult<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| PrepError::Io(e.error))?;
    Ok(())
}

/// Read an artifact that must exist, mapping NotFound to a typed error.
pub fn read_to_string(path: &Path) -> PrepResult<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(PrepError::MissingArtifact(path.to_path_buf()))
        }
        Err(e) => Err(PrepError::Io(e)),
    }
}
