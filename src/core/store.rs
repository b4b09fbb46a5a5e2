//! JSON documents under the rollout home: target configs, release ledgers
//! and run records. Writes go through a sibling temp file and a rename, so a
//! reader never sees a half-written document.

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

fn io_error(e: std::io::Error, action: &str, path: &Path) -> Error {
    Error::internal_io(e.to_string(), Some(format!("{} {}", action, path.display())))
}

/// Raw document text, `None` when the file does not exist.
pub(crate) fn read_text(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(e, "read", path)),
    }
}

pub(crate) fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let Some(content) = read_text(path)? else {
        return Ok(None);
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| Error::config_invalid_json(path.to_string_lossy(), e))
}

pub(crate) fn write<T: Serialize>(path: &Path, document: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(document).map_err(|e| {
        Error::internal_json(e.to_string(), Some(format!("serialize {}", path.display())))
    })?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::internal_unexpected(format!("no parent for {}", path.display())))?;
    std::fs::create_dir_all(dir).map_err(|e| io_error(e, "create", dir))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".rollout-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| io_error(e, "create temp file in", dir))?;
    tmp.write_all(content.as_bytes())
        .and_then(|_| tmp.write_all(b"\n"))
        .map_err(|e| io_error(e, "write", tmp.path()))?;
    tmp.persist(path).map_err(|e| io_error(e.error, "replace", path))?;
    Ok(())
}

/// Returns whether a document was there to remove.
pub(crate) fn remove(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error(e, "remove", path)),
    }
}

/// File stems of the `*.json` documents in `dir`, sorted. A missing
/// directory holds no documents.
pub(crate) fn ids(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(e, "list", dir)),
    };

    let mut ids: Vec<String> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .filter_map(|path| Some(path.file_stem()?.to_string_lossy().to_string()))
        .collect();
    ids.sort();
    Ok(ids)
}
