//! Shared utility functions.

use std::path::Path;

use tokio::task::spawn_blocking;

use crate::{Error, Result};

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Write `contents` to `path` through a temp file and rename, keeping the
/// previous version as `<ext>.bak`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        let backup = path.with_extension(backup_extension(path, "bak"));
        std::fs::copy(path, backup)?;
    }
    let temp = path.with_extension(backup_extension(path, "tmp"));
    std::fs::write(&temp, contents)?;
    std::fs::rename(&temp, path)?;
    Ok(())
}

fn backup_extension(path: &Path, suffix: &str) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}", ext, suffix),
        None => suffix.to_string(),
    }
}

/// Reduce an arbitrary identifier to characters safe for branch and
/// directory names.
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}
