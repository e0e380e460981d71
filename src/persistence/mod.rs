//! Persistence layer modules.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::{AppError, Result};

pub mod session_store;

/// Replace `target` with `body` through a sibling temp file and a rename, so
/// readers see either the old or the new content, never a mix.
///
/// # Errors
///
/// Returns `AppError::Store` if the temp file cannot be written or renamed.
pub fn write_atomic(target: &Path, body: &[u8]) -> Result<()> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|err| AppError::Store(format!("cannot create temp file in {}: {err}", dir.display())))?;
    tmp.write_all(body)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| AppError::Store(format!("cannot write {}: {err}", target.display())))?;
    tmp.persist(target).map_err(|err| {
        AppError::Store(format!("cannot persist {}: {}", target.display(), err.error))
    })?;
    Ok(())
}
