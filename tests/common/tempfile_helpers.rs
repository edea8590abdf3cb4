//! Helper functions for tempfile/tempdir usage in tests

use anyhow::Context;
use std::io::Write;
use std::path::PathBuf;

/// Create a temp directory with a helpful error message.
pub fn create_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::tempdir().context("Failed to create temporary directory for test")
}

/// Write `contents` to `name` inside `dir` and return the path.
pub fn write_temp_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> anyhow::Result<PathBuf> {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

#[allow(dead_code)]
pub use tempfile::TempDir;
