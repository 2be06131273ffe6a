//! Data directory layout for Tradeflow.
//!
//! Everything the CLI persists lives under one directory: the SQLite
//! database, `config.toml`, and the `workflows/` folder of definition files.

use std::path::{Path, PathBuf};

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `TRADEFLOW_DATA_DIR` environment variable
/// 2. `~/.tradeflow`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TRADEFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".tradeflow");
    }

    // Last resort: current directory
    PathBuf::from(".tradeflow")
}

/// Directory scanned for YAML workflow definitions: `{data_dir}/workflows/`.
pub fn workflows_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("workflows")
}

/// Create the data directory and its `workflows/` subfolder if missing.
pub async fn ensure_data_dir(data_dir: &Path) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(workflows_dir(data_dir)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_ensure_data_dir_creates_layout() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("nested").join("tradeflow");

        ensure_data_dir(&data_dir).await.unwrap();
        assert!(tokio::fs::try_exists(workflows_dir(&data_dir)).await.unwrap());

        // Idempotent.
        ensure_data_dir(&data_dir).await.unwrap();
    }

    #[test]
    fn test_workflows_dir_path() {
        assert_eq!(
            workflows_dir(Path::new("/home/user/.tradeflow")),
            PathBuf::from("/home/user/.tradeflow/workflows")
        );
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var("TRADEFLOW_DATA_DIR", "/tmp/test-tradeflow");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-tradeflow"));
        unsafe {
            std::env::remove_var("TRADEFLOW_DATA_DIR");
        }
    }
}
