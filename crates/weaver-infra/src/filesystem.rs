//! Data-directory layout for Weaver.
//!
//! Everything the CLI persists lives under one directory: `config.toml` and
//! the `weaver.db` SQLite file.

use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "WEAVER_DATA_DIR";

/// Resolve the Weaver data directory.
///
/// Priority:
/// 1. `WEAVER_DATA_DIR` environment variable
/// 2. `~/.weaver`
/// 3. `./.weaver` when no home directory is known
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".weaver");
    }

    PathBuf::from(".weaver")
}

/// Create the data directory (and parents) if it does not exist yet.
pub async fn ensure_data_dir(data_dir: &Path) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(data_dir).await?;
    tracing::debug!(path = %data_dir.display(), "data directory ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_ensure_data_dir_creates_nested() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_data_dir(&nested).await.unwrap();
        assert!(nested.is_dir());

        // Idempotent.
        ensure_data_dir(&nested).await.unwrap();
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This is the only test touching WEAVER_DATA_DIR and it restores it immediately.
        unsafe {
            std::env::set_var(DATA_DIR_ENV, "/tmp/test-weaver");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-weaver"));
        unsafe {
            std::env::remove_var(DATA_DIR_ENV);
        }
    }
}
