//! Installation and session identifiers

use crate::{Result, SkiffError};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Sentinel file, at the top of the log root, holding the installation id
pub const INSTALLATION_ID_FILE: &str = ".logid";

/// Read the installation id stored under `root`, creating it on first use.
///
/// Two processes starting for the first time at the same moment may both
/// generate an id; the last writer wins. No lock is taken.
pub fn get_or_create_installation_id(root: &Path) -> Result<String> {
    fs::create_dir_all(root)?;
    let sentinel = root.join(INSTALLATION_ID_FILE);

    if sentinel.exists() {
        let existing = fs::read_to_string(&sentinel)?;
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    let id = Uuid::new_v4().simple().to_string();
    fs::write(&sentinel, &id).map_err(|e| SkiffError::Identity {
        message: format!("Failed to persist {}: {}", sentinel.display(), e),
    })?;

    tracing::debug!(
        telemetry.event = "installation_id_created",
        sentinel = %sentinel.display(),
        "Created installation id"
    );

    Ok(id)
}

/// A fresh identifier for this process
pub fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_installation_id_is_created_once() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("logs");

        let first = get_or_create_installation_id(&root).unwrap();
        let second = get_or_create_installation_id(&root).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        assert!(root.join(INSTALLATION_ID_FILE).exists());
    }

    #[test]
    fn test_existing_sentinel_is_reused() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(INSTALLATION_ID_FILE), "abc123\n").unwrap();

        let id = get_or_create_installation_id(temp_dir.path()).unwrap();
        assert_eq!(id, "abc123");
    }

    #[test]
    fn test_empty_sentinel_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(INSTALLATION_ID_FILE), "  ").unwrap();

        let id = get_or_create_installation_id(temp_dir.path()).unwrap();
        assert!(!id.trim().is_empty());
        let stored = fs::read_to_string(temp_dir.path().join(INSTALLATION_ID_FILE)).unwrap();
        assert_eq!(stored, id);
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(new_session_id(), new_session_id());
    }
}
