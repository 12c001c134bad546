//! Scratch workspaces for one-shot queries and sessions without a cwd

use crate::config::GatewayConfig;
use crate::error::{Error, Result, WorkspaceError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

/// Who asked for a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceOwner {
    Query,
    Session,
}

impl WorkspaceOwner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Session => "session",
        }
    }
}

/// Creates and removes per-identifier directories under one base directory.
///
/// Only directories created through this manager are ever removed by
/// `cleanup_workspace`; startup cleanup additionally removes stale leftovers
/// from previous runs.
pub struct WorkspaceManager {
    base_dir: PathBuf,
    max_age: Duration,
    owners: Mutex<HashMap<String, WorkspaceOwner>>,
}

impl WorkspaceManager {
    pub fn new(base_dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_age,
            owners: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.workspace_root.clone(), config.workspace_max_age())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Ensure the base directory exists and remove orphans older than the
    /// maximum age. Returns the number of orphans removed.
    pub async fn initialize(&self) -> Result<usize> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            Error::Workspace(WorkspaceError::CreateFailed {
                path: self.base_dir.display().to_string(),
                message: e.to_string(),
            })
        })?;
        info!("Workspace root: {:?}", self.base_dir);
        Ok(self.cleanup_orphans().await)
    }

    async fn cleanup_orphans(&self) -> usize {
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot scan workspace root {:?}: {}", self.base_dir, e);
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= self.max_age {
                continue;
            }
            match fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!("Removed orphaned workspace {:?} (age {:?})", path, age);
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove orphaned workspace {:?}: {}", path, e),
            }
        }
        removed
    }

    /// Create (or adopt, if it already exists) the workspace for `identifier`
    pub async fn create_workspace(&self, identifier: &str, owner: WorkspaceOwner) -> Result<PathBuf> {
        let path = self.base_dir.join(identifier);
        match fs::create_dir_all(&self.base_dir).await {
            Ok(()) => {}
            Err(e) => return Err(create_failed(&path, e)),
        }
        match fs::create_dir(&path).await {
            Ok(()) => debug!("Created workspace {:?} for {} {}", path, owner.as_str(), identifier),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!("Workspace already exists: {:?}", path)
            }
            Err(e) => return Err(create_failed(&path, e)),
        }
        self.owners.lock().insert(identifier.to_string(), owner);
        Ok(path)
    }

    /// Remove a tracked workspace. Returns false if `identifier` is not tracked.
    pub async fn cleanup_workspace(&self, identifier: &str) -> Result<bool> {
        let Some(owner) = self.owners.lock().remove(identifier) else {
            return Ok(false);
        };

        let path = self.base_dir.join(identifier);
        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!("Cleaned workspace {:?} ({})", path, owner.as_str());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Workspace {:?} already gone", path);
                Ok(true)
            }
            Err(e) => Err(Error::Workspace(WorkspaceError::CleanupFailed {
                path: path.display().to_string(),
                message: e.to_string(),
            })),
        }
    }

    /// Remove every tracked workspace. Returns the number removed.
    pub async fn cleanup_all(&self) -> usize {
        let identifiers: Vec<String> = self.owners.lock().keys().cloned().collect();
        info!("Cleaning up {} tracked workspaces", identifiers.len());

        let mut removed = 0;
        for identifier in identifiers {
            match self.cleanup_workspace(&identifier).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!("Error cleaning workspace {}: {}", identifier, e),
            }
        }
        removed
    }

    pub fn is_tracked(&self, identifier: &str) -> bool {
        self.owners.lock().contains_key(identifier)
    }

    pub fn tracked_count(&self) -> usize {
        self.owners.lock().len()
    }
}

fn create_failed(path: &Path, e: std::io::Error) -> Error {
    Error::Workspace(WorkspaceError::CreateFailed {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, max_age: Duration) -> WorkspaceManager {
        WorkspaceManager::new(dir.path().join("workspaces"), max_age)
    }

    #[tokio::test]
    async fn test_create_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let workspaces = manager(&dir, Duration::from_secs(3600));
        workspaces.initialize().await.unwrap();

        let path = workspaces
            .create_workspace("abc", WorkspaceOwner::Session)
            .await
            .unwrap();
        assert!(path.is_dir());
        assert!(workspaces.is_tracked("abc"));

        assert!(workspaces.cleanup_workspace("abc").await.unwrap());
        assert!(!path.exists());
        assert!(!workspaces.cleanup_workspace("abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_untracked_directories_are_left_alone() {
        let dir = TempDir::new().unwrap();
        let workspaces = manager(&dir, Duration::from_secs(3600));
        workspaces.initialize().await.unwrap();

        let foreign = workspaces.base_dir().join("foreign");
        std::fs::create_dir(&foreign).unwrap();
        assert!(!workspaces.cleanup_workspace("foreign").await.unwrap());
        assert!(foreign.exists());
    }

    #[tokio::test]
    async fn test_existing_directory_is_adopted() {
        let dir = TempDir::new().unwrap();
        let workspaces = manager(&dir, Duration::from_secs(3600));
        let first = workspaces
            .create_workspace("dup", WorkspaceOwner::Query)
            .await
            .unwrap();
        let second = workspaces
            .create_workspace("dup", WorkspaceOwner::Query)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(workspaces.tracked_count(), 1);
    }

    #[tokio::test]
    async fn test_initialize_removes_stale_workspaces() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("workspaces");
        std::fs::create_dir_all(base.join("old-run")).unwrap();
        std::fs::write(base.join("stray-file"), "x").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let keep = WorkspaceManager::new(&base, Duration::from_secs(3600));
        assert_eq!(keep.initialize().await.unwrap(), 0);
        assert!(base.join("old-run").exists());

        let sweep = WorkspaceManager::new(&base, Duration::ZERO);
        assert_eq!(sweep.initialize().await.unwrap(), 1);
        assert!(!base.join("old-run").exists());
        assert!(base.join("stray-file").exists());
    }

    #[tokio::test]
    async fn test_cleanup_all() {
        let dir = TempDir::new().unwrap();
        let workspaces = manager(&dir, Duration::from_secs(3600));
        for id in ["a", "b", "c"] {
            workspaces
                .create_workspace(id, WorkspaceOwner::Session)
                .await
                .unwrap();
        }
        assert_eq!(workspaces.cleanup_all().await, 3);
        assert_eq!(workspaces.tracked_count(), 0);
    }
}
