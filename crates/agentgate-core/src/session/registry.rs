//! Process-wide session table

use super::Session;
use crate::agent::AgentBackend;
use crate::config::SessionSettings;
use crate::error::{Result, SessionError};
use crate::types::{SessionConfig, SessionId, SessionSummary};
use crate::workspace::{WorkspaceManager, WorkspaceOwner};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryTable {
    by_id: HashMap<SessionId, Arc<Session>>,
    /// Live ids in creation order
    order: Vec<SessionId>,
    /// Ids of deleted sessions; never handed out again
    retired: HashSet<SessionId>,
}

/// Table of live sessions keyed by id.
///
/// The registry is the only owner of session lifetime: sessions enter through
/// [`SessionRegistry::create`] and leave through [`SessionRegistry::delete`]
/// or [`SessionRegistry::shutdown`].
pub struct SessionRegistry {
    table: RwLock<RegistryTable>,
    backend: Arc<dyn AgentBackend>,
    settings: SessionSettings,
    workspaces: Option<Arc<WorkspaceManager>>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn AgentBackend>, settings: SessionSettings) -> Self {
        Self {
            table: RwLock::new(RegistryTable::default()),
            backend,
            settings,
            workspaces: None,
        }
    }

    /// Give sessions created without a working directory a scratch workspace
    pub fn with_workspaces(mut self, workspaces: Arc<WorkspaceManager>) -> Self {
        self.workspaces = Some(workspaces);
        self
    }

    pub fn backend(&self) -> &Arc<dyn AgentBackend> {
        &self.backend
    }

    /// Validate `config` and register a new session under a fresh id
    pub async fn create(&self, config: SessionConfig) -> Result<SessionId> {
        self.create_owned(config, WorkspaceOwner::Session).await
    }

    /// Like [`create`](Self::create), recording who the scratch workspace is for
    pub async fn create_owned(&self, mut config: SessionConfig, owner: WorkspaceOwner) -> Result<SessionId> {
        // Reject bad configuration before touching the filesystem
        Session::validate_config(&config, &self.settings)?;

        let id = self.fresh_id();

        if config.cwd.is_none() {
            if let Some(workspaces) = &self.workspaces {
                let path = workspaces.create_workspace(id.as_str(), owner).await?;
                config.cwd = Some(path);
            }
        }

        let session = match Session::new(id.clone(), config, Arc::clone(&self.backend), self.settings) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                self.release_workspace(&id).await;
                return Err(e);
            }
        };

        {
            let mut table = self.table.write();
            table.by_id.insert(id.clone(), session);
            table.order.push(id.clone());
        }
        info!("Created session {}", id);
        Ok(id)
    }

    fn fresh_id(&self) -> SessionId {
        loop {
            let id = SessionId::generate();
            let table = self.table.read();
            if !table.by_id.contains_key(&id) && !table.retired.contains(&id) {
                return id;
            }
        }
    }

    pub fn get(&self, id: &SessionId) -> Result<Arc<Session>> {
        self.table
            .read()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.clone()).into())
    }

    /// Live session ids in creation order
    pub fn list(&self) -> Vec<SessionId> {
        self.table.read().order.clone()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let table = self.table.read();
        table
            .order
            .iter()
            .filter_map(|id| table.by_id.get(id))
            .map(|session| session.summary())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.table.read().by_id.len()
    }

    /// Remove a session from the table, close it and release its workspace
    pub async fn delete(&self, id: &SessionId) -> Result<()> {
        let session = {
            let mut table = self.table.write();
            let session = table
                .by_id
                .remove(id)
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;
            table.order.retain(|existing| existing != id);
            table.retired.insert(id.clone());
            session
        };

        session.close().await;
        match session.running_turn() {
            Some(finished) => self.release_workspace_after(id, finished),
            None => self.release_workspace(id).await,
        }
        info!("Deleted session {}", id);
        Ok(())
    }

    async fn release_workspace(&self, id: &SessionId) {
        if let Some(workspaces) = &self.workspaces {
            clean_workspace(workspaces, id).await;
        }
    }

    /// The agent may still be writing into the workspace; remove it once the
    /// turn driver has stopped.
    fn release_workspace_after(&self, id: &SessionId, mut finished: watch::Receiver<bool>) {
        let Some(workspaces) = self.workspaces.clone() else {
            return;
        };
        let id = id.clone();
        debug!("Deferring workspace cleanup for session {} until its turn ends", id);
        tokio::spawn(async move {
            // A dropped sender means the driver already finished.
            let _ = finished.wait_for(|done| *done).await;
            clean_workspace(&workspaces, &id).await;
        });
    }

    /// Close and remove every session. Returns how many were drained.
    pub async fn shutdown(&self) -> usize {
        let ids = self.list();
        debug!("Draining {} sessions", ids.len());
        let deletes = ids.iter().map(|id| self.delete(id));
        let drained = futures::future::join_all(deletes)
            .await
            .into_iter()
            .filter(|r| r.is_ok())
            .count();
        info!("Session registry drained ({} sessions)", drained);
        drained
    }
}

async fn clean_workspace(workspaces: &WorkspaceManager, id: &SessionId) {
    if let Err(e) = workspaces.cleanup_workspace(id.as_str()).await {
        warn!("Failed to clean workspace for session {}: {}", id, e);
    }
}
