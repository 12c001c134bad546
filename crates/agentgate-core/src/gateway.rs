//! Gateway facade
//!
//! Composes configuration, workspaces and the session registry behind the
//! normalized operations a routing layer calls: one-shot queries, persistent
//! sessions, interrupts, introspection and shutdown.

use crate::agent::{AgentBackend, ProcessBackend};
use crate::config::GatewayConfig;
use crate::dispatch::{dispatch, Dispatcher, WireFrame};
use crate::error::Result;
use crate::session::{SessionRegistry, TurnStream};
use crate::skills::{list_skills, SkillsList};
use crate::types::{
    ChatRequest, CreateSessionRequest, HealthStatus, QueryRequest, SessionId, SessionList,
    SessionResponse, SessionStatus, TurnResult,
};
use crate::workspace::{WorkspaceManager, WorkspaceOwner};
use futures::{Stream, StreamExt};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, info, warn};

pub const SERVICE_NAME: &str = "agentgate";

/// Entry point for the routing layer
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<SessionRegistry>,
    workspaces: Arc<WorkspaceManager>,
}

impl Gateway {
    /// Build a gateway over any backend. Call [`Gateway::initialize`] before serving.
    pub fn new(config: GatewayConfig, backend: Arc<dyn AgentBackend>) -> Self {
        let workspaces = Arc::new(WorkspaceManager::from_config(&config));
        let registry = SessionRegistry::new(backend, config.session_settings())
            .with_workspaces(Arc::clone(&workspaces));
        Self {
            config,
            registry: Arc::new(registry),
            workspaces,
        }
    }

    /// Gateway driving the agent CLI named in `config`, initialized and ready
    pub async fn start(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(ProcessBackend::from_config(&config));
        let gateway = Self::new(config, backend);
        gateway.initialize().await?;
        Ok(gateway)
    }

    /// Prepare the workspace root and sweep orphans from earlier runs
    pub async fn initialize(&self) -> Result<()> {
        let removed = self.workspaces.initialize().await?;
        if removed > 0 {
            info!("Removed {} orphaned workspaces", removed);
        }
        Ok(())
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // One-shot queries
    // ------------------------------------------------------------------

    /// Ephemeral session, one turn, torn down afterwards.
    ///
    /// The session is deleted even if this future is dropped mid-turn.
    pub async fn query(&self, request: QueryRequest) -> Result<TurnResult> {
        let id = self
            .registry
            .create_owned(request.to_config(None), WorkspaceOwner::Query)
            .await?;
        let ephemeral = EphemeralSession::new(Arc::clone(&self.registry), id.clone());
        debug!("Query running in ephemeral session {}", id);

        let outcome = match self.registry.get(&id) {
            Ok(session) => session.run_turn_collect(request.prompt).await,
            Err(e) => Err(e),
        };
        ephemeral.delete().await;
        outcome
    }

    /// Streaming one-shot query; the ephemeral session is deleted once the
    /// stream finishes or is dropped
    pub async fn query_stream(&self, request: QueryRequest) -> Result<QueryStream> {
        let id = self
            .registry
            .create_owned(request.to_config(None), WorkspaceOwner::Query)
            .await?;
        let ephemeral = EphemeralSession::new(Arc::clone(&self.registry), id.clone());

        let turn = match self.registry.get(&id).and_then(|s| s.run_turn(request.prompt)) {
            Ok(turn) => turn,
            Err(e) => {
                ephemeral.delete().await;
                return Err(e);
            }
        };
        Ok(QueryStream {
            inner: dispatch(turn),
            ephemeral,
        })
    }

    // ------------------------------------------------------------------
    // Persistent sessions
    // ------------------------------------------------------------------

    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<SessionResponse> {
        let id = self.registry.create(request.to_config()).await?;
        Ok(SessionResponse::new(id, SessionStatus::Created))
    }

    pub async fn chat(&self, id: &SessionId, request: ChatRequest) -> Result<TurnResult> {
        self.registry.get(id)?.run_turn_collect(request.message).await
    }

    pub fn chat_stream(&self, id: &SessionId, request: ChatRequest) -> Result<Dispatcher<TurnStream>> {
        let turn = self.registry.get(id)?.run_turn(request.message)?;
        Ok(dispatch(turn))
    }

    pub async fn interrupt(&self, id: &SessionId) -> Result<SessionResponse> {
        self.registry.get(id)?.interrupt().await?;
        Ok(SessionResponse::new(id.clone(), SessionStatus::Interrupted))
    }

    pub async fn delete_session(&self, id: &SessionId) -> Result<SessionResponse> {
        self.registry.delete(id).await?;
        Ok(SessionResponse::new(id.clone(), SessionStatus::Deleted))
    }

    pub fn list_sessions(&self) -> SessionList {
        SessionList::new(self.registry.list())
    }

    // ------------------------------------------------------------------
    // Introspection and lifecycle
    // ------------------------------------------------------------------

    /// Skills from the user's home and, if given, the project at `cwd`
    pub async fn list_skills(&self, cwd: Option<&Path>) -> Result<SkillsList> {
        let home = dirs::home_dir();
        list_skills(home.as_deref(), cwd).await
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "healthy".to_string(),
            service: SERVICE_NAME.to_string(),
            sessions: self.registry.count(),
        }
    }

    /// Drain every session, then remove all scratch workspaces
    pub async fn shutdown(&self) {
        info!("Shutting down gateway");
        self.registry.shutdown().await;
        self.workspaces.cleanup_all().await;
    }
}

/// Deletes a one-shot query's session when dropped, unless already deleted
struct EphemeralSession {
    registry: Arc<SessionRegistry>,
    id: Option<SessionId>,
}

impl EphemeralSession {
    fn new(registry: Arc<SessionRegistry>, id: SessionId) -> Self {
        Self {
            registry,
            id: Some(id),
        }
    }

    /// Delete now and wait for it. The deletion runs as its own task so a
    /// caller dropped mid-wait cannot cut it short.
    async fn delete(mut self) {
        if let Some(task) = self.spawn_delete() {
            if let Err(e) = task.await {
                warn!("Ephemeral session cleanup task failed: {}", e);
            }
        }
    }

    fn spawn_delete(&mut self) -> Option<tokio::task::JoinHandle<()>> {
        let id = self.id.take()?;
        let registry = Arc::clone(&self.registry);
        let cleanup = async move {
            if let Err(e) = registry.delete(&id).await {
                warn!("Failed to delete ephemeral session {}: {}", id, e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(cleanup)),
            Err(_) => {
                warn!("No runtime to delete an ephemeral session");
                None
            }
        }
    }
}

impl Drop for EphemeralSession {
    fn drop(&mut self) {
        let _ = self.spawn_delete();
    }
}

/// Wire frames of a one-shot query. Owns its ephemeral session.
pub struct QueryStream {
    inner: Dispatcher<TurnStream>,
    ephemeral: EphemeralSession,
}

impl QueryStream {
    pub fn session_id(&self) -> &SessionId {
        self.inner.session_id()
    }
}

impl Stream for QueryStream {
    type Item = WireFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);
        if let Poll::Ready(Some(WireFrame::Done)) | Poll::Ready(None) = &polled {
            let _ = self.ephemeral.spawn_delete();
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ScriptedBackend, ScriptedTurn};
    use crate::error::{Error, SessionError};
    use crate::types::{OutputFormat, TurnOutcome, WireEvent};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn gateway(backend: &ScriptedBackend) -> (Gateway, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = GatewayConfig {
            workspace_root: dir.path().join("workspaces"),
            interrupt_grace_ms: 500,
            close_grace_ms: 500,
            ..GatewayConfig::default()
        };
        (Gateway::new(config, Arc::new(backend.clone())), dir)
    }

    async fn wait_until_empty(gateway: &Gateway) {
        for _ in 0..200 {
            if gateway.registry().count() == 0 && gateway.workspaces.tracked_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_query_without_schema() {
        let backend = ScriptedBackend::new().with_turn(ScriptedTurn::reply("4"));
        let (gateway, _dir) = gateway(&backend);
        gateway.initialize().await.unwrap();

        let result = gateway.query(QueryRequest::new("2+2?")).await.unwrap();
        assert_eq!(result.outcome, TurnOutcome::Success);
        assert_eq!(result.result, "4");
        assert_eq!(result.structured_output, None);

        // Ephemeral session and its workspace are gone
        assert_eq!(gateway.registry().count(), 0);
        assert_eq!(gateway.workspaces.tracked_count(), 0);
        let started = backend.started_configs();
        assert!(started[0].cwd.as_ref().unwrap().starts_with(gateway.workspaces.base_dir()));
    }

    #[tokio::test]
    async fn test_query_with_schema_retries_once() {
        let backend = ScriptedBackend::new()
            .with_turn(ScriptedTurn::reply("{}"))
            .with_turn(ScriptedTurn::reply(r#"{"company_name": "Anthropic"}"#));
        let (gateway, _dir) = gateway(&backend);

        let mut request = QueryRequest::new("Who makes Claude?");
        request.output_format = Some(OutputFormat::json_schema(json!({
            "type": "object",
            "properties": {"company_name": {"type": "string"}},
            "required": ["company_name"]
        })));

        let result = gateway.query(request).await.unwrap();
        assert_eq!(result.outcome, TurnOutcome::Success);
        assert_eq!(
            result.structured_output.unwrap()["company_name"],
            json!("Anthropic")
        );
        assert_eq!(backend.sent_messages().len(), 2);
    }

    #[tokio::test]
    async fn test_query_stream_frames_and_cleanup() {
        let backend = ScriptedBackend::new().with_turn(
            ScriptedTurn::new()
                .text("Hello")
                .tool_use("tu_1", "mcp__tools__get_server_time", json!({}))
                .tool_result("tu_1", "12:00")
                .success("Hello"),
        );
        let (gateway, _dir) = gateway(&backend);

        let frames: Vec<WireFrame> = gateway
            .query_stream(QueryRequest::new("time?"))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(frames.len(), 5);
        assert!(matches!(frames[3], WireFrame::Event(WireEvent::Result(_))));
        assert_eq!(frames[4], WireFrame::Done);

        wait_until_empty(&gateway).await;
        assert_eq!(gateway.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_query_stream_deletes_session() {
        let backend = ScriptedBackend::new().with_turn(ScriptedTurn::new().text("a").hang());
        let (gateway, _dir) = gateway(&backend);

        let mut stream = gateway.query_stream(QueryRequest::new("hang")).await.unwrap();
        assert!(stream.next().await.is_some());
        assert_eq!(gateway.registry().count(), 1);
        drop(stream);

        wait_until_empty(&gateway).await;
        assert_eq!(gateway.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_query_deletes_session() {
        let backend = ScriptedBackend::new().with_turn(ScriptedTurn::new().text("a").hang());
        let (gateway, _dir) = gateway(&backend);
        let gateway = Arc::new(gateway);

        let task = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.query(QueryRequest::new("hang")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gateway.registry().count(), 1);
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        wait_until_empty(&gateway).await;
        assert_eq!(gateway.registry().count(), 0);
        assert_eq!(gateway.workspaces.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let backend = ScriptedBackend::new()
            .with_turn(ScriptedTurn::reply("first"))
            .with_turn(ScriptedTurn::reply("second"));
        let (gateway, _dir) = gateway(&backend);

        let created = gateway
            .create_session(CreateSessionRequest::default())
            .await
            .unwrap();
        assert_eq!(created.status, SessionStatus::Created);
        let id = created.session_id;
        assert_eq!(gateway.list_sessions().sessions, vec![id.clone()]);
        assert_eq!(gateway.health().sessions, 1);

        let first = gateway
            .chat(&id, ChatRequest { message: "one".into() })
            .await
            .unwrap();
        assert_eq!(first.result, "first");
        let frames: Vec<WireFrame> = gateway
            .chat_stream(&id, ChatRequest { message: "two".into() })
            .unwrap()
            .collect()
            .await;
        assert_eq!(frames.last(), Some(&WireFrame::Done));

        let deleted = gateway.delete_session(&id).await.unwrap();
        assert_eq!(deleted.status, SessionStatus::Deleted);
        assert_eq!(gateway.list_sessions().count, 0);
        assert!(gateway
            .chat(&id, ChatRequest { message: "three".into() })
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_interrupt_through_gateway() {
        let backend = ScriptedBackend::new()
            .with_turn(ScriptedTurn::new().text("thinking").hang())
            .with_turn(ScriptedTurn::reply("after"));
        let (gateway, _dir) = gateway(&backend);
        let id = gateway
            .create_session(CreateSessionRequest::default())
            .await
            .unwrap()
            .session_id;

        let err = gateway.interrupt(&id).await.unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::NoActiveTurn(_))));

        let stream = gateway
            .chat_stream(&id, ChatRequest { message: "long".into() })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let response = gateway.interrupt(&id).await.unwrap();
        assert_eq!(response.status, SessionStatus::Interrupted);

        let frames: Vec<WireFrame> = stream.collect().await;
        match &frames[frames.len() - 2] {
            WireFrame::Event(WireEvent::Result(result)) => {
                assert_eq!(result.outcome, TurnOutcome::Interrupted)
            }
            other => panic!("Expected result frame, got {:?}", other),
        }

        let after = gateway
            .chat(&id, ChatRequest { message: "again".into() })
            .await
            .unwrap();
        assert_eq!(after.result, "after");
    }

    #[tokio::test]
    async fn test_back_to_back_chat_rejected() {
        let backend = ScriptedBackend::new()
            .with_turn(ScriptedTurn::new().delay(Duration::from_millis(100)).success("done"));
        let (gateway, _dir) = gateway(&backend);
        let id = gateway
            .create_session(CreateSessionRequest::default())
            .await
            .unwrap()
            .session_id;

        let first = gateway
            .chat_stream(&id, ChatRequest { message: "a".into() })
            .unwrap();
        let second = gateway.chat_stream(&id, ChatRequest { message: "b".into() });
        assert!(matches!(
            second.err(),
            Some(Error::Session(SessionError::TurnInProgress(_)))
        ));
        let frames: Vec<WireFrame> = first.collect().await;
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_sessions_and_workspaces() {
        let backend = ScriptedBackend::new();
        let (gateway, _dir) = gateway(&backend);
        for _ in 0..2 {
            gateway
                .create_session(CreateSessionRequest::default())
                .await
                .unwrap();
        }
        assert_eq!(gateway.workspaces.tracked_count(), 2);

        gateway.shutdown().await;
        assert_eq!(gateway.health().sessions, 0);
        assert_eq!(gateway.workspaces.tracked_count(), 0);
    }
}
