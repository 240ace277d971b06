//! The chat runtime: turns inbound messages into graph runs.
//!
//! A submission claims the session in the registry, loading it from the
//! store when it is not in memory, appends the user turn and spawns the run. When the run ends
//! the state is persisted, the session is released and only then is the
//! terminal event emitted, so a caller that resubmits on `run-completed`
//! never sees `SessionBusy`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use braid_core::config::AppConfig;
use braid_core::error::{BraidError, Result};
use braid_core::event::{event_channel, EventStream, RunEvent};
use braid_core::traits::{LlmClient, SessionStore};
use braid_core::types::{SessionId, SessionRecord, SessionState, Turn};
use braid_tools::ToolRegistry;

use crate::graph::{terminal_event, ExecutorConfig, GraphDefinition, GraphExecutor, RunOutcome, RunReport};
use crate::prebuilt::{chat_graph, title_graph};
use crate::session::SessionRegistry;
use crate::state::{Delta, StateContainer};

/// A run in progress: its event stream and the task driving it.
pub struct RunHandle {
    pub session_id: SessionId,
    pub events: EventStream,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Wait for the run to finish, discarding its events.
    pub async fn wait(self) -> Result<RunReport> {
        let RunHandle { events, join, .. } = self;
        drop(events);
        Ok(join_run(join).await??)
    }

    /// Drain all events up to the terminal one, then return them with the outcome.
    pub async fn collect(mut self) -> Result<(Vec<RunEvent>, RunOutcome)> {
        let events = self.events.collect_until_terminal().await;
        let outcome = join_run(self.join).await?;
        Ok((events, outcome))
    }
}

async fn join_run(join: JoinHandle<RunOutcome>) -> Result<RunOutcome> {
    join.await
        .map_err(|e| BraidError::Internal(format!("run task failed: {}", e)))
}

/// Runs conversations through a chat graph on behalf of many sessions.
pub struct ChatRuntime {
    executor: Arc<GraphExecutor>,
    title: Option<Arc<GraphExecutor>>,
    registry: Arc<SessionRegistry>,
    store: Arc<dyn SessionStore>,
    event_buffer: usize,
}

impl ChatRuntime {
    pub fn new(
        graph: Arc<GraphDefinition>,
        config: ExecutorConfig,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            executor: Arc::new(GraphExecutor::new(graph, config)),
            title: None,
            registry: Arc::new(SessionRegistry::new()),
            store,
            event_buffer: 64,
        }
    }

    /// The chat graph and title graph for a config.
    pub fn from_config(
        config: &AppConfig,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        let chat = chat_graph(config, llm.clone(), tools)?;
        let title = title_graph(&config.model, llm)?;
        Ok(Self::new(Arc::new(chat), ExecutorConfig::from_engine(&config.engine), store)
            .with_title_graph(Arc::new(title))
            .with_event_buffer(config.engine.event_buffer))
    }

    pub fn with_title_graph(mut self, graph: Arc<GraphDefinition>) -> Self {
        let config = self.executor.config().clone();
        self.title = Some(Arc::new(GraphExecutor::new(graph, config)));
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn graph(&self) -> &GraphDefinition {
        self.executor.graph()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Start a run for `message`. Without a session id a new session is created.
    ///
    /// Fails with `SessionBusy` while the session has a run in flight.
    pub async fn submit(&self, session_id: Option<SessionId>, message: &str) -> Result<RunHandle> {
        let message = message.trim();
        if message.is_empty() {
            return Err(BraidError::InvalidRequest("message must not be empty".into()));
        }
        let session_id = session_id.unwrap_or_default();
        let mut guard = match self.registry.try_acquire(&session_id)? {
            Some(guard) => guard,
            None => {
                let state = self.load(&session_id).await?;
                self.registry.acquire_with(&session_id, || state)?
            }
        };
        let user_turn = Delta::against(guard.state()).append_turn(Turn::user(message));
        guard.container_mut().apply_delta(user_turn)?;

        let (events, stream) = event_channel(self.event_buffer);
        let executor = self.executor.clone();
        let store = self.store.clone();
        let sid = session_id.clone();

        let join = tokio::spawn(async move {
            let cancel = guard.cancel_token().clone();
            let outcome = executor.run(&sid, guard.container_mut(), &events, &cancel).await;

            if let Err(e) = persist(&*store, &sid, guard.state()).await {
                error!(session_id = %sid, error = %e, "Failed to persist session state");
            }
            drop(guard);

            events.emit(terminal_event(&outcome)).await;
            outcome
        });

        Ok(RunHandle {
            session_id,
            events: stream,
            join,
        })
    }

    /// Read a session's persisted state and make sure it has a catalog
    /// record. Unknown sessions start empty.
    async fn load(&self, session_id: &SessionId) -> Result<SessionState> {
        let state = self.store.load_state(session_id).await?;
        if self.store.get_record(session_id).await?.is_none() {
            self.store
                .upsert_record(&SessionRecord::new(session_id.clone()))
                .await?;
        }
        if state.is_some() {
            info!(session_id = %session_id, "Session loaded");
        }
        Ok(state.unwrap_or_default())
    }

    /// Cancel the session's active run, if any.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        self.registry.cancel(session_id)
    }

    /// Stream a title for a conversation starting with `first_message`.
    ///
    /// Runs the title graph over a throwaway state; no session is touched.
    /// The title is the run's reply.
    pub fn generate_title(&self, first_message: &str) -> Result<RunHandle> {
        let first_message = first_message.trim();
        if first_message.is_empty() {
            return Err(BraidError::InvalidRequest("first_message must not be empty".into()));
        }
        let executor = self
            .title
            .clone()
            .ok_or_else(|| BraidError::GraphConfig("no title graph configured".into()))?;

        let session_id = SessionId::new();
        let mut container = StateContainer::from_state(SessionState {
            turns: vec![Turn::user(first_message)],
            ..Default::default()
        });
        let (events, stream) = event_channel(self.event_buffer);
        let sid = session_id.clone();

        let join = tokio::spawn(async move {
            executor
                .execute(&sid, &mut container, &events, &CancellationToken::new())
                .await
        });

        Ok(RunHandle {
            session_id,
            events: stream,
            join,
        })
    }

    /// Create an empty session with a catalog record.
    pub async fn create_session(&self, name: Option<&str>) -> Result<SessionRecord> {
        let mut record = SessionRecord::new(SessionId::new());
        if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
            record.name = name.to_string();
        }
        self.store.upsert_record(&record).await?;
        self.registry.restore(&record.session_id, SessionState::default());
        info!(session_id = %record.session_id, "Session created");
        Ok(record)
    }

    pub async fn rename_session(&self, session_id: &SessionId, name: &str) -> Result<SessionRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BraidError::InvalidRequest("name must not be empty".into()));
        }
        let mut record = self
            .store
            .get_record(session_id)
            .await?
            .ok_or_else(|| BraidError::SessionNotFound(session_id.to_string()))?;
        record.name = name.to_string();
        self.store.upsert_record(&record).await?;
        Ok(record)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        self.store.list_records().await
    }

    pub async fn session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>> {
        self.store.get_record(session_id).await
    }

    /// Delete a session everywhere. Refused with `SessionBusy` while it runs.
    pub async fn delete_session(&self, session_id: &SessionId) -> Result<bool> {
        let in_memory = self.registry.remove(session_id)?;
        let stored = self.store.delete(session_id).await?;
        if in_memory || stored {
            info!(session_id = %session_id, "Session deleted");
        }
        Ok(in_memory || stored)
    }

    /// Turns of a session's last committed state.
    pub async fn history(&self, session_id: &SessionId) -> Result<Vec<Turn>> {
        if let Some(snapshot) = self.registry.snapshot(session_id) {
            return Ok(snapshot.turns.clone());
        }
        if let Some(state) = self.store.load_state(session_id).await? {
            return Ok(state.turns);
        }
        match self.store.get_record(session_id).await? {
            Some(_) => Ok(Vec::new()),
            None => Err(BraidError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Drop idle sessions from memory. Their state stays in the store.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        self.registry.evict_idle(ttl)
    }
}

async fn persist(store: &dyn SessionStore, session_id: &SessionId, state: &SessionState) -> Result<()> {
    store.save_state(session_id, state).await?;
    let mut record = store
        .get_record(session_id)
        .await?
        .unwrap_or_else(|| SessionRecord::new(session_id.clone()));
    record.updated_at = Utc::now();
    store.upsert_record(&record).await
}
