use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use futures::StreamExt;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::{AgentCatalog, AgentType};
use crate::completion::{CompletionBackend, TokenStream};
use crate::error::{HubError, HubResult};
use crate::mcp::gateway::ToolGateway;
use crate::mcp::McpToolDefinition;
use crate::session::{AgentSession, ChatMessage, SessionStatus};
use crate::storage::{ConversationStore, SessionStore};

const STREAM_BUFFER: usize = 64;

pub type ReplyStream = ReceiverStream<HubResult<String>>;

/// A cached session. `turn` is held for the whole of a turn, `state` only for the
/// instant of a read or mutation, so snapshots never wait on a running turn.
struct SessionSlot {
    turn: Arc<Mutex<()>>,
    state: RwLock<AgentSession>,
}

impl SessionSlot {
    fn new(session: AgentSession) -> Arc<Self> {
        Arc::new(Self { turn: Arc::new(Mutex::new(())), state: RwLock::new(session) })
    }

    fn snapshot(&self) -> AgentSession {
        self.state.read().clone()
    }

    fn update<R>(&self, f: impl FnOnce(&mut AgentSession) -> R) -> R {
        f(&mut self.state.write())
    }
}

struct Inner {
    catalog: Arc<AgentCatalog>,
    backend: Arc<dyn CompletionBackend>,
    gateway: ToolGateway,
    sessions: Arc<dyn SessionStore>,
    conversations: Arc<dyn ConversationStore>,
    cache: DashMap<Uuid, Arc<SessionSlot>>,
}

/// Owns live sessions and drives their turns against the completion backend.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

async fn guarded<T>(
    cancel: &CancellationToken,
    wrap: fn(anyhow::Error) -> HubError,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> HubResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HubError::Cancelled),
        res = fut => res.map_err(wrap),
    }
}

impl SessionOrchestrator {
    pub fn new(
        catalog: Arc<AgentCatalog>,
        backend: Arc<dyn CompletionBackend>,
        gateway: ToolGateway,
        sessions: Arc<dyn SessionStore>,
        conversations: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner { catalog, backend, gateway, sessions, conversations, cache: DashMap::new() }),
        }
    }

    pub fn catalog(&self) -> &AgentCatalog {
        &self.inner.catalog
    }

    pub fn gateway(&self) -> &ToolGateway {
        &self.inner.gateway
    }

    pub async fn create_session(&self, user_id: &str, agent_type: AgentType, cancel: &CancellationToken) -> HubResult<AgentSession> {
        let agent = self.inner.catalog.get(agent_type).ok_or(HubError::UnknownAgent(agent_type))?;
        let session = AgentSession::new(user_id, agent.clone());
        self.admit(session.clone())?;

        let persisted = async {
            self.inner.sessions.save(&session).await?;
            self.inner.conversations.append(session.id, &session.messages[0]).await
        };
        if let Err(err) = guarded(cancel, HubError::Store, persisted).await {
            self.inner.cache.remove(&session.id);
            self.record_active();
            if let Err(cleanup) = self.inner.sessions.delete(session.id).await {
                warn!(session = %session.id, error = %cleanup, "failed to clean up partially created session");
            }
            return Err(err);
        }

        info!(session = %session.id, user = %session.user_id, agent = %agent_type, "created session");
        Ok(session)
    }

    /// Inserts a brand new session into the cache, refusing to replace an existing id.
    fn admit(&self, session: AgentSession) -> HubResult<Arc<SessionSlot>> {
        let id = session.id;
        let slot = match self.inner.cache.entry(id) {
            Entry::Occupied(_) => return Err(HubError::SessionConflict(id)),
            Entry::Vacant(v) => Arc::clone(v.insert(SessionSlot::new(session)).value()),
        };
        self.record_active();
        Ok(slot)
    }

    async fn load(&self, id: Uuid, cancel: &CancellationToken) -> HubResult<Option<Arc<SessionSlot>>> {
        let cached = self.inner.cache.get(&id).map(|slot| Arc::clone(slot.value()));
        if cached.is_some() {
            return Ok(cached);
        }
        let Some(session) = guarded(cancel, HubError::Store, self.inner.sessions.get(id)).await? else {
            return Ok(None);
        };
        debug!(session = %id, messages = session.messages.len(), "loaded session from store");
        let slot = Arc::clone(self.inner.cache.entry(id).or_insert_with(|| SessionSlot::new(session)).value());
        self.record_active();
        Ok(Some(slot))
    }

    async fn require(&self, id: Uuid, cancel: &CancellationToken) -> HubResult<Arc<SessionSlot>> {
        self.load(id, cancel).await?.ok_or(HubError::SessionNotFound(id))
    }

    async fn acquire(slot: &SessionSlot, cancel: &CancellationToken) -> HubResult<OwnedMutexGuard<()>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HubError::Cancelled),
            guard = Arc::clone(&slot.turn).lock_owned() => Ok(guard),
        }
    }

    /// Runs one blocking turn and returns the assistant's reply.
    pub async fn process_message(&self, id: Uuid, text: &str, cancel: &CancellationToken) -> HubResult<ChatMessage> {
        let slot = self.require(id, cancel).await?;
        let _turn = Self::acquire(&slot, cancel).await?;

        let outcome = async {
            let transcript = self.begin_turn(&slot, text, cancel).await?;
            let tools = self.tools_for(transcript.agent_type, cancel).await?;
            let content = guarded(
                cancel,
                HubError::Completion,
                self.inner.backend.complete(&transcript.messages, tools.as_deref()),
            )
            .await?;
            self.finish_turn(&slot, content, cancel).await
        }
        .await;

        match outcome {
            Ok(reply) => {
                counter!("ops_hub_turns_total", "mode" => "process", "outcome" => "ok").increment(1);
                Ok(reply)
            }
            Err(err) => Err(self.fail_turn(&slot, err, "process").await),
        }
    }

    /// Starts a streaming turn. Tokens arrive on the returned stream as the backend
    /// emits them; a failure after streaming began arrives as a final `Err` item.
    /// The session stays locked until the stream is exhausted, cancelled or dropped.
    pub async fn stream_message(&self, id: Uuid, text: &str, cancel: CancellationToken) -> HubResult<ReplyStream> {
        let slot = self.require(id, &cancel).await?;
        let turn = Self::acquire(&slot, &cancel).await?;

        let opened = async {
            let transcript = self.begin_turn(&slot, text, &cancel).await?;
            let tools = self.tools_for(transcript.agent_type, &cancel).await?;
            guarded(
                &cancel,
                HubError::Completion,
                self.inner.backend.stream(&transcript.messages, tools.as_deref()),
            )
            .await
        }
        .await;
        let tokens = match opened {
            Ok(tokens) => tokens,
            Err(err) => return Err(self.fail_turn(&slot, err, "stream").await),
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let this = self.clone();
        tokio::spawn(async move {
            let _turn = turn;
            this.relay(slot, tokens, tx, cancel).await;
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn relay(&self, slot: Arc<SessionSlot>, mut tokens: TokenStream, tx: mpsc::Sender<HubResult<String>>, cancel: CancellationToken) {
        let mut text = String::new();
        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(HubError::Cancelled),
                _ = tx.closed() => break Err(HubError::Cancelled),
                next = tokens.next() => next,
            };
            match next {
                Some(Ok(token)) => {
                    text.push_str(&token);
                    if tx.send(Ok(token)).await.is_err() {
                        break Err(HubError::Cancelled);
                    }
                }
                Some(Err(err)) => break Err(HubError::Completion(err)),
                None => break Ok(()),
            }
        };
        drop(tokens);

        let outcome = match outcome {
            Ok(()) => self.finish_turn(&slot, text, &cancel).await.map(|_| ()),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => counter!("ops_hub_turns_total", "mode" => "stream", "outcome" => "ok").increment(1),
            Err(err) => {
                let err = self.fail_turn(&slot, err, "stream").await;
                if !matches!(err, HubError::Cancelled) {
                    let _ = tx.send(Err(err)).await;
                }
            }
        }
    }

    /// Marks the session Thinking and records the user's message. Returns the
    /// transcript the backend should see. The message reaches the cache only once
    /// the store has it.
    async fn begin_turn(&self, slot: &SessionSlot, text: &str, cancel: &CancellationToken) -> HubResult<AgentSession> {
        let message = ChatMessage::user(text);
        let id = slot.update(|s| {
            s.status = SessionStatus::Thinking;
            s.id
        });
        guarded(cancel, HubError::Store, self.inner.conversations.append(id, &message)).await?;
        let transcript = slot.update(|s| {
            s.push(message);
            s.clone()
        });
        debug!(session = %id, messages = transcript.messages.len(), "turn started");

        guarded(cancel, HubError::Store, self.inner.sessions.update_status(id, SessionStatus::Thinking)).await?;
        Ok(transcript)
    }

    /// Tool definitions for the agent, or `None` when they cannot be had.
    async fn tools_for(&self, agent_type: AgentType, cancel: &CancellationToken) -> HubResult<Option<Vec<McpToolDefinition>>> {
        let client = match self.inner.gateway.client(agent_type) {
            Ok(client) => client,
            Err(err) => {
                warn!(agent = %agent_type, error = %err, "continuing without tools");
                return Ok(None);
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HubError::Cancelled),
            res = client.list_tools() => Ok(match res {
                Ok(tools) => Some(tools),
                Err(err) => {
                    warn!(agent = %agent_type, error = %err, "failed to list tools, continuing without tools");
                    None
                }
            }),
        }
    }

    /// Records the assistant's reply. Once the store holds it the turn is committed,
    /// so the trailing status write no longer observes cancellation.
    async fn finish_turn(&self, slot: &SessionSlot, content: String, cancel: &CancellationToken) -> HubResult<ChatMessage> {
        let reply = ChatMessage::assistant(content);
        let id = slot.update(|s| s.id);
        guarded(cancel, HubError::Store, self.inner.conversations.append(id, &reply)).await?;
        let session = slot.update(|s| {
            s.push(reply.clone());
            s.status = SessionStatus::Idle;
            s.clone()
        });

        self.inner.sessions.save(&session).await.map_err(HubError::Store)?;
        debug!(session = %id, chars = reply.content.len(), "turn finished");
        Ok(reply)
    }

    /// Settles the session after a failed turn: Idle when cancelled, Error otherwise.
    /// The transcript is left as is.
    async fn fail_turn(&self, slot: &SessionSlot, err: HubError, mode: &'static str) -> HubError {
        let cancelled = matches!(err, HubError::Cancelled);
        let status = if cancelled { SessionStatus::Idle } else { SessionStatus::Error };
        let id = slot.update(|s| {
            s.status = status;
            s.last_activity_at = Utc::now();
            s.id
        });
        if let Err(store_err) = self.inner.sessions.update_status(id, status).await {
            warn!(session = %id, error = %store_err, "failed to persist status after failed turn");
        }

        if cancelled {
            info!(session = %id, mode, "turn cancelled");
        } else {
            error!(session = %id, mode, error = %err, "turn failed");
        }
        let outcome = if cancelled { "cancelled" } else { "error" };
        counter!("ops_hub_turns_total", "mode" => mode, "outcome" => outcome).increment(1);
        err
    }

    pub async fn get_session(&self, id: Uuid, cancel: &CancellationToken) -> HubResult<Option<AgentSession>> {
        Ok(self.load(id, cancel).await?.map(|slot| slot.snapshot()))
    }

    /// Sessions owned by `user_id`, most recently active first. Cached sessions
    /// report their live state.
    pub async fn sessions_for_user(&self, user_id: &str, cancel: &CancellationToken) -> HubResult<Vec<AgentSession>> {
        let stored = guarded(cancel, HubError::Store, self.inner.sessions.get_by_user(user_id)).await?;
        let mut sessions: Vec<_> = stored
            .into_iter()
            .map(|s| match self.inner.cache.get(&s.id) {
                Some(slot) => slot.snapshot(),
                None => s,
            })
            .collect();
        sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(sessions)
    }

    /// Forgets the session everywhere. Ending an unknown session is not an error.
    pub async fn end_session(&self, id: Uuid, cancel: &CancellationToken) -> HubResult<()> {
        let cached = self.inner.cache.remove(&id).is_some();
        self.record_active();
        let deleted = async {
            self.inner.conversations.delete_all(id).await?;
            self.inner.sessions.delete(id).await
        };
        guarded(cancel, HubError::Store, deleted).await?;
        info!(session = %id, cached, "ended session");
        Ok(())
    }

    fn record_active(&self) {
        gauge!("ops_hub_sessions_active").set(self.inner.cache.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream;
    use tempfile::TempDir;

    use super::*;
    use crate::mcp::gateway::tests::FakeClient;
    use crate::session::ChatRole;
    use crate::storage::tests::temp_store;
    use crate::storage::SqliteStore;

    #[derive(Clone, Copy)]
    enum Script {
        Reply(&'static str),
        Slow(&'static str),
        Fail,
        FailMidStream,
        Hang,
        /// Streams one token then stalls; `complete` still answers "ack".
        StallAfterFirst,
    }

    struct ScriptedBackend {
        script: Script,
        seen_tools: parking_lot::Mutex<Vec<Option<Vec<String>>>>,
    }

    impl ScriptedBackend {
        fn record(&self, tools: Option<&[McpToolDefinition]>) {
            self.seen_tools.lock().push(tools.map(|t| t.iter().map(|d| d.name.clone()).collect()));
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(&self, _messages: &[ChatMessage], tools: Option<&[McpToolDefinition]>) -> anyhow::Result<String> {
            self.record(tools);
            match self.script {
                Script::Reply(r) => Ok(r.to_string()),
                Script::Slow(r) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(r.to_string())
                }
                Script::Fail | Script::FailMidStream => anyhow::bail!("model offline"),
                Script::Hang => futures::future::pending().await,
                Script::StallAfterFirst => Ok("ack".to_string()),
            }
        }

        async fn stream(&self, _messages: &[ChatMessage], tools: Option<&[McpToolDefinition]>) -> anyhow::Result<TokenStream> {
            self.record(tools);
            match self.script {
                Script::Reply(r) | Script::Slow(r) => {
                    let tokens: Vec<anyhow::Result<String>> = r.split_inclusive(' ').map(|t| Ok(t.to_string())).collect();
                    Ok(stream::iter(tokens).boxed())
                }
                Script::Fail => anyhow::bail!("model offline"),
                Script::FailMidStream => {
                    let items = vec![Ok("partial ".to_string()), Err(anyhow::anyhow!("connection reset"))];
                    Ok(stream::iter(items).boxed())
                }
                Script::Hang => futures::future::pending().await,
                Script::StallAfterFirst => Ok(stream::iter(vec![Ok("first ".to_string())]).chain(stream::pending()).boxed()),
            }
        }
    }

    struct Hub {
        orchestrator: SessionOrchestrator,
        backend: Arc<ScriptedBackend>,
        store: SqliteStore,
        _dir: TempDir,
    }

    async fn hub_with(script: Script, catalog: AgentCatalog, gateway: ToolGateway) -> Hub {
        let catalog = Arc::new(catalog);
        let (store, dir) = temp_store(catalog.clone()).await;
        let backend = Arc::new(ScriptedBackend { script, seen_tools: parking_lot::Mutex::new(Vec::new()) });
        let orchestrator = SessionOrchestrator::new(
            catalog,
            backend.clone(),
            gateway,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        );
        Hub { orchestrator, backend, store, _dir: dir }
    }

    async fn hub(script: Script) -> Hub {
        hub_with(script, AgentCatalog::builtin(), ToolGateway::new([(AgentType::GitHub, FakeClient::working())])).await
    }

    #[derive(Clone, Copy)]
    enum StoreFault {
        Fail,
        Hang,
    }

    /// Misbehaves when asked to append a message with one particular role.
    struct FaultyConversations {
        inner: SqliteStore,
        role: ChatRole,
        fault: StoreFault,
    }

    #[async_trait]
    impl ConversationStore for FaultyConversations {
        async fn append(&self, session_id: Uuid, message: &ChatMessage) -> anyhow::Result<()> {
            if message.role == self.role {
                match self.fault {
                    StoreFault::Fail => anyhow::bail!("disk full"),
                    StoreFault::Hang => futures::future::pending::<()>().await,
                }
            }
            self.inner.append(session_id, message).await
        }

        async fn get_all(&self, session_id: Uuid) -> anyhow::Result<Vec<ChatMessage>> {
            self.inner.get_all(session_id).await
        }

        async fn delete_all(&self, session_id: Uuid) -> anyhow::Result<()> {
            self.inner.delete_all(session_id).await
        }
    }

    async fn hub_with_faulty_store(script: Script, role: ChatRole, fault: StoreFault) -> Hub {
        let catalog = Arc::new(AgentCatalog::builtin());
        let (store, dir) = temp_store(catalog.clone()).await;
        let backend = Arc::new(ScriptedBackend { script, seen_tools: parking_lot::Mutex::new(Vec::new()) });
        let conversations = FaultyConversations { inner: store.clone(), role, fault };
        let orchestrator = SessionOrchestrator::new(
            catalog,
            backend.clone(),
            ToolGateway::default(),
            Arc::new(store.clone()),
            Arc::new(conversations),
        );
        Hub { orchestrator, backend, store, _dir: dir }
    }

    /// The cached transcript must be exactly what the store holds.
    async fn cached_matches_stored(hub: &Hub, id: Uuid) -> AgentSession {
        let cached = hub.orchestrator.get_session(id, &none()).await.unwrap().unwrap();
        let cached_ids: Vec<_> = cached.messages.iter().map(|m| m.id).collect();
        let stored_ids: Vec<_> = hub.store.get_all(id).await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(cached_ids, stored_ids);
        cached
    }

    fn roles(session: &AgentSession) -> Vec<ChatRole> {
        session.messages.iter().map(|m| m.role).collect()
    }

    fn none() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn created_session_is_seeded_and_persisted() {
        let hub = hub(Script::Reply("ack")).await;
        let session = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap();
        let builtin = AgentCatalog::builtin();
        let prompt = &builtin.get(AgentType::GitHub).unwrap().system_prompt;

        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].role, ChatRole::System);
        assert_eq!(&session.messages[0].content, prompt);
        assert_eq!(session.status, SessionStatus::Idle);

        let stored = hub.store.get(session.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(&stored.messages[0].content, prompt);
    }

    #[tokio::test]
    async fn unknown_agent_creates_nothing() {
        let github = AgentCatalog::builtin().get(AgentType::GitHub).unwrap().clone();
        let hub = hub_with(Script::Reply("ack"), AgentCatalog::new(vec![github]), ToolGateway::default()).await;

        match hub.orchestrator.create_session("u1", AgentType::Azure, &none()).await {
            Err(HubError::UnknownAgent(AgentType::Azure)) => {}
            other => panic!("expected UnknownAgent, got {:?}", other.map(|s| s.id)),
        }
        assert!(hub.store.get_by_user("u1").await.unwrap().is_empty());
        assert!(hub.orchestrator.sessions_for_user("u1", &none()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn process_message_appends_user_then_assistant() {
        let hub = hub(Script::Reply("ack")).await;
        let id = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;

        let reply = hub.orchestrator.process_message(id, "hello", &none()).await.unwrap();
        assert_eq!(reply.role, ChatRole::Assistant);
        assert_eq!(reply.content, "ack");

        let session = hub.orchestrator.get_session(id, &none()).await.unwrap().unwrap();
        assert_eq!(roles(&session), vec![ChatRole::System, ChatRole::User, ChatRole::Assistant]);
        assert_eq!(session.messages[1].content, "hello");
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(*hub.backend.seen_tools.lock(), vec![Some(vec!["test_tool".to_string()])]);

        let stored = hub.store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 3);
        assert_eq!(stored.status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn sessions_reload_from_store_after_restart() {
        let hub = hub(Script::Reply("ack")).await;
        let id = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;
        hub.orchestrator.process_message(id, "hello", &none()).await.unwrap();

        let restarted = SessionOrchestrator::new(
            Arc::new(AgentCatalog::builtin()),
            hub.backend.clone(),
            ToolGateway::default(),
            Arc::new(hub.store.clone()),
            Arc::new(hub.store.clone()),
        );
        let session = restarted.get_session(id, &none()).await.unwrap().unwrap();
        assert_eq!(roles(&session), vec![ChatRole::System, ChatRole::User, ChatRole::Assistant]);

        restarted.process_message(id, "again", &none()).await.unwrap();
        let contents: Vec<_> = hub.store.get_all(id).await.unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(contents[1..], ["hello", "ack", "again", "ack"]);
    }

    #[tokio::test]
    async fn completion_failure_marks_error_and_keeps_user_message() {
        let hub = hub(Script::Fail).await;
        let id = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;

        let err = hub.orchestrator.process_message(id, "hello", &none()).await.unwrap_err();
        assert!(matches!(err, HubError::Completion(_)));
        assert!(err.to_string().contains("model offline"));

        let session = hub.orchestrator.get_session(id, &none()).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(roles(&session), vec![ChatRole::System, ChatRole::User]);
        assert_eq!(hub.store.get(id).await.unwrap().unwrap().status, SessionStatus::Error);
        assert_eq!(hub.store.get_all(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn tool_backend_trouble_still_gets_a_reply() {
        let gateway = ToolGateway::new([(AgentType::GitHub, FakeClient::broken())]);
        let hub = hub_with(Script::Reply("ack"), AgentCatalog::builtin(), gateway).await;
        let broken = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;
        let unbound = hub.orchestrator.create_session("u1", AgentType::Azure, &none()).await.unwrap().id;

        assert_eq!(hub.orchestrator.process_message(broken, "hi", &none()).await.unwrap().content, "ack");
        assert_eq!(hub.orchestrator.process_message(unbound, "hi", &none()).await.unwrap().content, "ack");
        assert_eq!(*hub.backend.seen_tools.lock(), vec![None, None]);
    }

    #[tokio::test]
    async fn streamed_tokens_concatenate_to_the_blocking_reply() {
        let hub = hub(Script::Reply("the build is green")).await;
        let blocking = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;
        let streaming = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;

        let expected = hub.orchestrator.process_message(blocking, "status?", &none()).await.unwrap().content;
        let tokens: Vec<String> = hub
            .orchestrator
            .stream_message(streaming, "status?", none())
            .await
            .unwrap()
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert!(tokens.len() > 1);
        assert_eq!(tokens.concat(), expected);

        let session = hub.orchestrator.get_session(streaming, &none()).await.unwrap().unwrap();
        assert_eq!(roles(&session), vec![ChatRole::System, ChatRole::User, ChatRole::Assistant]);
        assert_eq!(session.messages[2].content, expected);
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(hub.store.get_all(streaming).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn mid_stream_failure_reaches_consumer_and_marks_error() {
        let hub = hub(Script::FailMidStream).await;
        let id = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;

        let items: Vec<_> = hub.orchestrator.stream_message(id, "hi", none()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial ");
        assert!(matches!(items[1], Err(HubError::Completion(_))));

        let session = hub.orchestrator.get_session(id, &none()).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(roles(&session), vec![ChatRole::System, ChatRole::User]);
    }

    #[tokio::test]
    async fn stream_open_failure_is_returned_directly() {
        let hub = hub(Script::Fail).await;
        let id = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;

        assert!(matches!(hub.orchestrator.stream_message(id, "hi", none()).await, Err(HubError::Completion(_))));
        assert_eq!(hub.orchestrator.get_session(id, &none()).await.unwrap().unwrap().status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn dropped_stream_releases_the_session() {
        let hub = hub(Script::StallAfterFirst).await;
        let id = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;

        let mut tokens = hub.orchestrator.stream_message(id, "watch logs", none()).await.unwrap();
        assert_eq!(tokens.next().await.unwrap().unwrap(), "first ");
        drop(tokens);

        // waits for the abandoned turn to let go of the session
        let reply = tokio::time::timeout(Duration::from_secs(5), hub.orchestrator.process_message(id, "again", &none()))
            .await
            .expect("abandoned stream kept the session locked")
            .unwrap();
        assert_eq!(reply.content, "ack");

        let session = hub.orchestrator.get_session(id, &none()).await.unwrap().unwrap();
        assert_eq!(roles(&session), vec![ChatRole::System, ChatRole::User, ChatRole::User, ChatRole::Assistant]);
        assert_eq!(session.status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn cancelled_stream_ends_quietly_and_resets_to_idle() {
        let hub = hub(Script::StallAfterFirst).await;
        let id = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;
        let cancel = CancellationToken::new();

        let mut tokens = hub.orchestrator.stream_message(id, "watch logs", cancel.clone()).await.unwrap();
        assert_eq!(tokens.next().await.unwrap().unwrap(), "first ");
        cancel.cancel();
        let rest = tokio::time::timeout(Duration::from_secs(5), tokens.next()).await.unwrap();
        assert!(rest.is_none());

        let session = hub.orchestrator.get_session(id, &none()).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(roles(&session), vec![ChatRole::System, ChatRole::User]);
    }

    #[tokio::test]
    async fn cancelled_turn_keeps_user_message_and_returns_to_idle() {
        let hub = hub(Script::Hang).await;
        let id = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = hub.orchestrator.process_message(id, "deploy", &cancel).await.unwrap_err();
        assert!(matches!(err, HubError::Cancelled));

        let session = hub.orchestrator.get_session(id, &none()).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(roles(&session), vec![ChatRole::System, ChatRole::User]);
        assert_eq!(hub.store.get(id).await.unwrap().unwrap().status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_session_do_not_interleave() {
        let hub = hub(Script::Slow("ack")).await;
        let id = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;

        let (cancel_a, cancel_b) = (none(), none());
        let (a, b) = tokio::join!(
            hub.orchestrator.process_message(id, "one", &cancel_a),
            hub.orchestrator.process_message(id, "two", &cancel_b),
        );
        a.unwrap();
        b.unwrap();

        let session = hub.orchestrator.get_session(id, &none()).await.unwrap().unwrap();
        assert_eq!(
            roles(&session),
            vec![ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::User, ChatRole::Assistant]
        );
    }

    #[tokio::test]
    async fn unknown_ids_are_absent_and_ending_them_is_fine() {
        let hub = hub(Script::Reply("ack")).await;
        let ghost = Uuid::new_v4();

        assert!(hub.orchestrator.get_session(ghost, &none()).await.unwrap().is_none());
        hub.orchestrator.end_session(ghost, &none()).await.unwrap();
        assert!(matches!(
            hub.orchestrator.process_message(ghost, "hi", &none()).await,
            Err(HubError::SessionNotFound(id)) if id == ghost
        ));
    }

    #[tokio::test]
    async fn ack_scenario_end_to_end() {
        let builtin = AgentCatalog::builtin();
        let catalog = AgentCatalog::new(vec![
            builtin.get(AgentType::GitHub).unwrap().clone(),
            builtin.get(AgentType::Azure).unwrap().clone(),
        ]);
        let hub = hub_with(Script::Reply("ack"), catalog, ToolGateway::default()).await;

        let session = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap();
        assert_eq!(session.messages.len(), 1);

        hub.orchestrator.process_message(session.id, "hi", &none()).await.unwrap();
        let session = hub.orchestrator.get_session(session.id, &none()).await.unwrap().unwrap();
        let transcript: Vec<_> = session.messages.iter().map(|m| (m.role, m.content.as_str())).collect();
        assert_eq!(transcript[1..], [(ChatRole::User, "hi"), (ChatRole::Assistant, "ack")]);
        assert_eq!(transcript[0].0, ChatRole::System);
        assert_eq!(session.status, SessionStatus::Idle);

        hub.orchestrator.end_session(session.id, &none()).await.unwrap();
        assert!(hub.orchestrator.get_session(session.id, &none()).await.unwrap().is_none());
        assert!(hub.store.get(session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_a_conflict_not_an_overwrite() {
        let hub = hub(Script::Reply("ack")).await;
        let agent = AgentCatalog::builtin().get(AgentType::GitHub).unwrap().clone();
        let session = AgentSession::new("u1", agent.clone());
        hub.orchestrator.admit(session.clone()).unwrap();

        let mut impostor = AgentSession::new("u2", agent);
        impostor.id = session.id;
        assert!(matches!(hub.orchestrator.admit(impostor), Err(HubError::SessionConflict(id)) if id == session.id));
        assert_eq!(hub.orchestrator.get_session(session.id, &none()).await.unwrap().unwrap().user_id, "u1");
    }

    #[tokio::test]
    async fn user_listing_reports_live_state_most_recent_first() {
        let hub = hub(Script::Reply("ack")).await;
        let first = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;
        let second = hub.orchestrator.create_session("u1", AgentType::Personal, &none()).await.unwrap().id;
        hub.orchestrator.create_session("u2", AgentType::GitHub, &none()).await.unwrap();
        hub.orchestrator.process_message(first, "hi", &none()).await.unwrap();

        let listed = hub.orchestrator.sessions_for_user("u1", &none()).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(listed[0].messages.len(), 3);
    }

    #[tokio::test]
    async fn failed_reply_write_marks_error_without_a_phantom_reply() {
        let hub = hub_with_faulty_store(Script::Reply("ack"), ChatRole::Assistant, StoreFault::Fail).await;
        let id = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;

        let err = hub.orchestrator.process_message(id, "hello", &none()).await.unwrap_err();
        assert!(matches!(err, HubError::Store(_)));
        assert!(err.to_string().contains("disk full"));

        let session = cached_matches_stored(&hub, id).await;
        assert_eq!(roles(&session), vec![ChatRole::System, ChatRole::User]);
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(hub.store.get(id).await.unwrap().unwrap().status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn cancelled_reply_write_appends_nothing_and_returns_to_idle() {
        let hub = hub_with_faulty_store(Script::Reply("ack"), ChatRole::Assistant, StoreFault::Hang).await;
        let id = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = hub.orchestrator.process_message(id, "hello", &cancel).await.unwrap_err();
        assert!(matches!(err, HubError::Cancelled));

        let session = cached_matches_stored(&hub, id).await;
        assert_eq!(roles(&session), vec![ChatRole::System, ChatRole::User]);
        assert_eq!(session.status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn failed_user_message_write_leaves_transcript_untouched() {
        let hub = hub_with_faulty_store(Script::Reply("ack"), ChatRole::User, StoreFault::Fail).await;
        let id = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;

        assert!(matches!(hub.orchestrator.process_message(id, "hello", &none()).await, Err(HubError::Store(_))));
        assert!(hub.backend.seen_tools.lock().is_empty());

        let session = cached_matches_stored(&hub, id).await;
        assert_eq!(roles(&session), vec![ChatRole::System]);
        assert_eq!(session.status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn failed_streamed_reply_write_reaches_consumer() {
        let hub = hub_with_faulty_store(Script::Reply("all green"), ChatRole::Assistant, StoreFault::Fail).await;
        let id = hub.orchestrator.create_session("u1", AgentType::GitHub, &none()).await.unwrap().id;

        let items: Vec<_> = hub.orchestrator.stream_message(id, "status?", none()).await.unwrap().collect().await;
        assert!(matches!(items.last(), Some(Err(HubError::Store(_)))));

        let session = cached_matches_stored(&hub, id).await;
        assert_eq!(roles(&session), vec![ChatRole::System, ChatRole::User]);
        assert_eq!(session.status, SessionStatus::Error);
    }
}
