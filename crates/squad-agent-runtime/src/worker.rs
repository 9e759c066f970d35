//! The per-agent worker: consume, reason, act, persist.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use squad_bus_core::{subject, BusError, BusMessage, MessageBus};
use squad_types::{
    AgentId, AgentMessage, AgentRole, BroadcastScope, Classify, ExecutionId, MessageFlags,
    MessageId, MessageMetadata, MessageType, Roster, SessionId, SquadMember,
};

use crate::llm::{CompletionRequest, LanguageModel};
use crate::session::{Session, SessionStore, SessionTurn};
use crate::tools::ToolRegistry;
use crate::{AgentResult, AgentRuntimeError, RetryConfig, DEFAULT_PROCESS_TIMEOUT};

/// The bus subscriptions feeding one agent's receive loop.
pub struct AgentSubscriptions {
    inbox: squad_bus_core::Subscription,
    broadcasts: squad_bus_core::Subscription,
    squad_wide: squad_bus_core::Subscription,
    role_wide: squad_bus_core::Subscription,
}

/// A live agent bound to one execution.
///
/// The worker owns no references to other agents; everything it can do is
/// expressed through its capability set (model, tools, bus, sessions) and
/// the read-only roster.
pub struct AgentWorker {
    member: SquadMember,
    execution_id: ExecutionId,
    bus: Arc<dyn MessageBus>,
    roster: Arc<dyn Roster>,
    sessions: Arc<dyn SessionStore>,
    model: Arc<dyn LanguageModel>,
    tools: Arc<ToolRegistry>,
    retry: RetryConfig,
    session_id: Mutex<Option<SessionId>>,
    // One message at a time, per agent.
    serial: Mutex<()>,
}

impl std::fmt::Debug for AgentWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentWorker")
            .field("member", &self.member)
            .field("execution_id", &self.execution_id)
            .finish_non_exhaustive()
    }
}

impl AgentWorker {
    /// Create a worker, optionally resuming a prior session.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        member: SquadMember,
        execution_id: ExecutionId,
        bus: Arc<dyn MessageBus>,
        roster: Arc<dyn Roster>,
        sessions: Arc<dyn SessionStore>,
        model: Arc<dyn LanguageModel>,
        tools: Arc<ToolRegistry>,
        session_id: Option<SessionId>,
    ) -> Self {
        Self {
            member,
            execution_id,
            bus,
            roster,
            sessions,
            model,
            tools,
            retry: RetryConfig::default(),
            session_id: Mutex::new(session_id),
            serial: Mutex::new(()),
        }
    }

    /// The agent's identity.
    pub fn agent_id(&self) -> AgentId {
        self.member.id
    }

    /// The agent's role.
    pub fn role(&self) -> AgentRole {
        self.member.role
    }

    /// The member record this worker was built from.
    pub fn member(&self) -> &SquadMember {
        &self.member
    }

    /// The execution this worker participates in.
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// The session id, once one has been resolved.
    pub async fn session_id(&self) -> Option<SessionId> {
        *self.session_id.lock().await
    }

    //───────────────────── public operations ─────────────────────

    /// Route content through the agent's reasoning capability.
    ///
    /// An optional context string is presented to the model ahead of the
    /// content. The exchange is appended to the session and the produced
    /// text returned; on deadline expiry nothing is persisted.
    #[instrument(skip(self, content, context), fields(agent = %self.member.id))]
    pub async fn process_message(
        &self,
        content: &str,
        context: Option<&str>,
        deadline: Option<Duration>,
    ) -> AgentResult<String> {
        let _serial = self.serial.lock().await;
        let mut session = self.session().await?;
        let input = match context {
            Some(context) => format!("{context}\n\n{content}"),
            None => content.to_string(),
        };
        let reply = self.think(&mut session, &input, deadline).await?;
        self.sessions.save(&session).await?;
        Ok(reply)
    }

    /// Publish a point-to-point message. Returns the message id.
    pub async fn send_message(
        &self,
        recipient_id: AgentId,
        content: impl Into<String>,
        message_type: MessageType,
        metadata: Option<MessageMetadata>,
    ) -> AgentResult<MessageId> {
        let mut message = AgentMessage::direct(
            self.execution_id,
            self.member.id,
            recipient_id,
            message_type,
            content,
        );
        if let Some(metadata) = metadata {
            message = message.with_metadata(metadata);
        }
        self.publish_direct(&message).await?;
        Ok(message.id)
    }

    /// Publish a fanout message. Returns the message id.
    pub async fn broadcast_message(
        &self,
        scope: BroadcastScope,
        content: impl Into<String>,
        message_type: MessageType,
        metadata: Option<MessageMetadata>,
    ) -> AgentResult<MessageId> {
        let mut message = AgentMessage::broadcast(
            self.execution_id,
            self.member.id,
            scope,
            message_type,
            content,
        );
        if let Some(metadata) = metadata {
            message = message.with_metadata(metadata);
        }
        let subject = subject::broadcast(self.execution_id, scope);
        self.publish_with_retry(BusMessage::agent(message.clone(), subject))
            .await?;
        Ok(message.id)
    }

    /// Invoke an external tool.
    pub async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> AgentResult<serde_json::Value> {
        self.tools.call(name, args).await
    }

    /// Attach the worker's inbox and broadcast subscriptions.
    ///
    /// Separate from [`receive_loop`](Self::receive_loop) so a caller can
    /// guarantee the subscriptions exist before any message addressed to
    /// the agent is published.
    pub async fn attach(&self) -> AgentResult<AgentSubscriptions> {
        let me = self.member.id;
        Ok(AgentSubscriptions {
            inbox: self
                .bus
                .subscribe(
                    subject::inbox_pattern(self.execution_id, me),
                    &format!("agent-{me}"),
                )
                .await?,
            broadcasts: self
                .bus
                .subscribe(
                    subject::broadcast_pattern(self.execution_id, BroadcastScope::Execution),
                    &format!("agent-{me}-exec"),
                )
                .await?,
            squad_wide: self
                .bus
                .subscribe(
                    subject::broadcast_pattern(self.execution_id, BroadcastScope::Squad),
                    &format!("agent-{me}-squad"),
                )
                .await?,
            role_wide: self
                .bus
                .subscribe(
                    subject::broadcast_pattern(
                        self.execution_id,
                        BroadcastScope::Role(self.member.role),
                    ),
                    &format!("agent-{me}-role"),
                )
                .await?,
        })
    }

    /// Run the background consumer: pull from the attached subjects,
    /// process serially, ack on success.
    ///
    /// A delivery that fails processing is left un-acked so the bus
    /// redelivers it.
    pub fn receive_loop(
        self: Arc<Self>,
        subscriptions: AgentSubscriptions,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let me = self.member.id;
            let AgentSubscriptions {
                mut inbox,
                mut broadcasts,
                mut squad_wide,
                mut role_wide,
            } = subscriptions;
            info!(agent = %me, role = %self.member.role, "agent receive loop started");

            loop {
                let delivery = tokio::select! {
                    d = inbox.next() => d,
                    d = broadcasts.next() => d,
                    d = squad_wide.next() => d,
                    d = role_wide.next() => d,
                };
                let Some(delivery) = delivery else { break };
                let Some(message) = delivery.message.as_agent().cloned() else {
                    delivery.ack();
                    continue;
                };
                if message.sender_id == me {
                    delivery.ack();
                    continue;
                }
                match self.handle_inbox_message(&message).await {
                    Ok(()) => delivery.ack(),
                    Err(e) if e.is_retryable() => {
                        // Leave un-acked; the bus redelivers after ack-wait.
                        warn!(agent = %me, error = %e, "processing failed, awaiting redelivery");
                    }
                    Err(e) => {
                        warn!(agent = %me, error = %e, "dropping unprocessable message");
                        delivery.ack();
                    }
                }
            }
            info!(agent = %me, "agent receive loop stopped");
        })
    }

    //───────────────────── inbox handling ─────────────────────

    /// Process one inbox message with at-least-once safety.
    pub async fn handle_inbox_message(&self, message: &AgentMessage) -> AgentResult<()> {
        let _serial = self.serial.lock().await;
        let mut session = self.session().await?;

        if session.already_processed(message.id) {
            if let Some(reply) = session.pending_reply(message.id).cloned() {
                debug!(agent = %self.member.id, reply = %reply.id, "republishing recorded reply");
                self.publish_direct(&reply).await?;
                session.confirm_published(reply.id);
                self.sessions.save(&session).await?;
            }
            return Ok(());
        }

        let output = self
            .think(&mut session, &message.content, Some(DEFAULT_PROCESS_TIMEOUT))
            .await?;
        let reply = self.reply_for(message, output);

        // Durability point: the ledger and the fully-formed reply are
        // persisted before the first publish attempt, so a crash after
        // this save republishes the same message id instead of minting a
        // new one.
        session
            .processed
            .insert(message.id, reply.as_ref().map(|r| r.id));
        if let Some(reply) = &reply {
            session.outbox.push(reply.clone());
        }
        self.sessions.save(&session).await?;

        if let Some(reply) = reply {
            self.publish_direct(&reply).await?;
            session.confirm_published(reply.id);
            self.sessions.save(&session).await?;
        }
        Ok(())
    }

    fn reply_for(&self, message: &AgentMessage, output: String) -> Option<AgentMessage> {
        let reply = match message.message_type {
            MessageType::Question => AgentMessage::direct(
                self.execution_id,
                self.member.id,
                message.sender_id,
                MessageType::Answer,
                output,
            )
            .replying_to(message.parent_message_id.unwrap_or(message.id)),
            MessageType::TaskAssignment => AgentMessage::direct(
                self.execution_id,
                self.member.id,
                message.sender_id,
                MessageType::StatusUpdate,
                output,
            )
            .replying_to(message.id)
            .with_flags(MessageFlags {
                acknowledgment: true,
                ..MessageFlags::default()
            }),
            _ => return None,
        };
        Some(match message.conversation_id {
            Some(conversation_id) => reply.in_conversation(conversation_id),
            None => reply,
        })
    }

    //───────────────────── internals ─────────────────────

    async fn think(
        &self,
        session: &mut Session,
        input: &str,
        deadline: Option<Duration>,
    ) -> AgentResult<String> {
        let request = CompletionRequest {
            system_prompt: self.member.system_prompt.clone(),
            history: session.turns.clone(),
            input: input.to_string(),
        };
        let completion = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.model.complete(request))
                .await
                .map_err(|_| AgentRuntimeError::DeadlineExceeded)??,
            None => self.model.complete(request).await?,
        };
        session.turns.push(SessionTurn::user(input));
        session.turns.push(SessionTurn::assistant(&completion.content));
        Ok(completion.content)
    }

    async fn session(&self) -> AgentResult<Session> {
        let mut slot = self.session_id.lock().await;
        match *slot {
            Some(session_id) => match self.sessions.load(session_id).await? {
                Some(session) => Ok(session),
                None => {
                    // A resumed id with no stored blob starts fresh under
                    // the same identity.
                    let mut session = Session::new(self.member.id);
                    session.session_id = session_id;
                    Ok(session)
                }
            },
            None => {
                let session = Session::new(self.member.id);
                *slot = Some(session.session_id);
                debug!(agent = %self.member.id, session = %session.session_id, "session created");
                Ok(session)
            }
        }
    }

    async fn publish_direct(&self, message: &AgentMessage) -> AgentResult<()> {
        let Some(recipient) = message.recipient_id else {
            return Err(AgentRuntimeError::Bus(BusError::Malformed(
                "direct publish without recipient".to_string(),
            )));
        };
        let role = match self.roster.member(recipient).await {
            Some(member) => member.role,
            None => {
                warn!(recipient = %recipient, "recipient unknown to roster, defaulting role token");
                self.member.role
            }
        };
        let subject = subject::agent_inbox(self.execution_id, role, recipient);
        self.publish_with_retry(BusMessage::agent(message.clone(), subject))
            .await
    }

    async fn publish_with_retry(&self, envelope: BusMessage) -> AgentResult<()> {
        let mut attempt = 0;
        loop {
            match self.bus.publish(envelope.clone()).await {
                Ok(_) => return Ok(()),
                Err(e @ BusError::Unavailable(_)) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(error = %e, attempt, "publish failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, ScriptedModel};
    use crate::session::MemorySessionStore;
    use squad_bus_core::InMemoryBus;
    use squad_types::SquadId;

    struct StaticRoster {
        members: Vec<SquadMember>,
    }

    #[async_trait::async_trait]
    impl Roster for StaticRoster {
        async fn member(&self, agent_id: AgentId) -> Option<SquadMember> {
            self.members.iter().find(|m| m.id == agent_id).cloned()
        }

        async fn first_with_role(&self, squad_id: SquadId, role: AgentRole) -> Option<SquadMember> {
            self.members
                .iter()
                .find(|m| m.squad_id == squad_id && m.role == role)
                .cloned()
        }
    }

    struct Rig {
        bus: Arc<InMemoryBus>,
        sessions: Arc<MemorySessionStore>,
        model: Arc<ScriptedModel>,
        roster: Arc<StaticRoster>,
        exec: ExecutionId,
        pm: SquadMember,
        dev: SquadMember,
    }

    fn rig() -> Rig {
        let squad_id = SquadId::new();
        let pm = SquadMember::new(
            squad_id,
            AgentRole::ProjectManager,
            "anthropic",
            "claude-sonnet",
            "You manage the squad.",
        );
        let dev = SquadMember::new(
            squad_id,
            AgentRole::BackendDeveloper,
            "anthropic",
            "claude-sonnet",
            "You write backend code.",
        );
        Rig {
            bus: Arc::new(InMemoryBus::with_defaults()),
            sessions: Arc::new(MemorySessionStore::new()),
            model: Arc::new(ScriptedModel::new()),
            roster: Arc::new(StaticRoster {
                members: vec![pm.clone(), dev.clone()],
            }),
            exec: ExecutionId::new(),
            pm,
            dev,
        }
    }

    fn worker(rig: &Rig, member: &SquadMember, session_id: Option<SessionId>) -> AgentWorker {
        AgentWorker::new(
            member.clone(),
            rig.exec,
            rig.bus.clone(),
            rig.roster.clone(),
            rig.sessions.clone(),
            rig.model.clone(),
            Arc::new(ToolRegistry::new()),
            session_id,
        )
    }

    #[tokio::test]
    async fn process_message_persists_the_exchange() {
        let rig = rig();
        rig.model.push("the endpoint returns 200").await;
        let agent = worker(&rig, &rig.dev, None);

        let reply = agent.process_message("status?", None, None).await.unwrap();
        assert_eq!(reply, "the endpoint returns 200");

        let session_id = agent.session_id().await.unwrap();
        let session = rig.sessions.load(session_id).await.unwrap().unwrap();
        assert_eq!(session.turns.len(), 2);
        assert_eq!(session.turns[0].content, "status?");
        assert_eq!(session.turns[1].content, "the endpoint returns 200");
    }

    #[tokio::test]
    async fn question_gets_an_answer_back_to_the_asker() {
        let rig = rig();
        rig.model.push("it listens on 8080").await;
        let agent = worker(&rig, &rig.dev, None);

        let mut pm_inbox = rig
            .bus
            .subscribe(subject::inbox_pattern(rig.exec, rig.pm.id), "pm-inbox")
            .await
            .unwrap();

        let question = AgentMessage::direct(
            rig.exec,
            rig.pm.id,
            rig.dev.id,
            MessageType::Question,
            "which port?",
        );
        agent.handle_inbox_message(&question).await.unwrap();

        let delivery = pm_inbox.next().await.unwrap();
        let answer = delivery.message.as_agent().unwrap();
        assert_eq!(answer.message_type, MessageType::Answer);
        assert_eq!(answer.content, "it listens on 8080");
        assert_eq!(answer.parent_message_id, Some(question.id));
        delivery.ack();
    }

    #[tokio::test]
    async fn redelivered_input_republishes_the_same_reply_once() {
        let rig = rig();
        rig.model.push("deploying now").await;
        let agent = worker(&rig, &rig.dev, None);

        let mut pm_inbox = rig
            .bus
            .subscribe(subject::inbox_pattern(rig.exec, rig.pm.id), "pm-inbox")
            .await
            .unwrap();

        let question = AgentMessage::direct(
            rig.exec,
            rig.pm.id,
            rig.dev.id,
            MessageType::Question,
            "deploy status?",
        );
        agent.handle_inbox_message(&question).await.unwrap();
        // The bus redelivers the same input after a missed ack.
        agent.handle_inbox_message(&question).await.unwrap();

        // Reasoned once, not twice.
        assert_eq!(rig.model.requests().await.len(), 1);

        let first = pm_inbox.next().await.unwrap();
        first.ack();
        assert!(pm_inbox.try_next().is_none());
    }

    #[tokio::test]
    async fn resumed_session_sees_prior_context() {
        let rig = rig();
        let agent = worker(&rig, &rig.dev, None);
        agent.process_message("remember: we use postgres", None, None).await.unwrap();
        let session_id = agent.session_id().await.unwrap();
        drop(agent);

        // Restart: a new worker resumes the same session.
        let resumed = worker(&rig, &rig.dev, Some(session_id));
        resumed.process_message("which database?", None, None).await.unwrap();

        let requests = rig.model.requests().await;
        let last = requests.last().unwrap();
        assert!(last
            .history
            .iter()
            .any(|turn| turn.content == "remember: we use postgres"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_persists_nothing() {
        struct Hanging;

        #[async_trait::async_trait]
        impl LanguageModel for Hanging {
            async fn complete(&self, _request: CompletionRequest) -> AgentResult<CompletionResponse> {
                std::future::pending().await
            }
        }

        let rig = rig();
        let agent = AgentWorker::new(
            rig.dev.clone(),
            rig.exec,
            rig.bus.clone(),
            rig.roster.clone(),
            rig.sessions.clone(),
            Arc::new(Hanging),
            Arc::new(ToolRegistry::new()),
            None,
        );

        let err = agent
            .process_message("hello?", None, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentRuntimeError::DeadlineExceeded));
        assert!(rig.sessions.is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_scope_subscribers() {
        let rig = rig();
        let agent = worker(&rig, &rig.pm, None);

        let mut observer = rig
            .bus
            .subscribe(
                subject::broadcast_pattern(rig.exec, BroadcastScope::Execution),
                "observer",
            )
            .await
            .unwrap();

        let id = agent
            .broadcast_message(
                BroadcastScope::Execution,
                "all acceptance criteria met",
                MessageType::TaskCompletion,
                Some(MessageMetadata::public()),
            )
            .await
            .unwrap();

        let delivery = observer.next().await.unwrap();
        assert_eq!(delivery.message.as_agent().unwrap().id, id);
        delivery.ack();
    }
}
