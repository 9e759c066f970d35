//! The conversation tracker.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use squad_bus_core::{subject, BusMessage, MessageBus};
use squad_types::time::now_ms;
use squad_types::{
    AgentId, AgentMessage, BroadcastScope, Conversation, ConversationEvent,
    ConversationEventKind, ConversationId, ConversationNotice, ConversationState, MessageFlags,
    MessageId, MessageType, SquadMember,
};

use crate::{ConversationConfig, ConversationError, ConversationResult, ConversationStore, Roster};

/// Deadline assigned once a conversation is parked on human intervention;
/// only an answer, a cancel or an operator closes it from there.
const PARKED_DAYS: i64 = 365;

/// Tracks every question flowing over the bus and drives its lifecycle.
pub struct ConversationTracker {
    store: Arc<dyn ConversationStore>,
    bus: Arc<dyn MessageBus>,
    roster: Arc<dyn Roster>,
    config: ConversationConfig,
    // Original question bodies, kept so escalation re-delivery can repeat
    // the question verbatim. Best-effort: lost on restart, in which case
    // the re-delivery references the original message id instead.
    question_bodies: DashMap<ConversationId, String>,
}

impl ConversationTracker {
    /// Create a tracker over the given store, bus and roster.
    pub fn new(
        store: Arc<dyn ConversationStore>,
        bus: Arc<dyn MessageBus>,
        roster: Arc<dyn Roster>,
        config: ConversationConfig,
    ) -> Self {
        Self {
            store,
            bus,
            roster,
            config,
            question_bodies: DashMap::new(),
        }
    }

    /// The store backing this tracker.
    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Run the tracker: consume the message firehose and sweep deadlines.
    ///
    /// The firehose subscription is created before the task starts, so no
    /// question published after this call returns can be missed.
    pub async fn spawn(
        self: Arc<Self>,
    ) -> Result<tokio::task::JoinHandle<()>, squad_bus_core::BusError> {
        let mut sub = self
            .bus
            .subscribe(subject::all_messages(), "conversation-tracker")
            .await?;
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    delivery = sub.next() => match delivery {
                        Some(delivery) => {
                            if let Some(message) = delivery.message.as_agent() {
                                if let Err(e) = self.observe(message).await {
                                    warn!(error = %e, message_id = %message.id, "conversation tracking failed");
                                }
                            }
                            delivery.ack();
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "conversation sweep failed");
                        }
                    }
                }
            }
        }))
    }

    //───────────────────── message handling ─────────────────────

    /// Feed one published message through the lifecycle rules.
    pub async fn observe(&self, message: &AgentMessage) -> ConversationResult<()> {
        if message.is_question() && !message.flags.follow_up && !message.flags.escalation {
            return self.open_conversation(message).await;
        }

        if message.message_type == MessageType::Answer {
            if let Some(conversation) = self.conversation_for_answer(message).await? {
                if conversation.state.is_terminal() {
                    return Ok(());
                }
                return self.close_answered(conversation, message).await;
            }
        }

        if message.message_type != MessageType::Question {
            if let Some(conversation) = self.match_acknowledgment(message).await? {
                return self.acknowledge(conversation, message).await;
            }
        }

        Ok(())
    }

    async fn open_conversation(&self, message: &AgentMessage) -> ConversationResult<()> {
        // Broadcast questions have no single responder to hold to a
        // deadline; they are not tracked.
        let Some(responder) = message.recipient_id else {
            return Ok(());
        };
        if self
            .store
            .find_by_initial_message(message.execution_id, message.id)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let deadline =
            now_ms() + chrono::Duration::from_std(self.config.ack_timeout).unwrap_or_default();
        let conversation = Conversation::open(
            message.execution_id,
            message.id,
            message.sender_id,
            responder,
            deadline,
        );
        let created = ConversationEvent::record(
            conversation.id,
            ConversationEventKind::Created,
            None,
            ConversationState::Initiated,
        )
        .with_message(message.id)
        .by_agent(message.sender_id);

        self.store.insert(conversation.clone(), created).await?;
        self.question_bodies
            .insert(conversation.id, message.content.clone());
        info!(
            conversation_id = %conversation.id,
            asker = %conversation.asker_id,
            responder = %responder,
            "conversation opened"
        );
        self.notify(&conversation).await;
        Ok(())
    }

    async fn conversation_for_answer(
        &self,
        message: &AgentMessage,
    ) -> ConversationResult<Option<Conversation>> {
        if let Some(id) = message.conversation_id {
            if let Some(conversation) = self.store.get(id).await? {
                return Ok(Some(conversation));
            }
        }
        if let Some(parent) = message.parent_message_id {
            return self
                .store
                .find_by_initial_message(message.execution_id, parent)
                .await;
        }
        Ok(None)
    }

    async fn match_acknowledgment(
        &self,
        message: &AgentMessage,
    ) -> ConversationResult<Option<Conversation>> {
        let Some(recipient) = message.recipient_id else {
            return Ok(None);
        };
        if let Some(id) = message.conversation_id {
            if let Some(conversation) = self.store.get(id).await? {
                if conversation.state == ConversationState::Initiated {
                    return Ok(Some(conversation));
                }
                return Ok(None);
            }
        }
        Ok(self
            .store
            .open_conversations()
            .await?
            .into_iter()
            .find(|c| {
                c.state == ConversationState::Initiated
                    && c.execution_id == message.execution_id
                    && c.asker_id == recipient
                    && c.current_responder_id == message.sender_id
            }))
    }

    async fn acknowledge(
        &self,
        conversation: Conversation,
        message: &AgentMessage,
    ) -> ConversationResult<()> {
        let deadline =
            now_ms() + chrono::Duration::from_std(self.config.answer_timeout).unwrap_or_default();
        let sender = message.sender_id;
        self.apply(
            conversation,
            ConversationEventKind::Acknowledged,
            ConversationState::Waiting,
            Some(message.id),
            Some(sender),
            |c| {
                c.acked_at = Some(now_ms());
                c.deadline_at = deadline;
            },
        )
        .await?;
        Ok(())
    }

    async fn close_answered(
        &self,
        conversation: Conversation,
        message: &AgentMessage,
    ) -> ConversationResult<()> {
        let id = conversation.id;
        let sender = message.sender_id;
        self.apply(
            conversation,
            ConversationEventKind::Answered,
            ConversationState::Answered,
            Some(message.id),
            Some(sender),
            |_| {},
        )
        .await?;
        self.question_bodies.remove(&id);
        info!(conversation_id = %id, "conversation answered");
        Ok(())
    }

    /// Cancel a non-terminal conversation on behalf of its asker.
    pub async fn cancel(
        &self,
        conversation_id: ConversationId,
        by: AgentId,
    ) -> ConversationResult<()> {
        let conversation = self
            .store
            .get(conversation_id)
            .await?
            .ok_or(ConversationError::UnknownConversation(conversation_id))?;
        if conversation.state.is_terminal() {
            return Err(ConversationError::AlreadyClosed(conversation_id));
        }
        if conversation.asker_id != by {
            return Err(ConversationError::NotAsker {
                conversation_id,
                agent_id: by,
            });
        }
        self.apply(
            conversation,
            ConversationEventKind::Cancelled,
            ConversationState::Cancelled,
            None,
            Some(by),
            |_| {},
        )
        .await?;
        self.question_bodies.remove(&conversation_id);
        Ok(())
    }

    //───────────────────── deadline sweeping ─────────────────────

    /// Drive every overdue conversation one step along its lifecycle.
    pub async fn sweep(&self) -> ConversationResult<()> {
        let now = now_ms();
        for conversation in self.store.open_conversations().await? {
            if conversation.deadline_at > now {
                continue;
            }
            let outcome = match conversation.state {
                ConversationState::Initiated | ConversationState::Waiting => {
                    self.handle_timeout(conversation).await
                }
                ConversationState::FollowUp | ConversationState::Escalated => {
                    self.escalate(conversation).await
                }
                // Transient states left behind by an interrupted sweep.
                ConversationState::Timeout => self.after_timeout(conversation).await,
                ConversationState::Escalating => self.select_target(conversation).await,
                _ => Ok(()),
            };
            if let Err(ConversationError::VersionConflict { conversation_id, .. }) = &outcome {
                // A concurrent writer (e.g. an answer) advanced the row; the
                // next sweep re-reads it.
                debug!(conversation_id = %conversation_id, "sweep lost a race, skipping");
                continue;
            }
            outcome?;
        }
        Ok(())
    }

    async fn handle_timeout(&self, conversation: Conversation) -> ConversationResult<()> {
        let timed_out = self
            .apply(
                conversation,
                ConversationEventKind::TimedOut,
                ConversationState::Timeout,
                None,
                None,
                |_| {},
            )
            .await?;
        self.after_timeout(timed_out).await
    }

    async fn after_timeout(&self, conversation: Conversation) -> ConversationResult<()> {
        if conversation.follow_ups_sent < self.config.max_follow_ups {
            self.send_follow_up(conversation).await
        } else {
            self.escalate(conversation).await
        }
    }

    async fn send_follow_up(&self, conversation: Conversation) -> ConversationResult<()> {
        let body = self
            .question_bodies
            .get(&conversation.id)
            .map(|b| b.clone())
            .unwrap_or_default();
        let content = if body.is_empty() {
            "Following up: the earlier question is still awaiting your response.".to_string()
        } else {
            format!("Following up on an unanswered question: {body}")
        };

        let follow_up = AgentMessage::direct(
            conversation.execution_id,
            conversation.asker_id,
            conversation.current_responder_id,
            MessageType::Question,
            content,
        )
        .in_conversation(conversation.id)
        .replying_to(conversation.initial_message_id)
        .with_flags(MessageFlags {
            follow_up: true,
            ..MessageFlags::default()
        });
        let follow_up_id = follow_up.id;
        self.deliver_to(&follow_up, conversation.current_responder_id)
            .await;

        let deadline =
            now_ms() + chrono::Duration::from_std(self.config.answer_timeout).unwrap_or_default();
        self.apply(
            conversation,
            ConversationEventKind::FollowUpSent,
            ConversationState::FollowUp,
            Some(follow_up_id),
            None,
            |c| {
                c.follow_ups_sent += 1;
                c.deadline_at = deadline;
            },
        )
        .await?;
        Ok(())
    }

    async fn escalate(&self, conversation: Conversation) -> ConversationResult<()> {
        let escalating = self
            .apply(
                conversation,
                ConversationEventKind::EscalationStarted,
                ConversationState::Escalating,
                None,
                None,
                |c| {
                    c.escalation_level += 1;
                },
            )
            .await?;
        self.select_target(escalating).await
    }

    async fn select_target(&self, conversation: Conversation) -> ConversationResult<()> {
        if conversation.escalation_level >= self.config.max_escalation {
            return self.request_human_intervention(conversation).await;
        }
        match self.next_responder(&conversation).await {
            Some(target) => self.redeliver_to(conversation, target).await,
            None => self.request_human_intervention(conversation).await,
        }
    }

    async fn next_responder(&self, conversation: &Conversation) -> Option<SquadMember> {
        let current = self.roster.member(conversation.current_responder_id).await?;
        let mut role = current.role.escalation_target();
        while let Some(candidate_role) = role {
            if let Some(member) = self
                .roster
                .first_with_role(current.squad_id, candidate_role)
                .await
            {
                if member.id != conversation.asker_id {
                    return Some(member);
                }
            }
            role = candidate_role.escalation_target();
        }
        None
    }

    async fn redeliver_to(
        &self,
        conversation: Conversation,
        target: SquadMember,
    ) -> ConversationResult<()> {
        let body = self
            .question_bodies
            .get(&conversation.id)
            .map(|b| b.clone())
            .unwrap_or_else(|| {
                format!(
                    "An unanswered question (message {}) has been escalated to you.",
                    conversation.initial_message_id
                )
            });
        let redelivery = AgentMessage::direct(
            conversation.execution_id,
            conversation.asker_id,
            target.id,
            MessageType::Question,
            body,
        )
        .in_conversation(conversation.id)
        .replying_to(conversation.initial_message_id)
        .with_flags(MessageFlags {
            escalation: true,
            ..MessageFlags::default()
        });
        let redelivery_id = redelivery.id;
        self.deliver_to(&redelivery, target.id).await;

        let deadline =
            now_ms() + chrono::Duration::from_std(self.config.answer_timeout).unwrap_or_default();
        let target_id = target.id;
        let updated = self
            .apply(
                conversation,
                ConversationEventKind::Escalated,
                ConversationState::Escalated,
                Some(redelivery_id),
                None,
                |c| {
                    c.current_responder_id = target_id;
                    c.deadline_at = deadline;
                },
            )
            .await?;
        info!(
            conversation_id = %updated.id,
            responder = %target_id,
            level = updated.escalation_level,
            "question escalated"
        );
        Ok(())
    }

    async fn request_human_intervention(
        &self,
        conversation: Conversation,
    ) -> ConversationResult<()> {
        let notice = AgentMessage::broadcast(
            conversation.execution_id,
            conversation.asker_id,
            BroadcastScope::Execution,
            MessageType::HumanInterventionRequired,
            format!(
                "Question {} remains unanswered after {} escalation(s); human intervention required.",
                conversation.initial_message_id, conversation.escalation_level
            ),
        )
        .in_conversation(conversation.id)
        .replying_to(conversation.initial_message_id)
        .with_flags(MessageFlags {
            escalation: true,
            ..MessageFlags::default()
        });
        let notice_id = notice.id;
        let subject = subject::broadcast(conversation.execution_id, BroadcastScope::Execution);
        if let Err(e) = self.bus.publish(BusMessage::agent(notice, subject)).await {
            warn!(error = %e, "human intervention notice could not be published");
        }

        let parked = now_ms() + chrono::Duration::days(PARKED_DAYS);
        let updated = self
            .apply(
                conversation,
                ConversationEventKind::HumanInterventionRequested,
                ConversationState::Escalated,
                Some(notice_id),
                None,
                |c| {
                    c.deadline_at = parked;
                },
            )
            .await?;
        warn!(
            conversation_id = %updated.id,
            level = updated.escalation_level,
            "conversation parked on human intervention"
        );
        Ok(())
    }

    //───────────────────── plumbing ─────────────────────

    async fn deliver_to(&self, message: &AgentMessage, recipient: AgentId) {
        let Some(member) = self.roster.member(recipient).await else {
            warn!(recipient = %recipient, "recipient unknown to roster, message not sent");
            return;
        };
        let subject = subject::agent_inbox(message.execution_id, member.role, recipient);
        if let Err(e) = self
            .bus
            .publish(BusMessage::agent(message.clone(), subject))
            .await
        {
            warn!(error = %e, recipient = %recipient, "tracker message publication failed");
        }
    }

    async fn apply(
        &self,
        mut conversation: Conversation,
        kind: ConversationEventKind,
        to: ConversationState,
        message_id: Option<MessageId>,
        by: Option<AgentId>,
        mutate: impl FnOnce(&mut Conversation),
    ) -> ConversationResult<Conversation> {
        let expected = conversation.version;
        let from = conversation.state;
        conversation.state = to;
        mutate(&mut conversation);
        if to.is_terminal() {
            conversation.closed_at = Some(now_ms());
        }

        let mut event = ConversationEvent::record(conversation.id, kind, Some(from), to);
        if let Some(message_id) = message_id {
            event = event.with_message(message_id);
        }
        if let Some(agent_id) = by {
            event = event.by_agent(agent_id);
        }

        self.store
            .transition(conversation.clone(), expected, event)
            .await?;
        conversation.version = expected + 1;
        self.notify(&conversation).await;
        Ok(conversation)
    }

    async fn notify(&self, conversation: &Conversation) {
        let notice = ConversationNotice {
            execution_id: conversation.execution_id,
            conversation_id: conversation.id,
            state: conversation.state,
            escalation_level: conversation.escalation_level,
            current_responder_id: conversation.current_responder_id,
            at: now_ms(),
        };
        if let Err(e) = self.bus.publish(BusMessage::conversation(notice)).await {
            warn!(error = %e, conversation_id = %conversation.id, "conversation notice publication failed");
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryConversationStore;
    use squad_bus_core::InMemoryBus;
    use squad_types::{AgentRole, ExecutionId, SquadId};

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
        tracker: Arc<ConversationTracker>,
        bus: Arc<InMemoryBus>,
        exec: ExecutionId,
        pm: SquadMember,
        tl: SquadMember,
        dev: SquadMember,
    }

    fn member(squad_id: SquadId, role: AgentRole) -> SquadMember {
        SquadMember::new(squad_id, role, "anthropic", "claude-sonnet", "prompt")
    }

    fn rig(config: ConversationConfig) -> Rig {
        let squad_id = SquadId::new();
        let pm = member(squad_id, AgentRole::ProjectManager);
        let tl = member(squad_id, AgentRole::TechLead);
        let dev = member(squad_id, AgentRole::BackendDeveloper);
        let roster = Arc::new(StaticRoster {
            members: vec![pm.clone(), tl.clone(), dev.clone()],
        });
        let bus = Arc::new(InMemoryBus::with_defaults());
        let tracker = Arc::new(ConversationTracker::new(
            Arc::new(MemoryConversationStore::new()),
            bus.clone(),
            roster,
            config,
        ));
        Rig {
            tracker,
            bus,
            exec: ExecutionId::new(),
            pm,
            tl,
            dev,
        }
    }

    fn question(rig: &Rig) -> AgentMessage {
        AgentMessage::direct(
            rig.exec,
            rig.pm.id,
            rig.dev.id,
            MessageType::Question,
            "is the migration ready?",
        )
    }

    async fn sole_conversation(rig: &Rig) -> Conversation {
        let open = rig.tracker.store().open_conversations().await.unwrap();
        assert_eq!(open.len(), 1);
        open.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn question_opens_conversation() {
        let rig = rig(ConversationConfig::default());
        rig.tracker.observe(&question(&rig)).await.unwrap();

        let conversation = sole_conversation(&rig).await;
        assert_eq!(conversation.state, ConversationState::Initiated);
        assert_eq!(conversation.asker_id, rig.pm.id);
        assert_eq!(conversation.current_responder_id, rig.dev.id);
        assert_eq!(conversation.escalation_level, 0);
    }

    #[tokio::test]
    async fn reply_acknowledges_and_answer_closes() {
        let rig = rig(ConversationConfig::default());
        let q = question(&rig);
        rig.tracker.observe(&q).await.unwrap();

        let ack = AgentMessage::direct(
            rig.exec,
            rig.dev.id,
            rig.pm.id,
            MessageType::StatusUpdate,
            "looking into it",
        );
        rig.tracker.observe(&ack).await.unwrap();
        let conversation = sole_conversation(&rig).await;
        assert_eq!(conversation.state, ConversationState::Waiting);
        assert!(conversation.acked_at.is_some());

        let answer = AgentMessage::direct(
            rig.exec,
            rig.dev.id,
            rig.pm.id,
            MessageType::Answer,
            "yes, merged this morning",
        )
        .replying_to(q.id);
        rig.tracker.observe(&answer).await.unwrap();

        let closed = rig
            .tracker
            .store()
            .get(conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.state, ConversationState::Answered);
        assert!(closed.closed_at.is_some());
        closed.validate().unwrap();

        let kinds: Vec<_> = rig
            .tracker
            .store()
            .events(conversation.id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ConversationEventKind::Created,
                ConversationEventKind::Acknowledged,
                ConversationEventKind::Answered,
            ]
        );
    }

    /// Conversation timers are wall-clock driven, so timeout tests run with
    /// short real deadlines rather than the paused tokio clock.
    fn fast_config(max_follow_ups: u32) -> ConversationConfig {
        ConversationConfig {
            ack_timeout: std::time::Duration::from_millis(40),
            answer_timeout: std::time::Duration::from_millis(40),
            max_follow_ups,
            ..ConversationConfig::default()
        }
    }

    async fn past_deadline() {
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn silent_responder_gets_follow_up_then_escalation() {
        let rig = rig(fast_config(1));
        let mut dev_inbox = rig
            .bus
            .subscribe(subject::inbox_pattern(rig.exec, rig.dev.id), "dev-inbox")
            .await
            .unwrap();
        let mut tl_inbox = rig
            .bus
            .subscribe(subject::inbox_pattern(rig.exec, rig.tl.id), "tl-inbox")
            .await
            .unwrap();

        rig.tracker.observe(&question(&rig)).await.unwrap();

        // Past the ack timeout: one synthetic follow-up to the developer.
        past_deadline().await;
        rig.tracker.sweep().await.unwrap();
        let conversation = sole_conversation(&rig).await;
        assert_eq!(conversation.state, ConversationState::FollowUp);
        assert_eq!(conversation.follow_ups_sent, 1);

        let follow_up = dev_inbox.next().await.unwrap();
        let msg = follow_up.message.as_agent().unwrap();
        assert!(msg.flags.follow_up);
        assert_eq!(msg.sender_id, rig.pm.id);
        follow_up.ack();

        // Past the answer timeout: escalated to the tech lead.
        past_deadline().await;
        rig.tracker.sweep().await.unwrap();
        let conversation = sole_conversation(&rig).await;
        assert_eq!(conversation.state, ConversationState::Escalated);
        assert_eq!(conversation.escalation_level, 1);
        assert_eq!(conversation.current_responder_id, rig.tl.id);

        let redelivery = tl_inbox.next().await.unwrap();
        let msg = redelivery.message.as_agent().unwrap();
        assert!(msg.flags.escalation);
        assert_eq!(msg.content, "is the migration ready?");
        redelivery.ack();
    }

    #[tokio::test]
    async fn exhausted_ladder_requests_human_intervention() {
        let rig = rig(fast_config(1));
        let mut broadcast = rig
            .bus
            .subscribe(
                subject::broadcast_pattern(rig.exec, BroadcastScope::Execution),
                "observer",
            )
            .await
            .unwrap();

        rig.tracker.observe(&question(&rig)).await.unwrap();

        // Dev silent -> follow-up -> escalated to TL -> TL silent -> human.
        past_deadline().await;
        rig.tracker.sweep().await.unwrap();
        past_deadline().await;
        rig.tracker.sweep().await.unwrap();
        past_deadline().await;
        rig.tracker.sweep().await.unwrap();

        let conversation = sole_conversation(&rig).await;
        assert_eq!(conversation.escalation_level, 2);

        let delivery = broadcast.next().await.unwrap();
        let msg = delivery.message.as_agent().unwrap();
        assert_eq!(msg.message_type, MessageType::HumanInterventionRequired);
        delivery.ack();

        // Parked: no further escalation on subsequent sweeps.
        past_deadline().await;
        rig.tracker.sweep().await.unwrap();
        let parked = sole_conversation(&rig).await;
        assert_eq!(parked.escalation_level, 2);
    }

    #[tokio::test]
    async fn zero_follow_ups_escalates_from_first_timeout() {
        let rig = rig(fast_config(0));
        rig.tracker.observe(&question(&rig)).await.unwrap();

        past_deadline().await;
        rig.tracker.sweep().await.unwrap();

        let conversation = sole_conversation(&rig).await;
        assert_eq!(conversation.state, ConversationState::Escalated);
        assert_eq!(conversation.follow_ups_sent, 0);
        assert_eq!(conversation.current_responder_id, rig.tl.id);
    }

    #[tokio::test]
    async fn only_the_asker_may_cancel() {
        let rig = rig(ConversationConfig::default());
        rig.tracker.observe(&question(&rig)).await.unwrap();
        let conversation = sole_conversation(&rig).await;

        let err = rig
            .tracker
            .cancel(conversation.id, rig.dev.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ConversationError::NotAsker { .. }));

        rig.tracker.cancel(conversation.id, rig.pm.id).await.unwrap();
        let cancelled = rig
            .tracker
            .store()
            .get(conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.state, ConversationState::Cancelled);
        assert!(cancelled.closed_at.is_some());
    }

    #[tokio::test]
    async fn follow_up_questions_do_not_spawn_conversations() {
        let rig = rig(ConversationConfig::default());
        rig.tracker.observe(&question(&rig)).await.unwrap();

        let synthetic = AgentMessage::direct(
            rig.exec,
            rig.pm.id,
            rig.dev.id,
            MessageType::Question,
            "still there?",
        )
        .with_flags(MessageFlags {
            follow_up: true,
            ..MessageFlags::default()
        });
        rig.tracker.observe(&synthetic).await.unwrap();

        assert_eq!(rig.tracker.store().open_conversations().await.unwrap().len(), 1);
    }
}
