//! The stream broadcaster.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use squad_bus_core::{subject, BusMessage, BusPayload, MessageBus};
use squad_types::{
    AgentRole, ExecutionId, Roster, SquadId, StateChanged, SubscriberId, Visibility,
};

use crate::{Audience, StreamConfig, StreamEvent, StreamFrame, StreamScope};

//─────────────────────────────
//  Per-scope channel
//─────────────────────────────

struct ChannelState {
    next_id: u64,
    replay: VecDeque<StreamFrame>,
}

struct SubscriberHandle {
    audience: Audience,
    tx: mpsc::Sender<StreamFrame>,
    lagged: Arc<AtomicBool>,
}

struct ScopeChannel {
    buffer_size: usize,
    state: Mutex<ChannelState>,
    subscribers: DashMap<SubscriberId, SubscriberHandle>,
}

impl ScopeChannel {
    fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            state: Mutex::new(ChannelState {
                next_id: 1,
                replay: VecDeque::new(),
            }),
            subscribers: DashMap::new(),
        }
    }

    async fn emit(&self, event: StreamEvent, end_user_visible: bool) {
        let frame = {
            let mut state = self.state.lock().await;
            let frame = StreamFrame {
                id: state.next_id,
                event,
            };
            state.next_id += 1;
            state.replay.push_back(frame.clone());
            while state.replay.len() > self.buffer_size {
                state.replay.pop_front();
            }
            frame
        };

        let mut cut_off = Vec::new();
        for handle in self.subscribers.iter() {
            let is_message = matches!(frame.event, StreamEvent::Message(_));
            if is_message && handle.audience == Audience::EndUser && !end_user_visible {
                continue;
            }
            match handle.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    handle.lagged.store(true, Ordering::SeqCst);
                    cut_off.push(*handle.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    cut_off.push(*handle.key());
                }
            }
        }
        for subscriber_id in cut_off {
            debug!(subscriber_id = %subscriber_id, "subscriber cut off");
            self.subscribers.remove(&subscriber_id);
        }
    }

    async fn heartbeat(&self) {
        let id = {
            let state = self.state.lock().await;
            state.next_id.saturating_sub(1)
        };
        let frame = StreamFrame {
            id,
            event: StreamEvent::Heartbeat,
        };
        let mut cut_off = Vec::new();
        for handle in self.subscribers.iter() {
            match handle.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    handle.lagged.store(true, Ordering::SeqCst);
                    cut_off.push(*handle.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    cut_off.push(*handle.key());
                }
            }
        }
        for subscriber_id in cut_off {
            self.subscribers.remove(&subscriber_id);
        }
    }
}

//─────────────────────────────
//  Subscription handle
//─────────────────────────────

/// A live stream subscription.
pub struct StreamSubscription {
    subscriber_id: SubscriberId,
    rx: mpsc::Receiver<StreamFrame>,
    lagged: Arc<AtomicBool>,
    last_seen: u64,
    lag_reported: bool,
}

impl StreamSubscription {
    /// Identity assigned to this subscriber.
    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    /// Next frame, or `None` once the stream is closed.
    ///
    /// A subscriber that was cut off for lagging receives a final
    /// `error: lagged` frame before the close; the missing events must be
    /// re-fetched from the history store.
    pub async fn next(&mut self) -> Option<StreamFrame> {
        match self.rx.recv().await {
            Some(frame) => {
                self.last_seen = frame.id.max(self.last_seen);
                Some(frame)
            }
            None => {
                if self.lagged.load(Ordering::SeqCst) && !self.lag_reported {
                    self.lag_reported = true;
                    Some(StreamFrame {
                        id: self.last_seen,
                        event: StreamEvent::Error {
                            code: "lagged".to_string(),
                            message: "subscriber fell behind the event buffer".to_string(),
                        },
                    })
                } else {
                    None
                }
            }
        }
    }
}

//─────────────────────────────
//  The broadcaster
//─────────────────────────────

/// Multiplexes orchestration events into per-scope subscriber channels.
pub struct StreamBroadcaster {
    config: StreamConfig,
    roster: Arc<dyn Roster>,
    channels: DashMap<StreamScope, Arc<ScopeChannel>>,
    exec_squads: DashMap<ExecutionId, SquadId>,
}

impl StreamBroadcaster {
    /// Create a broadcaster with the given configuration.
    pub fn new(config: StreamConfig, roster: Arc<dyn Roster>) -> Self {
        Self {
            config,
            roster,
            channels: DashMap::new(),
            exec_squads: DashMap::new(),
        }
    }

    /// Record which squad runs an execution, so squad-scoped subscribers
    /// receive its events.
    pub fn register_execution(&self, execution_id: ExecutionId, squad_id: SquadId) {
        self.exec_squads.insert(execution_id, squad_id);
    }

    /// Attach a subscriber to a scope.
    ///
    /// With `since_id`, buffered frames after the cursor are delivered
    /// first; a cursor older than the replay ring immediately yields an
    /// `error: lagged` frame and a closed stream.
    pub async fn subscribe(
        &self,
        scope: StreamScope,
        audience: Audience,
        since_id: Option<u64>,
    ) -> StreamSubscription {
        let channel = self.channel(scope);
        let subscriber_id = SubscriberId::new();
        let lagged = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(self.config.buffer_size + 8);

        // Holding the channel state across replay and registration keeps a
        // concurrent emit from slipping frames between the two.
        let state = channel.state.lock().await;
        let last_id = state.next_id - 1;
        let _ = tx.try_send(StreamFrame {
            id: last_id,
            event: StreamEvent::Connected {
                subscriber_id,
                scope,
                since: since_id,
            },
        });

        if let Some(since) = since_id {
            let oldest_buffered = state.replay.front().map(|f| f.id);
            let gap = since < last_id
                && oldest_buffered.map(|oldest| oldest > since + 1).unwrap_or(true);
            if gap {
                // The cursor fell out of the buffer window; close after an
                // explicit lag signal so the client backfills from history.
                lagged.store(true, Ordering::SeqCst);
                drop(tx);
                return StreamSubscription {
                    subscriber_id,
                    rx,
                    lagged,
                    last_seen: since,
                    lag_reported: false,
                };
            }
            for frame in state.replay.iter().filter(|f| f.id > since) {
                let _ = tx.try_send(frame.clone());
            }
        }

        channel.subscribers.insert(
            subscriber_id,
            SubscriberHandle {
                audience,
                tx,
                lagged: Arc::clone(&lagged),
            },
        );
        drop(state);
        debug!(subscriber_id = %subscriber_id, ?scope, "stream subscriber attached");

        StreamSubscription {
            subscriber_id,
            rx,
            lagged,
            last_seen: since_id.unwrap_or(0),
            lag_reported: false,
        }
    }

    /// Detach a subscriber, releasing its buffer.
    pub fn unsubscribe(&self, scope: StreamScope, subscriber_id: SubscriberId) {
        if let Some(channel) = self.channels.get(&scope) {
            channel.subscribers.remove(&subscriber_id);
        }
    }

    /// Emit a free-form log entry on an execution scope.
    pub async fn publish_log(&self, execution_id: ExecutionId, entry: serde_json::Value) {
        self.fan_out(execution_id, StreamEvent::Log(entry), true).await;
    }

    /// Route one bus message into the appropriate scopes.
    pub async fn handle_bus_message(&self, message: &BusMessage) {
        match &message.payload {
            BusPayload::Agent(agent_message) => {
                let end_user_visible = self.end_user_visible(agent_message).await;
                self.fan_out(
                    agent_message.execution_id,
                    StreamEvent::Message(agent_message.clone()),
                    end_user_visible,
                )
                .await;
            }
            BusPayload::State(change) => self.handle_state_change(change).await,
            BusPayload::Conversation(notice) => {
                self.fan_out(
                    notice.execution_id,
                    StreamEvent::Conversation {
                        conversation_id: notice.conversation_id,
                        state: notice.state,
                        escalation_level: notice.escalation_level,
                    },
                    true,
                )
                .await;
            }
        }
    }

    async fn handle_state_change(&self, change: &StateChanged) {
        self.fan_out(
            change.execution_id,
            StreamEvent::StateChanged {
                execution_id: change.execution_id,
                from: change.from,
                to: change.to,
                progress_pct: change.progress_pct,
                actor_id: change.actor_id,
            },
            true,
        )
        .await;
        self.fan_out(
            change.execution_id,
            StreamEvent::Progress {
                execution_id: change.execution_id,
                progress_pct: change.progress_pct,
            },
            true,
        )
        .await;
        if change.to.is_terminal() {
            let outcome = match change.to {
                squad_types::WorkflowState::Completed => "completed",
                _ => "failed",
            };
            self.fan_out(
                change.execution_id,
                StreamEvent::Completed {
                    execution_id: change.execution_id,
                    outcome: outcome.to_string(),
                    completed_at: change.at,
                },
                true,
            )
            .await;
        }
    }

    /// Consume the bus and heartbeat until the bus closes.
    ///
    /// Subscriptions are created before the task starts, so no event
    /// published after this call returns can be missed.
    pub async fn spawn(
        self: Arc<Self>,
        bus: Arc<dyn MessageBus>,
    ) -> Result<tokio::task::JoinHandle<()>, squad_bus_core::BusError> {
        let mut messages = bus.subscribe(subject::all_messages(), "stream-messages").await?;
        let mut conversations = bus
            .subscribe(subject::all_conversations(), "stream-conversations")
            .await?;
        let mut states = bus
            .subscribe(subject::all_state_changes(), "stream-states")
            .await?;
        Ok(tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    delivery = messages.next() => match delivery {
                        Some(delivery) => {
                            self.handle_bus_message(&delivery.message).await;
                            delivery.ack();
                        }
                        None => break,
                    },
                    delivery = conversations.next() => match delivery {
                        Some(delivery) => {
                            self.handle_bus_message(&delivery.message).await;
                            delivery.ack();
                        }
                        None => break,
                    },
                    delivery = states.next() => match delivery {
                        Some(delivery) => {
                            self.handle_bus_message(&delivery.message).await;
                            delivery.ack();
                        }
                        None => break,
                    },
                    _ = heartbeat.tick() => self.send_heartbeats().await,
                }
            }
        }))
    }

    /// Send one heartbeat frame to every live subscriber.
    pub async fn send_heartbeats(&self) {
        let channels: Vec<Arc<ScopeChannel>> = self
            .channels
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect();
        for channel in channels {
            channel.heartbeat().await;
        }
    }

    async fn end_user_visible(&self, message: &squad_types::AgentMessage) -> bool {
        if message.metadata.visibility != Visibility::Public {
            return false;
        }
        match self.roster.member(message.sender_id).await {
            Some(member) => {
                matches!(member.role, AgentRole::ProjectManager | AgentRole::TechLead)
            }
            None => false,
        }
    }

    async fn fan_out(&self, execution_id: ExecutionId, event: StreamEvent, end_user_visible: bool) {
        self.channel(StreamScope::Execution(execution_id))
            .emit(event.clone(), end_user_visible)
            .await;
        if let Some(squad_id) = self.exec_squads.get(&execution_id).map(|s| *s) {
            self.channel(StreamScope::Squad(squad_id))
                .emit(event, end_user_visible)
                .await;
        } else {
            trace!(execution_id = %execution_id, "no squad registered for execution");
        }
    }

    fn channel(&self, scope: StreamScope) -> Arc<ScopeChannel> {
        self.channels
            .entry(scope)
            .or_insert_with(|| Arc::new(ScopeChannel::new(self.config.buffer_size)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squad_types::{
        AgentId, AgentMessage, MessageMetadata, MessageType, SquadMember, WorkflowState,
    };

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
        broadcaster: StreamBroadcaster,
        exec: ExecutionId,
        pm: SquadMember,
        dev: SquadMember,
    }

    fn rig(buffer_size: usize) -> Rig {
        let squad_id = SquadId::new();
        let pm = SquadMember::new(squad_id, AgentRole::ProjectManager, "anthropic", "m", "p");
        let dev = SquadMember::new(squad_id, AgentRole::BackendDeveloper, "anthropic", "m", "p");
        let roster = Arc::new(StaticRoster {
            members: vec![pm.clone(), dev.clone()],
        });
        let config = StreamConfig {
            buffer_size,
            ..StreamConfig::default()
        };
        let broadcaster = StreamBroadcaster::new(config, roster);
        let exec = ExecutionId::new();
        broadcaster.register_execution(exec, squad_id);
        Rig {
            broadcaster,
            exec,
            pm,
            dev,
        }
    }

    fn public_message(rig: &Rig, sender: AgentId, content: &str) -> BusMessage {
        let msg = AgentMessage::direct(rig.exec, sender, AgentId::new(), MessageType::StatusUpdate, content)
            .with_metadata(MessageMetadata::public());
        let subject = subject::agent_inbox(rig.exec, AgentRole::BackendDeveloper, AgentId::new());
        BusMessage::agent(msg, subject)
    }

    async fn expect_connected(sub: &mut StreamSubscription) {
        let frame = sub.next().await.unwrap();
        assert!(matches!(frame.event, StreamEvent::Connected { .. }));
    }

    #[tokio::test]
    async fn frames_arrive_in_order_with_increasing_ids() {
        let rig = rig(256);
        let mut sub = rig
            .broadcaster
            .subscribe(StreamScope::Execution(rig.exec), Audience::Operator, None)
            .await;
        expect_connected(&mut sub).await;

        for i in 0..5 {
            rig.broadcaster
                .handle_bus_message(&public_message(&rig, rig.pm.id, &format!("update {i}")))
                .await;
        }

        let mut last_id = 0;
        for i in 0..5 {
            let frame = sub.next().await.unwrap();
            assert!(frame.id > last_id);
            last_id = frame.id;
            match frame.event {
                StreamEvent::Message(msg) => assert_eq!(msg.content, format!("update {i}")),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn end_users_see_only_public_leadership_traffic() {
        let rig = rig(256);
        let mut end_user = rig
            .broadcaster
            .subscribe(StreamScope::Execution(rig.exec), Audience::EndUser, None)
            .await;
        expect_connected(&mut end_user).await;

        // Internal PM message: filtered.
        let internal = {
            let msg = AgentMessage::direct(
                rig.exec,
                rig.pm.id,
                rig.dev.id,
                MessageType::TaskAssignment,
                "implement the endpoint",
            );
            let subject = subject::agent_inbox(rig.exec, AgentRole::BackendDeveloper, rig.dev.id);
            BusMessage::agent(msg, subject)
        };
        rig.broadcaster.handle_bus_message(&internal).await;

        // Public developer message: filtered (wrong role).
        rig.broadcaster
            .handle_bus_message(&public_message(&rig, rig.dev.id, "dev says hi"))
            .await;

        // Public PM message: visible.
        rig.broadcaster
            .handle_bus_message(&public_message(&rig, rig.pm.id, "kickoff complete"))
            .await;

        let frame = end_user.next().await.unwrap();
        match frame.event {
            StreamEvent::Message(msg) => assert_eq!(msg.content, "kickoff complete"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_cut_off_with_lag_frame() {
        let rig = rig(4);
        let mut sub = rig
            .broadcaster
            .subscribe(StreamScope::Execution(rig.exec), Audience::Operator, None)
            .await;

        for i in 0..50 {
            rig.broadcaster
                .handle_bus_message(&public_message(&rig, rig.pm.id, &format!("burst {i}")))
                .await;
        }

        let mut saw_lag = false;
        while let Some(frame) = sub.next().await {
            if let StreamEvent::Error { code, .. } = &frame.event {
                assert_eq!(code, "lagged");
                saw_lag = true;
            }
        }
        assert!(saw_lag);
    }

    #[tokio::test]
    async fn since_id_replays_buffered_frames() {
        let rig = rig(256);
        for i in 0..6 {
            rig.broadcaster
                .handle_bus_message(&public_message(&rig, rig.pm.id, &format!("event {i}")))
                .await;
        }

        let mut sub = rig
            .broadcaster
            .subscribe(StreamScope::Execution(rig.exec), Audience::Operator, Some(3))
            .await;
        expect_connected(&mut sub).await;

        for expected in ["event 3", "event 4", "event 5"] {
            let frame = sub.next().await.unwrap();
            match frame.event {
                StreamEvent::Message(msg) => assert_eq!(msg.content, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn stale_cursor_yields_lag_and_close() {
        let rig = rig(4);
        for i in 0..20 {
            rig.broadcaster
                .handle_bus_message(&public_message(&rig, rig.pm.id, &format!("event {i}")))
                .await;
        }

        let mut sub = rig
            .broadcaster
            .subscribe(StreamScope::Execution(rig.exec), Audience::Operator, Some(1))
            .await;
        expect_connected(&mut sub).await;

        let frame = sub.next().await.unwrap();
        assert!(matches!(frame.event, StreamEvent::Error { .. }));
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn state_changes_produce_progress_and_completion() {
        let rig = rig(256);
        let mut sub = rig
            .broadcaster
            .subscribe(StreamScope::Execution(rig.exec), Audience::EndUser, None)
            .await;
        expect_connected(&mut sub).await;

        let change = StateChanged {
            execution_id: rig.exec,
            from: WorkflowState::Testing,
            to: WorkflowState::Completed,
            progress_pct: 100,
            actor_id: rig.pm.id,
            reason: None,
            at: squad_types::time::now_ms(),
        };
        rig.broadcaster
            .handle_bus_message(&BusMessage::state(change))
            .await;

        let kinds: Vec<StreamFrame> = vec![
            sub.next().await.unwrap(),
            sub.next().await.unwrap(),
            sub.next().await.unwrap(),
        ];
        assert!(matches!(kinds[0].event, StreamEvent::StateChanged { to: WorkflowState::Completed, .. }));
        assert!(matches!(kinds[1].event, StreamEvent::Progress { progress_pct: 100, .. }));
        assert!(matches!(kinds[2].event, StreamEvent::Completed { .. }));
    }

    #[tokio::test]
    async fn squad_scope_receives_execution_events() {
        let rig = rig(256);
        let squad_id = rig.pm.squad_id;
        let mut sub = rig
            .broadcaster
            .subscribe(StreamScope::Squad(squad_id), Audience::Operator, None)
            .await;
        expect_connected(&mut sub).await;

        rig.broadcaster
            .handle_bus_message(&public_message(&rig, rig.pm.id, "squad-visible"))
            .await;

        let frame = sub.next().await.unwrap();
        assert!(matches!(frame.event, StreamEvent::Message(_)));
    }

    #[tokio::test]
    async fn heartbeats_reach_idle_subscribers() {
        let rig = rig(256);
        let mut sub = rig
            .broadcaster
            .subscribe(StreamScope::Execution(rig.exec), Audience::Operator, None)
            .await;
        expect_connected(&mut sub).await;

        rig.broadcaster.send_heartbeats().await;
        let frame = sub.next().await.unwrap();
        assert!(matches!(frame.event, StreamEvent::Heartbeat));
    }
}
