//! Client Event Loop
//!
//! Eine einzige Task besitzt Session, Raum und Anrufsteuerung und wartet
//! gleichzeitig auf drei Quellen:
//!
//! ```text
//!  RoomClient ──Command──►┐
//!  Transport ──Event─────►├─ tokio::select! ──► Handler ──► ClientEvent
//!  Scheduler ──Wakeup────►┘
//! ```
//!
//! Handler geben ihre Folgen als Werte zurück (`SessionEvent`,
//! `RoomAction`, `CallEvent`); der Loop führt sie nacheinander aus.
//! Erstellen, Beitreten und `retry_on` warten nicht im Loop: die Antwort
//! wird gemerkt und gesendet, sobald die Session ihr Ergebnis meldet.

use super::handle::{ClientError, ClientEvent};
use crate::call::{CallController, CallEvent, CallState};
use crate::config::ClientConfig;
use crate::protocol::AppMessage;
use crate::room::{MessageHistoryEntry, RoomAction, RoomCode, RoomDirectory, RoomMember};
use crate::session::{ConnectivityState, Role, SessionError, SessionEvent, SessionOrchestrator};
use crate::storage::{save_display_name, KeyValueStore, NameCache};
use crate::timer::{Scheduler, TimerHandle, Wakeup};
use crate::transport::LinkMetadata;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Versuche mit neuem Code, wenn ein Raum-Code schon vergeben ist
const CREATE_ATTEMPTS: usize = 3;

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// COMMANDS
// ============================================================================

/// Aufträge eines `RoomClient` an den Loop
pub(crate) enum Command {
    CreateRoom { reply: Reply<RoomCode> },
    JoinRoom { code: RoomCode, reply: Reply<()> },
    SendText { text: String, reply: Reply<()> },
    SendVoice {
        audio: Vec<u8>,
        duration_secs: u32,
        reply: Reply<()>,
    },
    ChangeName { name: String, reply: Reply<String> },
    Members { reply: oneshot::Sender<Vec<RoomMember>> },
    History {
        limit: usize,
        reply: oneshot::Sender<Vec<MessageHistoryEntry>>,
    },
    LocalId { reply: oneshot::Sender<Option<String>> },
    StartCall { peer_id: String, reply: Reply<()> },
    AcceptCall { reply: Reply<()> },
    RejectCall { reply: Reply<()> },
    HangUp { reply: Reply<()> },
    CallState { reply: oneshot::Sender<CallState> },
    Connectivity { reply: oneshot::Sender<ConnectivityState> },
    PendingTimers { reply: oneshot::Sender<usize> },
    Retry { reply: Reply<()> },
    RetryOn { index: usize, reply: Reply<()> },
    Disconnect { reply: oneshot::Sender<()> },
    Shutdown,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::CreateRoom { .. } => "CreateRoom",
            Command::JoinRoom { .. } => "JoinRoom",
            Command::SendText { .. } => "SendText",
            Command::SendVoice { .. } => "SendVoice",
            Command::ChangeName { .. } => "ChangeName",
            Command::Members { .. } => "Members",
            Command::History { .. } => "History",
            Command::LocalId { .. } => "LocalId",
            Command::StartCall { .. } => "StartCall",
            Command::AcceptCall { .. } => "AcceptCall",
            Command::RejectCall { .. } => "RejectCall",
            Command::HangUp { .. } => "HangUp",
            Command::CallState { .. } => "CallState",
            Command::Connectivity { .. } => "Connectivity",
            Command::PendingTimers { .. } => "PendingTimers",
            Command::Retry { .. } => "Retry",
            Command::RetryOn { .. } => "RetryOn",
            Command::Disconnect { .. } => "Disconnect",
            Command::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Erstellen oder Beitreten, das auf die Session wartet
pub(crate) enum Entry {
    Create {
        code: RoomCode,
        attempt: usize,
        reply: Reply<RoomCode>,
    },
    Join {
        code: RoomCode,
        reply: Reply<()>,
    },
}

impl Entry {
    fn cancel(self) {
        match self {
            Entry::Create { reply, .. } => {
                let _ = reply.send(Err(ClientError::Cancelled));
            }
            Entry::Join { reply, .. } => {
                let _ = reply.send(Err(ClientError::Cancelled));
            }
        }
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

pub(crate) struct EventLoop {
    pub(crate) config: ClientConfig,
    pub(crate) session: SessionOrchestrator,
    pub(crate) calls: CallController,
    pub(crate) scheduler: Scheduler,
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) display_name: String,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) room: Option<RoomDirectory>,
    pub(crate) sweep_timer: Option<TimerHandle>,
    pub(crate) last_state: ConnectivityState,
    pub(crate) entry: Option<Entry>,
    pub(crate) retry_reply: Option<Reply<()>>,
}

impl EventLoop {
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut wakeups: mpsc::UnboundedReceiver<Wakeup>,
    ) {
        tracing::info!("Client event loop starting as '{}'", self.display_name);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown) => {
                            tracing::info!("Shutdown requested");
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            tracing::info!("All client handles dropped");
                            break;
                        }
                    }
                }

                input = self.session.next_input() => {
                    tracing::debug!("Session input: {:?}", input);
                    let events = self.session.handle_input(input);
                    self.dispatch(events).await;
                }

                Some(wakeup) = wakeups.recv() => {
                    self.handle_wakeup(wakeup).await;
                }
            }
            self.publish_connectivity();
        }

        self.leave_room(true).await;
        self.publish_connectivity();
        tracing::info!("Client event loop stopped");
    }

    fn publish(&self, event: ClientEvent) {
        // Ohne Abonnenten geht das Event verloren
        let _ = self.events.send(event);
    }

    fn publish_calls(&self, events: Vec<CallEvent>) {
        for event in events {
            self.publish(ClientEvent::Call(event));
        }
    }

    fn publish_connectivity(&mut self) {
        let state = self.session.state();
        if state != self.last_state {
            self.last_state = state;
            self.publish(ClientEvent::Connectivity(state));
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        tracing::debug!("Handling command {:?}", command);

        match command {
            Command::CreateRoom { reply } => self.create_room(reply).await,
            Command::JoinRoom { code, reply } => self.join_room(code, reply).await,
            Command::SendText { text, reply } => {
                let result = match self.room.as_mut() {
                    Some(room) => room.send_text(&text, now_millis()).map_err(ClientError::from),
                    None => Err(ClientError::NotInRoom),
                };
                let _ = reply.send(result.map(|actions| self.run_actions(actions)));
            }
            Command::SendVoice {
                audio,
                duration_secs,
                reply,
            } => {
                let result = match self.room.as_mut() {
                    Some(room) => room
                        .send_voice(&audio, duration_secs, now_millis())
                        .map_err(ClientError::from),
                    None => Err(ClientError::NotInRoom),
                };
                let _ = reply.send(result.map(|actions| self.run_actions(actions)));
            }
            Command::ChangeName { name, reply } => {
                let result = self.change_name(&name);
                let _ = reply.send(result);
            }
            Command::Members { reply } => {
                let members = self.room.as_ref().map(|r| r.members()).unwrap_or_default();
                let _ = reply.send(members);
            }
            Command::History { limit, reply } => {
                let history = self
                    .room
                    .as_ref()
                    .map(|r| r.history(limit))
                    .unwrap_or_default();
                let _ = reply.send(history);
            }
            Command::LocalId { reply } => {
                let _ = reply.send(self.session.local_id());
            }
            Command::StartCall { peer_id, reply } => {
                let result = match self.session.session_handle() {
                    Some(session) => self
                        .calls
                        .start_call(session, &peer_id)
                        .await
                        .map_err(ClientError::from),
                    None => Err(ClientError::NotInRoom),
                };
                let _ = reply.send(result.map(|events| self.publish_calls(events)));
            }
            Command::AcceptCall { reply } => {
                let result = self.calls.accept().await.map_err(ClientError::from);
                let _ = reply.send(result.map(|events| self.publish_calls(events)));
            }
            Command::RejectCall { reply } => {
                let result = self.calls.reject().map_err(ClientError::from);
                let _ = reply.send(result.map(|events| self.publish_calls(events)));
            }
            Command::HangUp { reply } => {
                let result = self.calls.hangup().map_err(ClientError::from);
                let _ = reply.send(result.map(|events| self.publish_calls(events)));
            }
            Command::CallState { reply } => {
                let _ = reply.send(self.calls.state());
            }
            Command::Connectivity { reply } => {
                let _ = reply.send(self.session.state());
            }
            Command::PendingTimers { reply } => {
                let _ = reply.send(self.pending_timers());
            }
            Command::Retry { reply } => {
                let _ = reply.send(self.session.retry().map_err(ClientError::from));
            }
            Command::RetryOn { index, reply } => self.retry_on(index, reply).await,
            Command::Disconnect { reply } => {
                self.leave_room(true).await;
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
    }

    fn pending_timers(&self) -> usize {
        let sweep = self
            .sweep_timer
            .as_ref()
            .map(|t| usize::from(t.is_pending()))
            .unwrap_or(0);
        self.session.pending_timers() + self.calls.pending_timers() + sweep
    }

    fn is_busy(&self) -> bool {
        self.room.is_some() || self.entry.is_some()
    }

    async fn create_room(&mut self, reply: Reply<RoomCode>) {
        if self.is_busy() {
            let _ = reply.send(Err(ClientError::AlreadyInRoom));
            return;
        }
        self.open_as_host(1, reply).await;
    }

    async fn open_as_host(&mut self, attempt: usize, reply: Reply<RoomCode>) {
        let code = RoomCode::generate();
        self.session.open(code.as_str(), Role::Host).await;
        self.entry = Some(Entry::Create {
            code,
            attempt,
            reply,
        });
    }

    async fn join_room(&mut self, code: RoomCode, reply: Reply<()>) {
        if self.is_busy() {
            let _ = reply.send(Err(ClientError::AlreadyInRoom));
            return;
        }
        self.session.open(code.as_str(), Role::Guest).await;
        self.entry = Some(Entry::Join { code, reply });
    }

    fn link_metadata(&self) -> LinkMetadata {
        LinkMetadata {
            name: self.display_name.clone(),
            timestamp: now_millis(),
        }
    }

    /// Die Session für Erstellen oder Beitreten ist offen
    async fn on_opened(&mut self, local_id: &str) {
        match self.entry.take() {
            Some(Entry::Create { code, reply, .. }) => {
                self.enter_room(local_id, Role::Host, &code);
                tracing::info!("Created room {}", code);
                let _ = reply.send(Ok(code));
            }
            Some(Entry::Join { code, reply }) => {
                let metadata = self.link_metadata();
                match self.session.connect_to_peer(code.as_str(), metadata) {
                    Ok(()) => self.entry = Some(Entry::Join { code, reply }),
                    Err(e) => {
                        tracing::warn!("Failed to join room {}: {}", code, e);
                        self.session.disconnect().await;
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            None => tracing::debug!("Session {} opened without a waiting request", local_id),
        }
    }

    async fn on_open_failed(&mut self, error: SessionError) {
        match self.entry.take() {
            Some(Entry::Create {
                attempt, reply, ..
            }) => match error {
                SessionError::RoomCodeInUse(taken) if attempt < CREATE_ATTEMPTS => {
                    tracing::warn!("Room code {} taken (attempt {})", taken, attempt);
                    self.open_as_host(attempt + 1, reply).await;
                }
                other => {
                    let _ = reply.send(Err(other.into()));
                }
            },
            Some(Entry::Join { code, reply }) => {
                tracing::warn!("Failed to join room {}: {}", code, error);
                let _ = reply.send(Err(error.into()));
            }
            None => tracing::warn!("Session failed to open: {}", error),
        }
    }

    fn is_joining(&self) -> bool {
        matches!(self.entry, Some(Entry::Join { .. }))
    }

    fn is_joining_via(&self, peer_id: &str) -> bool {
        matches!(&self.entry, Some(Entry::Join { code, .. }) if code.as_str() == peer_id)
    }

    /// Der Link zum Host steht, der Beitritt ist abgeschlossen
    fn finish_join(&mut self) {
        let Some(Entry::Join { code, reply }) = self.entry.take() else {
            return;
        };
        let local_id = self.session.local_id().unwrap_or_default();
        self.enter_room(&local_id, Role::Guest, &code);
        tracing::info!("Joined room {}", code);
        let _ = reply.send(Ok(()));
    }

    /// Beitritt scheitert, weil die Session vor dem Link zum Host abreißt
    async fn abort_join(&mut self, error: ClientError) {
        if !self.is_joining() {
            return;
        }
        if let Some(Entry::Join { code, reply }) = self.entry.take() {
            tracing::warn!("Failed to join room {}: {}", code, error);
            self.session.disconnect().await;
            let _ = reply.send(Err(error));
        }
    }

    fn enter_room(&mut self, local_id: &str, role: Role, code: &RoomCode) {
        self.room = Some(RoomDirectory::new(
            local_id,
            &self.display_name,
            role,
            code.as_str(),
            NameCache::new(Arc::clone(&self.store)),
            self.config.room.clone(),
            now_millis(),
        ));
        self.sweep_timer = Some(
            self.scheduler
                .every(self.config.room.sweep_interval(), Wakeup::RosterSweep),
        );
    }

    fn change_name(&mut self, name: &str) -> Result<String, ClientError> {
        let name = save_display_name(self.store.as_ref(), name)?;
        self.display_name = name.clone();
        if let Some(room) = self.room.as_mut() {
            let actions = room.rename_local(&name);
            self.run_actions(actions);
        }
        Ok(name)
    }

    async fn retry_on(&mut self, index: usize, reply: Reply<()>) {
        match self.session.retry_on(index).await {
            Ok(events) => {
                if let Some(previous) = self.retry_reply.replace(reply) {
                    let _ = previous.send(Err(ClientError::Cancelled));
                }
                self.dispatch(events).await;
            }
            Err(e) => {
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    /// Verlässt den Raum; auf Wunsch mit Abschiedsnachricht
    async fn leave_room(&mut self, farewell: bool) {
        if let Some(entry) = self.entry.take() {
            entry.cancel();
        }
        if let Some(reply) = self.retry_reply.take() {
            let _ = reply.send(Err(ClientError::Cancelled));
        }
        if let Some(room) = self.room.take() {
            if farewell {
                self.run_actions(vec![room.farewell()]);
            }
            tracing::info!("Leaving room {}", room.host_id());
        }
        let events = self.calls.hangup().unwrap_or_default();
        self.publish_calls(events);
        self.sweep_timer = None;
        if self.session.state() != ConnectivityState::Closed {
            self.session.disconnect().await;
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    fn run_actions(&self, actions: Vec<RoomAction>) {
        for action in actions {
            match action {
                RoomAction::Send { to, message } => {
                    if let Err(e) = self.session.send_to(&to, &message) {
                        tracing::warn!("Failed to send {} to {}: {}", message.kind(), to, e);
                    }
                }
                RoomAction::Broadcast { message, except } => {
                    let sent = self.session.broadcast(&message, except.as_deref());
                    tracing::debug!("Broadcast {} to {} peer(s)", message.kind(), sent);
                }
                RoomAction::Notify(event) => self.publish(ClientEvent::Room(event)),
            }
        }
    }

    /// Verteilt Session-Events an Raum und Anrufsteuerung
    async fn dispatch(&mut self, events: Vec<SessionEvent>) {
        let mut queue: VecDeque<SessionEvent> = events.into();

        while let Some(event) = queue.pop_front() {
            match event {
                SessionEvent::Opened { local_id } => self.on_opened(&local_id).await,
                SessionEvent::OpenFailed(error) => self.on_open_failed(error).await,
                SessionEvent::DialFailed { peer_id, error } => {
                    if self.is_joining_via(&peer_id) {
                        self.abort_join(error.into()).await;
                        continue;
                    }
                    let host_lost = self
                        .room
                        .as_ref()
                        .map(|r| r.role() == Role::Guest && r.host_id() == peer_id)
                        .unwrap_or(false);
                    if host_lost {
                        tracing::warn!("Host {} unreachable after re-open: {}", peer_id, error);
                        queue.push_back(SessionEvent::RoomLost);
                    }
                }
                SessionEvent::PeerLinked { peer_id, metadata } => {
                    if self.is_joining_via(&peer_id) {
                        self.finish_join();
                    }
                    let name = metadata.as_ref().map(|m| m.name.as_str());
                    let actions = match self.room.as_mut() {
                        Some(room) => room.link_opened(&peer_id, name, now_millis()),
                        None => continue,
                    };
                    self.run_actions(actions);
                }
                SessionEvent::LinkClosed { peer_id } => {
                    let call_events = self.calls.on_link_lost(&peer_id);
                    self.publish_calls(call_events);
                    if let Some(room) = self.room.as_mut() {
                        let actions = room.link_closed(&peer_id);
                        self.run_actions(actions);
                    }
                }
                SessionEvent::Data { peer_id, payload } => {
                    let message = match AppMessage::parse(&payload) {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::warn!("Dropping message from {}: {}", peer_id, e);
                            continue;
                        }
                    };
                    let actions = match self.room.as_mut() {
                        Some(room) => room.handle_message(&peer_id, message, now_millis()),
                        None => continue,
                    };
                    self.run_actions(actions);
                }
                SessionEvent::IncomingCall { call } => {
                    let events = self.calls.on_incoming(call);
                    self.publish_calls(events);
                }
                SessionEvent::RemoteStream { call_id, .. } => {
                    let events = self.calls.on_remote_stream(call_id);
                    self.publish_calls(events);
                }
                SessionEvent::CallClosed { call_id, .. } => {
                    let events = self.calls.on_call_closed(call_id);
                    self.publish_calls(events);
                }
                SessionEvent::CallError {
                    call_id, reason, ..
                } => {
                    let events = self.calls.on_call_error(call_id, &reason);
                    self.publish_calls(events);
                }
                SessionEvent::Degraded { attempt } => {
                    if self.is_joining() {
                        let reason = "Lost the rendezvous service while joining".to_string();
                        self.abort_join(ClientError::Connectivity(reason)).await;
                        continue;
                    }
                    self.publish(ClientEvent::Reconnecting { attempt });
                }
                SessionEvent::Reconnected { peer_id, reopened } => {
                    self.publish(ClientEvent::Reconnected {
                        peer_id: peer_id.clone(),
                    });
                    if reopened {
                        if let Some(reply) = self.retry_reply.take() {
                            let _ = reply.send(Ok(()));
                        }
                        let events = self.calls.on_session_reset();
                        self.publish_calls(events);
                        queue.extend(self.rejoin_after_reopen(&peer_id));
                    }
                }
                SessionEvent::RoomLost => {
                    self.publish(ClientEvent::RoomLost);
                    self.leave_room(false).await;
                }
                SessionEvent::FatalError(e) => {
                    tracing::error!("Session failed: {}", e);
                    self.publish(ClientEvent::Failed {
                        reason: e.to_string(),
                    });
                    if let Some(reply) = self.retry_reply.take() {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
        }
    }

    /// Nach einem Neuaufbau hat der Gast eine neue Kennung und muss den
    /// Host neu anwählen; das Ergebnis kommt als `PeerLinked` oder
    /// `DialFailed`
    fn rejoin_after_reopen(&mut self, local_id: &str) -> Vec<SessionEvent> {
        let host_id = match self.room.as_mut() {
            Some(room) => {
                room.rebind_local(local_id);
                if room.role() != Role::Guest {
                    return Vec::new();
                }
                room.host_id().to_string()
            }
            None => return Vec::new(),
        };

        let metadata = self.link_metadata();
        match self.session.connect_to_peer(&host_id, metadata) {
            Ok(()) => Vec::new(),
            Err(e) => {
                tracing::warn!("Host {} unreachable after re-open: {}", host_id, e);
                vec![SessionEvent::RoomLost]
            }
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    async fn handle_wakeup(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Reconnect { epoch } => {
                let events = self.session.on_reconnect_due(epoch).await;
                self.dispatch(events).await;
            }
            Wakeup::Liveness { epoch } => {
                let events = self.session.on_liveness_due(epoch);
                self.dispatch(events).await;
            }
            Wakeup::CallTimeout { call_id } => {
                let events = self.calls.on_timeout(call_id);
                self.publish_calls(events);
            }
            Wakeup::CallTick { call_id } => {
                let events = self.calls.on_tick(call_id);
                self.publish_calls(events);
            }
            Wakeup::RosterSweep => {
                if let Some(room) = self.room.as_mut() {
                    let actions = room.sweep(now_millis());
                    self.run_actions(actions);
                }
            }
        }
    }
}
