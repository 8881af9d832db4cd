//! Session Orchestrator
//!
//! Besitzt die einzige Transport-Session einer Instanz. Öffnet sie mit der
//! aktuellen Relay-Auswahl, verwaltet die Links zu anderen Peers und führt
//! bei Verbindungsverlust die Reconnect-Policy aus.
//!
//! Zustände: `Initializing → Opening → Ready → {Degraded, Closed}`.
//! `Closed` wird nur über [`SessionOrchestrator::disconnect`] erreicht.
//!
//! Nichts hier blockiert den Event-Loop: Öffnen (samt Relay-Auswahl),
//! Reconnect, Liveness-Prüfung und Anwahl laufen als abbrechbare
//! Hintergrundvorgänge, deren Ergebnisse über
//! [`SessionOrchestrator::next_input`] zurückkommen.

use super::pending::{wait, PendingTask};
use super::reconnect::{ReconnectAction, ReconnectConfig, ReconnectPolicy};
use crate::protocol::AppMessage;
use crate::relay::{RelayCandidate, RelaySelector, SelectionBudget};
use crate::rendezvous::RendezvousServerPool;
use crate::timer::{Scheduler, TimerHandle, Wakeup};
use crate::transport::{
    Link, LinkMetadata, MediaCall, OpenedSession, PeerTransport, SessionConfig, TransportError,
    TransportEvent, TransportSession,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::timeout;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Rendezvous service unreachable: {0}")]
    Connectivity(String),

    #[error("Rendezvous handshake timed out")]
    HandshakeTimeout,

    #[error("Room code {0} is already in use")]
    RoomCodeInUse(String),

    #[error("Peer {0} not found, check the room code")]
    PeerUnreachable(String),

    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("No open session")]
    NotConnected,

    #[error("No open link to {0}")]
    LinkUnavailable(String),

    #[error("Invalid rendezvous endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Failed to encode message: {0}")]
    Encoding(String),
}

// ============================================================================
// STATE & EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityState {
    Initializing,
    Opening,
    Ready,
    Degraded,
    Closed,
}

/// Rolle im Raum; bleibt über einen kompletten Neuaufbau erhalten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Host,
    Guest,
}

/// Ereignisse für Raum und Anrufsteuerung
#[derive(Clone)]
pub enum SessionEvent {
    /// Erstes Öffnen nach [`SessionOrchestrator::open`] ist abgeschlossen
    Opened { local_id: String },
    /// Erstes Öffnen ist gescheitert; wird nicht wiederholt
    OpenFailed(SessionError),
    /// Link ist offen; eingehende Links tragen Metadaten
    PeerLinked {
        peer_id: String,
        metadata: Option<LinkMetadata>,
    },
    /// Anwahl über [`SessionOrchestrator::connect_to_peer`] ist gescheitert
    DialFailed { peer_id: String, error: SessionError },
    LinkClosed { peer_id: String },
    Data { peer_id: String, payload: String },
    IncomingCall { call: Arc<dyn MediaCall> },
    RemoteStream { call_id: u64, peer_id: String },
    CallClosed { call_id: u64, peer_id: String },
    CallError { call_id: u64, peer_id: String, reason: String },
    /// Verbindung verloren, Reconnect läuft
    Degraded { attempt: u32 },
    /// Wieder verbunden; `reopened` heißt neue Session (neue Kennung beim Gast)
    Reconnected { peer_id: String, reopened: bool },
    /// Gast hat den letzten Link verloren
    RoomLost,
    FatalError(SessionError),
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Opened { local_id } => {
                f.debug_struct("Opened").field("local_id", local_id).finish()
            }
            SessionEvent::OpenFailed(e) => f.debug_tuple("OpenFailed").field(e).finish(),
            SessionEvent::DialFailed { peer_id, error } => f
                .debug_struct("DialFailed")
                .field("peer_id", peer_id)
                .field("error", error)
                .finish(),
            SessionEvent::PeerLinked { peer_id, metadata } => f
                .debug_struct("PeerLinked")
                .field("peer_id", peer_id)
                .field("metadata", metadata)
                .finish(),
            SessionEvent::LinkClosed { peer_id } => {
                f.debug_struct("LinkClosed").field("peer_id", peer_id).finish()
            }
            SessionEvent::Data { peer_id, .. } => {
                f.debug_struct("Data").field("peer_id", peer_id).finish_non_exhaustive()
            }
            SessionEvent::IncomingCall { call } => f
                .debug_struct("IncomingCall")
                .field("call_id", &call.id())
                .field("peer_id", &call.peer_id())
                .finish(),
            SessionEvent::RemoteStream { call_id, peer_id } => f
                .debug_struct("RemoteStream")
                .field("call_id", call_id)
                .field("peer_id", peer_id)
                .finish(),
            SessionEvent::CallClosed { call_id, peer_id } => f
                .debug_struct("CallClosed")
                .field("call_id", call_id)
                .field("peer_id", peer_id)
                .finish(),
            SessionEvent::CallError {
                call_id,
                peer_id,
                reason,
            } => f
                .debug_struct("CallError")
                .field("call_id", call_id)
                .field("peer_id", peer_id)
                .field("reason", reason)
                .finish(),
            SessionEvent::Degraded { attempt } => {
                f.debug_struct("Degraded").field("attempt", attempt).finish()
            }
            SessionEvent::Reconnected { peer_id, reopened } => f
                .debug_struct("Reconnected")
                .field("peer_id", peer_id)
                .field("reopened", reopened)
                .finish(),
            SessionEvent::RoomLost => f.write_str("RoomLost"),
            SessionEvent::FatalError(e) => f.debug_tuple("FatalError").field(e).finish(),
        }
    }
}

/// Zeitgrenzen der Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTimeouts {
    pub open_timeout_ms: u64,
    /// Verbindungsaufbau eines Gasts zum Host
    pub dial_timeout_ms: u64,
    pub liveness_interval_ms: u64,
    pub liveness_check_ms: u64,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            open_timeout_ms: 8_000,
            dial_timeout_ms: 8_000,
            liveness_interval_ms: 15_000,
            liveness_check_ms: 5_000,
        }
    }
}

impl SessionTimeouts {
    fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    fn liveness_check(&self) -> Duration {
        Duration::from_millis(self.liveness_check_ms)
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

/// Eingang des Event-Loops von der Session
pub enum SessionInput {
    Transport(TransportEvent),
    /// Ein Hintergrundvorgang ist fertig
    Finished(Finished),
}

/// Ergebnis eines Hintergrundvorgangs; nur für [`SessionOrchestrator::handle_input`]
pub struct Finished(Completion);

enum Completion {
    Connect(Result<Progress, JoinError>),
    Dial(Result<Result<Arc<dyn Link>, SessionError>, JoinError>),
}

type OpenResult = Result<(Vec<RelayCandidate>, OpenedSession), SessionError>;

/// Ergebnis im Verbindungs-Slot. Welcher Vorgang läuft, folgt aus dem
/// Zustand: `Opening` öffnet, `Degraded` verbindet neu, `Ready` prüft.
enum Progress {
    Opened(OpenResult),
    Resumed(bool),
    Alive(bool),
}

/// Wer das laufende Öffnen ausgelöst hat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenPurpose {
    /// `open` beim Erstellen oder Beitreten
    Initial,
    /// Neuaufbau durch die Reconnect-Policy
    Reconnect,
    /// `retry_on`
    Manual,
}

impl std::fmt::Debug for SessionInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionInput::Transport(event) => f.debug_tuple("Transport").field(event).finish(),
            SessionInput::Finished(finished) => f.debug_tuple("Finished").field(finished).finish(),
        }
    }
}

impl std::fmt::Debug for Finished {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.0 {
            Completion::Connect(Ok(Progress::Opened(_))) => "Opened",
            Completion::Connect(Ok(Progress::Resumed(_))) => "Resumed",
            Completion::Connect(Ok(Progress::Alive(_))) => "Alive",
            Completion::Connect(Err(_)) | Completion::Dial(Err(_)) => "Panicked",
            Completion::Dial(Ok(_)) => "Dialed",
        };
        f.write_str(kind)
    }
}

async fn recv_transport(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> TransportEvent {
    let Some(rx) = events.as_mut() else {
        return std::future::pending().await;
    };
    if let Some(event) = rx.recv().await {
        return event;
    }
    *events = None;
    TransportEvent::Disconnected
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct SessionOrchestrator {
    transport: Arc<dyn PeerTransport>,
    selector: RelaySelector,
    pool: RendezvousServerPool,
    relay_catalog: Vec<RelayCandidate>,
    budget: SelectionBudget,
    timeouts: SessionTimeouts,
    scheduler: Scheduler,
    policy: ReconnectPolicy,

    state: ConnectivityState,
    role: Option<Role>,
    room: Option<String>,
    session: Option<Arc<dyn TransportSession>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    relays: Vec<RelayCandidate>,
    links: HashMap<String, Arc<dyn Link>>,
    /// Host hatte schon mindestens einen Gast
    had_guests: bool,
    /// Wird bei jedem Session-Wechsel erhöht, alte Weckrufe verfallen
    epoch: u64,

    reconnect_timer: Option<TimerHandle>,
    liveness_timer: Option<TimerHandle>,

    /// Öffnen, Reconnect oder Liveness-Prüfung
    connecting: Option<PendingTask<Progress>>,
    purpose: OpenPurpose,
    /// Anwahl eines Peers
    dialing: Option<PendingTask<Result<Arc<dyn Link>, SessionError>>>,
    dial_target: Option<String>,
}

impl SessionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        selector: RelaySelector,
        pool: RendezvousServerPool,
        relay_catalog: Vec<RelayCandidate>,
        budget: SelectionBudget,
        reconnect: ReconnectConfig,
        timeouts: SessionTimeouts,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            transport,
            selector,
            pool,
            relay_catalog,
            budget,
            timeouts,
            scheduler,
            policy: ReconnectPolicy::new(reconnect),
            state: ConnectivityState::Initializing,
            role: None,
            room: None,
            session: None,
            events: None,
            relays: Vec::new(),
            links: HashMap::new(),
            had_guests: false,
            epoch: 0,
            reconnect_timer: None,
            liveness_timer: None,
            connecting: None,
            purpose: OpenPurpose::Initial,
            dialing: None,
            dial_target: None,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn local_id(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.local_id())
    }

    /// Handle der aktuellen Session, z. B. für Anrufe
    pub fn session_handle(&self) -> Option<Arc<dyn TransportSession>> {
        self.session.clone()
    }

    pub fn relays(&self) -> &[RelayCandidate] {
        &self.relays
    }

    pub fn endpoint_index(&self) -> usize {
        self.pool.index()
    }

    pub fn has_link(&self, peer_id: &str) -> bool {
        self.links.get(peer_id).map(|l| l.is_open()).unwrap_or(false)
    }

    pub fn linked_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.links.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Anzahl noch laufender Timer
    pub fn pending_timers(&self) -> usize {
        [&self.reconnect_timer, &self.liveness_timer]
            .iter()
            .filter(|t| t.as_ref().map(|t| t.is_pending()).unwrap_or(false))
            .count()
    }

    /// Anzahl laufender Hintergrundvorgänge (Öffnen, Reconnect, Anwahl)
    pub fn pending_operations(&self) -> usize {
        usize::from(self.connecting.is_some()) + usize::from(self.dialing.is_some())
    }

    // ------------------------------------------------------------------------
    // Open / Close
    // ------------------------------------------------------------------------

    /// Beginnt das Öffnen der Session für einen Raum. Der Host beansprucht
    /// den Raum-Code als Kennung. Das Ergebnis kommt als
    /// [`SessionEvent::Opened`] oder [`SessionEvent::OpenFailed`]; ein
    /// Timeout wird gemeldet, nicht wiederholt.
    pub async fn open(&mut self, room: &str, role: Role) {
        self.teardown().await;
        self.reconnect_timer = None;
        self.policy.reset();
        self.role = Some(role);
        self.room = Some(room.to_string());
        self.start_open(OpenPurpose::Initial);
    }

    /// Startet Relay-Auswahl und Öffnen als einen Vorgang unter dem
    /// Open-Timeout
    fn start_open(&mut self, purpose: OpenPurpose) {
        let (room, role) = match (&self.room, self.role) {
            (Some(room), Some(role)) => (room.clone(), role),
            _ => return,
        };

        self.state = ConnectivityState::Opening;
        self.purpose = purpose;
        let endpoint = self.pool.current().clone();
        tracing::info!("Opening session on {} as {:?} of room {}", endpoint, role, room);

        let transport = Arc::clone(&self.transport);
        let selector = self.selector.clone();
        let catalog = self.relay_catalog.clone();
        let budget = self.budget.clone();
        let limit = self.timeouts.open_timeout();
        let requested_id = (role == Role::Host).then_some(room);

        self.connecting = Some(PendingTask::spawn(async move {
            let attempt = async {
                let relays = selector.select_relays(&catalog, &budget).await;
                let config = SessionConfig {
                    requested_id,
                    endpoint,
                    relays: relays.clone(),
                };
                transport.open(config).await.map(|opened| (relays, opened))
            };
            let result = match timeout(limit, attempt).await {
                Ok(Ok(opened)) => Ok(opened),
                Ok(Err(TransportError::IdTaken(id))) => Err(SessionError::RoomCodeInUse(id)),
                Ok(Err(e)) => Err(SessionError::Connectivity(e.to_string())),
                Err(_) => Err(SessionError::HandshakeTimeout),
            };
            Progress::Opened(result)
        }));
    }

    fn finish_open(&mut self, result: OpenResult) -> Vec<SessionEvent> {
        let (relays, opened) = match result {
            Ok(opened) => opened,
            Err(e) => {
                match &e {
                    SessionError::RoomCodeInUse(id) => tracing::warn!("Room code {} is taken", id),
                    SessionError::HandshakeTimeout => tracing::warn!("Session handshake timed out"),
                    other => tracing::warn!("Failed to open session: {}", other),
                }
                return match self.purpose {
                    OpenPurpose::Initial => {
                        self.state = ConnectivityState::Initializing;
                        vec![SessionEvent::OpenFailed(e)]
                    }
                    OpenPurpose::Reconnect => {
                        self.state = ConnectivityState::Degraded;
                        self.schedule_reconnect();
                        vec![SessionEvent::Degraded {
                            attempt: self.policy.attempts(),
                        }]
                    }
                    OpenPurpose::Manual => {
                        self.state = ConnectivityState::Degraded;
                        vec![SessionEvent::FatalError(e)]
                    }
                };
            }
        };

        let id = opened.session.local_id();
        self.relays = relays;
        self.session = Some(opened.session);
        self.events = Some(opened.events);
        self.epoch += 1;
        self.had_guests = false;
        self.state = ConnectivityState::Ready;
        self.policy.reset();
        self.liveness_timer = Some(self.scheduler.every(
            self.timeouts.liveness_interval(),
            Wakeup::Liveness { epoch: self.epoch },
        ));
        tracing::info!("Session ready with id {}", id);

        match self.purpose {
            OpenPurpose::Initial => vec![SessionEvent::Opened { local_id: id }],
            OpenPurpose::Reconnect | OpenPurpose::Manual => vec![SessionEvent::Reconnected {
                peer_id: id,
                reopened: true,
            }],
        }
    }

    /// Baut die aktuelle Session ab, bricht laufende Vorgänge ab und meldet
    /// die geschlossenen Links
    async fn teardown(&mut self) -> Vec<SessionEvent> {
        self.epoch += 1;
        self.liveness_timer = None;
        self.connecting = None;
        self.dialing = None;
        self.dial_target = None;
        // Eigene Close-Events der Links sollen nicht mehr ankommen
        self.events = None;

        let mut closed = Vec::with_capacity(self.links.len());
        for (peer_id, link) in self.links.drain() {
            link.close();
            closed.push(peer_id);
        }
        closed.sort();

        if let Some(session) = self.session.take() {
            session.destroy().await;
        }
        closed
            .into_iter()
            .map(|peer_id| SessionEvent::LinkClosed { peer_id })
            .collect()
    }

    /// Beendet alles: Timer, laufende Vorgänge, Links, Session. Danach ist
    /// der Zustand `Closed`.
    pub async fn disconnect(&mut self) {
        self.reconnect_timer = None;
        self.teardown().await;
        self.policy.reset();
        self.role = None;
        self.room = None;
        self.state = ConnectivityState::Closed;
        tracing::info!("Session closed");
    }

    // ------------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------------

    /// Beginnt die Anwahl eines Peers (Gast → Host). Das Ergebnis kommt als
    /// [`SessionEvent::PeerLinked`] oder [`SessionEvent::DialFailed`]; eine
    /// laufende Anwahl wird ersetzt.
    pub fn connect_to_peer(
        &mut self,
        peer_id: &str,
        metadata: LinkMetadata,
    ) -> Result<(), SessionError> {
        let session = self.session.clone().ok_or(SessionError::NotConnected)?;
        let limit = self.timeouts.dial_timeout();
        let target = peer_id.to_string();
        tracing::debug!("Dialing {}", peer_id);

        self.dial_target = Some(target.clone());
        self.dialing = Some(PendingTask::spawn(async move {
            match timeout(limit, session.connect(&target, metadata)).await {
                Ok(Ok(link)) => Ok(link),
                Ok(Err(TransportError::PeerUnavailable(peer))) => {
                    Err(SessionError::PeerUnreachable(peer))
                }
                Ok(Err(e)) => Err(SessionError::Connectivity(e.to_string())),
                Err(_) => Err(SessionError::PeerUnreachable(target.clone())),
            }
        }));
        Ok(())
    }

    fn finish_dial(
        &mut self,
        outcome: Result<Result<Arc<dyn Link>, SessionError>, JoinError>,
    ) -> Vec<SessionEvent> {
        let Some(peer_id) = self.dial_target.take() else {
            return Vec::new();
        };
        let result = outcome.unwrap_or_else(|e| {
            tracing::error!("Dial task failed: {}", e);
            Err(SessionError::Connectivity(e.to_string()))
        });

        match result {
            Ok(link) => {
                tracing::info!("Linked to {}", peer_id);
                if let Some(old) = self.links.insert(peer_id.clone(), link) {
                    old.close();
                }
                vec![SessionEvent::PeerLinked {
                    peer_id,
                    metadata: None,
                }]
            }
            Err(error) => {
                tracing::warn!("Failed to reach {}: {}", peer_id, error);
                vec![SessionEvent::DialFailed { peer_id, error }]
            }
        }
    }

    /// Sendet eine Nachricht an genau einen Peer
    pub fn send_to(&self, peer_id: &str, message: &AppMessage) -> Result<(), SessionError> {
        let link = self
            .links
            .get(peer_id)
            .filter(|l| l.is_open())
            .ok_or_else(|| SessionError::LinkUnavailable(peer_id.to_string()))?;
        let payload = message
            .encode()
            .map_err(|e| SessionError::Encoding(e.to_string()))?;
        link.send(payload)
            .map_err(|_| SessionError::LinkUnavailable(peer_id.to_string()))
    }

    /// Sendet an alle offenen Links außer `except`; liefert die Anzahl Empfänger
    pub fn broadcast(&self, message: &AppMessage, except: Option<&str>) -> usize {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to encode {}: {}", message.kind(), e);
                return 0;
            }
        };

        let mut sent = 0;
        for (peer_id, link) in &self.links {
            if Some(peer_id.as_str()) == except || !link.is_open() {
                continue;
            }
            match link.send(payload.clone()) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("Failed to send {} to {}: {}", message.kind(), peer_id, e),
            }
        }
        sent
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Nächstes Transport-Event oder Ergebnis eines Hintergrundvorgangs;
    /// wartet ewig, solange es beides nicht geben kann. Abbruchsicher.
    pub async fn next_input(&mut self) -> SessionInput {
        tokio::select! {
            event = recv_transport(&mut self.events) => SessionInput::Transport(event),
            outcome = wait(&mut self.connecting) => {
                SessionInput::Finished(Finished(Completion::Connect(outcome)))
            }
            outcome = wait(&mut self.dialing) => {
                SessionInput::Finished(Finished(Completion::Dial(outcome)))
            }
        }
    }

    /// Verarbeitet einen Eingang aus [`Self::next_input`]
    pub fn handle_input(&mut self, input: SessionInput) -> Vec<SessionEvent> {
        match input {
            SessionInput::Transport(event) => self.handle_transport_event(event),
            SessionInput::Finished(Finished(Completion::Connect(outcome))) => {
                self.finish_connect(outcome)
            }
            SessionInput::Finished(Finished(Completion::Dial(outcome))) => {
                self.finish_dial(outcome)
            }
        }
    }

    fn finish_connect(&mut self, outcome: Result<Progress, JoinError>) -> Vec<SessionEvent> {
        let progress = outcome.unwrap_or_else(|e| {
            tracing::error!("Session task failed: {}", e);
            match self.state {
                ConnectivityState::Opening => {
                    Progress::Opened(Err(SessionError::Connectivity(e.to_string())))
                }
                ConnectivityState::Degraded => Progress::Resumed(false),
                _ => Progress::Alive(true),
            }
        });

        match progress {
            Progress::Opened(result) => self.finish_open(result),
            Progress::Resumed(ok) => self.finish_resume(ok),
            Progress::Alive(alive) => {
                if alive || self.state != ConnectivityState::Ready {
                    Vec::new()
                } else {
                    self.enter_degraded()
                }
            }
        }
    }

    /// Verarbeitet ein Transport-Event. Alle Map-Änderungen sind
    /// abgeschlossen, bevor die Events zurückgegeben werden.
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Vec<SessionEvent> {
        match event {
            TransportEvent::Connection { link, metadata } => {
                let peer_id = link.peer_id().to_string();
                tracing::info!("Inbound link from {}", peer_id);
                if let Some(old) = self.links.insert(peer_id.clone(), link) {
                    old.close();
                }
                if self.role == Some(Role::Host) {
                    self.had_guests = true;
                }
                vec![SessionEvent::PeerLinked { peer_id, metadata }]
            }
            TransportEvent::Data { peer_id, payload } => {
                vec![SessionEvent::Data { peer_id, payload }]
            }
            TransportEvent::LinkClosed { peer_id } => self.drop_link(peer_id),
            TransportEvent::LinkError { peer_id, reason } => {
                tracing::warn!("Link to {} failed: {}", peer_id, reason);
                if let Some(link) = self.links.get(&peer_id) {
                    link.close();
                }
                self.drop_link(peer_id)
            }
            TransportEvent::IncomingCall { call } => vec![SessionEvent::IncomingCall { call }],
            TransportEvent::RemoteStream { call_id, peer_id } => {
                vec![SessionEvent::RemoteStream { call_id, peer_id }]
            }
            TransportEvent::CallClosed { call_id, peer_id } => {
                vec![SessionEvent::CallClosed { call_id, peer_id }]
            }
            TransportEvent::CallError {
                call_id,
                peer_id,
                reason,
            } => vec![SessionEvent::CallError {
                call_id,
                peer_id,
                reason,
            }],
            TransportEvent::Disconnected => {
                if self.state == ConnectivityState::Ready {
                    self.enter_degraded()
                } else {
                    Vec::new()
                }
            }
            TransportEvent::Error(e) => {
                tracing::error!("Transport error: {}", e);
                match e {
                    TransportError::Unreachable(_) | TransportError::Closed
                        if self.state == ConnectivityState::Ready =>
                    {
                        self.enter_degraded()
                    }
                    _ => Vec::new(),
                }
            }
        }
    }

    fn drop_link(&mut self, peer_id: String) -> Vec<SessionEvent> {
        // Ein offener Link unter dieser ID ist ein Nachfolger des geschlossenen
        match self.links.get(&peer_id) {
            Some(link) if !link.is_open() => {}
            _ => return Vec::new(),
        }
        self.links.remove(&peer_id);
        tracing::info!("Link to {} closed", peer_id);

        let mut events = vec![SessionEvent::LinkClosed { peer_id }];
        if self.links.is_empty()
            && self.role == Some(Role::Guest)
            && self.state != ConnectivityState::Closed
        {
            tracing::warn!("Lost the last link, room is gone");
            events.push(SessionEvent::RoomLost);
        }
        events
    }

    // ------------------------------------------------------------------------
    // Reconnect
    // ------------------------------------------------------------------------

    fn enter_degraded(&mut self) -> Vec<SessionEvent> {
        tracing::warn!("Lost connection to rendezvous service, reconnecting");
        self.state = ConnectivityState::Degraded;
        // Eine laufende Liveness-Prüfung ist überholt
        self.connecting = None;
        self.schedule_reconnect();
        vec![SessionEvent::Degraded {
            attempt: self.policy.attempts(),
        }]
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.policy.next_delay();
        tracing::debug!("Next reconnect attempt in {:?}", delay);
        self.reconnect_timer = Some(
            self.scheduler
                .once(delay, Wakeup::Reconnect { epoch: self.epoch }),
        );
    }

    /// Reconnect-Timer ist abgelaufen. Der Versuch selbst läuft im
    /// Hintergrund; sofort zurück kommen nur die Links eines Neuaufbaus.
    pub async fn on_reconnect_due(&mut self, epoch: u64) -> Vec<SessionEvent> {
        if epoch != self.epoch || self.state != ConnectivityState::Degraded {
            return Vec::new();
        }
        self.reconnect_timer = None;

        let action = self.policy.next_action();
        match action {
            ReconnectAction::GiveUp => {
                let attempts = self.policy.attempts();
                tracing::error!("Giving up after {} reconnect attempts", attempts);
                self.liveness_timer = None;
                vec![SessionEvent::FatalError(SessionError::ReconnectExhausted {
                    attempts,
                })]
            }
            ReconnectAction::InPlace if self.session.is_some() => {
                self.policy.record_attempt(action);
                let Some(session) = self.session.clone() else {
                    return Vec::new();
                };
                tracing::info!("Reconnect attempt {} (in place)", self.policy.attempts());

                let limit = self.timeouts.open_timeout();
                self.connecting = Some(PendingTask::spawn(async move {
                    Progress::Resumed(matches!(
                        timeout(limit, session.reconnect()).await,
                        Ok(Ok(()))
                    ))
                }));
                Vec::new()
            }
            ReconnectAction::InPlace | ReconnectAction::RotateEndpoint => {
                self.policy.record_attempt(action);
                if action == ReconnectAction::RotateEndpoint {
                    self.pool.advance();
                }
                tracing::info!("Reconnect attempt {} (full re-open)", self.policy.attempts());
                let events = self.teardown().await;
                self.start_open(OpenPurpose::Reconnect);
                events
            }
        }
    }

    fn finish_resume(&mut self, reconnected: bool) -> Vec<SessionEvent> {
        let Some(session) = self.session.clone() else {
            return Vec::new();
        };
        if reconnected {
            tracing::info!("Reconnected as {}", session.local_id());
            self.state = ConnectivityState::Ready;
            self.policy.reset();
            vec![SessionEvent::Reconnected {
                peer_id: session.local_id(),
                reopened: false,
            }]
        } else {
            self.schedule_reconnect();
            vec![SessionEvent::Degraded {
                attempt: self.policy.attempts(),
            }]
        }
    }

    /// Liveness-Timer ist abgelaufen. Eine Session ohne Links wird im
    /// Hintergrund geprüft; stumm verlorene Verbindungen führen zu `Degraded`.
    pub fn on_liveness_due(&mut self, epoch: u64) -> Vec<SessionEvent> {
        if epoch != self.epoch || self.state != ConnectivityState::Ready {
            return Vec::new();
        }
        if self.connecting.is_some() {
            return Vec::new();
        }
        let Some(session) = self.session.clone() else {
            return Vec::new();
        };
        let host_waiting = self.role == Some(Role::Host) && !self.had_guests;
        if !self.links.is_empty() || host_waiting {
            return Vec::new();
        }

        tracing::debug!("Session has no links, checking liveness");
        let limit = self.timeouts.liveness_check();
        self.connecting = Some(PendingTask::spawn(async move {
            Progress::Alive(
                timeout(limit, session.check_liveness())
                    .await
                    .unwrap_or(false),
            )
        }));
        Vec::new()
    }

    /// Startet die Reconnect-Policy neu, z. B. nach erschöpftem Budget
    pub fn retry(&mut self) -> Result<(), SessionError> {
        if self.room.is_none() {
            return Err(SessionError::NotConnected);
        }
        if self.state == ConnectivityState::Ready || self.connecting.is_some() {
            return Ok(());
        }

        tracing::info!("Manual retry requested");
        self.policy.reset();
        self.state = ConnectivityState::Degraded;
        self.reconnect_timer = Some(
            self.scheduler
                .once(Duration::ZERO, Wakeup::Reconnect { epoch: self.epoch }),
        );
        Ok(())
    }

    /// Wählt einen Endpunkt und baut die Session dort neu auf. Zurück kommen
    /// die geschlossenen Links; das Ergebnis folgt als `Reconnected` oder
    /// als `FatalError`.
    pub async fn retry_on(&mut self, index: usize) -> Result<Vec<SessionEvent>, SessionError> {
        if self.room.is_none() {
            return Err(SessionError::NotConnected);
        }
        self.pool
            .select(index)
            .map_err(|e| SessionError::InvalidEndpoint(e.to_string()))?;

        self.reconnect_timer = None;
        self.policy.reset();

        let events = self.teardown().await;
        self.start_open(OpenPurpose::Manual);
        Ok(events)
    }
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("room", &self.room)
            .field("links", &self.linked_peers())
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
