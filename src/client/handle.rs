//! Room Client - öffentliche Fassade
//!
//! `RoomClient` ist ein billig klonbares Handle; jeder Aufruf wird als
//! Command an den Event-Loop geschickt und die Antwort über einen
//! Oneshot-Kanal abgeholt. Zustandsänderungen kommen als [`ClientEvent`]
//! über einen Broadcast-Kanal.

use super::event_loop::{Command, EventLoop};
use crate::call::{CallController, CallError, CallEvent, CallState, MediaCapture, MediaError};
use crate::config::ClientConfig;
use crate::relay::{RelayProbe, RelaySelector};
use crate::rendezvous::RendezvousServerPool;
use crate::room::{MessageHistoryEntry, RoomCode, RoomCodeError, RoomError, RoomEvent, RoomMember};
use crate::session::{ConnectivityState, SessionError, SessionOrchestrator};
use crate::storage::{load_or_create_display_name, KeyValueStore, ProfileError};
use crate::timer::Scheduler;
use crate::transport::PeerTransport;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ClientError {
    /// Rendezvous-Dienst nicht erreichbar (nach erschöpften Versuchen)
    #[error("Connection problem: {0}")]
    Connectivity(String),

    #[error("Room or peer {0} not found, check the room code")]
    PeerUnreachable(String),

    #[error("Microphone unavailable: {0}")]
    MediaPermission(String),

    #[error("Invalid room code: {0}")]
    RoomCode(#[from] RoomCodeError),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("Room error: {0}")]
    Room(#[from] RoomError),

    #[error("Call error: {0}")]
    Call(CallError),

    #[error("Session error: {0}")]
    Session(SessionError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not in a room")]
    NotInRoom,

    #[error("Already in a room")]
    AlreadyInRoom,

    /// Durch `disconnect` abgebrochen, bevor ein Ergebnis vorlag
    #[error("Cancelled by disconnect")]
    Cancelled,

    #[error("Client event loop has stopped")]
    Stopped,
}

impl From<SessionError> for ClientError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Connectivity(_)
            | SessionError::HandshakeTimeout
            | SessionError::ReconnectExhausted { .. } => ClientError::Connectivity(e.to_string()),
            SessionError::PeerUnreachable(peer) => ClientError::PeerUnreachable(peer),
            other => ClientError::Session(other),
        }
    }
}

impl From<CallError> for ClientError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Media(media @ (MediaError::PermissionDenied | MediaError::DeviceUnavailable)) => {
                ClientError::MediaPermission(media.to_string())
            }
            other => ClientError::Call(other),
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Alles, was eine Oberfläche anzeigen muss
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connectivity(ConnectivityState),
    /// Verbindung verloren, Versuch `attempt` läuft
    Reconnecting { attempt: u32 },
    Reconnected { peer_id: String },
    /// Alle Versuche erschöpft; braucht `retry` oder `retry_on`
    Failed { reason: String },
    /// Der Host ist weg
    RoomLost,
    Room(RoomEvent),
    Call(CallEvent),
}

// ============================================================================
// CLIENT
// ============================================================================

/// Externe Fähigkeiten, die der Client benutzt
#[derive(Clone)]
pub struct ClientDeps {
    pub transport: Arc<dyn PeerTransport>,
    pub probe: Arc<dyn RelayProbe>,
    pub capture: Arc<dyn MediaCapture>,
    pub store: Arc<dyn KeyValueStore>,
}

#[derive(Clone)]
pub struct RoomClient {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
}

impl RoomClient {
    /// Startet den Event-Loop; muss innerhalb einer Tokio-Runtime laufen
    pub fn spawn(config: ClientConfig, deps: ClientDeps) -> Result<Self, ClientError> {
        let display_name = load_or_create_display_name(deps.store.as_ref())?;
        let pool = RendezvousServerPool::new(config.rendezvous.clone())
            .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;

        let (scheduler, wakeups) = Scheduler::channel();
        let session = SessionOrchestrator::new(
            deps.transport,
            RelaySelector::new(deps.probe),
            pool,
            config.relays.clone(),
            config.selection.clone(),
            config.reconnect.clone(),
            config.session.clone(),
            scheduler.clone(),
        );
        let calls = CallController::new(
            deps.capture,
            config.audio.clone(),
            scheduler.clone(),
            config.call.clone(),
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

        let event_loop = EventLoop {
            last_state: session.state(),
            config,
            session,
            calls,
            scheduler,
            store: deps.store,
            display_name,
            events: event_tx.clone(),
            room: None,
            sweep_timer: None,
            entry: None,
            retry_reply: None,
        };
        tokio::spawn(event_loop.run(command_rx, wakeups));

        Ok(Self {
            commands: command_tx,
            events: event_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    // ------------------------------------------------------------------------
    // Room
    // ------------------------------------------------------------------------

    /// Erstellt einen Raum und liefert den Code für die Gäste
    pub async fn create_room(&self) -> Result<RoomCode, ClientError> {
        self.request(|reply| Command::CreateRoom { reply }).await?
    }

    pub async fn join_room(&self, code: &str) -> Result<(), ClientError> {
        let code = RoomCode::parse(code)?;
        self.request(|reply| Command::JoinRoom { code, reply }).await?
    }

    pub async fn send_text(&self, text: &str) -> Result<(), ClientError> {
        let text = text.to_string();
        self.request(|reply| Command::SendText { text, reply }).await?
    }

    /// Sendet einen aufgenommenen Clip als Sprachnachricht
    pub async fn send_voice(&self, audio: Vec<u8>, duration_secs: u32) -> Result<(), ClientError> {
        self.request(|reply| Command::SendVoice {
            audio,
            duration_secs,
            reply,
        })
        .await?
    }

    /// Speichert einen neuen Anzeigenamen und teilt ihn dem Raum mit
    pub async fn change_name(&self, name: &str) -> Result<String, ClientError> {
        let name = name.to_string();
        self.request(|reply| Command::ChangeName { name, reply }).await?
    }

    pub async fn members(&self) -> Result<Vec<RoomMember>, ClientError> {
        self.request(|reply| Command::Members { reply }).await
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<MessageHistoryEntry>, ClientError> {
        self.request(|reply| Command::History { limit, reply }).await
    }

    pub async fn local_id(&self) -> Result<Option<String>, ClientError> {
        self.request(|reply| Command::LocalId { reply }).await
    }

    // ------------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------------

    pub async fn start_call(&self, peer_id: &str) -> Result<(), ClientError> {
        let peer_id = peer_id.to_string();
        self.request(|reply| Command::StartCall { peer_id, reply }).await?
    }

    pub async fn accept_call(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::AcceptCall { reply }).await?
    }

    pub async fn reject_call(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::RejectCall { reply }).await?
    }

    pub async fn hang_up(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::HangUp { reply }).await?
    }

    pub async fn call_state(&self) -> Result<CallState, ClientError> {
        self.request(|reply| Command::CallState { reply }).await
    }

    // ------------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------------

    pub async fn connectivity(&self) -> Result<ConnectivityState, ClientError> {
        self.request(|reply| Command::Connectivity { reply }).await
    }

    /// Anzahl laufender Timer (Reconnect, Liveness, Sweep, Anruf)
    pub async fn pending_timers(&self) -> Result<usize, ClientError> {
        self.request(|reply| Command::PendingTimers { reply }).await
    }

    /// Startet die Reconnect-Policy neu
    pub async fn retry(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Retry { reply }).await?
    }

    /// Baut die Session auf einem bestimmten Rendezvous-Endpunkt neu auf
    pub async fn retry_on(&self, endpoint_index: usize) -> Result<(), ClientError> {
        self.request(|reply| Command::RetryOn {
            index: endpoint_index,
            reply,
        })
        .await?
    }

    /// Verlässt den Raum; alle Timer werden abgebrochen
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Beendet den Event-Loop
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| ClientError::Stopped)
    }
}

impl std::fmt::Debug for RoomClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomClient")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallEndReason;
    use crate::rendezvous::default_rendezvous_catalog;
    use crate::storage::MemoryKeyValueStore;
    use crate::test_support::{FakeCapture, FakeProbe};
    use crate::transport::MemoryNetwork;
    use std::time::Duration;
    use tokio::sync::broadcast::error::RecvError;
    use tokio::time::Instant;

    fn test_config() -> ClientConfig {
        ClientConfig {
            relays: Vec::new(),
            ..Default::default()
        }
    }

    fn client(net: &MemoryNetwork) -> RoomClient {
        client_with(net, test_config())
    }

    fn client_with(net: &MemoryNetwork, config: ClientConfig) -> RoomClient {
        spawn_client(net, config, Arc::new(FakeProbe::reachable(&[])))
    }

    fn spawn_client(
        net: &MemoryNetwork,
        config: ClientConfig,
        probe: Arc<dyn RelayProbe>,
    ) -> RoomClient {
        RoomClient::spawn(
            config,
            ClientDeps {
                transport: Arc::new(net.clone()),
                probe,
                capture: Arc::new(FakeCapture::allow()),
                store: Arc::new(MemoryKeyValueStore::new()),
            },
        )
        .unwrap()
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<ClientEvent>,
        matches: impl Fn(&ClientEvent) -> bool,
    ) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                match events.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("event did not arrive")
    }

    async fn wait_for_roster(
        client: &RoomClient,
        accept: impl Fn(&[RoomMember]) -> bool,
    ) -> Vec<RoomMember> {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let members = client.members().await.unwrap();
                let named = members.iter().all(|m| !m.name.starts_with("Guest_"));
                if named && accept(&members) {
                    return members;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("membership did not converge")
    }

    async fn wait_until_members(client: &RoomClient, count: usize) -> Vec<RoomMember> {
        wait_for_roster(client, |members| members.len() == count).await
    }

    /// Gast, dessen erster Rendezvous-Endpunkt `1.peerjs.com` ist
    async fn room_with_rotating_guest(net: &MemoryNetwork) -> (RoomClient, RoomClient, RoomCode) {
        let host = client(net);
        let mut guest_config = test_config();
        guest_config.rendezvous.rotate_left(1);
        let guest = client_with(net, guest_config);

        let code = host.create_room().await.unwrap();
        guest.join_room(code.as_str()).await.unwrap();
        wait_until_members(&host, 2).await;
        wait_until_members(&guest, 2).await;
        (host, guest, code)
    }

    async fn room_with_guest(net: &MemoryNetwork) -> (RoomClient, RoomClient, RoomCode) {
        // Längeres Klingeln, damit der Wähl-Timeout des Gasts zuerst greift
        let mut host_config = test_config();
        host_config.call.ring_timeout_ms = 60_000;
        let host = client_with(net, host_config);
        let guest = client(net);
        let code = host.create_room().await.unwrap();
        guest.join_room(&code.as_str().to_lowercase()).await.unwrap();
        wait_until_members(&host, 2).await;
        wait_until_members(&guest, 2).await;
        (host, guest, code)
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_room_lists_only_local_member() {
        let net = MemoryNetwork::new();
        let host = client(&net);

        let code = host.create_room().await.unwrap();
        assert_eq!(code.as_str().len(), 6);

        let members = host.members().await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, code.as_str());
        assert_eq!(host.connectivity().await.unwrap(), ConnectivityState::Ready);
        assert!(matches!(host.create_room().await, Err(ClientError::AlreadyInRoom)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_and_host_converge_and_exchange_text() {
        let net = MemoryNetwork::new();
        let (host, guest, _code) = room_with_guest(&net).await;

        let host_members = host.members().await.unwrap();
        let guest_members = guest.members().await.unwrap();
        assert_eq!(host_members[0].name, guest_members[1].name);
        assert_eq!(guest_members[0].name, host_members[1].name);

        let mut host_events = host.subscribe();
        guest.send_text("hello host").await.unwrap();
        wait_for(&mut host_events, |e| {
            matches!(e, ClientEvent::Room(RoomEvent::MessageReceived(_)))
        })
        .await;

        let last = host.history(1).await.unwrap();
        assert_eq!(last[0].payload, "hello host");
        assert_eq!(last[0].sender_name, guest_members[0].name);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_reaches_host() {
        let net = MemoryNetwork::new();
        let (host, guest, _code) = room_with_guest(&net).await;
        let mut host_events = host.subscribe();

        assert_eq!(guest.change_name("  Robert ").await.unwrap(), "Robert");
        wait_for(&mut host_events, |e| {
            matches!(e, ClientEvent::Room(RoomEvent::MemberRenamed { new_name, .. }) if new_name == "Robert")
        })
        .await;
        assert!(matches!(
            guest.change_name("").await,
            Err(ClientError::Profile(ProfileError::EmptyName))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_returns_both_sides_to_idle() {
        let net = MemoryNetwork::new();
        let (host, guest, code) = room_with_guest(&net).await;
        let mut host_events = host.subscribe();
        let mut guest_events = guest.subscribe();

        guest.start_call(code.as_str()).await.unwrap();
        wait_for(&mut host_events, |e| {
            matches!(e, ClientEvent::Call(CallEvent::Incoming { .. }))
        })
        .await;

        let ended = wait_for(&mut guest_events, |e| {
            matches!(e, ClientEvent::Call(CallEvent::Ended { .. }))
        })
        .await;
        assert!(matches!(
            ended,
            ClientEvent::Call(CallEvent::Ended {
                reason: CallEndReason::NoAnswer,
                ..
            })
        ));
        wait_for(&mut host_events, |e| {
            matches!(e, ClientEvent::Call(CallEvent::Ended { .. }))
        })
        .await;

        assert_eq!(guest.call_state().await.unwrap(), CallState::Idle);
        assert_eq!(host.call_state().await.unwrap(), CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_loses_room_when_host_dies() {
        let net = MemoryNetwork::new();
        let (_host, guest, code) = room_with_guest(&net).await;
        let mut guest_events = guest.subscribe();

        net.kill_session(code.as_str());

        wait_for(&mut guest_events, |e| matches!(e, ClientEvent::RoomLost)).await;
        assert!(guest.members().await.unwrap().is_empty());
        assert_eq!(guest.pending_timers().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_every_timer() {
        let net = MemoryNetwork::new();
        let (host, guest, _code) = room_with_guest(&net).await;
        let mut host_events = host.subscribe();
        assert!(guest.pending_timers().await.unwrap() >= 2);

        guest.disconnect().await.unwrap();

        assert_eq!(guest.pending_timers().await.unwrap(), 0);
        assert_eq!(guest.connectivity().await.unwrap(), ConnectivityState::Closed);
        wait_for(&mut host_events, |e| {
            matches!(e, ClientEvent::Room(RoomEvent::MemberLeft { .. }))
        })
        .await;
        wait_until_members(&host, 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_room_is_peer_unreachable() {
        let net = MemoryNetwork::new();
        let guest = client(&net);

        let err = guest.join_room("ZZZZZZ").await.unwrap_err();
        assert!(matches!(err, ClientError::PeerUnreachable(_)));
        assert!(matches!(
            guest.join_room("AB").await,
            Err(ClientError::RoomCode(RoomCodeError::InvalidLength))
        ));
        assert!(guest.members().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_the_loop() {
        let net = MemoryNetwork::new();
        let host = client(&net);
        host.create_room().await.unwrap();

        host.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(host.members().await, Err(ClientError::Stopped)));
        assert!(net.session_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_create_fails_within_open_timeout() {
        let net = MemoryNetwork::new();
        net.set_endpoint_stalled("0.peerjs.com", true);
        let host = spawn_client(&net, ClientConfig::default(), Arc::new(FakeProbe::hanging()));

        let start = Instant::now();
        let err = host.create_room().await.unwrap_err();

        assert!(matches!(err, ClientError::Connectivity(_)));
        assert!(start.elapsed() <= Duration::from_secs(10));
        assert_eq!(host.connectivity().await.unwrap(), ConnectivityState::Initializing);
        assert!(host.members().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_opening_returns_promptly() {
        let net = MemoryNetwork::new();
        net.set_endpoint_stalled("0.peerjs.com", true);
        let host = spawn_client(&net, ClientConfig::default(), Arc::new(FakeProbe::hanging()));

        let creating = tokio::spawn({
            let host = host.clone();
            async move { host.create_room().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Der Loop bedient weiter Befehle, während die Session öffnet
        let start = Instant::now();
        assert_eq!(host.connectivity().await.unwrap(), ConnectivityState::Opening);
        assert!(matches!(host.join_room("ABC123").await, Err(ClientError::AlreadyInRoom)));
        host.disconnect().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        assert!(matches!(creating.await.unwrap(), Err(ClientError::Cancelled)));
        assert_eq!(host.connectivity().await.unwrap(), ConnectivityState::Closed);
        assert_eq!(host.pending_timers().await.unwrap(), 0);
        assert!(net.session_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_rejoins_with_new_id_after_endpoint_rotation() {
        let net = MemoryNetwork::new();
        let (host, guest, code) = room_with_rotating_guest(&net).await;
        let old_id = guest.local_id().await.unwrap().unwrap();
        let mut guest_events = guest.subscribe();

        net.set_endpoint_reachable("1.peerjs.com", false);
        let reconnected = wait_for(&mut guest_events, |e| {
            matches!(e, ClientEvent::Reconnected { .. })
        })
        .await;
        let ClientEvent::Reconnected { peer_id: new_id } = reconnected else {
            unreachable!()
        };
        assert_ne!(new_id, old_id);
        assert_eq!(net.open_log().pop().unwrap().endpoint, "2.peerjs.com");

        let host_view = wait_for_roster(&host, |members| {
            members.len() == 2 && members.iter().any(|m| m.id == new_id)
        })
        .await;
        assert!(host_view.iter().all(|m| m.id != old_id));

        let guest_view = wait_for_roster(&guest, |members| {
            members.len() == 2 && members[0].id == new_id
        })
        .await;
        assert_eq!(guest_view[1].id, code.as_str());
        assert_eq!(guest_view[0].name, host_view[1].name);
        assert_eq!(guest.connectivity().await.unwrap(), ConnectivityState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_loses_room_when_host_is_gone_after_reopen() {
        let net = MemoryNetwork::new();
        let (_host, guest, code) = room_with_rotating_guest(&net).await;
        let mut guest_events = guest.subscribe();

        net.set_endpoint_reachable("1.peerjs.com", false);
        // Der Host ist nicht mehr anwählbar, sein Link zum Gast steht noch
        net.drop_signaling_silently(code.as_str());

        wait_for(&mut guest_events, |e| matches!(e, ClientEvent::RoomLost)).await;
        assert!(guest.members().await.unwrap().is_empty());
        assert_eq!(guest.pending_timers().await.unwrap(), 0);
        assert_eq!(guest.connectivity().await.unwrap(), ConnectivityState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_exhausted_reconnect_restores_room() {
        let net = MemoryNetwork::new();
        let host = client(&net);
        let code = host.create_room().await.unwrap();
        let mut events = host.subscribe();

        let catalog = default_rendezvous_catalog();
        for endpoint in &catalog {
            net.set_endpoint_reachable(&endpoint.host, false);
        }
        wait_for(&mut events, |e| matches!(e, ClientEvent::Failed { .. })).await;
        assert_eq!(host.connectivity().await.unwrap(), ConnectivityState::Degraded);
        // nur noch der Sweep des Raums
        assert_eq!(host.pending_timers().await.unwrap(), 1);

        for endpoint in &catalog {
            net.set_endpoint_reachable(&endpoint.host, true);
        }
        host.retry().await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, ClientEvent::Reconnected { peer_id } if peer_id == code.as_str())
        })
        .await;

        assert_eq!(host.connectivity().await.unwrap(), ConnectivityState::Ready);
        assert_eq!(host.members().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_reports_outcome() {
        let net = MemoryNetwork::new();
        let host = client(&net);
        let code = host.create_room().await.unwrap();

        host.retry_on(2).await.unwrap();
        assert_eq!(net.open_log().pop().unwrap().endpoint, "2.peerjs.com");
        assert_eq!(host.local_id().await.unwrap().as_deref(), Some(code.as_str()));

        net.set_endpoint_reachable("3.peerjs.com", false);
        assert!(matches!(host.retry_on(3).await, Err(ClientError::Connectivity(_))));
        assert!(matches!(host.retry_on(9).await, Err(ClientError::Session(_))));
    }
}
