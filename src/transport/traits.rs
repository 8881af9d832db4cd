//! Capability-Verträge des externen Transports

use crate::call::CaptureStream;
use crate::relay::RelayCandidate;
use crate::rendezvous::RendezvousEndpoint;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Rendezvous endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Peer {0} is not available")]
    PeerUnavailable(String),

    #[error("Identifier {0} is already taken")]
    IdTaken(String),

    #[error("Session is closed")]
    Closed,

    #[error("Link to {0} is closed")]
    LinkClosed(String),

    #[error("Transport error: {0}")]
    Other(String),
}

// ============================================================================
// SESSION TYPES
// ============================================================================

/// Metadaten, die beim Verbindungsaufbau mitgeschickt werden
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMetadata {
    pub name: String,
    pub timestamp: i64,
}

/// Parameter für das Öffnen einer Session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Gewünschte Kennung (Host: der Raum-Code), sonst vergibt der Dienst eine
    pub requested_id: Option<String>,
    pub endpoint: RendezvousEndpoint,
    pub relays: Vec<RelayCandidate>,
}

/// Ereignisse einer offenen Session
#[derive(Clone)]
pub enum TransportEvent {
    /// Ein Peer hat sich mit uns verbunden
    Connection {
        link: Arc<dyn Link>,
        metadata: Option<LinkMetadata>,
    },
    Data { peer_id: String, payload: String },
    LinkClosed { peer_id: String },
    LinkError { peer_id: String, reason: String },
    IncomingCall { call: Arc<dyn MediaCall> },
    /// Medienstrom der Gegenseite ist angekommen
    RemoteStream { call_id: u64, peer_id: String },
    CallClosed { call_id: u64, peer_id: String },
    CallError { call_id: u64, peer_id: String, reason: String },
    /// Verbindung zum Rendezvous-Dienst verloren
    Disconnected,
    Error(TransportError),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::Connection { link, metadata } => f
                .debug_struct("Connection")
                .field("peer_id", &link.peer_id())
                .field("metadata", metadata)
                .finish(),
            TransportEvent::Data { peer_id, payload } => f
                .debug_struct("Data")
                .field("peer_id", peer_id)
                .field("len", &payload.len())
                .finish(),
            TransportEvent::LinkClosed { peer_id } => {
                f.debug_struct("LinkClosed").field("peer_id", peer_id).finish()
            }
            TransportEvent::LinkError { peer_id, reason } => f
                .debug_struct("LinkError")
                .field("peer_id", peer_id)
                .field("reason", reason)
                .finish(),
            TransportEvent::IncomingCall { call } => f
                .debug_struct("IncomingCall")
                .field("call_id", &call.id())
                .field("peer_id", &call.peer_id())
                .finish(),
            TransportEvent::RemoteStream { call_id, peer_id } => f
                .debug_struct("RemoteStream")
                .field("call_id", call_id)
                .field("peer_id", peer_id)
                .finish(),
            TransportEvent::CallClosed { call_id, peer_id } => f
                .debug_struct("CallClosed")
                .field("call_id", call_id)
                .field("peer_id", peer_id)
                .finish(),
            TransportEvent::CallError {
                call_id,
                peer_id,
                reason,
            } => f
                .debug_struct("CallError")
                .field("call_id", call_id)
                .field("peer_id", peer_id)
                .field("reason", reason)
                .finish(),
            TransportEvent::Disconnected => f.write_str("Disconnected"),
            TransportEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

/// Frisch geöffnete Session samt Event-Kanal
pub struct OpenedSession {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

// ============================================================================
// CAPABILITIES
// ============================================================================

/// Zugang zum Rendezvous-Dienst
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn open(&self, config: SessionConfig) -> Result<OpenedSession, TransportError>;
}

/// Eine offene Session beim Rendezvous-Dienst
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Vom Dienst vergebene Kennung
    fn local_id(&self) -> String;

    /// Baut einen Link zu einem anderen Peer auf
    async fn connect(
        &self,
        remote_id: &str,
        metadata: LinkMetadata,
    ) -> Result<Arc<dyn Link>, TransportError>;

    /// Startet einen Anruf mit dem lokalen Audiostrom
    async fn call(
        &self,
        remote_id: &str,
        stream: &dyn CaptureStream,
    ) -> Result<Arc<dyn MediaCall>, TransportError>;

    /// Verbindet sich mit derselben Kennung neu
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// `true` wenn der Dienst die Session noch kennt
    async fn check_liveness(&self) -> bool;

    /// Schließt die Session samt aller Links und Anrufe
    async fn destroy(&self);
}

/// Verbindung zu genau einem Peer (geordnet und zuverlässig)
pub trait Link: Send + Sync {
    fn peer_id(&self) -> &str;

    fn is_open(&self) -> bool;

    fn send(&self, payload: String) -> Result<(), TransportError>;

    fn close(&self);
}

/// Transport-Handle eines Anrufs
pub trait MediaCall: Send + Sync {
    fn id(&self) -> u64;

    fn peer_id(&self) -> &str;

    /// Nimmt einen eingehenden Anruf mit dem lokalen Audiostrom an
    fn answer(&self, stream: &dyn CaptureStream) -> Result<(), TransportError>;

    fn close(&self);
}
