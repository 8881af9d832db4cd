//! In-Process Rendezvous-Dienst und Transport
//!
//! Alle Sessions eines `MemoryNetwork` teilen sich einen Hub. Tests können
//! Endpunkte abschalten, die Signaling-Verbindung einzelner Sessions
//! trennen oder Sessions komplett verschwinden lassen.

use super::traits::{
    Link, LinkMetadata, MediaCall, OpenedSession, PeerTransport, SessionConfig, TransportError,
    TransportEvent, TransportSession,
};
use crate::call::CaptureStream;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

type EventTx = mpsc::UnboundedSender<TransportEvent>;

/// Protokolleintrag eines `open` Aufrufs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRecord {
    pub endpoint: String,
    pub requested_id: Option<String>,
    /// Vergebene Kennung, `None` wenn das Öffnen fehlschlug
    pub assigned_id: Option<String>,
}

struct SessionEntry {
    tx: EventTx,
    endpoint: String,
    online: bool,
    /// Unterscheidet eine neue Session mit gleicher Kennung von einer alten
    generation: u64,
}

#[derive(Default)]
struct Hub {
    sessions: HashMap<String, SessionEntry>,
    unreachable: HashSet<String>,
    stalled: HashSet<String>,
    links: Vec<Arc<MemoryLink>>,
    calls: Vec<Arc<MemoryCall>>,
    open_log: Vec<OpenRecord>,
    next_generation: u64,
    next_call_id: u64,
}

impl Hub {
    fn is_live(&self, id: &str, generation: u64) -> bool {
        self.sessions
            .get(id)
            .map(|s| s.generation == generation)
            .unwrap_or(false)
    }

    /// Entfernt geschlossene Links und Anrufe und liefert die offenen von `id`
    fn take_resources_of(&mut self, id: &str) -> (Vec<Arc<MemoryLink>>, Vec<Arc<MemoryCall>>) {
        self.links.retain(|l| l.is_open());
        self.calls.retain(|c| !c.state.closed.load(Ordering::SeqCst));
        let links = self
            .links
            .iter()
            .filter(|l| l.local_id == id || l.peer_id == id)
            .cloned()
            .collect();
        let calls = self
            .calls
            .iter()
            .filter(|c| c.local_id == id || c.peer_id == id)
            .cloned()
            .collect();
        (links, calls)
    }
}

// ============================================================================
// NETWORK
// ============================================================================

/// Gemeinsames In-Process-Netz
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schaltet einen Endpunkt (Host-Name) ab oder wieder an. Sessions auf
    /// einem abgeschalteten Endpunkt verlieren ihre Signaling-Verbindung.
    pub fn set_endpoint_reachable(&self, host: &str, reachable: bool) {
        let mut dropped = Vec::new();
        {
            let mut hub = self.hub.lock();
            if reachable {
                hub.unreachable.remove(host);
            } else {
                hub.unreachable.insert(host.to_string());
                for entry in hub.sessions.values_mut() {
                    if entry.endpoint == host && entry.online {
                        entry.online = false;
                        dropped.push(entry.tx.clone());
                    }
                }
            }
        }
        for tx in dropped {
            let _ = tx.send(TransportEvent::Disconnected);
        }
    }

    /// `open` auf diesem Endpunkt antwortet nie
    pub fn set_endpoint_stalled(&self, host: &str, stalled: bool) {
        let mut hub = self.hub.lock();
        if stalled {
            hub.stalled.insert(host.to_string());
        } else {
            hub.stalled.remove(host);
        }
    }

    /// Trennt die Signaling-Verbindung einer Session; Links bleiben bestehen
    pub fn drop_signaling(&self, id: &str) {
        let tx = {
            let mut hub = self.hub.lock();
            match hub.sessions.get_mut(id) {
                Some(entry) if entry.online => {
                    entry.online = false;
                    Some(entry.tx.clone())
                }
                _ => None,
            }
        };
        if let Some(tx) = tx {
            let _ = tx.send(TransportEvent::Disconnected);
        }
    }

    /// Wie `drop_signaling`, aber ohne `Disconnected` Event
    pub fn drop_signaling_silently(&self, id: &str) {
        if let Some(entry) = self.hub.lock().sessions.get_mut(id) {
            entry.online = false;
        }
    }

    /// Lässt eine Session samt Links und Anrufen verschwinden
    pub fn kill_session(&self, id: &str) {
        let (links, calls, tx) = {
            let mut hub = self.hub.lock();
            let (links, calls) = hub.take_resources_of(id);
            let tx = hub.sessions.remove(id).map(|entry| entry.tx);
            (links, calls, tx)
        };
        for link in links {
            link.close();
        }
        for call in calls {
            call.close();
        }
        if let Some(tx) = tx {
            let _ = tx.send(TransportEvent::Disconnected);
        }
    }

    /// Schließt den Link zwischen zwei Peers
    pub fn close_link(&self, a: &str, b: &str) {
        let links: Vec<Arc<MemoryLink>> = {
            let hub = self.hub.lock();
            hub.links
                .iter()
                .filter(|l| {
                    (l.local_id == a && l.peer_id == b) || (l.local_id == b && l.peer_id == a)
                })
                .cloned()
                .collect()
        };
        for link in links {
            link.close();
        }
    }

    /// Alle `open` Aufrufe in Reihenfolge
    pub fn open_log(&self) -> Vec<OpenRecord> {
        self.hub.lock().open_log.clone()
    }

    /// Kennungen aller registrierten Sessions
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.hub.lock().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("sessions", &self.session_ids())
            .finish()
    }
}

#[async_trait]
impl PeerTransport for MemoryNetwork {
    async fn open(&self, config: SessionConfig) -> Result<OpenedSession, TransportError> {
        let host = config.endpoint.host.clone();
        let stalled = self.hub.lock().stalled.contains(&host);
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut hub = self.hub.lock();
        let result = if hub.unreachable.contains(&host) {
            Err(TransportError::Unreachable(host.clone()))
        } else {
            match &config.requested_id {
                Some(id) if hub.sessions.contains_key(id) => Err(TransportError::IdTaken(id.clone())),
                Some(id) => Ok(id.clone()),
                None => Ok(uuid::Uuid::new_v4().to_string()),
            }
        };

        hub.open_log.push(OpenRecord {
            endpoint: host.clone(),
            requested_id: config.requested_id.clone(),
            assigned_id: result.as_ref().ok().cloned(),
        });
        let id = result?;

        hub.next_generation += 1;
        let generation = hub.next_generation;
        let (tx, rx) = mpsc::unbounded_channel();
        hub.sessions.insert(
            id.clone(),
            SessionEntry {
                tx,
                endpoint: host,
                online: true,
                generation,
            },
        );
        tracing::debug!("Memory session {} opened ({} relays)", id, config.relays.len());

        Ok(OpenedSession {
            session: Arc::new(MemorySession {
                id,
                generation,
                hub: Arc::clone(&self.hub),
            }),
            events: rx,
        })
    }
}

// ============================================================================
// SESSION
// ============================================================================

struct MemorySession {
    id: String,
    generation: u64,
    hub: Arc<Mutex<Hub>>,
}

impl MemorySession {
    /// Event-Kanäle beider Seiten, falls beide online sind
    fn channels_to(&self, remote_id: &str) -> Result<(EventTx, EventTx), TransportError> {
        let hub = self.hub.lock();
        let local = hub
            .sessions
            .get(&self.id)
            .filter(|s| s.generation == self.generation)
            .ok_or(TransportError::Closed)?;
        let remote = hub
            .sessions
            .get(remote_id)
            .filter(|s| s.online)
            .ok_or_else(|| TransportError::PeerUnavailable(remote_id.to_string()))?;
        Ok((local.tx.clone(), remote.tx.clone()))
    }
}

#[async_trait]
impl TransportSession for MemorySession {
    fn local_id(&self) -> String {
        self.id.clone()
    }

    async fn connect(
        &self,
        remote_id: &str,
        metadata: LinkMetadata,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let (local_tx, remote_tx) = self.channels_to(remote_id)?;
        let open = Arc::new(AtomicBool::new(true));

        let local = Arc::new(MemoryLink {
            local_id: self.id.clone(),
            peer_id: remote_id.to_string(),
            local_tx: local_tx.clone(),
            remote_tx: remote_tx.clone(),
            open: Arc::clone(&open),
        });
        let remote = Arc::new(MemoryLink {
            local_id: remote_id.to_string(),
            peer_id: self.id.clone(),
            local_tx: remote_tx.clone(),
            remote_tx: local_tx,
            open,
        });

        self.hub.lock().links.push(Arc::clone(&local));
        let _ = remote_tx.send(TransportEvent::Connection {
            link: remote,
            metadata: Some(metadata),
        });
        Ok(local)
    }

    async fn call(
        &self,
        remote_id: &str,
        stream: &dyn CaptureStream,
    ) -> Result<Arc<dyn MediaCall>, TransportError> {
        let (local_tx, remote_tx) = self.channels_to(remote_id)?;
        let call_id = {
            let mut hub = self.hub.lock();
            hub.next_call_id += 1;
            hub.next_call_id
        };
        let state = Arc::new(CallShared::default());

        let local = Arc::new(MemoryCall {
            id: call_id,
            local_id: self.id.clone(),
            peer_id: remote_id.to_string(),
            local_tx: local_tx.clone(),
            remote_tx: remote_tx.clone(),
            state: Arc::clone(&state),
        });
        let remote = Arc::new(MemoryCall {
            id: call_id,
            local_id: remote_id.to_string(),
            peer_id: self.id.clone(),
            local_tx: remote_tx.clone(),
            remote_tx: local_tx,
            state,
        });

        self.hub.lock().calls.push(Arc::clone(&local));
        tracing::debug!("Memory call {} to {} with stream {}", call_id, remote_id, stream.id());
        let _ = remote_tx.send(TransportEvent::IncomingCall { call: remote });
        Ok(local)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let mut hub = self.hub.lock();
        let Hub {
            sessions,
            unreachable,
            ..
        } = &mut *hub;
        let entry = sessions
            .get_mut(&self.id)
            .filter(|s| s.generation == self.generation)
            .ok_or(TransportError::Closed)?;
        if unreachable.contains(&entry.endpoint) {
            return Err(TransportError::Unreachable(entry.endpoint.clone()));
        }
        entry.online = true;
        Ok(())
    }

    async fn check_liveness(&self) -> bool {
        let hub = self.hub.lock();
        hub.sessions
            .get(&self.id)
            .filter(|s| s.generation == self.generation)
            .map(|s| s.online && !hub.unreachable.contains(&s.endpoint))
            .unwrap_or(false)
    }

    async fn destroy(&self) {
        let (links, calls) = {
            let mut hub = self.hub.lock();
            if !hub.is_live(&self.id, self.generation) {
                return;
            }
            hub.sessions.remove(&self.id);
            hub.take_resources_of(&self.id)
        };
        for link in links {
            link.close();
        }
        for call in calls {
            call.close();
        }
        tracing::debug!("Memory session {} destroyed", self.id);
    }
}

// ============================================================================
// LINKS
// ============================================================================

struct MemoryLink {
    local_id: String,
    peer_id: String,
    local_tx: EventTx,
    remote_tx: EventTx,
    /// Gemeinsam mit der Gegenseite
    open: Arc<AtomicBool>,
}

impl Link for MemoryLink {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, payload: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::LinkClosed(self.peer_id.clone()));
        }
        self.remote_tx
            .send(TransportEvent::Data {
                peer_id: self.local_id.clone(),
                payload,
            })
            .map_err(|_| TransportError::LinkClosed(self.peer_id.clone()))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.local_tx.send(TransportEvent::LinkClosed {
                peer_id: self.peer_id.clone(),
            });
            let _ = self.remote_tx.send(TransportEvent::LinkClosed {
                peer_id: self.local_id.clone(),
            });
        }
    }
}

// ============================================================================
// CALLS
// ============================================================================

#[derive(Default)]
struct CallShared {
    answered: AtomicBool,
    closed: AtomicBool,
}

struct MemoryCall {
    id: u64,
    local_id: String,
    peer_id: String,
    local_tx: EventTx,
    remote_tx: EventTx,
    state: Arc<CallShared>,
}

impl MediaCall for MemoryCall {
    fn id(&self) -> u64 {
        self.id
    }

    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn answer(&self, stream: &dyn CaptureStream) -> Result<(), TransportError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.state.answered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!("Memory call {} answered with stream {}", self.id, stream.id());
        let _ = self.local_tx.send(TransportEvent::RemoteStream {
            call_id: self.id,
            peer_id: self.peer_id.clone(),
        });
        let _ = self.remote_tx.send(TransportEvent::RemoteStream {
            call_id: self.id,
            peer_id: self.local_id.clone(),
        });
        Ok(())
    }

    fn close(&self) {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            let _ = self.local_tx.send(TransportEvent::CallClosed {
                call_id: self.id,
                peer_id: self.peer_id.clone(),
            });
            let _ = self.remote_tx.send(TransportEvent::CallClosed {
                call_id: self.id,
                peer_id: self.local_id.clone(),
            });
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::RendezvousEndpoint;
    use crate::test_support::FakeStream;

    fn config(host: &str, requested: Option<&str>) -> SessionConfig {
        SessionConfig {
            requested_id: requested.map(str::to_string),
            endpoint: RendezvousEndpoint::new(host, 443, "/", "test", true),
            relays: Vec::new(),
        }
    }

    fn meta(name: &str) -> LinkMetadata {
        LinkMetadata {
            name: name.into(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_requested_id_is_exclusive() {
        let net = MemoryNetwork::new();
        let host = net.open(config("a", Some("ROOM42"))).await.unwrap();
        assert_eq!(host.session.local_id(), "ROOM42");

        let err = net.open(config("a", Some("ROOM42"))).await.err().unwrap();
        assert_eq!(err, TransportError::IdTaken("ROOM42".into()));

        host.session.destroy().await;
        assert!(net.open(config("a", Some("ROOM42"))).await.is_ok());
    }

    #[tokio::test]
    async fn test_link_delivers_data_and_close_to_both_sides() {
        let net = MemoryNetwork::new();
        let mut host = net.open(config("a", Some("HOST"))).await.unwrap();
        let mut guest = net.open(config("a", None)).await.unwrap();

        let link = guest.session.connect("HOST", meta("Bob")).await.unwrap();
        let inbound = match host.events.recv().await.unwrap() {
            TransportEvent::Connection { link, metadata } => {
                assert_eq!(metadata.unwrap().name, "Bob");
                link
            }
            other => panic!("unexpected {other:?}"),
        };

        link.send("hello".into()).unwrap();
        match host.events.recv().await.unwrap() {
            TransportEvent::Data { peer_id, payload } => {
                assert_eq!(peer_id, guest.session.local_id());
                assert_eq!(payload, "hello");
            }
            other => panic!("unexpected {other:?}"),
        }

        inbound.close();
        assert!(!link.is_open());
        assert!(matches!(host.events.recv().await, Some(TransportEvent::LinkClosed { .. })));
        assert!(matches!(guest.events.recv().await, Some(TransportEvent::LinkClosed { .. })));
        assert!(link.send("late".into()).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_and_unknown_peer() {
        let net = MemoryNetwork::new();
        net.set_endpoint_reachable("down", false);
        assert!(matches!(
            net.open(config("down", None)).await,
            Err(TransportError::Unreachable(_))
        ));

        let guest = net.open(config("up", None)).await.unwrap();
        assert!(matches!(
            guest.session.connect("NOPE", meta("x")).await,
            Err(TransportError::PeerUnavailable(_))
        ));
        assert_eq!(net.open_log().len(), 2);
        assert_eq!(net.open_log()[0].assigned_id, None);
    }

    #[tokio::test]
    async fn test_signaling_drop_and_reconnect() {
        let net = MemoryNetwork::new();
        let mut opened = net.open(config("a", None)).await.unwrap();
        let id = opened.session.local_id();

        net.drop_signaling(&id);
        assert!(matches!(opened.events.recv().await, Some(TransportEvent::Disconnected)));
        assert!(!opened.session.check_liveness().await);

        opened.session.reconnect().await.unwrap();
        assert!(opened.session.check_liveness().await);

        net.set_endpoint_reachable("a", false);
        assert!(opened.session.reconnect().await.is_err());
    }

    #[tokio::test]
    async fn test_call_answer_and_close() {
        let net = MemoryNetwork::new();
        let mut a = net.open(config("a", Some("A"))).await.unwrap();
        let mut b = net.open(config("a", Some("B"))).await.unwrap();
        let stream = FakeStream::new("mic");

        let outgoing = a.session.call("B", &stream).await.unwrap();
        let incoming = match b.events.recv().await.unwrap() {
            TransportEvent::IncomingCall { call } => call,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(incoming.id(), outgoing.id());
        assert_eq!(incoming.peer_id(), "A");

        incoming.answer(&stream).unwrap();
        assert!(matches!(
            a.events.recv().await,
            Some(TransportEvent::RemoteStream { peer_id, .. }) if peer_id == "B"
        ));
        assert!(matches!(b.events.recv().await, Some(TransportEvent::RemoteStream { .. })));

        outgoing.close();
        assert!(matches!(a.events.recv().await, Some(TransportEvent::CallClosed { .. })));
        assert!(matches!(b.events.recv().await, Some(TransportEvent::CallClosed { .. })));
        assert!(incoming.answer(&stream).is_err());
    }
}
