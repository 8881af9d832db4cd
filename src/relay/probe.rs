//! Erreichbarkeitsprüfung für STUN Server
//!
//! Baut eine kurzlebige Peer Connection auf, die nur den geprüften Server
//! kennt, und wartet auf einen server-reflexiven Kandidaten oder das Ende
//! des ICE-Gatherings.

use super::candidate::RelayCandidate;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

/// Ergebnis einer einzelnen Prüfung
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Mindestens ein Erreichbarkeitssignal vor dem Timeout
    Reachable,
    /// Verhandlung fehlgeschlagen
    Unreachable(String),
    /// Kein Signal innerhalb des Timeouts
    TimedOut,
}

/// Prüft, ob ein Relay-Kandidat erreichbar ist
#[async_trait]
pub trait RelayProbe: Send + Sync {
    /// Muss alle geöffneten Ressourcen auf jedem Pfad wieder freigeben,
    /// auch wenn der Future vorzeitig gedroppt wird.
    async fn probe(&self, candidate: &RelayCandidate, timeout: Duration) -> ProbeOutcome;
}

// ============================================================================
// WEBRTC PROBE
// ============================================================================

/// Signal aus dem ICE-Callback
#[derive(Debug)]
enum GatherSignal {
    Reflexive,
    Complete,
}

/// Prüft STUN Server über webrtc-rs
#[derive(Debug, Default, Clone)]
pub struct WebRtcRelayProbe;

impl WebRtcRelayProbe {
    pub fn new() -> Self {
        Self
    }

    /// Erstellt eine Peer Connection, die nur den geprüften Server kennt
    async fn create_peer_connection(
        candidate: &RelayCandidate,
    ) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![candidate.to_ice_server()],
            ..Default::default()
        };

        Ok(Arc::new(api.new_peer_connection(config).await?))
    }

    async fn gather(
        pc: &Arc<RTCPeerConnection>,
        timeout: Duration,
    ) -> Result<ProbeOutcome, webrtc::Error> {
        let (tx, mut rx) = mpsc::channel::<GatherSignal>(4);

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let signal = match candidate {
                    Some(c) if c.typ == RTCIceCandidateType::Srflx => Some(GatherSignal::Reflexive),
                    Some(_) => None,
                    None => Some(GatherSignal::Complete),
                };
                if let Some(signal) = signal {
                    let _ = tx.send(signal).await;
                }
            })
        }));

        // Ein Data Channel reicht, damit das Offer ICE-Gathering auslöst
        pc.create_data_channel("probe", None).await?;
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await?;

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(signal)) => {
                tracing::debug!("Relay probe signal: {:?}", signal);
                Ok(ProbeOutcome::Reachable)
            }
            Ok(None) => Ok(ProbeOutcome::Unreachable("gathering aborted".to_string())),
            Err(_) => Ok(ProbeOutcome::TimedOut),
        }
    }
}

/// Schließt die Peer Connection, auch wenn der Probe-Future gedroppt wird
struct ProbeGuard {
    pc: Option<Arc<RTCPeerConnection>>,
}

impl ProbeGuard {
    async fn close(mut self) {
        if let Some(pc) = self.pc.take() {
            if let Err(e) = pc.close().await {
                tracing::debug!("Failed to close probe connection: {}", e);
            }
        }
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if let Some(pc) = self.pc.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = pc.close().await;
                });
            }
        }
    }
}

#[async_trait]
impl RelayProbe for WebRtcRelayProbe {
    async fn probe(&self, candidate: &RelayCandidate, timeout: Duration) -> ProbeOutcome {
        let pc = match Self::create_peer_connection(candidate).await {
            Ok(pc) => pc,
            Err(e) => return ProbeOutcome::Unreachable(e.to_string()),
        };
        let guard = ProbeGuard {
            pc: Some(Arc::clone(&pc)),
        };

        let outcome = match Self::gather(&pc, timeout).await {
            Ok(outcome) => outcome,
            Err(e) => ProbeOutcome::Unreachable(e.to_string()),
        };

        guard.close().await;
        outcome
    }
}
