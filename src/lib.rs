//! Roomcall - P2P Raum-, Chat- und Voice-Call-Kern
//!
//! Ein Kern für kleine serverlose P2P-Räume mit:
//! - Rendezvous-Dienst mit Endpunkt-Failover
//! - STUN/TURN-Auswahl über WebRTC-Probes
//! - Mitglieder- und Verlaufssynchronisation über Anwendungsnachrichten
//! - Voice-Calls mit Timeouts und genau einem aktiven Anruf
//! - SQLite für Anzeigenamen und Namens-Cache

pub mod call;
pub mod client;
pub mod config;
pub mod protocol;
pub mod relay;
pub mod rendezvous;
pub mod room;
pub mod session;
pub mod storage;
pub mod timer;
pub mod transport;

pub use call::{CallEndReason, CallEvent, CallState};
pub use client::{ClientDeps, ClientError, ClientEvent, RoomClient};
pub use config::{ClientConfig, ConfigError};
pub use room::{RoomCode, RoomEvent, RoomMember};
pub use session::ConnectivityState;

/// Standard-Filter, wenn `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "roomcall=debug,webrtc=warn";

/// Installiert den tracing-Subscriber; weitere Aufrufe sind wirkungslos
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("Logging initialized");
    }
}

// ============================================================================
// TEST SUPPORT
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use crate::call::{AudioConstraints, CaptureStream, MediaCapture, MediaError};
    use crate::relay::{ProbeOutcome, RelayCandidate, RelayProbe};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Probe mit fest vorgegebenen erreichbaren URLs
    pub struct FakeProbe {
        reachable: HashSet<String>,
        hang: bool,
        probed: Mutex<Vec<String>>,
    }

    impl FakeProbe {
        pub fn reachable(urls: &[&str]) -> Self {
            Self {
                reachable: urls.iter().map(|u| u.to_string()).collect(),
                hang: false,
                probed: Mutex::new(Vec::new()),
            }
        }

        /// Antwortet nie
        pub fn hanging() -> Self {
            Self {
                reachable: HashSet::new(),
                hang: true,
                probed: Mutex::new(Vec::new()),
            }
        }

        pub fn probed(&self) -> Vec<String> {
            self.probed.lock().clone()
        }
    }

    #[async_trait]
    impl RelayProbe for FakeProbe {
        async fn probe(&self, candidate: &RelayCandidate, _timeout: Duration) -> ProbeOutcome {
            let url = candidate.urls.first().cloned().unwrap_or_default();
            self.probed.lock().push(url.clone());
            if self.hang {
                return std::future::pending().await;
            }
            if self.reachable.contains(&url) {
                ProbeOutcome::Reachable
            } else {
                ProbeOutcome::Unreachable(format!("{url} refused"))
            }
        }
    }

    /// Audiostrom ohne Gerät
    pub struct FakeStream {
        id: String,
        live: AtomicBool,
        counter: Option<Arc<AtomicUsize>>,
    }

    impl FakeStream {
        pub fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                live: AtomicBool::new(true),
                counter: None,
            }
        }
    }

    impl CaptureStream for FakeStream {
        fn id(&self) -> &str {
            &self.id
        }

        fn stop(&self) {
            if self.live.swap(false, Ordering::SeqCst) {
                if let Some(counter) = &self.counter {
                    counter.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        fn is_live(&self) -> bool {
            self.live.load(Ordering::SeqCst)
        }
    }

    /// Mikrofon, das erlaubt oder verweigert und offene Ströme zählt
    pub struct FakeCapture {
        allow: bool,
        live: Arc<AtomicUsize>,
        issued: AtomicUsize,
    }

    impl FakeCapture {
        pub fn allow() -> Self {
            Self {
                allow: true,
                live: Arc::new(AtomicUsize::new(0)),
                issued: AtomicUsize::new(0),
            }
        }

        pub fn deny() -> Self {
            Self {
                allow: false,
                ..Self::allow()
            }
        }

        /// Noch nicht gestoppte Ströme
        pub fn live_streams(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MediaCapture for FakeCapture {
        async fn acquire_audio(
            &self,
            _constraints: &AudioConstraints,
        ) -> Result<Box<dyn CaptureStream>, MediaError> {
            if !self.allow {
                return Err(MediaError::PermissionDenied);
            }
            let n = self.issued.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeStream {
                id: format!("fake-mic-{n}"),
                live: AtomicBool::new(true),
                counter: Some(Arc::clone(&self.live)),
            }))
        }
    }
}
