//! Session Module - Lebenszyklus der Transport-Session
//!
//! - Öffnen gegen den aktuellen Rendezvous-Endpunkt mit ausgewählten Relays
//! - Link-Verwaltung und Weiterleitung der Transport-Events
//! - Reconnect-Policy mit Endpunktwechsel und Liveness-Prüfung
//! - Langsame Vorgänge laufen als abbrechbare Hintergrund-Tasks

mod orchestrator;
mod pending;
mod reconnect;

pub use orchestrator::{
    ConnectivityState, Role, SessionError, SessionEvent, SessionInput, SessionOrchestrator,
    SessionTimeouts,
};
pub use reconnect::{ReconnectAction, ReconnectConfig, ReconnectPolicy};
