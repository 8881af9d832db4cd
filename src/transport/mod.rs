//! Transport Module - Capability-Verträge für Session, Links und Anrufe
//!
//! - `PeerTransport` öffnet Sessions beim Rendezvous-Dienst
//! - `TransportSession` verbindet Peers und startet Anrufe
//! - `MemoryNetwork` ist eine In-Process-Implementierung für Tests und Demos

mod memory;
mod traits;

pub use memory::{MemoryNetwork, OpenRecord};
pub use traits::{
    Link, LinkMetadata, MediaCall, OpenedSession, PeerTransport, SessionConfig, TransportError,
    TransportEvent, TransportSession,
};
