//! Relay Module - STUN/TURN Auswahl
//!
//! Dieses Modul verwaltet die NAT-Traversal-Helfer:
//! - Statischer Katalog von STUN/TURN Servern
//! - Erreichbarkeitsprüfung einzelner STUN Server
//! - Auswahl einer begrenzten, geordneten Relay-Liste pro Session
//!

mod candidate;
mod probe;
mod selector;

pub use candidate::{default_relay_catalog, fallback_stun_pair, RelayCandidate, RelayKind};
pub use probe::{ProbeOutcome, RelayProbe, WebRtcRelayProbe};
pub use selector::{RelaySelector, SelectionBudget};
