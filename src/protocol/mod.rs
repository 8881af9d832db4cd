//! Protocol Module - Anwendungsnachrichten zwischen Raum-Mitgliedern
//!
//! Alle Nachrichten sind JSON-Objekte mit einem `type` Feld und werden
//! über die Links der Session als Text übertragen.

mod messages;

pub use messages::{AppMessage, ProtocolViolation, UserInfo};
