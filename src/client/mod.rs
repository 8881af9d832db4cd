//! Client Module - Fassade und Event-Loop
//!
//! - `RoomClient`: klonbares Handle für Raum, Chat und Anrufe
//! - Event-Loop, der Session, Raum und Anrufsteuerung exklusiv besitzt
//! - `ClientEvent` Broadcast für die (externe) Oberfläche

mod event_loop;
mod handle;

pub use handle::{ClientDeps, ClientError, ClientEvent, RoomClient};
