//! Call Module - Anruf-Zustandsmaschine und Audio Capture
//!
//! Dieses Modul verwaltet:
//! - Den einzigen Call-Leg (Idle, Dialing, Ringing, Active)
//! - Wähl- und Klingel-Timeouts sowie den Sekundentakt aktiver Anrufe
//! - Mikrofon-Zugriff über die `MediaCapture` Capability

mod capture;
mod controller;

#[cfg(feature = "native-audio")]
pub use capture::CpalCapture;
pub use capture::{AudioConstraints, CaptureStream, MediaCapture, MediaError};
pub use controller::{
    CallController, CallEndReason, CallError, CallEvent, CallSettings, CallState,
};
