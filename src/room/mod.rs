//! Room Module - Raum-Code, Mitgliederliste und Nachrichtenverlauf
//!
//! - Raum-Codes aus einem Alphabet ohne verwechselbare Zeichen
//! - Mitgliedersynchronisation über Anwendungsnachrichten (Stern-Topologie)
//! - Begrenzter Nachrichtenverlauf mit Wiedergabe an neue Gäste

mod code;
mod directory;
mod history;

pub use code::{RoomCode, RoomCodeError, ROOM_CODE_ALPHABET, ROOM_CODE_LEN};
pub use directory::{RoomAction, RoomDirectory, RoomError, RoomEvent, RoomMember, RoomSettings};
pub use history::{MessageHistory, MessageHistoryEntry, MessageKind};
