//! Message Types für das Raum-Protokoll
//!
//! Die Feldnamen entsprechen dem Format der Browser-Clients (camelCase),
//! damit beide Seiten dieselben Nachrichten verstehen.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehlerhafte oder unerwartete Nachricht; wird geloggt und verworfen
#[derive(Error, Debug)]
pub enum ProtocolViolation {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid {kind} message: {reason}")]
    Invalid { kind: &'static str, reason: &'static str },
}

// ============================================================================
// MESSAGES
// ============================================================================

/// Identität eines Mitglieds in Roster-Nachrichten
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
}

/// Alle Nachrichten, die zwischen Raum-Mitgliedern ausgetauscht werden
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppMessage {
    /// Textnachricht
    Message {
        message: String,
        sender: String,
        #[serde(rename = "senderId")]
        sender_id: String,
        /// Unix-Millisekunden beim Absender
        timestamp: i64,
    },

    /// Sprachnachricht, `audio` ist base64-kodiert
    VoiceMessage {
        audio: String,
        sender: String,
        #[serde(rename = "senderId")]
        sender_id: String,
        /// Länge in Sekunden
        duration: u32,
        timestamp: i64,
    },

    /// Vorstellung direkt nach dem Verbindungsaufbau
    UserJoin {
        id: String,
        name: String,
        #[serde(rename = "isHost", default)]
        is_host: bool,
    },

    /// Host informiert bestehende Mitglieder über einen neuen Teilnehmer
    UserJoinBroadcast { user: UserInfo },

    /// Gast fragt den Host nach der vollständigen Mitgliederliste
    UserListRequest {},

    UserListResponse { users: Vec<UserInfo> },

    /// Einmalige Übertragung der letzten Nachrichten an einen neuen Gast
    MessageHistory { messages: Vec<AppMessage> },

    NameChange {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "oldName")]
        old_name: String,
        #[serde(rename = "newName")]
        new_name: String,
    },

    /// Mitglied hat den Raum verlassen
    UserLeft {
        #[serde(rename = "userId")]
        user_id: String,
    },
}

impl AppMessage {
    /// Parst und validiert eine empfangene Nachricht
    pub fn parse(raw: &str) -> Result<Self, ProtocolViolation> {
        let msg: AppMessage = serde_json::from_str(raw)?;
        msg.validate()?;
        Ok(msg)
    }

    /// Serialisiert die Nachricht für den Versand
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Name des `type` Felds, für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            AppMessage::Message { .. } => "message",
            AppMessage::VoiceMessage { .. } => "voice_message",
            AppMessage::UserJoin { .. } => "user_join",
            AppMessage::UserJoinBroadcast { .. } => "user_join_broadcast",
            AppMessage::UserListRequest {} => "user_list_request",
            AppMessage::UserListResponse { .. } => "user_list_response",
            AppMessage::MessageHistory { .. } => "message_history",
            AppMessage::NameChange { .. } => "name_change",
            AppMessage::UserLeft { .. } => "user_left",
        }
    }

    /// `true` für Nachrichten, die in die Historie gehören
    pub fn is_chat(&self) -> bool {
        matches!(self, AppMessage::Message { .. } | AppMessage::VoiceMessage { .. })
    }

    fn validate(&self) -> Result<(), ProtocolViolation> {
        let kind = self.kind();
        let invalid = |reason| Err(ProtocolViolation::Invalid { kind, reason });

        match self {
            AppMessage::Message { sender_id, .. } | AppMessage::VoiceMessage { sender_id, .. }
                if sender_id.is_empty() =>
            {
                invalid("empty sender id")
            }
            AppMessage::VoiceMessage { audio, .. } if audio.is_empty() => invalid("empty audio"),
            AppMessage::UserJoin { id, .. } if id.is_empty() => invalid("empty id"),
            AppMessage::UserJoinBroadcast { user } if user.id.is_empty() => invalid("empty id"),
            AppMessage::UserListResponse { users } if users.iter().any(|u| u.id.is_empty()) => {
                invalid("empty id in roster")
            }
            AppMessage::MessageHistory { messages } => {
                for entry in messages {
                    if !entry.is_chat() {
                        return invalid("non-chat entry in history");
                    }
                    entry.validate()?;
                }
                Ok(())
            }
            AppMessage::NameChange { user_id, .. } | AppMessage::UserLeft { user_id }
                if user_id.is_empty() =>
            {
                invalid("empty user id")
            }
            _ => Ok(()),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
