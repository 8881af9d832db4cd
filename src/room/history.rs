//! Nachrichtenverlauf
//!
//! Ring-Buffer mit fester Kapazität; älteste Einträge fallen still heraus.

use crate::protocol::AppMessage;
use ringbuf::{traits::*, HeapRb};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Voice,
}

/// Ein Eintrag im Verlauf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHistoryEntry {
    pub kind: MessageKind,
    pub sender_id: String,
    pub sender_name: String,
    /// Text oder base64-kodiertes Audio
    pub payload: String,
    /// Nur bei Sprachnachrichten (Sekunden)
    pub duration_secs: Option<u32>,
    pub timestamp: i64,
}

impl MessageHistoryEntry {
    pub fn text(sender_id: &str, sender_name: &str, text: &str, timestamp: i64) -> Self {
        Self {
            kind: MessageKind::Text,
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            payload: text.to_string(),
            duration_secs: None,
            timestamp,
        }
    }

    pub fn voice(
        sender_id: &str,
        sender_name: &str,
        audio_base64: &str,
        duration_secs: u32,
        timestamp: i64,
    ) -> Self {
        Self {
            kind: MessageKind::Voice,
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            payload: audio_base64.to_string(),
            duration_secs: Some(duration_secs),
            timestamp,
        }
    }

    /// Chat-Nachrichten werden zu Einträgen, alles andere nicht
    pub fn from_message(message: &AppMessage) -> Option<Self> {
        match message {
            AppMessage::Message {
                message,
                sender,
                sender_id,
                timestamp,
            } => Some(Self::text(sender_id, sender, message, *timestamp)),
            AppMessage::VoiceMessage {
                audio,
                sender,
                sender_id,
                duration,
                timestamp,
            } => Some(Self::voice(sender_id, sender, audio, *duration, *timestamp)),
            _ => None,
        }
    }

    pub fn to_message(&self) -> AppMessage {
        match self.kind {
            MessageKind::Text => AppMessage::Message {
                message: self.payload.clone(),
                sender: self.sender_name.clone(),
                sender_id: self.sender_id.clone(),
                timestamp: self.timestamp,
            },
            MessageKind::Voice => AppMessage::VoiceMessage {
                audio: self.payload.clone(),
                sender: self.sender_name.clone(),
                sender_id: self.sender_id.clone(),
                duration: self.duration_secs.unwrap_or(0),
                timestamp: self.timestamp,
            },
        }
    }

    /// Gleiche Nachricht, unabhängig vom angezeigten Namen
    fn same_message(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.sender_id == other.sender_id
            && self.timestamp == other.timestamp
            && self.payload == other.payload
    }
}

/// Begrenzter Verlauf in Ankunftsreihenfolge
pub struct MessageHistory {
    entries: HeapRb<MessageHistoryEntry>,
}

impl MessageHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HeapRb::new(capacity.max(1)),
        }
    }

    pub fn push(&mut self, entry: MessageHistoryEntry) {
        if let Some(dropped) = self.entries.push_overwrite(entry) {
            tracing::trace!("History full, dropped entry from {}", dropped.sender_id);
        }
    }

    pub fn contains(&self, entry: &MessageHistoryEntry) -> bool {
        self.entries.iter().any(|e| e.same_message(entry))
    }

    /// Die letzten `limit` Einträge, älteste zuerst
    pub fn recent(&self, limit: usize) -> Vec<MessageHistoryEntry> {
        let len = self.entries.occupied_len();
        self.entries
            .iter()
            .skip(len.saturating_sub(limit))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for MessageHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHistory")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(i: usize) -> MessageHistoryEntry {
        MessageHistoryEntry::text("peer", "Peer", &format!("msg {i}"), i as i64)
    }

    #[test]
    fn test_recent_returns_tail_in_arrival_order() {
        let mut history = MessageHistory::new(100);
        for i in 0..5 {
            history.push(entry(i));
        }

        let recent: Vec<String> = history.recent(2).into_iter().map(|e| e.payload).collect();
        assert_eq!(recent, vec!["msg 3", "msg 4"]);
        assert_eq!(history.recent(50).len(), 5);
    }

    #[test]
    fn test_voice_entry_converts_to_message() {
        let voice = MessageHistoryEntry::voice("b", "Bob", "AAAA", 4, 10);
        let message = voice.to_message();

        assert_eq!(message.kind(), "voice_message");
        assert_eq!(MessageHistoryEntry::from_message(&message), Some(voice));
    }

    proptest! {
        #[test]
        fn prop_bounded_and_tail_preserving(count in 0usize..300) {
            let mut history = MessageHistory::new(100);
            for i in 0..count {
                history.push(entry(i));
            }

            prop_assert!(history.len() <= 100);
            let recent = history.recent(20);
            let expected: Vec<i64> = (count.saturating_sub(20)..count).map(|i| i as i64).collect();
            let actual: Vec<i64> = recent.iter().map(|e| e.timestamp).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
