//! Room Directory
//!
//! Mitgliederliste und Nachrichtenverlauf eines Raums. Der Host ist die
//! Drehscheibe: er stellt sich neuen Gästen vor, spielt den Verlauf ab,
//! beantwortet Roster-Anfragen und leitet Nachrichten an alle anderen
//! Gäste weiter. Alle Nachrichten sind idempotent; Reihenfolge und
//! Duplikate ändern das Ergebnis nicht.

use super::history::{MessageHistory, MessageHistoryEntry};
use crate::protocol::{AppMessage, UserInfo};
use crate::session::Role;
use crate::storage::NameCache;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Message must not be empty")]
    EmptyMessage,

    #[error("Voice message has no audio")]
    EmptyVoice,
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSettings {
    pub history_capacity: usize,
    /// So viele Einträge bekommt ein neuer Gast vom Host
    pub replay_count: usize,
    /// Nie verbundene Mitglieder verfallen nach dieser Zeit
    pub stale_after_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            replay_count: 20,
            stale_after_ms: 5 * 60 * 1000,
            sweep_interval_ms: 30_000,
        }
    }
}

impl RoomSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    pub id: String,
    pub name: String,
    /// Unix-Millisekunden
    pub last_seen: i64,
}

/// Benutzer-sichtbare Änderungen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    MemberJoined { id: String, name: String },
    MemberLeft { id: String, name: String },
    MemberRenamed {
        id: String,
        old_name: String,
        new_name: String,
    },
    MessageReceived(MessageHistoryEntry),
    /// Vom Host abgespielter Verlauf (ohne eigene Nachrichten)
    HistoryReplayed { entries: Vec<MessageHistoryEntry> },
}

/// Ergebnis eines Handlers; der Event-Loop führt die Aktionen aus
#[derive(Debug, Clone, PartialEq)]
pub enum RoomAction {
    Send { to: String, message: AppMessage },
    Broadcast {
        message: AppMessage,
        except: Option<String>,
    },
    Notify(RoomEvent),
}

// ============================================================================
// DIRECTORY
// ============================================================================

pub struct RoomDirectory {
    local: RoomMember,
    role: Role,
    /// Kennung des Hosts (= Raum-Code)
    host_id: String,
    members: HashMap<String, RoomMember>,
    /// Peers mit direktem Link
    linked: HashSet<String>,
    /// Mitglieder, deren echter Name noch aussteht
    placeholders: HashSet<String>,
    history: MessageHistory,
    names: NameCache,
    settings: RoomSettings,
}

impl RoomDirectory {
    pub fn new(
        local_id: &str,
        local_name: &str,
        role: Role,
        host_id: &str,
        names: NameCache,
        settings: RoomSettings,
        now: i64,
    ) -> Self {
        Self {
            local: RoomMember {
                id: local_id.to_string(),
                name: local_name.to_string(),
                last_seen: now,
            },
            role,
            host_id: host_id.to_string(),
            members: HashMap::new(),
            linked: HashSet::new(),
            placeholders: HashSet::new(),
            history: MessageHistory::new(settings.history_capacity),
            names,
            settings,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local.id
    }

    pub fn local_name(&self) -> &str {
        &self.local.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    /// Neue eigene Kennung nach einem kompletten Session-Neuaufbau
    pub fn rebind_local(&mut self, local_id: &str) {
        if self.local.id != local_id {
            tracing::info!("Local peer id changed {} -> {}", self.local.id, local_id);
            self.members.remove(local_id);
            self.local.id = local_id.to_string();
        }
    }

    /// Platzhalter für Peers ohne bekannten Namen
    fn placeholder_name(peer_id: &str) -> String {
        let prefix: String = peer_id.chars().take(4).collect();
        format!("Guest_{prefix}")
    }

    /// Anzeigename eines Peers, auch wenn er kein Mitglied (mehr) ist
    pub fn display_name_of(&self, peer_id: &str) -> String {
        if peer_id == self.local.id {
            return self.local.name.clone();
        }
        if let Some(member) = self.members.get(peer_id) {
            return member.name.clone();
        }
        self.names
            .lookup(peer_id)
            .map(|cached| cached.name)
            .unwrap_or_else(|| Self::placeholder_name(peer_id))
    }

    // ------------------------------------------------------------------------
    // Members
    // ------------------------------------------------------------------------

    /// Fügt ein Mitglied hinzu oder aktualisiert es (idempotent)
    pub fn join(&mut self, peer_id: &str, name: &str, now: i64) -> Option<RoomEvent> {
        if peer_id == self.local.id || peer_id.is_empty() {
            return None;
        }
        let name = name.trim();
        if name.is_empty() {
            self.ensure_member(peer_id, now);
            return None;
        }

        if let Err(e) = self.names.remember(peer_id, name, now) {
            tracing::warn!("Failed to cache name of {}: {}", peer_id, e);
        }

        let was_placeholder = self.placeholders.remove(peer_id);
        match self.members.get_mut(peer_id) {
            Some(member) => {
                member.last_seen = member.last_seen.max(now);
                if member.name == name {
                    None
                } else if was_placeholder {
                    member.name = name.to_string();
                    Some(RoomEvent::MemberJoined {
                        id: peer_id.to_string(),
                        name: name.to_string(),
                    })
                } else {
                    let old_name = std::mem::replace(&mut member.name, name.to_string());
                    Some(RoomEvent::MemberRenamed {
                        id: peer_id.to_string(),
                        old_name,
                        new_name: name.to_string(),
                    })
                }
            }
            None => {
                tracing::debug!("Member {} ({}) joined", name, peer_id);
                self.members.insert(
                    peer_id.to_string(),
                    RoomMember {
                        id: peer_id.to_string(),
                        name: name.to_string(),
                        last_seen: now,
                    },
                );
                Some(RoomEvent::MemberJoined {
                    id: peer_id.to_string(),
                    name: name.to_string(),
                })
            }
        }
    }

    /// Legt ein Mitglied mit gecachtem oder Platzhalter-Namen an
    fn ensure_member(&mut self, peer_id: &str, now: i64) {
        if self.members.contains_key(peer_id) {
            return;
        }
        let name = match self.names.lookup(peer_id) {
            Some(cached) => cached.name,
            None => {
                self.placeholders.insert(peer_id.to_string());
                Self::placeholder_name(peer_id)
            }
        };
        self.members.insert(
            peer_id.to_string(),
            RoomMember {
                id: peer_id.to_string(),
                name,
                last_seen: now,
            },
        );
    }

    /// Entfernt ein Mitglied und vergisst seinen Namen
    pub fn leave(&mut self, peer_id: &str) -> Option<RoomMember> {
        self.linked.remove(peer_id);
        self.placeholders.remove(peer_id);
        let removed = self.members.remove(peer_id);
        if removed.is_some() {
            if let Err(e) = self.names.forget(peer_id) {
                tracing::warn!("Failed to forget name of {}: {}", peer_id, e);
            }
        }
        removed
    }

    /// Alle Mitglieder, das lokale zuerst
    pub fn members(&self) -> Vec<RoomMember> {
        let mut others: Vec<RoomMember> = self.members.values().cloned().collect();
        others.sort_by(|a, b| a.id.cmp(&b.id));
        let mut all = Vec::with_capacity(others.len() + 1);
        all.push(self.local.clone());
        all.extend(others);
        all
    }

    fn roster(&self) -> Vec<UserInfo> {
        self.members()
            .into_iter()
            .map(|m| UserInfo {
                id: m.id,
                name: m.name,
            })
            .collect()
    }

    pub fn is_linked(&self, peer_id: &str) -> bool {
        self.linked.contains(peer_id)
    }

    // ------------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------------

    pub fn record_message(&mut self, entry: MessageHistoryEntry) {
        self.history.push(entry);
    }

    /// Die letzten `limit` Einträge in Ankunftsreihenfolge
    pub fn history(&self, limit: usize) -> Vec<MessageHistoryEntry> {
        self.history.recent(limit)
    }

    // ------------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------------

    /// Link zu einem Peer ist offen
    pub fn link_opened(&mut self, peer_id: &str, announced_name: Option<&str>, now: i64) -> Vec<RoomAction> {
        self.linked.insert(peer_id.to_string());
        let mut actions = Vec::new();

        match announced_name {
            Some(name) if !name.trim().is_empty() => {
                if let Some(event) = self.join(peer_id, name, now) {
                    actions.push(RoomAction::Notify(event));
                }
            }
            _ => self.ensure_member(peer_id, now),
        }

        let introduction = AppMessage::UserJoin {
            id: self.local.id.clone(),
            name: self.local.name.clone(),
            is_host: self.role == Role::Host,
        };
        actions.push(RoomAction::Send {
            to: peer_id.to_string(),
            message: introduction,
        });

        match self.role {
            Role::Host => {
                if !self.history.is_empty() {
                    let messages = self
                        .history
                        .recent(self.settings.replay_count)
                        .iter()
                        .map(MessageHistoryEntry::to_message)
                        .collect();
                    actions.push(RoomAction::Send {
                        to: peer_id.to_string(),
                        message: AppMessage::MessageHistory { messages },
                    });
                }
            }
            Role::Guest => {
                actions.push(RoomAction::Send {
                    to: peer_id.to_string(),
                    message: AppMessage::UserListRequest {},
                });
            }
        }
        actions
    }

    /// Link zu einem Peer ist geschlossen
    pub fn link_closed(&mut self, peer_id: &str) -> Vec<RoomAction> {
        let Some(member) = self.leave(peer_id) else {
            return Vec::new();
        };
        tracing::info!("{} left the room", member.name);

        let mut actions = vec![RoomAction::Notify(RoomEvent::MemberLeft {
            id: member.id,
            name: member.name,
        })];
        if self.role == Role::Host {
            actions.push(RoomAction::Broadcast {
                message: AppMessage::UserLeft {
                    user_id: peer_id.to_string(),
                },
                except: None,
            });
        }
        actions
    }

    // ------------------------------------------------------------------------
    // Protocol
    // ------------------------------------------------------------------------

    /// Verarbeitet eine Anwendungsnachricht von `from`
    pub fn handle_message(&mut self, from: &str, message: AppMessage, now: i64) -> Vec<RoomAction> {
        tracing::debug!("Received {} from {}", message.kind(), from);
        if let Some(member) = self.members.get_mut(from) {
            member.last_seen = member.last_seen.max(now);
        }

        let mut actions = Vec::new();
        match message {
            AppMessage::Message { .. } | AppMessage::VoiceMessage { .. } => {
                let Some(entry) = MessageHistoryEntry::from_message(&message) else {
                    return actions;
                };
                if entry.sender_id == self.local.id || self.history.contains(&entry) {
                    return actions;
                }
                self.history.push(entry.clone());
                actions.push(RoomAction::Notify(RoomEvent::MessageReceived(entry)));
                self.relay(from, message, &mut actions);
            }

            AppMessage::UserJoin { id, name, .. } => {
                if id == self.local.id {
                    return actions;
                }
                if let Some(event) = self.join(&id, &name, now) {
                    actions.push(RoomAction::Notify(event));
                }
                if self.role == Role::Host {
                    actions.push(RoomAction::Broadcast {
                        message: AppMessage::UserJoinBroadcast {
                            user: UserInfo { id, name },
                        },
                        except: Some(from.to_string()),
                    });
                }
            }

            AppMessage::UserJoinBroadcast { user } => {
                if let Some(event) = self.join(&user.id, &user.name, now) {
                    actions.push(RoomAction::Notify(event));
                }
            }

            AppMessage::UserListRequest {} => {
                if self.role == Role::Host {
                    actions.push(RoomAction::Send {
                        to: from.to_string(),
                        message: AppMessage::UserListResponse {
                            users: self.roster(),
                        },
                    });
                } else {
                    tracing::warn!("Ignoring roster request from {} (not host)", from);
                }
            }

            AppMessage::UserListResponse { users } => {
                for user in users {
                    if let Some(event) = self.join(&user.id, &user.name, now) {
                        actions.push(RoomAction::Notify(event));
                    }
                }
            }

            AppMessage::MessageHistory { messages } => {
                let mut replayed = Vec::new();
                for entry in messages.iter().filter_map(MessageHistoryEntry::from_message) {
                    if self.history.contains(&entry) {
                        continue;
                    }
                    let own = entry.sender_id == self.local.id;
                    self.history.push(entry.clone());
                    if !own {
                        replayed.push(entry);
                    }
                }
                if !replayed.is_empty() {
                    actions.push(RoomAction::Notify(RoomEvent::HistoryReplayed {
                        entries: replayed,
                    }));
                }
            }

            AppMessage::NameChange {
                ref user_id,
                ref new_name,
                ..
            } => {
                if *user_id == self.local.id {
                    return actions;
                }
                let (user_id, new_name) = (user_id.clone(), new_name.clone());
                if let Some(event) = self.join(&user_id, &new_name, now) {
                    actions.push(RoomAction::Notify(event));
                    self.relay(from, message, &mut actions);
                }
            }

            AppMessage::UserLeft { ref user_id } => {
                if *user_id == self.local.id || self.linked.contains(user_id) {
                    return actions;
                }
                let user_id = user_id.clone();
                if let Some(member) = self.leave(&user_id) {
                    actions.push(RoomAction::Notify(RoomEvent::MemberLeft {
                        id: member.id,
                        name: member.name,
                    }));
                    self.relay(from, message, &mut actions);
                }
            }
        }
        actions
    }

    /// Host leitet an alle anderen Gäste weiter
    fn relay(&self, from: &str, message: AppMessage, actions: &mut Vec<RoomAction>) {
        if self.role == Role::Host {
            actions.push(RoomAction::Broadcast {
                message,
                except: Some(from.to_string()),
            });
        }
    }

    // ------------------------------------------------------------------------
    // Local actions
    // ------------------------------------------------------------------------

    /// Eigene Textnachricht: in den Verlauf und an alle Links
    pub fn send_text(&mut self, text: &str, now: i64) -> Result<Vec<RoomAction>, RoomError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RoomError::EmptyMessage);
        }
        let entry = MessageHistoryEntry::text(&self.local.id, &self.local.name, text, now);
        let message = entry.to_message();
        self.history.push(entry);
        Ok(vec![RoomAction::Broadcast {
            message,
            except: None,
        }])
    }

    /// Eigene Sprachnachricht (Audio wird base64-kodiert)
    pub fn send_voice(
        &mut self,
        audio: &[u8],
        duration_secs: u32,
        now: i64,
    ) -> Result<Vec<RoomAction>, RoomError> {
        if audio.is_empty() {
            return Err(RoomError::EmptyVoice);
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(audio);
        let entry = MessageHistoryEntry::voice(
            &self.local.id,
            &self.local.name,
            &encoded,
            duration_secs,
            now,
        );
        let message = entry.to_message();
        self.history.push(entry);
        Ok(vec![RoomAction::Broadcast {
            message,
            except: None,
        }])
    }

    /// Eigener neuer Name (bereits validiert)
    pub fn rename_local(&mut self, new_name: &str) -> Vec<RoomAction> {
        if self.local.name == new_name {
            return Vec::new();
        }
        let old_name = std::mem::replace(&mut self.local.name, new_name.to_string());
        tracing::info!("Renamed {} -> {}", old_name, new_name);
        vec![RoomAction::Broadcast {
            message: AppMessage::NameChange {
                user_id: self.local.id.clone(),
                old_name,
                new_name: new_name.to_string(),
            },
            except: None,
        }]
    }

    /// Eigener Abschied vor dem Trennen
    pub fn farewell(&self) -> RoomAction {
        RoomAction::Broadcast {
            message: AppMessage::UserLeft {
                user_id: self.local.id.clone(),
            },
            except: None,
        }
    }

    // ------------------------------------------------------------------------
    // Sweep
    // ------------------------------------------------------------------------

    /// Entfernt nie verbundene, veraltete Mitglieder und räumt den
    /// Namens-Cache auf. Ein Gast fragt danach die aktuelle Liste neu an.
    pub fn sweep(&mut self, now: i64) -> Vec<RoomAction> {
        let cutoff = now - self.settings.stale_after_ms as i64;
        let stale: Vec<String> = self
            .members
            .values()
            .filter(|m| !self.linked.contains(&m.id) && m.last_seen < cutoff)
            .map(|m| m.id.clone())
            .collect();

        let mut actions = Vec::new();
        for peer_id in stale {
            if let Some(member) = self.leave(&peer_id) {
                tracing::info!("Evicted stale member {} ({})", member.name, member.id);
                actions.push(RoomAction::Notify(RoomEvent::MemberLeft {
                    id: member.id,
                    name: member.name,
                }));
            }
        }

        let mut active: HashSet<String> = self.members.keys().cloned().collect();
        active.insert(self.local.id.clone());
        match self.names.prune(&active, cutoff) {
            Ok(pruned) if !pruned.is_empty() => {
                tracing::debug!("Pruned {} cached name(s)", pruned.len());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to prune name cache: {}", e),
        }

        if self.role == Role::Guest && self.linked.contains(&self.host_id) {
            actions.push(RoomAction::Send {
                to: self.host_id.clone(),
                message: AppMessage::UserListRequest {},
            });
        }
        actions
    }
}

impl std::fmt::Debug for RoomDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomDirectory")
            .field("local", &self.local)
            .field("role", &self.role)
            .field("members", &self.members.len())
            .field("history", &self.history)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
