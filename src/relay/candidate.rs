//! Relay-Kandidaten und Standard-Katalog

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Art eines NAT-Traversal-Helfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayKind {
    /// Reflexive Adressermittlung
    Stun,
    /// Relaying über einen Drittserver (braucht Credentials)
    Turn,
}

/// Ein STUN/TURN Eintrag, unveränderlich nach der Definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCandidate {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    pub kind: RelayKind,
}

impl RelayCandidate {
    /// STUN Eintrag mit einer URL
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
            kind: RelayKind::Stun,
        }
    }

    /// TURN Eintrag mit Credentials
    pub fn turn(urls: Vec<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls,
            username: Some(username.into()),
            credential: Some(credential.into()),
            kind: RelayKind::Turn,
        }
    }

    pub fn is_stun(&self) -> bool {
        self.kind == RelayKind::Stun
    }

    /// Konvertiert in die ICE-Server-Konfiguration von webrtc-rs
    pub fn to_ice_server(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Standard STUN/TURN Katalog
pub fn default_relay_catalog() -> Vec<RelayCandidate> {
    vec![
        RelayCandidate::stun("stun:stun.l.google.com:19302"),
        RelayCandidate::stun("stun:stun1.l.google.com:19302"),
        RelayCandidate::stun("stun:stun2.l.google.com:19302"),
        RelayCandidate::stun("stun:stun3.l.google.com:19302"),
        RelayCandidate::stun("stun:global.stun.twilio.com:3478"),
        RelayCandidate::turn(
            vec![
                "turn:openrelay.metered.ca:80".to_string(),
                "turn:openrelay.metered.ca:443".to_string(),
                "turn:openrelay.metered.ca:443?transport=tcp".to_string(),
            ],
            "openrelayproject",
            "openrelayproject",
        ),
    ]
}

/// Minimales Paar, das verwendet wird, wenn kein STUN Server antwortet
pub fn fallback_stun_pair() -> Vec<RelayCandidate> {
    vec![
        RelayCandidate::stun("stun:stun.l.google.com:19302"),
        RelayCandidate::stun("stun:stun1.l.google.com:19302"),
    ]
}
