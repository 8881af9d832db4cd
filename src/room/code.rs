//! Raum-Codes

use rand::Rng;
use std::fmt;
use thiserror::Error;

/// Alphabet für neue Codes (ohne I, O, 0, 1)
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const ROOM_CODE_LEN: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomCodeError {
    #[error("Room code must be {ROOM_CODE_LEN} characters long")]
    InvalidLength,

    #[error("Room code may only contain letters and digits")]
    InvalidCharacter,
}

/// Normalisierter Raum-Code (Großbuchstaben)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomCode(String);

impl RoomCode {
    /// Erzeugt einen zufälligen Code
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..ROOM_CODE_LEN)
            .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Parst eine Benutzereingabe. Groß-/Kleinschreibung wird ignoriert;
    /// ältere Codes mit Ziffern wie `ABC123` bleiben gültig.
    pub fn parse(input: &str) -> Result<Self, RoomCodeError> {
        let trimmed = input.trim();
        if trimmed.chars().count() != ROOM_CODE_LEN {
            return Err(RoomCodeError::InvalidLength);
        }
        if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(RoomCodeError::InvalidCharacter);
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_codes_use_unambiguous_alphabet() {
        for _ in 0..200 {
            let code = RoomCode::generate();
            assert_eq!(code.as_str().len(), ROOM_CODE_LEN);
            assert!(code.as_str().bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b)));
            assert_eq!(RoomCode::parse(code.as_str()).unwrap(), code);
        }
    }

    #[test]
    fn test_parse_normalizes_case_and_whitespace() {
        assert_eq!(RoomCode::parse("  abc123 ").unwrap().as_str(), "ABC123");
        assert_eq!(RoomCode::parse("abc123"), RoomCode::parse("ABC123"));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(RoomCode::parse("ABC12"), Err(RoomCodeError::InvalidLength));
        assert_eq!(RoomCode::parse("ABC-12"), Err(RoomCodeError::InvalidCharacter));
        assert_eq!(RoomCode::parse("ÄBC123"), Err(RoomCodeError::InvalidCharacter));
    }
}
