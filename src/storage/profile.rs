//! Anzeigename des lokalen Benutzers
//!
//! Lädt den gespeicherten Namen oder erzeugt beim ersten Start einen
//! zufälligen Namen und speichert ihn.
//!
//! ## Verwendung
//! ```rust,ignore
//! let name = load_or_create_display_name(store.as_ref())?;
//! let name = save_display_name(store.as_ref(), "  Alice ")?; // "Alice"
//! ```

use super::kv::{KeyValueStore, StoreError};
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

/// Store-Key des eigenen Anzeigenamens
pub const DISPLAY_NAME_KEY: &str = "p2p_chat_username";

/// Maximale Länge eines Anzeigenamens in Zeichen
pub const MAX_NAME_LEN: usize = 20;

const ADJECTIVES: &[&str] = &[
    "Cheerful", "Serious", "Clever", "Brave", "Kind", "Swift", "Quiet", "Bright",
];
const ANIMALS: &[&str] = &[
    "Raccoon", "Tiger", "Owl", "Dolphin", "Wolf", "Bear", "Fox", "Hedgehog",
];

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Display name must not be empty")]
    EmptyName,

    #[error("Display name must not exceed {MAX_NAME_LEN} characters")]
    NameTooLong,

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

// ============================================================================
// PROFILE
// ============================================================================

/// Lädt den gespeicherten Anzeigenamen oder erstellt einen neuen
pub fn load_or_create_display_name(store: &dyn KeyValueStore) -> Result<String, ProfileError> {
    if let Some(saved) = store.get(DISPLAY_NAME_KEY)? {
        if let Ok(name) = validate_name(&saved) {
            tracing::info!("Loaded display name '{}'", name);
            return Ok(name);
        }
        tracing::warn!("Stored display name is invalid, generating a new one");
    }

    let name = generate_random_name();
    store.set(DISPLAY_NAME_KEY, &name)?;
    tracing::info!("Created display name '{}'", name);
    Ok(name)
}

/// Prüft und speichert einen neuen Anzeigenamen
pub fn save_display_name(store: &dyn KeyValueStore, name: &str) -> Result<String, ProfileError> {
    let name = validate_name(name)?;
    store.set(DISPLAY_NAME_KEY, &name)?;
    Ok(name)
}

/// Erzeugt einen Namen der Form `Adjektiv_Tier_NN`
pub fn generate_random_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Quiet");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("Fox");
    let number: u8 = rng.gen_range(0..100);
    format!("{adjective}_{animal}_{number}")
}

fn validate_name(name: &str) -> Result<String, ProfileError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ProfileError::EmptyName);
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(ProfileError::NameTooLong);
    }
    Ok(trimmed.to_string())
}

// ============================================================================
// TESTS
// ============================================================================
