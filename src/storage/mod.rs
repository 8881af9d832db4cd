//! Storage Module - Lokale Persistenz
//!
//! Dieses Modul verwaltet alles, was einen Neustart überlebt:
//! - Key/Value-Store (SQLite oder In-Memory)
//! - Eigener Anzeigename
//! - Namens-Cache für Raum-Mitglieder
//!

mod kv;
mod names;
mod profile;

pub use kv::{KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore, StoreError};
pub use names::{CachedName, NameCache, NAME_KEY_PREFIX};
pub use profile::{
    generate_random_name, load_or_create_display_name, save_display_name, ProfileError,
    DISPLAY_NAME_KEY, MAX_NAME_LEN,
};
