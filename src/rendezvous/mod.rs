//! Rendezvous Module - Endpunkte des externen Vermittlungsdienstes
//!
//! - Statischer Katalog alternativer Endpunkte
//! - Round-Robin Rotation für Failover

mod pool;

pub use pool::{default_rendezvous_catalog, PoolError, RendezvousEndpoint, RendezvousServerPool};
