//! Database layer for the control plane.

mod memory;
mod models;
mod pool;
mod postgres;
mod store;

pub use memory::{MemoryStore, DEFAULT_REGISTRY_URL};
pub use models::*;
pub use pool::{create_pool, run_migrations};
pub use postgres::PgStore;
pub use store::*;
