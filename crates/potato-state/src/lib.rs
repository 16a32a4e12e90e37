//! potato-state — desired-state store for Potato.
//!
//! Release rows live in PostgreSQL, one row per service a node should run.
//! The plan server reads them through the [`ReleaseStore`] trait; tests and
//! local runs can use the [`MemoryReleaseStore`] instead.
//!
//! # Architecture
//!
//! ```text
//! ReleaseStore (trait)
//!   ├── PgReleaseStore   → sqlx pool, `releases` table
//!   └── MemoryReleaseStore → Vec<Release> behind an RwLock
//!
//! Startup
//!   └── prepare_store()
//!       ├── ReadinessGate  → poll until reachable (classified backoff)
//!       └── run_migrations → sqlx migrator over `migrations/`
//! ```

pub mod error;
pub mod readiness;
pub mod store;
pub mod types;

pub use error::{ErrorKind, StoreError, StoreResult};
pub use readiness::{ReadinessGate, prepare_store, run_migrations};
pub use store::{MemoryReleaseStore, PgReleaseStore, ReleaseStore};
pub use types::*;
