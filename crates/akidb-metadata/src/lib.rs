//! SQLite persistence of collection tier state for the AkiDB storage engine.

mod tier_state_repository;
mod util;

pub use tier_state_repository::SqliteTierStateRepository;
pub use util::{create_in_memory_pool, create_sqlite_pool, run_migrations};

/// Embedded SQL migrations for the metadata database.
pub const MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
