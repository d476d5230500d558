//! # Jobqueue MySQL
//!
//! Durable [`Store`](jobqueue_core::Store) backed by MySQL 8 through SQLx.
//!
//! Jobs live in a single `jobs` table created by the bundled migrations.
//! [`Store::next`](jobqueue_core::Store::next) claims a row inside a
//! transaction with `SELECT ... FOR UPDATE SKIP LOCKED`, so any number of
//! dispatchers, in one process or many, can share the table without
//! handing out the same job twice.
//!
//! ```rust,ignore
//! let pool = jobqueue_mysql::create_pool(&config.store.database).await?;
//! let manager = Manager::builder()
//!     .store(MySqlStore::new(pool))
//!     .build()?;
//! ```

pub mod pool;
pub mod store;

pub use pool::*;
pub use store::MySqlStore;
