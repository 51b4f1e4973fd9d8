//! Reference data store back ends for the orbital job scheduler.
//!
//! [`memory::MemoryDataStore`] is always available and is the primary
//! vehicle for tests. The `postgres` and `mongodb` features add back ends
//! over a relational and a document store respectively, each implementing
//! the same [`orbital_core::DataStore`] contract.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mongodb")]
pub mod mongo;

pub use memory::MemoryDataStore;

#[cfg(feature = "postgres")]
pub use postgres::{OpenError as PostgresOpenError, PostgresDataStore};

#[cfg(feature = "mongodb")]
pub use mongo::{MongoDataStore, OpenError as MongoOpenError};
