//! Transactional persistence collaborator.
//!
//! Engine systems read through [`EngineStore`] and stage their changes in a
//! [`StoreTransaction`]; the transaction's writes commit atomically and its
//! events and job actions are released only after a successful commit.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod traits;
pub mod transaction;

pub use memory::MemoryEngineStore;
#[cfg(feature = "postgres")]
pub use postgres::PgEngineStore;
pub use traits::EngineStore;
pub use transaction::{StoreTransaction, StoreWrite, TransactionParts};
