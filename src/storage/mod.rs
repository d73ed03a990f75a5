//! Durable session storage.
//!
//! - `kv`: the key-value capability, with in-memory and `SQLite` backends
//! - `clock`: the time source for session timestamps
//! - `session_store`: keyed session collection with listing projections

pub mod clock;
pub mod errors;
pub mod kv;
pub mod session_store;

pub use clock::{Clock, SystemClock};
pub use errors::{StoreError, StoreResult};
pub use kv::{KeyValueStore, MemoryKvStore, SqliteKvStore, StoreFuture};
pub use session_store::SessionStore;
