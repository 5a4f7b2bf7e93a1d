pub mod event_store; // EventSink + SQLite events, origin outages, monitored prefixes
pub mod retry;
pub mod sqlite_kv;
pub mod state_store; // read-through prefix state cache

pub use event_store::{EventSink, SqliteEventStore};
pub use retry::with_retry;
pub use sqlite_kv::SqliteKvBackend;
pub use state_store::{KvBackend, KvEntry, MemoryKvBackend, StateStore};
