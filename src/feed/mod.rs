pub mod connection;
pub mod ris_live; // RIS Live subscribe/decode
pub mod session;

pub use connection::{FeedConnection, FeedError, FeedStats, UpdateHandler};
pub use session::{SessionConfig, SessionState};
