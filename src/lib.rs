//! Engagement counters and threaded-reply caching for a forum backend.
//!
//! Requests mutate the cache first and answer immediately; background
//! workers and the event consumer bring the primary store in line.

pub mod cache;
pub mod db;
pub mod engine;
pub mod error;
pub mod keys;
pub mod mq;
pub mod server;
pub mod types;

pub use engine::{EngineConfig, ForumEngine, LikePersistence};
pub use error::{ErrorKind, ForumError, Result};
