mod config;
mod daemon;

pub use config::{
  BackendType, LikesSection, LoggingSection, PostgresSection, RepliesSection, ServerConfig,
  SqliteSection, StoreSection, ViewsSection, WorkersSection,
};
pub use daemon::Daemon;
