//! Primary store: the source of truth behind the cache

mod backend;
mod postgres;
mod sqlite;

pub use backend::{like_table, ForumStore, SqlDialect};
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;
