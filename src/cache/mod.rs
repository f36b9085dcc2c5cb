//! Cache layer for counters, rankings and projections
//!
//! Two backends behind one trait:
//! - `InMemoryCacheStore`: builtin, single process, scripts run under one lock
//! - `RedisCacheStore`: proxy to an external Redis, scripts run as Lua

pub mod config;
mod entry;
pub mod proxy;
mod scripts;
mod store;

use std::sync::Arc;

pub use config::{format_memory_size, parse_memory_size, CacheConfig, CacheMode, CacheProxyConfig};
pub use entry::{CacheEntry, CacheValue, SortedSet};
pub use proxy::RedisCacheStore;
pub use store::{
  CacheStats, CacheStore, CacheStoreError, EvictionPolicy, InMemoryCacheStore, MembershipOp,
  RankingState, ToggleOutcome,
};

/// Build the cache selected by `config.mode`.
///
/// The builtin store is also returned on its own so the caller can drive its
/// expiry sweep.
pub async fn connect(
  config: &CacheConfig,
) -> anyhow::Result<(Arc<dyn CacheStore>, Option<Arc<InMemoryCacheStore>>)> {
  match config.mode {
    CacheMode::Builtin => {
      let store = Arc::new(InMemoryCacheStore::new(
        config.max_memory_bytes(),
        config.eviction,
      ));
      Ok((store.clone(), Some(store)))
    }
    CacheMode::Proxy => {
      let store = RedisCacheStore::new(&config.proxy).await?;
      store.test_connection().await?;
      Ok((Arc::new(store), None))
    }
  }
}
