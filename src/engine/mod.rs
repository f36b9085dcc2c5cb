//! Engagement engine
//!
//! The request path mutates the cache and answers immediately. Store
//! reconciliation goes to the `store` worker pool or the like stream, cache
//! fills go to the `cache` pool, so a slow store never starves repopulation.

mod articles;
mod likes;
mod replies;
mod workers;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub use likes::reconcile_like;
pub use workers::{Job, PoolConfig, PoolStats, WorkerPool};

use crate::cache::CacheStore;
use crate::db::ForumStore;
use crate::error::{ForumError, Result};
use crate::mq::Broker;
use crate::types::Target;

/// Where a confirmed like toggle is reconciled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LikePersistence {
  /// Background job on the store pool
  #[default]
  Direct,
  /// `LikeChangedEvent` on the like stream
  Queue,
}

impl std::str::FromStr for LikePersistence {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "direct" => Ok(LikePersistence::Direct),
      "queue" | "mq" => Ok(LikePersistence::Queue),
      _ => Err(format!("Unknown like persistence: {}", s)),
    }
  }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
  pub like_persistence: LikePersistence,
  pub reply_meta_ttl: Duration,
  pub article_meta_ttl: Duration,
  pub placeholder_ttl: Duration,
  /// Deepest level expanded when listing replies (top level is 0)
  pub max_depth: u32,
  /// Children expanded per reply
  pub max_children: usize,
  /// Largest reply body, in characters
  pub max_content_len: usize,
  /// Largest page size accepted by listings
  pub max_page_size: u32,
  pub store_pool: PoolConfig,
  pub cache_pool: PoolConfig,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      like_persistence: LikePersistence::default(),
      reply_meta_ttl: Duration::from_secs(3600),
      article_meta_ttl: Duration::from_secs(3600),
      placeholder_ttl: Duration::from_secs(60),
      max_depth: 8,
      max_children: 200,
      max_content_len: 500,
      max_page_size: 100,
      store_pool: PoolConfig::default(),
      cache_pool: PoolConfig::default(),
    }
  }
}

pub struct ForumEngine {
  store: Arc<dyn ForumStore>,
  cache: Arc<dyn CacheStore>,
  broker: Arc<dyn Broker>,
  store_pool: WorkerPool,
  cache_pool: WorkerPool,
  config: EngineConfig,
}

impl ForumEngine {
  /// Must be called inside a tokio runtime; the worker pools start here.
  pub fn new(
    store: Arc<dyn ForumStore>,
    cache: Arc<dyn CacheStore>,
    broker: Arc<dyn Broker>,
    config: EngineConfig,
  ) -> Self {
    Self {
      store_pool: WorkerPool::new("store", config.store_pool.clone()),
      cache_pool: WorkerPool::new("cache", config.cache_pool.clone()),
      store,
      cache,
      broker,
      config,
    }
  }

  pub fn store(&self) -> &Arc<dyn ForumStore> {
    &self.store
  }

  pub fn cache(&self) -> &Arc<dyn CacheStore> {
    &self.cache
  }

  pub fn broker(&self) -> &Arc<dyn Broker> {
    &self.broker
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn store_pool(&self) -> &WorkerPool {
    &self.store_pool
  }

  pub fn cache_pool(&self) -> &WorkerPool {
    &self.cache_pool
  }

  /// Wait for every background job submitted so far.
  pub async fn wait_idle(&self) {
    self.store_pool.wait_idle().await;
    self.cache_pool.wait_idle().await;
  }

  /// Stop both pools after draining them.
  pub async fn shutdown(&self) {
    self.store_pool.shutdown().await;
    self.cache_pool.shutdown().await;
  }

  /// Queue a row-level store update. A `false` result means no row matched.
  fn submit_store<F>(&self, op: &'static str, target: Target, update: F)
  where
    F: Future<Output = anyhow::Result<bool>> + Send + 'static,
  {
    self.store_pool.submit(Job::new(op, target, async move {
      if !update.await? {
        debug!(op, target_id = target.id, target_type = %target.kind, "Store update matched no row");
      }
      Ok(())
    }));
  }
}

pub(crate) fn validate_id(name: &str, id: i64) -> Result<()> {
  if id <= 0 {
    return Err(ForumError::Validation(format!("{} must be positive", name)));
  }
  Ok(())
}

pub(crate) fn validate_page(page: u32, size: u32, max_size: u32) -> Result<()> {
  if page == 0 {
    return Err(ForumError::Validation("page starts at 1".to_string()));
  }
  if size == 0 || size > max_size {
    return Err(ForumError::Validation(format!(
      "page size must be between 1 and {}",
      max_size
    )));
  }
  Ok(())
}
