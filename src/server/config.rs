use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::engine::{EngineConfig, LikePersistence, PoolConfig};
use crate::mq::{ConsumerConfig, MqConfig};

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax.
fn expand_env_vars(input: &str) -> String {
  let mut result = input.to_string();

  // ${VAR_NAME} first, it is the more specific form
  while let Some(start) = result.find("${") {
    if let Some(end) = result[start..].find('}') {
      let var_name = &result[start + 2..start + end];
      let value = std::env::var(var_name).unwrap_or_default();
      result = format!(
        "{}{}{}",
        &result[..start],
        value,
        &result[start + end + 1..]
      );
    } else {
      break;
    }
  }

  // $VAR_NAME runs over alphanumerics and underscores
  let mut i = 0;
  while i < result.len() {
    if result[i..].starts_with('$') && !result[i..].starts_with("${") {
      let rest = &result[i + 1..];
      let var_len = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .count();
      if var_len > 0 {
        let var_name = &rest[..var_len];
        let value = std::env::var(var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..i], value, &rest[var_len..]);
        i += value.len();
        continue;
      }
    }
    i += 1;
  }

  result
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
  Postgres,
  #[default]
  Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
  #[serde(default)]
  pub store: StoreSection,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub mq: MqConfig,
  #[serde(default)]
  pub workers: WorkersSection,
  #[serde(default)]
  pub views: ViewsSection,
  #[serde(default)]
  pub replies: RepliesSection,
  #[serde(default)]
  pub likes: LikesSection,
  #[serde(default)]
  pub logging: LoggingSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSection {
  #[serde(default)]
  pub backend: BackendType,
  #[serde(default)]
  pub postgres: PostgresSection,
  #[serde(default)]
  pub sqlite: SqliteSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresSection {
  #[serde(default = "default_pg_url")]
  pub url: String,
  #[serde(default = "default_max_conn")]
  pub max_connections: usize,
}
fn default_pg_url() -> String {
  "postgres://localhost/forum".into()
}
fn default_max_conn() -> usize {
  20
}
impl Default for PostgresSection {
  fn default() -> Self {
    Self {
      url: default_pg_url(),
      max_connections: default_max_conn(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSection {
  #[serde(default = "default_sqlite_path")]
  pub path: String,
}
fn default_sqlite_path() -> String {
  "forum.db".into()
}
impl Default for SqliteSection {
  fn default() -> Self {
    Self {
      path: default_sqlite_path(),
    }
  }
}

/// Background worker pools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersSection {
  /// Workers replaying mutations into the store
  #[serde(default = "default_workers")]
  pub store_workers: usize,

  /// Workers filling the cache
  #[serde(default = "default_workers")]
  pub cache_workers: usize,

  /// Queue capacity of each pool; a full queue drops jobs
  #[serde(default = "default_queue_capacity")]
  pub queue_capacity: usize,

  #[serde(default = "default_job_timeout_ms")]
  pub job_timeout_ms: u64,
}
fn default_workers() -> usize {
  5
}
fn default_queue_capacity() -> usize {
  500
}
fn default_job_timeout_ms() -> u64 {
  5000
}
impl Default for WorkersSection {
  fn default() -> Self {
    Self {
      store_workers: default_workers(),
      cache_workers: default_workers(),
      queue_capacity: default_queue_capacity(),
      job_timeout_ms: default_job_timeout_ms(),
    }
  }
}

impl WorkersSection {
  fn pool(&self, workers: usize) -> PoolConfig {
    PoolConfig {
      workers,
      queue_capacity: self.queue_capacity,
      job_timeout: Duration::from_millis(self.job_timeout_ms),
    }
  }
}

/// View buffering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewsSection {
  /// Buffered views that trigger a flush
  #[serde(default = "default_batch_size")]
  pub batch_size: usize,
  #[serde(default = "default_flush_interval_secs")]
  pub flush_interval_secs: u64,
}
fn default_batch_size() -> usize {
  100
}
fn default_flush_interval_secs() -> u64 {
  5
}
impl Default for ViewsSection {
  fn default() -> Self {
    Self {
      batch_size: default_batch_size(),
      flush_interval_secs: default_flush_interval_secs(),
    }
  }
}

/// Reply listing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepliesSection {
  #[serde(default = "default_max_depth")]
  pub max_depth: u32,
  #[serde(default = "default_max_children")]
  pub max_children: usize,
  #[serde(default = "default_max_content_len")]
  pub max_content_len: usize,
  #[serde(default = "default_max_page_size")]
  pub max_page_size: u32,
}
fn default_max_depth() -> u32 {
  8
}
fn default_max_children() -> usize {
  200
}
fn default_max_content_len() -> usize {
  500
}
fn default_max_page_size() -> u32 {
  100
}
impl Default for RepliesSection {
  fn default() -> Self {
    Self {
      max_depth: default_max_depth(),
      max_children: default_max_children(),
      max_content_len: default_max_content_len(),
      max_page_size: default_max_page_size(),
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LikesSection {
  #[serde(default)]
  pub persistence: LikePersistence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}
fn default_level() -> String {
  "info".into()
}
impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

impl ServerConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    Self::from_yaml(&content)
  }

  pub fn from_yaml(content: &str) -> Result<Self, anyhow::Error> {
    let expanded = expand_env_vars(content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["forumcache.yaml", "forumcache.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }

  pub fn engine_config(&self) -> EngineConfig {
    EngineConfig {
      like_persistence: self.likes.persistence,
      reply_meta_ttl: self.cache.reply_meta_ttl(),
      article_meta_ttl: self.cache.article_meta_ttl(),
      placeholder_ttl: self.cache.placeholder_ttl(),
      max_depth: self.replies.max_depth,
      max_children: self.replies.max_children,
      max_content_len: self.replies.max_content_len,
      max_page_size: self.replies.max_page_size,
      store_pool: self.workers.pool(self.workers.store_workers),
      cache_pool: self.workers.pool(self.workers.cache_workers),
    }
  }

  pub fn consumer_config(&self) -> ConsumerConfig {
    ConsumerConfig {
      max_deliveries: self.mq.max_deliveries.max(1),
      flush_interval: Duration::from_secs(self.views.flush_interval_secs.max(1)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheMode;
  use crate::mq::MqMode;

  #[test]
  fn test_defaults() {
    let config = ServerConfig::default();
    assert_eq!(config.store.backend, BackendType::Sqlite);
    assert_eq!(config.cache.mode, CacheMode::Builtin);
    assert_eq!(config.mq.max_deliveries, 3);
    assert_eq!(config.workers.queue_capacity, 500);
    assert_eq!(config.views.batch_size, 100);
    assert_eq!(config.likes.persistence, LikePersistence::Direct);

    let engine = config.engine_config();
    assert_eq!(engine.placeholder_ttl, Duration::from_secs(60));
    assert_eq!(engine.store_pool.job_timeout, Duration::from_secs(5));
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = ServerConfig::from_yaml(
      r#"
store:
  backend: postgres
cache:
  placeholder_ttl_secs: 10
mq:
  mode: redis
likes:
  persistence: queue
"#,
    )
    .unwrap();
    assert_eq!(config.store.backend, BackendType::Postgres);
    assert_eq!(config.store.postgres.max_connections, 20);
    assert_eq!(config.cache.placeholder_ttl_secs, 10);
    assert_eq!(config.cache.reply_meta_ttl_secs, 3600);
    assert_eq!(config.mq.mode, MqMode::Redis);
    assert_eq!(config.mq.like_stream, "forum.like.persistence.queue");
    assert_eq!(config.likes.persistence, LikePersistence::Queue);
  }

  #[test]
  fn test_env_expansion() {
    std::env::set_var("FORUMCACHE_TEST_PG", "postgres://db/forum");
    std::env::set_var("FORUMCACHE_TEST_LEVEL", "debug");
    let expanded = expand_env_vars("url: ${FORUMCACHE_TEST_PG}\nlevel: $FORUMCACHE_TEST_LEVEL");
    assert_eq!(expanded, "url: postgres://db/forum\nlevel: debug");
  }

  #[test]
  fn test_missing_env_var_expands_empty() {
    assert_eq!(expand_env_vars("a${FORUMCACHE_UNSET_VAR}b"), "ab");
  }
}
