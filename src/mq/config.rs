//! Broker configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cache::CacheProxyConfig;

/// Which broker carries the event streams
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqMode {
  /// In-process queues (default)
  #[default]
  Memory,
  /// Redis Streams with a consumer group
  Redis,
}

impl std::str::FromStr for MqMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "memory" | "inmemory" => Ok(MqMode::Memory),
      "redis" | "streams" => Ok(MqMode::Redis),
      _ => Err(format!("Unknown mq mode: {}", s)),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqConfig {
  #[serde(default)]
  pub mode: MqMode,

  #[serde(default = "default_like_stream")]
  pub like_stream: String,

  #[serde(default = "default_view_stream")]
  pub view_stream: String,

  #[serde(default = "default_dead_letter_stream")]
  pub dead_letter_stream: String,

  /// Consumer group shared by every daemon instance
  #[serde(default = "default_group")]
  pub group: String,

  /// Consumer name, unique per instance
  #[serde(default = "default_consumer")]
  pub consumer: String,

  /// Deliveries of a like event before it is dead-lettered
  #[serde(default = "default_max_deliveries")]
  pub max_deliveries: u32,

  /// How long one receive call waits for a message
  #[serde(default = "default_block_ms")]
  pub block_ms: u64,

  /// Pending entries idle this long are claimed from their consumer and
  /// delivered again
  #[serde(default = "default_claim_idle_ms")]
  pub claim_idle_ms: u64,

  /// Pending entries inspected per claim pass
  #[serde(default = "default_claim_batch")]
  pub claim_batch: usize,

  /// Approximate cap on stream length
  #[serde(default = "default_max_len")]
  pub max_len: usize,

  /// Per-topic queue capacity of the memory broker
  #[serde(default = "default_capacity")]
  pub capacity: usize,

  /// Redis connection; falls back to `cache.proxy` when absent
  #[serde(default)]
  pub redis: Option<CacheProxyConfig>,
}

fn default_like_stream() -> String {
  "forum.like.persistence.queue".to_string()
}

fn default_view_stream() -> String {
  "forum.view.persistence.queue".to_string()
}

fn default_dead_letter_stream() -> String {
  "forum.like.dead_letter".to_string()
}

fn default_group() -> String {
  "forum.persistence".to_string()
}

fn default_consumer() -> String {
  format!("forumd-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

fn default_max_deliveries() -> u32 {
  3
}

fn default_block_ms() -> u64 {
  1000
}

fn default_claim_idle_ms() -> u64 {
  30_000
}

fn default_claim_batch() -> usize {
  100
}

fn default_max_len() -> usize {
  100_000
}

fn default_capacity() -> usize {
  10_000
}

impl Default for MqConfig {
  fn default() -> Self {
    Self {
      mode: MqMode::default(),
      like_stream: default_like_stream(),
      view_stream: default_view_stream(),
      dead_letter_stream: default_dead_letter_stream(),
      group: default_group(),
      consumer: default_consumer(),
      max_deliveries: default_max_deliveries(),
      block_ms: default_block_ms(),
      claim_idle_ms: default_claim_idle_ms(),
      claim_batch: default_claim_batch(),
      max_len: default_max_len(),
      capacity: default_capacity(),
      redis: None,
    }
  }
}

impl MqConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.block_ms.max(1))
  }

  pub fn claim_interval(&self) -> Duration {
    Duration::from_millis(self.claim_idle_ms.max(1))
  }
}
