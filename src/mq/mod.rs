//! Event streams between the request path and the primary store

mod broker;
mod buffer;
pub mod config;
mod consumer;
mod redis_stream;

use std::sync::Arc;

pub use broker::{Broker, BrokerError, BrokerStats, Delivery, MemoryBroker, Topic};
pub use buffer::{flush_views, group_by_article, FlushReport, ViewBuffer};
pub use config::{MqConfig, MqMode};
pub use consumer::{ConsumerConfig, ConsumerStats, EventConsumer, LikeOutcome};
pub use redis_stream::RedisStreamBroker;

use crate::cache::CacheProxyConfig;

/// Build the broker selected by `config.mode`. `fallback` supplies the Redis
/// connection when `mq.redis` is not set.
pub async fn connect(
  config: &MqConfig,
  fallback: &CacheProxyConfig,
) -> Result<Arc<dyn Broker>, BrokerError> {
  match config.mode {
    MqMode::Memory => Ok(Arc::new(MemoryBroker::new(
      config.capacity,
      config.poll_interval(),
    ))),
    MqMode::Redis => {
      let redis = config.redis.as_ref().unwrap_or(fallback);
      Ok(Arc::new(
        RedisStreamBroker::connect(redis, config.clone()).await?,
      ))
    }
  }
}
