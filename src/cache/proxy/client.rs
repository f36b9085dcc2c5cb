//! Redis-backed cache store for external Redis servers

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cache::config::CacheProxyConfig;
use crate::cache::scripts::Scripts;
use crate::cache::store::{
  CacheStats, CacheStore, CacheStoreError, MembershipOp, RankingState, ToggleOutcome,
};
use crate::keys::ABSENT_FIELD;

fn command_err(e: RedisError) -> CacheStoreError {
  if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
    CacheStoreError::Connection(e.to_string())
  } else {
    CacheStoreError::InvalidValue(e.to_string())
  }
}

fn script_err(e: RedisError) -> CacheStoreError {
  if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
    CacheStoreError::Connection(e.to_string())
  } else {
    CacheStoreError::Script(e.to_string())
  }
}

fn ttl_secs(ttl: Duration) -> i64 {
  ttl.as_secs().max(1) as i64
}

/// Cache store backed by an external Redis
pub struct RedisCacheStore {
  connection: ConnectionManager,
  scripts: Scripts,
  hits: AtomicU64,
  misses: AtomicU64,
}

impl RedisCacheStore {
  /// Connect using the proxy configuration
  pub async fn new(config: &CacheProxyConfig) -> Result<Self, RedisError> {
    let client = Client::open(config.connection_url())?;
    let connection = ConnectionManager::new(client).await?;

    Ok(Self {
      connection,
      scripts: Scripts::load(),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
    })
  }

  /// Test the connection to Redis
  pub async fn test_connection(&self) -> Result<(), RedisError> {
    let mut conn = self.connection.clone();
    redis::cmd("PING").query_async::<()>(&mut conn).await?;
    Ok(())
  }

  /// Shared connection, for components that talk to the same server
  pub fn connection(&self) -> ConnectionManager {
    self.connection.clone()
  }

  fn record(&self, hit: bool) {
    if hit {
      self.hits.fetch_add(1, Ordering::Relaxed);
    } else {
      self.misses.fetch_add(1, Ordering::Relaxed);
    }
  }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
  async fn exists(&self, key: &str) -> Result<bool, CacheStoreError> {
    let mut conn = self.connection.clone();
    conn.exists(key).await.map_err(command_err)
  }

  async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
    let mut conn = self.connection.clone();
    let removed: i64 = conn.del(key).await.map_err(command_err)?;
    Ok(removed > 0)
  }

  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheStoreError> {
    let mut conn = self.connection.clone();
    conn.expire(key, ttl_secs(ttl)).await.map_err(command_err)
  }

  async fn get_int(&self, key: &str) -> Result<Option<i64>, CacheStoreError> {
    let mut conn = self.connection.clone();
    let value: Option<i64> = conn.get(key).await.map_err(command_err)?;
    self.record(value.is_some());
    Ok(value)
  }

  async fn get_ints(&self, keys: &[String]) -> Result<Vec<Option<i64>>, CacheStoreError> {
    if keys.is_empty() {
      return Ok(Vec::new());
    }
    let mut conn = self.connection.clone();
    // Explicit MGET so a single key still yields an array reply
    let values: Vec<Option<i64>> = redis::cmd("MGET")
      .arg(keys)
      .query_async(&mut conn)
      .await
      .map_err(command_err)?;
    for value in &values {
      self.record(value.is_some());
    }
    Ok(values)
  }

  async fn toggle_membership(
    &self,
    set_key: &str,
    counter_key: &str,
    member: &str,
    op: MembershipOp,
  ) -> Result<ToggleOutcome, CacheStoreError> {
    let mut conn = self.connection.clone();
    let script = match op {
      MembershipOp::Add => &self.scripts.like,
      MembershipOp::Remove => &self.scripts.unlike,
    };
    let (changed, count): (i64, i64) = script
      .key(set_key)
      .key(counter_key)
      .arg(member)
      .invoke_async(&mut conn)
      .await
      .map_err(script_err)?;

    match changed {
      0 | 1 => Ok(ToggleOutcome {
        changed: changed == 1,
        count,
      }),
      other => Err(CacheStoreError::Script(format!(
        "toggle returned unexpected flag {}",
        other
      ))),
    }
  }

  async fn seed_membership(
    &self,
    set_key: &str,
    counter_key: &str,
    members: &[String],
  ) -> Result<bool, CacheStoreError> {
    let mut conn = self.connection.clone();
    let seeded: i64 = self
      .scripts
      .seed
      .key(set_key)
      .key(counter_key)
      .arg(members)
      .invoke_async(&mut conn)
      .await
      .map_err(script_err)?;
    Ok(seeded == 1)
  }

  async fn is_member(&self, set_key: &str, member: &str) -> Result<bool, CacheStoreError> {
    let mut conn = self.connection.clone();
    let found: bool = conn.sismember(set_key, member).await.map_err(command_err)?;
    self.record(found);
    Ok(found)
  }

  async fn replace_ranking(
    &self,
    key: &str,
    entries: &[(String, f64)],
  ) -> Result<(), CacheStoreError> {
    let mut conn = self.connection.clone();
    let mut pipe = redis::pipe();
    pipe.atomic().del(key).ignore();
    if !entries.is_empty() {
      let items: Vec<(f64, &str)> = entries
        .iter()
        .map(|(member, score)| (*score, member.as_str()))
        .collect();
      pipe.zadd_multiple(key, &items).ignore();
    }
    pipe
      .query_async::<()>(&mut conn)
      .await
      .map_err(command_err)
  }

  async fn set_placeholder(
    &self,
    key: &str,
    sentinel: &str,
    ttl: Duration,
  ) -> Result<(), CacheStoreError> {
    let mut conn = self.connection.clone();
    redis::pipe()
      .atomic()
      .del(key)
      .ignore()
      .zadd(key, sentinel, 0)
      .ignore()
      .expire(key, ttl_secs(ttl))
      .ignore()
      .query_async::<()>(&mut conn)
      .await
      .map_err(command_err)
  }

  async fn add_to_ranking_if_present(
    &self,
    key: &str,
    member: &str,
    score: f64,
    sentinel: &str,
  ) -> Result<bool, CacheStoreError> {
    let mut conn = self.connection.clone();
    let added: i64 = self
      .scripts
      .ranking_add_if_present
      .key(key)
      .arg(member)
      .arg(score)
      .arg(sentinel)
      .invoke_async(&mut conn)
      .await
      .map_err(script_err)?;
    Ok(added == 1)
  }

  async fn remove_from_ranking(&self, key: &str, member: &str) -> Result<bool, CacheStoreError> {
    let mut conn = self.connection.clone();
    let removed: i64 = conn.zrem(key, member).await.map_err(command_err)?;
    Ok(removed > 0)
  }

  async fn ranking_state(&self, key: &str, sentinel: &str) -> Result<RankingState, CacheStoreError> {
    let mut conn = self.connection.clone();
    let state: i64 = self
      .scripts
      .ranking_state
      .key(key)
      .arg(sentinel)
      .invoke_async(&mut conn)
      .await
      .map_err(script_err)?;
    self.record(state >= 0);
    match state {
      -1 => Ok(RankingState::Cold),
      0 => Ok(RankingState::Empty),
      n if n > 0 => Ok(RankingState::Warm(n as u64)),
      other => Err(CacheStoreError::Script(format!(
        "ranking state returned {}",
        other
      ))),
    }
  }

  async fn ranking_range_desc(
    &self,
    key: &str,
    start: usize,
    stop: usize,
  ) -> Result<Vec<String>, CacheStoreError> {
    if stop < start {
      return Ok(Vec::new());
    }
    let mut conn = self.connection.clone();
    conn
      .zrevrange(key, start as isize, stop as isize)
      .await
      .map_err(command_err)
  }

  async fn put_hash(
    &self,
    key: &str,
    fields: &[(String, String)],
    ttl: Option<Duration>,
  ) -> Result<(), CacheStoreError> {
    let mut conn = self.connection.clone();
    let mut pipe = redis::pipe();
    pipe.atomic().del(key).ignore();
    if !fields.is_empty() {
      pipe.hset_multiple(key, fields).ignore();
      if let Some(ttl) = ttl {
        pipe.expire(key, ttl_secs(ttl)).ignore();
      }
    }
    pipe
      .query_async::<()>(&mut conn)
      .await
      .map_err(command_err)
  }

  async fn get_hash(&self, key: &str) -> Result<Option<HashMap<String, String>>, CacheStoreError> {
    let mut conn = self.connection.clone();
    let fields: HashMap<String, String> = conn.hgetall(key).await.map_err(command_err)?;
    // HGETALL answers an empty map for a missing key
    let found = !fields.is_empty();
    self.record(found);
    Ok(found.then_some(fields))
  }

  async fn get_hashes(
    &self,
    keys: &[String],
  ) -> Result<Vec<Option<HashMap<String, String>>>, CacheStoreError> {
    if keys.is_empty() {
      return Ok(Vec::new());
    }
    let mut conn = self.connection.clone();
    let mut pipe = redis::pipe();
    for key in keys {
      pipe.hgetall(key);
    }
    let hashes: Vec<HashMap<String, String>> =
      pipe.query_async(&mut conn).await.map_err(command_err)?;
    Ok(
      hashes
        .into_iter()
        .map(|fields| {
          let found = !fields.is_empty();
          self.record(found);
          found.then_some(fields)
        })
        .collect(),
    )
  }

  async fn incr_hash_field_if_present(
    &self,
    key: &str,
    field: &str,
    delta: i64,
  ) -> Result<Option<i64>, CacheStoreError> {
    let mut conn = self.connection.clone();
    self
      .scripts
      .hincr_if_present
      .key(key)
      .arg(field)
      .arg(delta)
      .arg(ABSENT_FIELD)
      .invoke_async(&mut conn)
      .await
      .map_err(script_err)
  }

  async fn flush(&self) -> Result<(), CacheStoreError> {
    let mut conn = self.connection.clone();
    redis::cmd("FLUSHDB")
      .query_async::<()>(&mut conn)
      .await
      .map_err(command_err)
  }

  async fn info(&self) -> Result<CacheStats, CacheStoreError> {
    let mut conn = self.connection.clone();

    let info: String = redis::cmd("INFO")
      .query_async(&mut conn)
      .await
      .map_err(command_err)?;
    let dbsize: usize = redis::cmd("DBSIZE")
      .query_async(&mut conn)
      .await
      .map_err(command_err)?;

    let mut stats = CacheStats {
      keys: dbsize,
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      ..Default::default()
    };

    for line in info.lines() {
      let Some((name, value)) = line.split_once(':') else {
        continue;
      };
      let value = value.trim().parse().unwrap_or(0);
      match name {
        "used_memory" => stats.memory_used = value as usize,
        "maxmemory" => stats.memory_limit = value as usize,
        "evicted_keys" => stats.evictions = value,
        "expired_keys" => stats.expired = value,
        _ => {}
      }
    }

    Ok(stats)
  }
}
