//! Cache store implementation

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::entry::{CacheEntry, CacheValue, SortedSet};
use crate::keys::{like_companion, ABSENT_FIELD};

/// Eviction policy when memory limit is reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
  /// Least Recently Used
  #[default]
  Lru,
  /// Least Frequently Used
  Lfu,
  /// Random eviction
  Random,
  /// Don't evict, return error on memory limit
  NoEviction,
}

impl std::str::FromStr for EvictionPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "lru" => Ok(EvictionPolicy::Lru),
      "lfu" => Ok(EvictionPolicy::Lfu),
      "random" => Ok(EvictionPolicy::Random),
      "noeviction" | "no-eviction" | "no_eviction" => Ok(EvictionPolicy::NoEviction),
      _ => Err(format!("Unknown eviction policy: {}", s)),
    }
  }
}

impl std::fmt::Display for EvictionPolicy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EvictionPolicy::Lru => write!(f, "lru"),
      EvictionPolicy::Lfu => write!(f, "lfu"),
      EvictionPolicy::Random => write!(f, "random"),
      EvictionPolicy::NoEviction => write!(f, "noeviction"),
    }
  }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
  pub keys: usize,
  pub memory_used: usize,
  pub memory_limit: usize,
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
  pub expired: u64,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

/// Direction of a membership toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipOp {
  Add,
  Remove,
}

/// Result of an atomic set-membership toggle paired with its counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleOutcome {
  /// False when the member was already in the requested state
  pub changed: bool,
  /// Counter value after the operation
  pub count: i64,
}

/// Population state of a ranked set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingState {
  /// Key absent, never loaded or invalidated
  Cold,
  /// Holds only the negative placeholder
  Empty,
  /// Loaded, with this many members
  Warm(u64),
}

/// Cache store trait
///
/// Every method is a single indivisible operation against the cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
  async fn exists(&self, key: &str) -> Result<bool, CacheStoreError>;
  async fn delete(&self, key: &str) -> Result<bool, CacheStoreError>;
  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheStoreError>;
  async fn get_int(&self, key: &str) -> Result<Option<i64>, CacheStoreError>;
  async fn get_ints(&self, keys: &[String]) -> Result<Vec<Option<i64>>, CacheStoreError>;

  /// Add or remove `member` in `set_key`; the counter moves by one only when
  /// the set changed. The counter never drops below zero.
  async fn toggle_membership(
    &self,
    set_key: &str,
    counter_key: &str,
    member: &str,
    op: MembershipOp,
  ) -> Result<ToggleOutcome, CacheStoreError>;

  /// Load a set and its counter unless the like state is already whole: the
  /// counter exists and, when positive, so does the set.
  /// Returns true when this call did the seeding.
  async fn seed_membership(
    &self,
    set_key: &str,
    counter_key: &str,
    members: &[String],
  ) -> Result<bool, CacheStoreError>;

  async fn is_member(&self, set_key: &str, member: &str) -> Result<bool, CacheStoreError>;

  /// Replace a ranked set wholesale. An empty slice leaves the key absent.
  async fn replace_ranking(&self, key: &str, entries: &[(String, f64)])
    -> Result<(), CacheStoreError>;

  async fn set_placeholder(
    &self,
    key: &str,
    sentinel: &str,
    ttl: Duration,
  ) -> Result<(), CacheStoreError>;

  /// Insert into a ranked set only when it is already loaded. Drops the
  /// sentinel and its TTL. Returns false when the ranking is cold.
  async fn add_to_ranking_if_present(
    &self,
    key: &str,
    member: &str,
    score: f64,
    sentinel: &str,
  ) -> Result<bool, CacheStoreError>;

  async fn remove_from_ranking(&self, key: &str, member: &str) -> Result<bool, CacheStoreError>;
  async fn ranking_state(&self, key: &str, sentinel: &str) -> Result<RankingState, CacheStoreError>;

  /// Members by descending score, ranks `start..=stop`.
  async fn ranking_range_desc(
    &self,
    key: &str,
    start: usize,
    stop: usize,
  ) -> Result<Vec<String>, CacheStoreError>;

  /// Replace a hash wholesale, with an optional TTL.
  async fn put_hash(
    &self,
    key: &str,
    fields: &[(String, String)],
    ttl: Option<Duration>,
  ) -> Result<(), CacheStoreError>;

  async fn get_hash(&self, key: &str) -> Result<Option<HashMap<String, String>>, CacheStoreError>;

  async fn get_hashes(
    &self,
    keys: &[String],
  ) -> Result<Vec<Option<HashMap<String, String>>>, CacheStoreError>;

  /// Increment a hash field only when the hash exists and is not a negative
  /// placeholder. Returns the new value.
  async fn incr_hash_field_if_present(
    &self,
    key: &str,
    field: &str,
    delta: i64,
  ) -> Result<Option<i64>, CacheStoreError>;

  async fn flush(&self) -> Result<(), CacheStoreError>;
  async fn info(&self) -> Result<CacheStats, CacheStoreError>;
}

/// Store operation error
#[derive(Debug, Clone)]
pub enum CacheStoreError {
  OutOfMemory,
  InvalidValue(String),
  WrongType { key: String, found: &'static str },
  /// A server-side script failed or returned an unexpected shape
  Script(String),
  Connection(String),
}

impl std::fmt::Display for CacheStoreError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheStoreError::OutOfMemory => write!(f, "OOM: out of memory"),
      CacheStoreError::InvalidValue(msg) => write!(f, "Invalid value: {}", msg),
      CacheStoreError::WrongType { key, found } => {
        write!(f, "WRONGTYPE key {} holds a {}", key, found)
      }
      CacheStoreError::Script(msg) => write!(f, "Script error: {}", msg),
      CacheStoreError::Connection(msg) => write!(f, "Connection error: {}", msg),
    }
  }
}

impl std::error::Error for CacheStoreError {}

fn wrong_type(key: &str, value: &CacheValue) -> CacheStoreError {
  CacheStoreError::WrongType {
    key: key.to_string(),
    found: value.type_name(),
  }
}

type Data = HashMap<String, CacheEntry>;

/// In-memory cache store implementation
pub struct InMemoryCacheStore {
  data: RwLock<Data>,
  memory_used: AtomicUsize,
  memory_limit: usize,
  eviction_policy: EvictionPolicy,
  hits: AtomicU64,
  misses: AtomicU64,
  evictions: AtomicU64,
  expired: AtomicU64,
}

impl InMemoryCacheStore {
  pub fn new(memory_limit: usize, eviction_policy: EvictionPolicy) -> Self {
    Self {
      data: RwLock::new(HashMap::new()),
      memory_used: AtomicUsize::new(0),
      memory_limit,
      eviction_policy,
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      evictions: AtomicU64::new(0),
      expired: AtomicU64::new(0),
    }
  }

  /// Check and evict expired entries
  pub fn evict_expired(&self) -> usize {
    let mut data = self.data.write();
    let expired_keys: Vec<String> = data
      .iter()
      .filter(|(_, entry)| entry.is_expired())
      .map(|(k, _)| k.clone())
      .collect();

    let count = expired_keys.len();
    for key in expired_keys {
      if let Some(entry) = data.remove(&key) {
        self.memory_used.fetch_sub(entry.size, Ordering::Relaxed);
        self.expired.fetch_add(1, Ordering::Relaxed);
      }
    }
    count
  }

  /// Remaining TTL of a key, `None` when absent or persistent.
  pub fn ttl(&self, key: &str) -> Option<Duration> {
    let data = self.data.read();
    data
      .get(key)
      .filter(|e| !e.is_expired())
      .and_then(|e| e.ttl_remaining())
  }

  fn record(&self, hit: bool) {
    if hit {
      self.hits.fetch_add(1, Ordering::Relaxed);
    } else {
      self.misses.fetch_add(1, Ordering::Relaxed);
    }
  }

  /// Live entry for `key`, dropping it first if it has expired.
  fn live<'a>(&self, data: &'a mut Data, key: &str) -> Option<&'a mut CacheEntry> {
    if data.get(key).map(|e| e.is_expired()).unwrap_or(false) {
      if let Some(entry) = data.remove(key) {
        self.memory_used.fetch_sub(entry.size, Ordering::Relaxed);
        self.expired.fetch_add(1, Ordering::Relaxed);
      }
    }
    data.get_mut(key)
  }

  fn remove(&self, data: &mut Data, key: &str) -> bool {
    match data.remove(key) {
      Some(entry) => {
        self.memory_used.fetch_sub(entry.size, Ordering::Relaxed);
        !entry.is_expired()
      }
      None => false,
    }
  }

  /// Settle memory accounting after an in-place mutation.
  fn account(&self, entry: &mut CacheEntry) {
    let old = entry.resize();
    if entry.size >= old {
      self
        .memory_used
        .fetch_add(entry.size - old, Ordering::Relaxed);
    } else {
      self
        .memory_used
        .fetch_sub(old - entry.size, Ordering::Relaxed);
    }
  }

  /// Insert or overwrite an entry, evicting others if the limit requires it.
  fn insert(&self, data: &mut Data, entry: CacheEntry) -> Result<(), CacheStoreError> {
    self.remove(data, &entry.key);

    let current_used = self.memory_used.load(Ordering::Relaxed);
    if current_used + entry.size > self.memory_limit {
      self.evict_for_space(data, entry.size, &entry.key)?;
    }

    self.memory_used.fetch_add(entry.size, Ordering::Relaxed);
    data.insert(entry.key.clone(), entry);
    Ok(())
  }

  /// Evict entries to free memory (based on policy). Caller holds the lock.
  ///
  /// `inserting` and its like-state companion are never chosen. Evicting one
  /// half of a like state evicts the other half with it.
  fn evict_for_space(
    &self,
    data: &mut Data,
    needed: usize,
    inserting: &str,
  ) -> Result<(), CacheStoreError> {
    if self.eviction_policy == EvictionPolicy::NoEviction {
      return Err(CacheStoreError::OutOfMemory);
    }

    let current_used = self.memory_used.load(Ordering::Relaxed);
    let to_free = (current_used + needed).saturating_sub(self.memory_limit);
    let mut freed = 0usize;
    let partner = like_companion(inserting);
    let evictable = |key: &String| key != inserting && Some(key) != partner.as_ref();

    while freed < to_free && !data.is_empty() {
      let key_to_evict = match self.eviction_policy {
        EvictionPolicy::Lru => data
          .iter()
          .filter(|(k, _)| evictable(*k))
          .min_by_key(|(_, entry)| entry.accessed_at)
          .map(|(k, _)| k.clone()),
        EvictionPolicy::Lfu => data
          .iter()
          .filter(|(k, _)| evictable(*k))
          .min_by_key(|(_, entry)| entry.access_count)
          .map(|(k, _)| k.clone()),
        EvictionPolicy::Random => {
          let keys: Vec<_> = data.keys().filter(|k| evictable(*k)).cloned().collect();
          keys.choose(&mut rand::thread_rng()).cloned()
        }
        EvictionPolicy::NoEviction => None,
      };

      let Some(key) = key_to_evict else {
        break;
      };
      let companion = like_companion(&key);
      let mut evicted = false;
      for victim in std::iter::once(key).chain(companion) {
        if let Some(entry) = data.remove(&victim) {
          freed += entry.size;
          self.memory_used.fetch_sub(entry.size, Ordering::Relaxed);
          self.evictions.fetch_add(1, Ordering::Relaxed);
          evicted = true;
        }
      }
      if !evicted {
        break;
      }
    }

    if freed >= to_free {
      Ok(())
    } else {
      Err(CacheStoreError::OutOfMemory)
    }
  }

  /// Move an integer key by `delta`, creating it when absent. The result is
  /// clamped at `floor` when given.
  fn incr(
    &self,
    data: &mut Data,
    key: &str,
    delta: i64,
    floor: Option<i64>,
  ) -> Result<i64, CacheStoreError> {
    let clamp = |v: i64| floor.map(|f| v.max(f)).unwrap_or(v);

    if let Some(entry) = self.live(data, key) {
      let current = entry.value.as_i64().ok_or_else(|| wrong_type(key, &entry.value))?;
      let new_val = clamp(current + delta);
      entry.value = CacheValue::Integer(new_val);
      entry.touch();
      return Ok(new_val);
    }

    let new_val = clamp(delta);
    self.insert(
      data,
      CacheEntry::new(key.to_string(), CacheValue::Integer(new_val), None),
    )?;
    Ok(new_val)
  }

  fn read_int(&self, data: &mut Data, key: &str) -> Result<Option<i64>, CacheStoreError> {
    match self.live(data, key) {
      Some(entry) => {
        entry.touch();
        let value = entry.value.as_i64().ok_or_else(|| wrong_type(key, &entry.value))?;
        self.record(true);
        Ok(Some(value))
      }
      None => {
        self.record(false);
        Ok(None)
      }
    }
  }

  fn read_hash(
    &self,
    data: &mut Data,
    key: &str,
  ) -> Result<Option<HashMap<String, String>>, CacheStoreError> {
    match self.live(data, key) {
      Some(entry) => {
        entry.touch();
        match &entry.value {
          CacheValue::Hash(fields) => {
            self.record(true);
            Ok(Some(fields.clone()))
          }
          other => Err(wrong_type(key, other)),
        }
      }
      None => {
        self.record(false);
        Ok(None)
      }
    }
  }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
  async fn exists(&self, key: &str) -> Result<bool, CacheStoreError> {
    let data = self.data.read();
    Ok(data.get(key).map(|e| !e.is_expired()).unwrap_or(false))
  }

  async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
    let mut data = self.data.write();
    Ok(self.remove(&mut data, key))
  }

  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheStoreError> {
    let mut data = self.data.write();
    match self.live(&mut data, key) {
      Some(entry) => {
        entry.update_ttl(Some(ttl));
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn get_int(&self, key: &str) -> Result<Option<i64>, CacheStoreError> {
    let mut data = self.data.write();
    self.read_int(&mut data, key)
  }

  async fn get_ints(&self, keys: &[String]) -> Result<Vec<Option<i64>>, CacheStoreError> {
    let mut data = self.data.write();
    keys.iter().map(|k| self.read_int(&mut data, k)).collect()
  }

  async fn toggle_membership(
    &self,
    set_key: &str,
    counter_key: &str,
    member: &str,
    op: MembershipOp,
  ) -> Result<ToggleOutcome, CacheStoreError> {
    let mut data = self.data.write();

    if let Some(entry) = data.get(counter_key).filter(|e| !e.is_expired()) {
      if entry.value.as_i64().is_none() {
        return Err(wrong_type(counter_key, &entry.value));
      }
    }

    let changed = match self.live(&mut data, set_key) {
      Some(entry) => {
        let changed = match &mut entry.value {
          CacheValue::Set(members) => match op {
            MembershipOp::Add => members.insert(member.to_string()),
            MembershipOp::Remove => members.remove(member),
          },
          other => return Err(wrong_type(set_key, other)),
        };
        entry.touch();
        self.account(entry);
        changed
      }
      None => match op {
        MembershipOp::Add => {
          let members = HashSet::from([member.to_string()]);
          self.insert(
            &mut data,
            CacheEntry::new(set_key.to_string(), CacheValue::Set(members), None),
          )?;
          true
        }
        MembershipOp::Remove => false,
      },
    };

    if let Some(entry) = self.live(&mut data, set_key) {
      if matches!(&entry.value, CacheValue::Set(m) if m.is_empty()) {
        self.remove(&mut data, set_key);
      }
    }

    let count = if changed {
      match op {
        MembershipOp::Add => self.incr(&mut data, counter_key, 1, None)?,
        MembershipOp::Remove => self.incr(&mut data, counter_key, -1, Some(0))?,
      }
    } else {
      self
        .live(&mut data, counter_key)
        .and_then(|e| e.value.as_i64())
        .unwrap_or(0)
    };

    Ok(ToggleOutcome { changed, count })
  }

  async fn seed_membership(
    &self,
    set_key: &str,
    counter_key: &str,
    members: &[String],
  ) -> Result<bool, CacheStoreError> {
    let mut data = self.data.write();
    if let Some(count) = self.live(&mut data, counter_key).map(|e| e.value.as_i64()) {
      // A positive counter without its set is a split state and is reseeded.
      let split = count.is_some_and(|c| c > 0) && self.live(&mut data, set_key).is_none();
      if !split {
        return Ok(false);
      }
    }

    self.remove(&mut data, set_key);
    let members: HashSet<String> = members.iter().cloned().collect();
    let count = members.len() as i64;
    if !members.is_empty() {
      self.insert(
        &mut data,
        CacheEntry::new(set_key.to_string(), CacheValue::Set(members), None),
      )?;
    }
    self.insert(
      &mut data,
      CacheEntry::new(counter_key.to_string(), CacheValue::Integer(count), None),
    )?;
    Ok(true)
  }

  async fn is_member(&self, set_key: &str, member: &str) -> Result<bool, CacheStoreError> {
    let mut data = self.data.write();
    match self.live(&mut data, set_key) {
      Some(entry) => {
        entry.touch();
        match &entry.value {
          CacheValue::Set(members) => {
            self.record(true);
            Ok(members.contains(member))
          }
          other => Err(wrong_type(set_key, other)),
        }
      }
      None => {
        self.record(false);
        Ok(false)
      }
    }
  }

  async fn replace_ranking(
    &self,
    key: &str,
    entries: &[(String, f64)],
  ) -> Result<(), CacheStoreError> {
    let mut data = self.data.write();
    self.remove(&mut data, key);
    if entries.is_empty() {
      return Ok(());
    }
    let ranking = SortedSet::from_entries(entries);
    self.insert(
      &mut data,
      CacheEntry::new(key.to_string(), CacheValue::SortedSet(ranking), None),
    )
  }

  async fn set_placeholder(
    &self,
    key: &str,
    sentinel: &str,
    ttl: Duration,
  ) -> Result<(), CacheStoreError> {
    let mut data = self.data.write();
    let mut ranking = SortedSet::new();
    ranking.insert(sentinel.to_string(), 0.0);
    self.insert(
      &mut data,
      CacheEntry::new(key.to_string(), CacheValue::SortedSet(ranking), Some(ttl)),
    )
  }

  async fn add_to_ranking_if_present(
    &self,
    key: &str,
    member: &str,
    score: f64,
    sentinel: &str,
  ) -> Result<bool, CacheStoreError> {
    let mut data = self.data.write();
    let Some(entry) = self.live(&mut data, key) else {
      return Ok(false);
    };
    match &mut entry.value {
      CacheValue::SortedSet(ranking) => {
        ranking.remove(sentinel);
        ranking.insert(member.to_string(), score);
      }
      other => return Err(wrong_type(key, other)),
    }
    entry.update_ttl(None);
    entry.touch();
    self.account(entry);
    Ok(true)
  }

  async fn remove_from_ranking(&self, key: &str, member: &str) -> Result<bool, CacheStoreError> {
    let mut data = self.data.write();
    let Some(entry) = self.live(&mut data, key) else {
      return Ok(false);
    };
    let (removed, now_empty) = match &mut entry.value {
      CacheValue::SortedSet(ranking) => (ranking.remove(member), ranking.is_empty()),
      other => return Err(wrong_type(key, other)),
    };
    self.account(entry);
    if now_empty {
      self.remove(&mut data, key);
    }
    Ok(removed)
  }

  async fn ranking_state(&self, key: &str, sentinel: &str) -> Result<RankingState, CacheStoreError> {
    let mut data = self.data.write();
    match self.live(&mut data, key) {
      Some(entry) => {
        entry.touch();
        self.record(true);
        match &entry.value {
          CacheValue::SortedSet(r) if r.len() == 1 && r.contains(sentinel) => {
            Ok(RankingState::Empty)
          }
          CacheValue::SortedSet(r) => Ok(RankingState::Warm(r.len() as u64)),
          other => Err(wrong_type(key, other)),
        }
      }
      None => {
        self.record(false);
        Ok(RankingState::Cold)
      }
    }
  }

  async fn ranking_range_desc(
    &self,
    key: &str,
    start: usize,
    stop: usize,
  ) -> Result<Vec<String>, CacheStoreError> {
    let mut data = self.data.write();
    match self.live(&mut data, key) {
      Some(entry) => {
        entry.touch();
        match &entry.value {
          CacheValue::SortedSet(r) => Ok(r.range_desc(start, stop)),
          other => Err(wrong_type(key, other)),
        }
      }
      None => Ok(Vec::new()),
    }
  }

  async fn put_hash(
    &self,
    key: &str,
    fields: &[(String, String)],
    ttl: Option<Duration>,
  ) -> Result<(), CacheStoreError> {
    let mut data = self.data.write();
    let hash: HashMap<String, String> = fields.iter().cloned().collect();
    self.insert(
      &mut data,
      CacheEntry::new(key.to_string(), CacheValue::Hash(hash), ttl),
    )
  }

  async fn get_hash(&self, key: &str) -> Result<Option<HashMap<String, String>>, CacheStoreError> {
    let mut data = self.data.write();
    self.read_hash(&mut data, key)
  }

  async fn get_hashes(
    &self,
    keys: &[String],
  ) -> Result<Vec<Option<HashMap<String, String>>>, CacheStoreError> {
    let mut data = self.data.write();
    keys.iter().map(|k| self.read_hash(&mut data, k)).collect()
  }

  async fn incr_hash_field_if_present(
    &self,
    key: &str,
    field: &str,
    delta: i64,
  ) -> Result<Option<i64>, CacheStoreError> {
    let mut data = self.data.write();
    let Some(entry) = self.live(&mut data, key) else {
      return Ok(None);
    };
    let new_val = match &mut entry.value {
      CacheValue::Hash(fields) => {
        if fields.contains_key(ABSENT_FIELD) {
          return Ok(None);
        }
        let current = match fields.get(field) {
          Some(v) => v.parse::<i64>().map_err(|_| {
            CacheStoreError::InvalidValue(format!("hash field {} is not an integer", field))
          })?,
          None => 0,
        };
        let new_val = current + delta;
        fields.insert(field.to_string(), new_val.to_string());
        new_val
      }
      other => return Err(wrong_type(key, other)),
    };
    entry.touch();
    self.account(entry);
    Ok(Some(new_val))
  }

  async fn flush(&self) -> Result<(), CacheStoreError> {
    let mut data = self.data.write();
    data.clear();
    self.memory_used.store(0, Ordering::Relaxed);
    Ok(())
  }

  async fn info(&self) -> Result<CacheStats, CacheStoreError> {
    let data = self.data.read();
    Ok(CacheStats {
      keys: data.iter().filter(|(_, e)| !e.is_expired()).count(),
      memory_used: self.memory_used.load(Ordering::Relaxed),
      memory_limit: self.memory_limit,
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
      expired: self.expired.load(Ordering::Relaxed),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::keys;
  use crate::types::Target;

  fn store() -> InMemoryCacheStore {
    InMemoryCacheStore::new(1024 * 1024, EvictionPolicy::Lru)
  }

  #[tokio::test]
  async fn test_toggle_membership_counts_once() {
    let cache = store();
    let add = cache
      .toggle_membership("s", "c", "1", MembershipOp::Add)
      .await
      .unwrap();
    assert_eq!(add, ToggleOutcome { changed: true, count: 1 });

    let again = cache
      .toggle_membership("s", "c", "1", MembershipOp::Add)
      .await
      .unwrap();
    assert_eq!(again, ToggleOutcome { changed: false, count: 1 });

    let remove = cache
      .toggle_membership("s", "c", "1", MembershipOp::Remove)
      .await
      .unwrap();
    assert_eq!(remove, ToggleOutcome { changed: true, count: 0 });
    assert!(!cache.exists("s").await.unwrap());
    assert_eq!(cache.get_int("c").await.unwrap(), Some(0));
  }

  #[tokio::test]
  async fn test_counter_never_negative() {
    let cache = store();
    cache.seed_membership("s", "c", &["7".into()]).await.unwrap();
    cache
      .toggle_membership("s", "c", "7", MembershipOp::Remove)
      .await
      .unwrap();
    let none = cache
      .toggle_membership("s", "c", "7", MembershipOp::Remove)
      .await
      .unwrap();
    assert_eq!(none, ToggleOutcome { changed: false, count: 0 });
  }

  #[tokio::test]
  async fn test_seed_is_noop_when_counter_exists() {
    let cache = store();
    assert!(cache
      .seed_membership("s", "c", &["1".into(), "2".into()])
      .await
      .unwrap());
    assert_eq!(cache.get_int("c").await.unwrap(), Some(2));
    assert!(!cache.seed_membership("s", "c", &[]).await.unwrap());
    assert!(cache.is_member("s", "2").await.unwrap());
  }

  #[tokio::test]
  async fn test_ranking_states() {
    let cache = store();
    assert_eq!(
      cache.ranking_state("r", "__empty__").await.unwrap(),
      RankingState::Cold
    );

    cache
      .set_placeholder("r", "__empty__", Duration::from_secs(60))
      .await
      .unwrap();
    assert_eq!(
      cache.ranking_state("r", "__empty__").await.unwrap(),
      RankingState::Empty
    );
    assert!(cache.ttl("r").is_some());

    assert!(cache
      .add_to_ranking_if_present("r", "5", 10.0, "__empty__")
      .await
      .unwrap());
    assert_eq!(
      cache.ranking_state("r", "__empty__").await.unwrap(),
      RankingState::Warm(1)
    );
    assert!(cache.ttl("r").is_none());
  }

  #[tokio::test]
  async fn test_add_to_cold_ranking_is_noop() {
    let cache = store();
    assert!(!cache
      .add_to_ranking_if_present("r", "5", 10.0, "__empty__")
      .await
      .unwrap());
    assert!(!cache.exists("r").await.unwrap());
  }

  #[tokio::test]
  async fn test_replace_ranking_and_range() {
    let cache = store();
    let entries = vec![("1".to_string(), 1.0), ("2".to_string(), 2.0), ("3".to_string(), 3.0)];
    cache.replace_ranking("r", &entries).await.unwrap();
    assert_eq!(cache.ranking_range_desc("r", 0, 1).await.unwrap(), vec!["3", "2"]);
    assert_eq!(cache.ranking_range_desc("r", 2, 3).await.unwrap(), vec!["1"]);

    assert!(cache.remove_from_ranking("r", "2").await.unwrap());
    assert_eq!(cache.ranking_range_desc("r", 0, 9).await.unwrap(), vec!["3", "1"]);
  }

  #[tokio::test]
  async fn test_placeholder_expires() {
    let cache = store();
    cache
      .set_placeholder("r", "__empty__", Duration::from_millis(20))
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(
      cache.ranking_state("r", "__empty__").await.unwrap(),
      RankingState::Cold
    );
  }

  #[tokio::test]
  async fn test_incr_hash_field_skips_absent_and_placeholder() {
    let cache = store();
    assert_eq!(
      cache.incr_hash_field_if_present("h", "n", 1).await.unwrap(),
      None
    );

    cache
      .put_hash("h", &[(ABSENT_FIELD.to_string(), "1".to_string())], None)
      .await
      .unwrap();
    assert_eq!(
      cache.incr_hash_field_if_present("h", "n", 1).await.unwrap(),
      None
    );

    cache
      .put_hash("h", &[("n".to_string(), "4".to_string())], None)
      .await
      .unwrap();
    assert_eq!(
      cache.incr_hash_field_if_present("h", "n", -1).await.unwrap(),
      Some(3)
    );
  }

  #[tokio::test]
  async fn test_wrong_type_is_reported() {
    let cache = store();
    cache
      .put_hash("k", &[("a".to_string(), "b".to_string())], None)
      .await
      .unwrap();
    let err = cache
      .toggle_membership("k", "c", "1", MembershipOp::Add)
      .await
      .unwrap_err();
    assert!(matches!(err, CacheStoreError::WrongType { .. }));
  }

  #[tokio::test]
  async fn test_eviction_lru() {
    let cache = InMemoryCacheStore::new(200, EvictionPolicy::Lru);
    for i in 0..20 {
      let fields = vec![("field".to_string(), format!("value-{}", i))];
      cache.put_hash(&format!("key{}", i), &fields, None).await.unwrap();
    }
    let stats = cache.info().await.unwrap();
    assert!(stats.evictions > 0);
    assert!(stats.memory_used <= 200);
  }

  #[tokio::test]
  async fn test_eviction_keeps_like_state_whole() {
    let cache = InMemoryCacheStore::new(2048, EvictionPolicy::Lru);
    let target = Target::article(1);
    let set_key = keys::like_set(&target);
    let count_key = keys::like_count(&target);
    cache
      .toggle_membership(&set_key, &count_key, "7", MembershipOp::Add)
      .await
      .unwrap();

    for i in 0..200 {
      // Keep the counter recently used so the set is the older half.
      cache.get_int(&count_key).await.unwrap();
      let fields = vec![("content".to_string(), "x".repeat(32))];
      cache
        .put_hash(&keys::reply(i), &fields, None)
        .await
        .unwrap();
      assert_eq!(
        cache.exists(&set_key).await.unwrap(),
        cache.exists(&count_key).await.unwrap(),
        "like state split after {} inserts",
        i + 1
      );
    }
    assert!(!cache.exists(&count_key).await.unwrap());
    assert!(cache.info().await.unwrap().evictions > 0);
  }

  #[tokio::test]
  async fn test_seed_repairs_counter_without_set() {
    let cache = store();
    let target = Target::reply(4);
    let set_key = keys::like_set(&target);
    let count_key = keys::like_count(&target);
    cache
      .seed_membership(&set_key, &count_key, &["1".into(), "2".into()])
      .await
      .unwrap();
    cache.delete(&set_key).await.unwrap();

    assert!(cache
      .seed_membership(&set_key, &count_key, &["1".into(), "2".into()])
      .await
      .unwrap());
    assert!(cache.is_member(&set_key, "2").await.unwrap());
    assert_eq!(cache.get_int(&count_key).await.unwrap(), Some(2));
  }

  #[tokio::test]
  async fn test_seed_skips_zero_counter_without_set() {
    let cache = store();
    cache.seed_membership("s", "c", &["1".into()]).await.unwrap();
    cache
      .toggle_membership("s", "c", "1", MembershipOp::Remove)
      .await
      .unwrap();
    assert!(!cache.exists("s").await.unwrap());
    assert!(!cache.seed_membership("s", "c", &["9".into()]).await.unwrap());
  }

  #[tokio::test]
  async fn test_noeviction_reports_oom() {
    let cache = InMemoryCacheStore::new(40, EvictionPolicy::NoEviction);
    let fields = vec![("field".to_string(), "x".repeat(64))];
    let err = cache.put_hash("big", &fields, None).await.unwrap_err();
    assert!(matches!(err, CacheStoreError::OutOfMemory));
  }

  #[tokio::test]
  async fn test_evict_expired_sweep() {
    let cache = store();
    cache
      .put_hash("h", &[("a".into(), "1".into())], Some(Duration::from_millis(10)))
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(cache.evict_expired(), 1);
    assert_eq!(cache.info().await.unwrap().expired, 1);
  }
}
