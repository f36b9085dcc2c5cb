//! Cache entry types

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

/// A cached entry with metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub value: CacheValue,
  pub ttl: Option<Duration>,
  pub created_at: Instant,
  pub accessed_at: Instant,
  pub expires_at: Option<Instant>,
  pub access_count: u64,
  /// Size in bytes (approximate)
  pub size: usize,
}

impl CacheEntry {
  pub fn new(key: String, value: CacheValue, ttl: Option<Duration>) -> Self {
    let now = Instant::now();
    let size = value.approximate_size() + key.len();
    let expires_at = ttl.map(|d| now + d);
    Self {
      key,
      value,
      ttl,
      created_at: now,
      accessed_at: now,
      expires_at,
      access_count: 0,
      size,
    }
  }

  pub fn is_expired(&self) -> bool {
    self
      .expires_at
      .map(|exp| Instant::now() > exp)
      .unwrap_or(false)
  }

  pub fn ttl_remaining(&self) -> Option<Duration> {
    self.expires_at.and_then(|exp| {
      let now = Instant::now();
      if now > exp {
        None
      } else {
        Some(exp - now)
      }
    })
  }

  pub fn touch(&mut self) {
    self.accessed_at = Instant::now();
    self.access_count += 1;
  }

  pub fn update_ttl(&mut self, ttl: Option<Duration>) {
    self.ttl = ttl;
    self.expires_at = ttl.map(|d| Instant::now() + d);
  }

  /// Recompute the size after an in-place mutation. Returns the old size.
  pub fn resize(&mut self) -> usize {
    let old = self.size;
    self.size = self.value.approximate_size() + self.key.len();
    old
  }
}

/// Cache value types, one per data structure the engine relies on.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
  Integer(i64),
  Set(HashSet<String>),
  SortedSet(SortedSet),
  Hash(HashMap<String, String>),
}

impl CacheValue {
  pub fn approximate_size(&self) -> usize {
    match self {
      CacheValue::Integer(_) => 8,
      CacheValue::Set(s) => s.iter().map(|m| m.len() + 8).sum(),
      CacheValue::SortedSet(z) => z.approximate_size(),
      CacheValue::Hash(h) => h.iter().map(|(k, v)| k.len() + v.len() + 8).sum(),
    }
  }

  pub fn type_name(&self) -> &'static str {
    match self {
      CacheValue::Integer(_) => "integer",
      CacheValue::Set(_) => "set",
      CacheValue::SortedSet(_) => "zset",
      CacheValue::Hash(_) => "hash",
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      CacheValue::Integer(i) => Some(*i),
      _ => None,
    }
  }
}

impl From<i64> for CacheValue {
  fn from(i: i64) -> Self {
    CacheValue::Integer(i)
  }
}

#[derive(Debug, Clone, PartialEq)]
struct ScoredMember {
  score: f64,
  member: String,
}

impl Eq for ScoredMember {}

impl PartialOrd for ScoredMember {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for ScoredMember {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .score
      .total_cmp(&other.score)
      .then_with(|| self.member.cmp(&other.member))
  }
}

/// Members ordered by score. Equal scores fall back to member order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedSet {
  scores: HashMap<String, f64>,
  order: BTreeSet<ScoredMember>,
}

impl SortedSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a (String, f64)>) -> Self {
    let mut set = Self::new();
    for (member, score) in entries {
      set.insert(member.clone(), *score);
    }
    set
  }

  /// Insert or rescore a member. Returns true when the member is new.
  pub fn insert(&mut self, member: String, score: f64) -> bool {
    let is_new = match self.scores.insert(member.clone(), score) {
      Some(old) => {
        self.order.remove(&ScoredMember {
          score: old,
          member: member.clone(),
        });
        false
      }
      None => true,
    };
    self.order.insert(ScoredMember { score, member });
    is_new
  }

  pub fn remove(&mut self, member: &str) -> bool {
    match self.scores.remove(member) {
      Some(score) => {
        self.order.remove(&ScoredMember {
          score,
          member: member.to_string(),
        });
        true
      }
      None => false,
    }
  }

  pub fn contains(&self, member: &str) -> bool {
    self.scores.contains_key(member)
  }

  pub fn len(&self) -> usize {
    self.scores.len()
  }

  pub fn is_empty(&self) -> bool {
    self.scores.is_empty()
  }

  /// Members by descending score, ranks `start..=stop` (zero based).
  pub fn range_desc(&self, start: usize, stop: usize) -> Vec<String> {
    if stop < start {
      return Vec::new();
    }
    self
      .order
      .iter()
      .rev()
      .skip(start)
      .take(stop - start + 1)
      .map(|m| m.member.clone())
      .collect()
  }

  fn approximate_size(&self) -> usize {
    self.scores.keys().map(|m| m.len() * 2 + 24).sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sorted_set_orders_by_score_desc() {
    let mut z = SortedSet::new();
    z.insert("a".into(), 1.0);
    z.insert("c".into(), 3.0);
    z.insert("b".into(), 2.0);
    assert_eq!(z.range_desc(0, 10), vec!["c", "b", "a"]);
    assert_eq!(z.range_desc(1, 1), vec!["b"]);
    assert!(z.range_desc(3, 5).is_empty());
  }

  #[test]
  fn test_sorted_set_rescore_and_remove() {
    let mut z = SortedSet::new();
    assert!(z.insert("a".into(), 1.0));
    assert!(!z.insert("a".into(), 5.0));
    z.insert("b".into(), 2.0);
    assert_eq!(z.range_desc(0, 1), vec!["a", "b"]);
    assert!(z.remove("a"));
    assert!(!z.remove("a"));
    assert_eq!(z.len(), 1);
  }

  #[test]
  fn test_entry_resize_tracks_growth() {
    let mut entry = CacheEntry::new("k".into(), CacheValue::Set(HashSet::new()), None);
    if let CacheValue::Set(s) = &mut entry.value {
      s.insert("user-1".into());
    }
    let old = entry.resize();
    assert!(entry.size > old);
  }
}
