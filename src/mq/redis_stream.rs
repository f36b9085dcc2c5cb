//! Broker over Redis Streams
//!
//! Each topic is a stream read through one consumer group. A requeue appends
//! the payload again with a bumped attempt counter and acknowledges the
//! delivered entry; a rejection appends it to the dead-letter stream.
//!
//! Entries delivered but never settled stay in the group's pending list.
//! Every `claim_idle_ms` the broker claims the ones idle that long (and, on
//! its first pass, every entry still owned by its own consumer name) and
//! delivers them again ahead of new entries.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{
  StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
  StreamReadReply,
};
use redis::{AsyncCommands, Client};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::broker::{Broker, BrokerError, Delivery, Topic};
use super::config::MqConfig;
use crate::cache::CacheProxyConfig;

const FIELD_PAYLOAD: &str = "payload";
const FIELD_ATTEMPT: &str = "attempt";
const FIELD_ROUTING_KEY: &str = "routing_key";
const FIELD_SOURCE_ID: &str = "source_id";

/// Per-topic read state
struct Lane {
  /// Blocking reads stall a multiplexed connection, so each topic reads on
  /// its own
  reader: ConnectionManager,
  /// Claimed entries waiting to be delivered again
  claimed: Mutex<VecDeque<Delivery>>,
  /// `None` until the first claim pass
  last_claim: Mutex<Option<Instant>>,
}

impl Lane {
  fn new(reader: ConnectionManager) -> Self {
    Self {
      reader,
      claimed: Mutex::new(VecDeque::new()),
      last_claim: Mutex::new(None),
    }
  }
}

/// Redis Streams broker
pub struct RedisStreamBroker {
  /// Publish, acknowledge and claim
  conn: ConnectionManager,
  like: Lane,
  view: Lane,
  config: MqConfig,
}

impl RedisStreamBroker {
  pub async fn connect(redis: &CacheProxyConfig, config: MqConfig) -> Result<Self, BrokerError> {
    let client = Client::open(redis.connection_url())?;
    let conn = ConnectionManager::new(client.clone()).await?;
    let like_reader = ConnectionManager::new(client.clone()).await?;
    let view_reader = ConnectionManager::new(client).await?;

    let broker = Self {
      conn,
      like: Lane::new(like_reader),
      view: Lane::new(view_reader),
      config,
    };
    broker.ensure_groups().await?;
    info!(
      group = %broker.config.group,
      consumer = %broker.config.consumer,
      "Redis stream broker connected"
    );
    Ok(broker)
  }

  async fn ensure_groups(&self) -> Result<(), BrokerError> {
    let mut conn = self.conn.clone();
    for stream in [&self.config.like_stream, &self.config.view_stream] {
      let created: Result<(), redis::RedisError> = conn
        .xgroup_create_mkstream(stream, &self.config.group, "$")
        .await;
      match created {
        Ok(()) => debug!(stream = %stream, "Consumer group created"),
        Err(e) if e.code() == Some("BUSYGROUP") => {}
        Err(e) => return Err(e.into()),
      }
    }
    Ok(())
  }

  fn stream(&self, topic: Topic) -> &str {
    match topic {
      Topic::Like => &self.config.like_stream,
      Topic::View => &self.config.view_stream,
    }
  }

  fn lane(&self, topic: Topic) -> &Lane {
    match topic {
      Topic::Like => &self.like,
      Topic::View => &self.view,
    }
  }

  async fn append(
    &self,
    stream: &str,
    topic: Topic,
    payload: &[u8],
    attempt: u32,
    source_id: Option<&str>,
  ) -> Result<(), BrokerError> {
    let mut conn = self.conn.clone();
    let mut fields: Vec<(&str, Vec<u8>)> = vec![
      (FIELD_PAYLOAD, payload.to_vec()),
      (FIELD_ATTEMPT, attempt.to_string().into_bytes()),
      (FIELD_ROUTING_KEY, topic.routing_key().as_bytes().to_vec()),
    ];
    if let Some(id) = source_id {
      fields.push((FIELD_SOURCE_ID, id.as_bytes().to_vec()));
    }
    let _: String = conn
      .xadd_maxlen(stream, StreamMaxlen::Approx(self.config.max_len), "*", fields.as_slice())
      .await?;
    Ok(())
  }

  async fn acknowledge(&self, delivery: &Delivery) -> Result<(), BrokerError> {
    let mut conn = self.conn.clone();
    let stream = self.stream(delivery.topic);
    let acked: i64 = conn
      .xack(stream, &self.config.group, &[&delivery.id])
      .await?;
    if acked == 0 {
      return Err(BrokerError::UnknownDelivery(delivery.id.clone()));
    }
    let _: i64 = conn.xdel(stream, &[&delivery.id]).await?;
    Ok(())
  }

  /// Run a claim pass when one is due. Returns whether it ran.
  async fn claim_if_due(&self, topic: Topic) -> Result<bool, BrokerError> {
    let lane = self.lane(topic);
    let first_pass = {
      let mut last = lane.last_claim.lock();
      match *last {
        Some(at) if at.elapsed() < self.config.claim_interval() => return Ok(false),
        previous => {
          *last = Some(Instant::now());
          previous.is_none()
        }
      }
    };
    self.claim_pending(topic, first_pass).await?;
    Ok(true)
  }

  /// Take over stale pending entries and stash them for redelivery.
  async fn claim_pending(&self, topic: Topic, first_pass: bool) -> Result<(), BrokerError> {
    let mut conn = self.conn.clone();
    let stream = self.stream(topic);
    let pending: StreamPendingCountReply = conn
      .xpending_count(stream, &self.config.group, "-", "+", self.config.claim_batch)
      .await?;

    let mut delivered: HashMap<String, usize> = HashMap::new();
    let mut batches: HashMap<u64, Vec<String>> = HashMap::new();
    for entry in pending.ids {
      let Some(min_idle) = claim_min_idle(
        &entry.consumer,
        entry.last_delivered_ms as u64,
        &self.config.consumer,
        first_pass,
        self.config.claim_idle_ms,
      ) else {
        continue;
      };
      delivered.insert(entry.id.clone(), entry.times_delivered);
      batches.entry(min_idle).or_default().push(entry.id);
    }

    for (min_idle, ids) in batches {
      let reply: StreamClaimReply = conn
        .xclaim(stream, &self.config.group, &self.config.consumer, min_idle, ids.as_slice())
        .await?;
      for entry in reply.ids {
        let id = entry.id.clone();
        let times = delivered.get(&id).copied().unwrap_or(1);
        match read_delivery(topic, entry, times) {
          Ok(delivery) => {
            warn!(
              id = %delivery.id,
              topic = %topic,
              attempt = delivery.attempt,
              "Redelivering unsettled stream entry"
            );
            self.lane(topic).claimed.lock().push_back(delivery);
          }
          Err(e) => {
            // Settle it so the next pass does not claim it again.
            warn!(topic = %topic, error = %e, "Dropping unreadable claimed entry");
            let _: i64 = conn.xack(stream, &self.config.group, &[&id]).await?;
          }
        }
      }
    }
    Ok(())
  }
}

/// Minimum idle time to claim a pending entry with, or `None` to leave it.
///
/// Entries owned by this consumer name on the first pass were left by an
/// earlier run of this instance and are taken at once.
fn claim_min_idle(
  owner: &str,
  idle_ms: u64,
  consumer: &str,
  first_pass: bool,
  claim_idle_ms: u64,
) -> Option<u64> {
  if first_pass && owner == consumer {
    Some(0)
  } else if idle_ms >= claim_idle_ms {
    Some(claim_idle_ms)
  } else {
    None
  }
}

/// Attempt number of a redelivery: the recorded attempt plus one for every
/// delivery that was never settled.
fn redelivery_attempt(recorded: u32, times_delivered: usize) -> u32 {
  recorded.saturating_add(times_delivered as u32)
}

/// Build a delivery from a stream entry. `redeliveries` is how many times
/// the group already handed it out without a settlement.
fn read_delivery(topic: Topic, entry: StreamId, redeliveries: usize) -> Result<Delivery, BrokerError> {
  let Some(payload) = entry.get::<Vec<u8>>(FIELD_PAYLOAD) else {
    return Err(BrokerError::Malformed {
      id: entry.id,
      reason: "missing payload".to_string(),
    });
  };
  let recorded = entry
    .get::<String>(FIELD_ATTEMPT)
    .and_then(|a| a.parse().ok())
    .unwrap_or(1);

  Ok(Delivery {
    id: entry.id,
    topic,
    payload,
    attempt: redelivery_attempt(recorded, redeliveries),
  })
}

#[async_trait]
impl Broker for RedisStreamBroker {
  async fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), BrokerError> {
    self.append(self.stream(topic), topic, &payload, 1, None).await
  }

  async fn receive(&self, topic: Topic) -> Result<Option<Delivery>, BrokerError> {
    let lane = self.lane(topic);
    if lane.claimed.lock().is_empty() {
      self.claim_if_due(topic).await?;
    }
    let claimed = lane.claimed.lock().pop_front();
    if let Some(delivery) = claimed {
      return Ok(Some(delivery));
    }

    let mut conn = lane.reader.clone();
    let options = StreamReadOptions::default()
      .group(&self.config.group, &self.config.consumer)
      .count(1)
      .block(self.config.block_ms as usize);

    let reply: Option<StreamReadReply> = conn
      .xread_options(&[self.stream(topic)], &[">"], &options)
      .await?;

    let Some(entry) = reply
      .and_then(|r| r.keys.into_iter().next())
      .and_then(|k| k.ids.into_iter().next())
    else {
      return Ok(None);
    };

    read_delivery(topic, entry, 0).map(Some).map_err(|e| {
      warn!(topic = %topic, error = %e, "Stream entry without payload");
      e
    })
  }

  async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
    self.acknowledge(delivery).await
  }

  async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
    if requeue {
      self
        .append(
          self.stream(delivery.topic),
          delivery.topic,
          &delivery.payload,
          delivery.attempt + 1,
          None,
        )
        .await?;
    } else {
      self
        .append(
          &self.config.dead_letter_stream,
          delivery.topic,
          &delivery.payload,
          delivery.attempt,
          Some(&delivery.id),
        )
        .await?;
    }
    self.acknowledge(delivery).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_own_entries_claimed_at_once_on_first_pass() {
    assert_eq!(claim_min_idle("forumd-a", 10, "forumd-a", true, 30_000), Some(0));
    assert_eq!(claim_min_idle("forumd-a", 10, "forumd-a", false, 30_000), None);
  }

  #[test]
  fn test_foreign_entries_claimed_once_idle() {
    assert_eq!(claim_min_idle("forumd-b", 10, "forumd-a", true, 30_000), None);
    assert_eq!(
      claim_min_idle("forumd-b", 30_000, "forumd-a", false, 30_000),
      Some(30_000)
    );
  }

  #[test]
  fn test_redelivery_counts_unsettled_deliveries() {
    // Delivered once, then the consumer died before settling it.
    assert_eq!(redelivery_attempt(1, 1), 2);
    // A requeued copy that was handed out twice without settlement.
    assert_eq!(redelivery_attempt(2, 2), 4);
    assert_eq!(redelivery_attempt(u32::MAX, 3), u32::MAX);
  }

  #[test]
  fn test_read_delivery_applies_redeliveries() {
    let mut map = HashMap::new();
    map.insert(
      FIELD_PAYLOAD.to_string(),
      redis::Value::BulkString(b"{}".to_vec()),
    );
    map.insert(
      FIELD_ATTEMPT.to_string(),
      redis::Value::BulkString(b"2".to_vec()),
    );
    let entry = StreamId {
      id: "1-0".to_string(),
      map,
    };
    let delivery = read_delivery(Topic::Like, entry, 1).unwrap();
    assert_eq!(delivery.attempt, 3);
    assert_eq!(delivery.payload, b"{}");

    let empty = StreamId {
      id: "2-0".to_string(),
      map: HashMap::new(),
    };
    assert!(matches!(
      read_delivery(Topic::Like, empty, 0),
      Err(BrokerError::Malformed { .. })
    ));
  }
}
