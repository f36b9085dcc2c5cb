//! Broker abstraction with an in-process implementation

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Event stream a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
  Like,
  View,
}

impl Topic {
  pub fn routing_key(&self) -> &'static str {
    match self {
      Topic::Like => "event.like",
      Topic::View => "event.view",
    }
  }
}

impl std::fmt::Display for Topic {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.routing_key())
  }
}

/// A received message awaiting acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
  pub id: String,
  pub topic: Topic,
  pub payload: Vec<u8>,
  /// 1 on first delivery, incremented on every requeue
  pub attempt: u32,
}

#[derive(Error, Debug)]
pub enum BrokerError {
  #[error("Broker connection error: {0}")]
  Connection(String),

  #[error("Broker is closed")]
  Closed,

  #[error("Queue full: {0}")]
  Full(Topic),

  #[error("Unknown delivery: {0}")]
  UnknownDelivery(String),

  #[error("Malformed delivery {id}: {reason}")]
  Malformed { id: String, reason: String },

  #[error("Redis error: {0}")]
  Redis(#[from] redis::RedisError),
}

/// At-least-once message broker with manual acknowledgement
#[async_trait]
pub trait Broker: Send + Sync {
  async fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), BrokerError>;

  /// Next delivery on `topic`, or `None` when nothing arrived within the
  /// broker's poll window.
  async fn receive(&self, topic: Topic) -> Result<Option<Delivery>, BrokerError>;

  async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

  /// Reject a delivery. With `requeue` it is delivered again with
  /// `attempt + 1`, otherwise it goes to the dead-letter destination.
  async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;
}

struct Message {
  payload: Vec<u8>,
  attempt: u32,
}

/// Bounded channel for new messages plus an unbounded lane for requeued
/// ones. The lane is served first and never blocks the consumer that fills it.
struct Queue {
  tx: mpsc::Sender<Message>,
  rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
  retry: Mutex<VecDeque<Message>>,
}

impl Queue {
  fn new(capacity: usize) -> Self {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    Self {
      tx,
      rx: tokio::sync::Mutex::new(rx),
      retry: Mutex::new(VecDeque::new()),
    }
  }

  fn next_retry(&self) -> Option<Message> {
    self.retry.lock().pop_front()
  }
}

/// Broker counters
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
  pub published: u64,
  pub delivered: u64,
  pub acked: u64,
  pub requeued: u64,
  pub dead_lettered: u64,
}

/// In-process broker: one bounded queue per topic and an in-flight table
pub struct MemoryBroker {
  like: Queue,
  view: Queue,
  in_flight: Mutex<HashMap<String, Delivery>>,
  dead_letters: Mutex<Vec<Delivery>>,
  poll_interval: Duration,
  next_id: AtomicU64,
  published: AtomicU64,
  delivered: AtomicU64,
  acked: AtomicU64,
  requeued: AtomicU64,
}

impl MemoryBroker {
  pub fn new(capacity: usize, poll_interval: Duration) -> Self {
    Self {
      like: Queue::new(capacity),
      view: Queue::new(capacity),
      in_flight: Mutex::new(HashMap::new()),
      dead_letters: Mutex::new(Vec::new()),
      poll_interval,
      next_id: AtomicU64::new(1),
      published: AtomicU64::new(0),
      delivered: AtomicU64::new(0),
      acked: AtomicU64::new(0),
      requeued: AtomicU64::new(0),
    }
  }

  fn queue(&self, topic: Topic) -> &Queue {
    match topic {
      Topic::Like => &self.like,
      Topic::View => &self.view,
    }
  }

  /// Never waits for room: a full queue is reported to the publisher.
  fn enqueue(&self, topic: Topic, message: Message) -> Result<(), BrokerError> {
    self
      .queue(topic)
      .tx
      .try_send(message)
      .map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => BrokerError::Full(topic),
        mpsc::error::TrySendError::Closed(_) => BrokerError::Closed,
      })
  }

  fn settle(&self, delivery: &Delivery) -> Result<Delivery, BrokerError> {
    self
      .in_flight
      .lock()
      .remove(&delivery.id)
      .ok_or_else(|| BrokerError::UnknownDelivery(delivery.id.clone()))
  }

  /// Messages rejected without requeue
  pub fn dead_letters(&self) -> Vec<Delivery> {
    self.dead_letters.lock().clone()
  }

  /// Deliveries neither acked nor rejected yet
  pub fn in_flight(&self) -> usize {
    self.in_flight.lock().len()
  }

  pub fn stats(&self) -> BrokerStats {
    BrokerStats {
      published: self.published.load(Ordering::Relaxed),
      delivered: self.delivered.load(Ordering::Relaxed),
      acked: self.acked.load(Ordering::Relaxed),
      requeued: self.requeued.load(Ordering::Relaxed),
      dead_lettered: self.dead_letters.lock().len() as u64,
    }
  }
}

impl Default for MemoryBroker {
  fn default() -> Self {
    Self::new(10_000, Duration::from_millis(500))
  }
}

#[async_trait]
impl Broker for MemoryBroker {
  async fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), BrokerError> {
    self.enqueue(topic, Message { payload, attempt: 1 })?;
    self.published.fetch_add(1, Ordering::Relaxed);
    Ok(())
  }

  async fn receive(&self, topic: Topic) -> Result<Option<Delivery>, BrokerError> {
    let queue = self.queue(topic);
    let message = match queue.next_retry() {
      Some(message) => message,
      None => {
        let mut rx = queue.rx.lock().await;
        match tokio::time::timeout(self.poll_interval, rx.recv()).await {
          Ok(Some(message)) => message,
          Ok(None) => return Err(BrokerError::Closed),
          Err(_) => match queue.next_retry() {
            Some(message) => message,
            None => return Ok(None),
          },
        }
      }
    };

    let delivery = Delivery {
      id: self.next_id.fetch_add(1, Ordering::Relaxed).to_string(),
      topic,
      payload: message.payload,
      attempt: message.attempt,
    };
    self
      .in_flight
      .lock()
      .insert(delivery.id.clone(), delivery.clone());
    self.delivered.fetch_add(1, Ordering::Relaxed);
    Ok(Some(delivery))
  }

  async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
    self.settle(delivery)?;
    self.acked.fetch_add(1, Ordering::Relaxed);
    Ok(())
  }

  async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
    let delivery = self.settle(delivery)?;
    if requeue {
      self.requeued.fetch_add(1, Ordering::Relaxed);
      self.queue(delivery.topic).retry.lock().push_back(Message {
        payload: delivery.payload,
        attempt: delivery.attempt + 1,
      });
      Ok(())
    } else {
      self.dead_letters.lock().push(delivery);
      Ok(())
    }
  }
}
