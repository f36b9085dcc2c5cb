//! Event consumer
//!
//! Like events are reconciled one at a time with manual acknowledgement.
//! View events are acknowledged on receipt and counted in a [`ViewBuffer`]
//! that is flushed on a size threshold or a timer, whichever fires first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, BrokerError, Delivery, Topic};
use super::buffer::{flush_views, FlushReport, ViewBuffer};
use crate::db::ForumStore;
use crate::engine::reconcile_like;
use crate::types::{LikeChangedEvent, ViewEvent};

/// Pause after a broker error before polling again
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
  /// Deliveries of a like event before it is dead-lettered
  pub max_deliveries: u32,
  pub flush_interval: Duration,
}

impl Default for ConsumerConfig {
  fn default() -> Self {
    Self {
      max_deliveries: 3,
      flush_interval: Duration::from_secs(5),
    }
  }
}

/// What happened to one like delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeOutcome {
  Acked,
  Requeued,
  DeadLettered,
}

#[derive(Debug, Clone, Default)]
pub struct ConsumerStats {
  pub likes_applied: u64,
  pub likes_skipped: u64,
  pub likes_requeued: u64,
  pub likes_dead_lettered: u64,
  pub views_received: u64,
  pub views_flushed: u64,
}

#[derive(Default)]
struct Counters {
  likes_applied: AtomicU64,
  likes_skipped: AtomicU64,
  likes_requeued: AtomicU64,
  likes_dead_lettered: AtomicU64,
  views_received: AtomicU64,
  views_flushed: AtomicU64,
}

pub struct EventConsumer {
  broker: Arc<dyn Broker>,
  store: Arc<dyn ForumStore>,
  buffer: Arc<ViewBuffer>,
  config: ConsumerConfig,
  counters: Counters,
}

impl EventConsumer {
  pub fn new(
    broker: Arc<dyn Broker>,
    store: Arc<dyn ForumStore>,
    buffer: Arc<ViewBuffer>,
    config: ConsumerConfig,
  ) -> Self {
    Self {
      broker,
      store,
      buffer,
      config,
      counters: Counters::default(),
    }
  }

  pub fn buffer(&self) -> &Arc<ViewBuffer> {
    &self.buffer
  }

  pub fn stats(&self) -> ConsumerStats {
    let c = &self.counters;
    ConsumerStats {
      likes_applied: c.likes_applied.load(Ordering::Relaxed),
      likes_skipped: c.likes_skipped.load(Ordering::Relaxed),
      likes_requeued: c.likes_requeued.load(Ordering::Relaxed),
      likes_dead_lettered: c.likes_dead_lettered.load(Ordering::Relaxed),
      views_received: c.views_received.load(Ordering::Relaxed),
      views_flushed: c.views_flushed.load(Ordering::Relaxed),
    }
  }

  /// Reconcile one like event and settle its delivery.
  pub async fn handle_like(&self, delivery: &Delivery) -> Result<LikeOutcome, BrokerError> {
    let event = match LikeChangedEvent::decode(&delivery.payload) {
      Ok(event) => event,
      Err(e) => {
        warn!(id = %delivery.id, error = %e, "Dead-lettering undecodable like event");
        self.broker.nack(delivery, false).await?;
        self.counters.likes_dead_lettered.fetch_add(1, Ordering::Relaxed);
        return Ok(LikeOutcome::DeadLettered);
      }
    };

    match reconcile_like(self.store.as_ref(), &event).await {
      Ok(changed) => {
        self.broker.ack(delivery).await?;
        let counter = if changed {
          &self.counters.likes_applied
        } else {
          &self.counters.likes_skipped
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(
          user_id = event.user_id,
          target_id = event.target_id,
          target_type = %event.target_type,
          liked = event.liked,
          changed,
          "Like event reconciled"
        );
        Ok(LikeOutcome::Acked)
      }
      Err(e) if delivery.attempt < self.config.max_deliveries => {
        warn!(
          target_id = event.target_id,
          target_type = %event.target_type,
          attempt = delivery.attempt,
          error = %e,
          "Like reconciliation failed, requeueing"
        );
        self.broker.nack(delivery, true).await?;
        self.counters.likes_requeued.fetch_add(1, Ordering::Relaxed);
        Ok(LikeOutcome::Requeued)
      }
      Err(e) => {
        error!(
          target_id = event.target_id,
          target_type = %event.target_type,
          attempt = delivery.attempt,
          error = %e,
          "Like reconciliation failed, dead-lettering"
        );
        self.broker.nack(delivery, false).await?;
        self.counters.likes_dead_lettered.fetch_add(1, Ordering::Relaxed);
        Ok(LikeOutcome::DeadLettered)
      }
    }
  }

  /// Acknowledge a view event and buffer it. Flushes when the buffer fills.
  pub async fn handle_view(&self, delivery: &Delivery) -> Result<Option<FlushReport>, BrokerError> {
    self.broker.ack(delivery).await?;
    let event = match ViewEvent::decode(&delivery.payload) {
      Ok(event) => event,
      Err(e) => {
        warn!(id = %delivery.id, error = %e, "Dropping undecodable view event");
        return Ok(None);
      }
    };
    self.counters.views_received.fetch_add(1, Ordering::Relaxed);

    match self.buffer.push(event) {
      Some(batch) => Ok(Some(self.flush_batch(batch).await)),
      None => Ok(None),
    }
  }

  /// Flush whatever is buffered.
  pub async fn flush_views(&self) -> FlushReport {
    let batch = self.buffer.drain();
    self.flush_batch(batch).await
  }

  async fn flush_batch(&self, batch: Vec<ViewEvent>) -> FlushReport {
    let report = flush_views(&self.store, batch).await;
    self
      .counters
      .views_flushed
      .fetch_add(report.views, Ordering::Relaxed);
    report
  }

  /// Start the like loop, the view loop and the flush ticker. All three stop
  /// on the shutdown signal; the caller flushes the buffer once they joined.
  pub fn spawn(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
    let likes = {
      let consumer = self.clone();
      let mut stop = shutdown.subscribe();
      tokio::spawn(async move {
        loop {
          tokio::select! {
            received = consumer.broker.receive(Topic::Like) => {
              let Some(delivery) = consumer.received(Topic::Like, received).await else {
                continue;
              };
              if let Err(e) = consumer.handle_like(&delivery).await {
                error!(id = %delivery.id, error = %e, "Failed to settle like delivery");
              }
            }
            _ = stop.recv() => break,
          }
        }
        debug!("Like consumer stopped");
      })
    };

    let views = {
      let consumer = self.clone();
      let mut stop = shutdown.subscribe();
      tokio::spawn(async move {
        loop {
          tokio::select! {
            received = consumer.broker.receive(Topic::View) => {
              let Some(delivery) = consumer.received(Topic::View, received).await else {
                continue;
              };
              if let Err(e) = consumer.handle_view(&delivery).await {
                error!(id = %delivery.id, error = %e, "Failed to settle view delivery");
              }
            }
            _ = stop.recv() => break,
          }
        }
        debug!("View consumer stopped");
      })
    };

    let ticker = {
      let consumer = self.clone();
      let mut stop = shutdown.subscribe();
      let period = consumer.config.flush_interval;
      tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
          tokio::select! {
            _ = interval.tick() => {
              if !consumer.buffer.is_empty() {
                consumer.flush_views().await;
              }
            }
            _ = stop.recv() => break,
          }
        }
        debug!("View flush ticker stopped");
      })
    };

    info!(
      max_deliveries = self.config.max_deliveries,
      flush_interval_ms = self.config.flush_interval.as_millis() as u64,
      batch_size = self.buffer.threshold(),
      "Event consumer started"
    );
    vec![likes, views, ticker]
  }

  async fn received(
    &self,
    topic: Topic,
    received: Result<Option<Delivery>, BrokerError>,
  ) -> Option<Delivery> {
    match received {
      Ok(delivery) => delivery,
      Err(e) => {
        error!(topic = %topic, error = %e, "Broker receive failed");
        tokio::time::sleep(RECEIVE_BACKOFF).await;
        None
      }
    }
  }
}
