mod common;

use common::{CountingStore, Harness};
use forumcache::db::ForumStore;
use forumcache::engine::{EngineConfig, LikePersistence};
use forumcache::mq::{
  Broker, ConsumerConfig, EventConsumer, LikeOutcome, MemoryBroker, Topic, ViewBuffer,
};
use forumcache::types::{LikeChangedEvent, Target, ViewEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn consumer(
  broker: Arc<MemoryBroker>,
  store: Arc<CountingStore>,
  batch_size: usize,
  flush_interval: Duration,
) -> EventConsumer {
  EventConsumer::new(
    broker,
    store,
    Arc::new(ViewBuffer::new(batch_size)),
    ConsumerConfig {
      max_deliveries: 3,
      flush_interval,
    },
  )
}

#[tokio::test]
async fn test_view_burst_is_one_store_update() {
  let h = Harness::new().await;
  let article = h.article().await;
  let consumer = consumer(h.broker.clone(), h.store.clone(), 5, Duration::from_secs(60));

  for _ in 0..5 {
    h.engine.record_view(article).await.unwrap();
  }

  let mut flushed = None;
  for _ in 0..5 {
    let delivery = h.broker.receive(Topic::View).await.unwrap().unwrap();
    flushed = consumer.handle_view(&delivery).await.unwrap().or(flushed);
  }

  let report = flushed.expect("threshold flush");
  assert_eq!(report.articles, 1);
  assert_eq!(report.views, 5);
  assert_eq!(h.store.calls("adjust_article_view_count"), 1);
  assert_eq!(h.store.get_article(article).await.unwrap().unwrap().visit_count, 5);
  // Views are acknowledged on receipt.
  assert_eq!(h.broker.in_flight(), 0);
}

#[tokio::test]
async fn test_views_grouped_per_article() {
  let h = Harness::new().await;
  let a = h.article().await;
  let b = h.article().await;
  let consumer = consumer(h.broker.clone(), h.store.clone(), 100, Duration::from_secs(60));

  for article in [a, b, a, a, b] {
    h.broker
      .publish(Topic::View, ViewEvent::new(article).encode())
      .await
      .unwrap();
    let delivery = h.broker.receive(Topic::View).await.unwrap().unwrap();
    assert!(consumer.handle_view(&delivery).await.unwrap().is_none());
  }

  let report = consumer.flush_views().await;
  assert_eq!(report.articles, 2);
  assert_eq!(report.views, 5);
  assert_eq!(h.store.calls("adjust_article_view_count"), 2);
  assert_eq!(h.store.get_article(a).await.unwrap().unwrap().visit_count, 3);
  assert_eq!(h.store.get_article(b).await.unwrap().unwrap().visit_count, 2);
}

#[tokio::test]
async fn test_timer_flushes_partial_buffer() {
  let h = Harness::new().await;
  let article = h.article().await;
  let consumer = Arc::new(consumer(
    h.broker.clone(),
    h.store.clone(),
    1000,
    Duration::from_millis(50),
  ));
  let (shutdown, _) = broadcast::channel(1);
  let handles = consumer.spawn(&shutdown);

  for _ in 0..3 {
    h.engine.record_view(article).await.unwrap();
  }
  tokio::time::sleep(Duration::from_millis(300)).await;

  assert_eq!(h.store.calls("adjust_article_view_count"), 1);
  assert_eq!(h.store.get_article(article).await.unwrap().unwrap().visit_count, 3);

  shutdown.send(()).unwrap();
  for handle in handles {
    handle.await.unwrap();
  }
}

#[tokio::test]
async fn test_like_failure_requeues_once_then_acks() {
  let h = Harness::with_config(EngineConfig {
    like_persistence: LikePersistence::Queue,
    ..Default::default()
  })
  .await;
  let article = Target::article(h.article().await);
  let consumer = consumer(h.broker.clone(), h.store.clone(), 10, Duration::from_secs(60));

  h.engine.like(3, article).await.unwrap();
  h.store.fail_apply_like(1);

  let first = h.broker.receive(Topic::Like).await.unwrap().unwrap();
  assert_eq!(consumer.handle_like(&first).await.unwrap(), LikeOutcome::Requeued);

  let second = h.broker.receive(Topic::Like).await.unwrap().unwrap();
  assert_eq!(second.attempt, 2);
  assert_eq!(consumer.handle_like(&second).await.unwrap(), LikeOutcome::Acked);

  assert!(h.broker.receive(Topic::Like).await.unwrap().is_none());
  assert_eq!(h.broker.stats().requeued, 1);
  assert_eq!(h.broker.stats().acked, 1);
  assert_eq!(h.broker.in_flight(), 0);
  assert_eq!(h.store.calls("apply_like"), 2);
  assert_eq!(h.store.get_article(article.id).await.unwrap().unwrap().like_count, 1);
}

#[tokio::test]
async fn test_redelivered_like_does_not_double_count() {
  let h = Harness::new().await;
  let article = Target::article(h.article().await);
  let consumer = consumer(h.broker.clone(), h.store.clone(), 10, Duration::from_secs(60));
  let payload = LikeChangedEvent::new(4, article, true).encode();

  for _ in 0..2 {
    h.broker.publish(Topic::Like, payload.clone()).await.unwrap();
    let delivery = h.broker.receive(Topic::Like).await.unwrap().unwrap();
    assert_eq!(consumer.handle_like(&delivery).await.unwrap(), LikeOutcome::Acked);
  }

  assert_eq!(consumer.stats().likes_applied, 1);
  assert_eq!(consumer.stats().likes_skipped, 1);
  assert_eq!(h.store.get_article(article.id).await.unwrap().unwrap().like_count, 1);
}

#[tokio::test]
async fn test_like_dead_lettered_after_max_deliveries() {
  let h = Harness::new().await;
  let article = Target::article(h.article().await);
  let consumer = consumer(h.broker.clone(), h.store.clone(), 10, Duration::from_secs(60));
  h.store.fail_apply_like(10);

  h.broker
    .publish(Topic::Like, LikeChangedEvent::new(1, article, true).encode())
    .await
    .unwrap();

  let mut outcomes = Vec::new();
  while let Some(delivery) = h.broker.receive(Topic::Like).await.unwrap() {
    outcomes.push(consumer.handle_like(&delivery).await.unwrap());
  }

  assert_eq!(
    outcomes,
    vec![
      LikeOutcome::Requeued,
      LikeOutcome::Requeued,
      LikeOutcome::DeadLettered
    ]
  );
  let dead = h.broker.dead_letters();
  assert_eq!(dead.len(), 1);
  assert_eq!(dead[0].attempt, 3);
}

#[tokio::test]
async fn test_malformed_like_is_dead_lettered() {
  let h = Harness::new().await;
  let consumer = consumer(h.broker.clone(), h.store.clone(), 10, Duration::from_secs(60));

  h.broker
    .publish(Topic::Like, b"{\"v\":1}".to_vec())
    .await
    .unwrap();
  let delivery = h.broker.receive(Topic::Like).await.unwrap().unwrap();
  assert_eq!(
    consumer.handle_like(&delivery).await.unwrap(),
    LikeOutcome::DeadLettered
  );
  assert_eq!(h.store.calls("apply_like"), 0);
}

#[tokio::test]
async fn test_consumer_loop_reconciles_queued_likes() {
  let h = Harness::with_config(EngineConfig {
    like_persistence: LikePersistence::Queue,
    ..Default::default()
  })
  .await;
  let article = Target::article(h.article().await);
  let consumer = Arc::new(consumer(
    h.broker.clone(),
    h.store.clone(),
    10,
    Duration::from_secs(60),
  ));
  let (shutdown, _) = broadcast::channel(1);
  let handles = consumer.spawn(&shutdown);

  for user in 1..=4 {
    h.engine.like(user, article).await.unwrap();
  }
  h.engine.unlike(2, article).await.unwrap();

  let mut likes = 0;
  for _ in 0..50 {
    tokio::time::sleep(Duration::from_millis(20)).await;
    likes = h.store.get_article(article.id).await.unwrap().unwrap().like_count;
    if likes == 3 && h.broker.in_flight() == 0 {
      break;
    }
  }
  assert_eq!(likes, 3);

  shutdown.send(()).unwrap();
  for handle in handles {
    handle.await.unwrap();
  }
}
