mod common;

use common::Harness;
use forumcache::cache::CacheStore;
use forumcache::db::ForumStore;
use forumcache::engine::{EngineConfig, LikePersistence};
use forumcache::mq::{Broker, Topic};
use forumcache::types::{LikeChangedEvent, Target};
use forumcache::{ErrorKind, ForumError};
use std::sync::Arc;

#[tokio::test]
async fn test_like_unlike_sequence() {
  let h = Harness::new().await;
  let article = Target::article(h.article().await);

  assert_eq!(h.engine.like(7, article).await.unwrap(), 1);
  let err = h.engine.like(7, article).await.unwrap_err();
  assert!(matches!(err, ForumError::AlreadyLiked { .. }));
  assert_eq!(err.kind(), ErrorKind::BusinessConflict);

  assert_eq!(h.engine.unlike(7, article).await.unwrap(), 0);
  let err = h.engine.unlike(7, article).await.unwrap_err();
  assert!(matches!(err, ForumError::NotLiked { .. }));
}

#[tokio::test]
async fn test_concurrent_likes_are_not_lost() {
  let h = Arc::new(Harness::new().await);
  let article = Target::article(h.article().await);

  let tasks: Vec<_> = (1..=50)
    .map(|user| {
      let h = h.clone();
      tokio::spawn(async move { h.engine.like(user, article).await })
    })
    .collect();
  for task in tasks {
    task.await.unwrap().unwrap();
  }

  assert_eq!(h.engine.like_count(article).await.unwrap(), 50);

  h.engine.wait_idle().await;
  let row = h.store.get_article(article.id).await.unwrap().unwrap();
  assert_eq!(row.like_count, 50);
  assert_eq!(h.store.list_likers(article).await.unwrap().len(), 50);
}

#[tokio::test]
async fn test_check_like_status_follows_toggles() {
  let h = Harness::new().await;
  let article = h.article().await;
  let reply = Target::reply(h.reply(article, None, 2).await);

  assert!(!h.engine.check_like_status(3, reply).await.unwrap());
  h.engine.like(3, reply).await.unwrap();
  assert!(h.engine.check_like_status(3, reply).await.unwrap());
  h.engine.unlike(3, reply).await.unwrap();
  assert!(!h.engine.check_like_status(3, reply).await.unwrap());
}

#[tokio::test]
async fn test_status_falls_back_to_store_without_repopulating() {
  let h = Harness::new().await;
  let article = Target::article(h.article().await);
  h.engine.like(4, article).await.unwrap();
  h.engine.wait_idle().await;

  // Lose the cache; the store still has the row.
  h.cache.flush().await.unwrap();
  h.store.reset();

  assert!(h.engine.check_like_status(4, article).await.unwrap());
  assert_eq!(h.store.calls("find_like"), 1);
  assert!(!h.cache.exists(&forumcache::keys::like_set(&article)).await.unwrap());
  assert!(!h.cache.exists(&forumcache::keys::like_count(&article)).await.unwrap());
}

#[tokio::test]
async fn test_cold_like_state_is_seeded_from_store() {
  let h = Harness::new().await;
  let article = Target::article(h.article().await);
  h.engine.like(1, article).await.unwrap();
  h.engine.like(2, article).await.unwrap();
  h.engine.wait_idle().await;
  h.cache.flush().await.unwrap();

  // Seeding restores both likers, so the third like counts to 3 and a
  // repeated like from an old liker is still a conflict.
  assert_eq!(h.engine.like(3, article).await.unwrap(), 3);
  assert!(matches!(
    h.engine.like(1, article).await,
    Err(ForumError::AlreadyLiked { .. })
  ));
}

#[tokio::test]
async fn test_counter_without_its_set_is_reseeded() {
  let h = Harness::new().await;
  let article = Target::article(h.article().await);
  h.engine.like(7, article).await.unwrap();
  h.engine.wait_idle().await;

  // Only the liker set goes; the counter stays behind.
  h.cache
    .delete(&forumcache::keys::like_set(&article))
    .await
    .unwrap();
  h.store.reset();

  assert!(h.engine.check_like_status(7, article).await.unwrap());
  assert_eq!(h.store.calls("find_like"), 1);
  assert!(matches!(
    h.engine.like(7, article).await,
    Err(ForumError::AlreadyLiked { .. })
  ));
  assert_eq!(h.store.calls("list_likers"), 1);
  assert_eq!(h.engine.like_count(article).await.unwrap(), 1);
  assert!(h.engine.check_like_status(7, article).await.unwrap());
}

#[tokio::test]
async fn test_like_bumps_cached_projection() {
  let h = Harness::new().await;
  let article = h.article().await;
  h.engine.like(9, Target::article(article)).await.unwrap();

  let meta = h.engine.get_article_meta(article).await.unwrap();
  assert_eq!(meta.like_count, 1);
}

#[tokio::test]
async fn test_invalid_ids_rejected_before_cache() {
  let h = Harness::new().await;
  let err = h.engine.like(0, Target::article(1)).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Validation);
  let err = h.engine.like(1, Target::reply(-5)).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Validation);
  assert_eq!(h.cache.info().await.unwrap().keys, 0);
}

#[tokio::test]
async fn test_queue_persistence_publishes_event() {
  let h = Harness::with_config(EngineConfig {
    like_persistence: LikePersistence::Queue,
    ..Default::default()
  })
  .await;
  let article = Target::article(h.article().await);
  h.engine.like(5, article).await.unwrap();
  h.engine.wait_idle().await;

  // Nothing reached the store directly.
  assert_eq!(h.store.calls("apply_like"), 0);

  let delivery = h.broker.receive(Topic::Like).await.unwrap().unwrap();
  let event = LikeChangedEvent::decode(&delivery.payload).unwrap();
  assert_eq!(event.user_id, 5);
  assert_eq!(event.target(), article);
  assert!(event.liked);
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
  let h = Harness::new().await;
  let article = Target::article(h.article().await);
  let event = LikeChangedEvent::new(8, article, true);

  assert!(forumcache::engine::reconcile_like(h.store.as_ref(), &event).await.unwrap());
  assert!(!forumcache::engine::reconcile_like(h.store.as_ref(), &event).await.unwrap());
  let row = h.store.get_article(article.id).await.unwrap().unwrap();
  assert_eq!(row.like_count, 1);
}
