//! Like counters
//!
//! The set of likers and the counter are always mutated together by one
//! cache script. The store follows asynchronously.

use tracing::{debug, info, warn};

use super::{validate_id, ForumEngine, LikePersistence};
use crate::cache::MembershipOp;
use crate::db::ForumStore;
use crate::error::{ForumError, Result};
use crate::keys;
use crate::mq::Topic;
use crate::types::{LikeChangedEvent, Target, TargetType, A_LIKE_COUNT, F_LIKE_COUNT};

/// Apply a confirmed toggle to the store. Returns false when the like row was
/// already in the requested state, so replays never double-count.
pub async fn reconcile_like(
  store: &dyn ForumStore,
  event: &LikeChangedEvent,
) -> anyhow::Result<bool> {
  store
    .apply_like(event.user_id, event.target(), event.liked)
    .await
}

impl ForumEngine {
  /// Like `target`. Returns the new like count.
  pub async fn like(&self, user_id: i64, target: Target) -> Result<i64> {
    self.toggle_like(user_id, target, MembershipOp::Add).await
  }

  /// Withdraw a like. Returns the new like count.
  pub async fn unlike(&self, user_id: i64, target: Target) -> Result<i64> {
    self.toggle_like(user_id, target, MembershipOp::Remove).await
  }

  async fn toggle_like(&self, user_id: i64, target: Target, op: MembershipOp) -> Result<i64> {
    validate_id("userId", user_id)?;
    validate_id("targetId", target.id)?;

    let set_key = keys::like_set(&target);
    let count_key = keys::like_count(&target);
    self.warm_like_state(target, &set_key, &count_key).await?;

    let outcome = self
      .cache
      .toggle_membership(&set_key, &count_key, &user_id.to_string(), op)
      .await?;
    let liked = op == MembershipOp::Add;

    if !outcome.changed {
      info!(
        user_id,
        target_id = target.id,
        target_type = %target.kind,
        liked,
        "Like toggle was a no-op"
      );
      let target = target.to_string();
      return Err(if liked {
        ForumError::AlreadyLiked { target }
      } else {
        ForumError::NotLiked { target }
      });
    }

    self.bump_projection_likes(target, if liked { 1 } else { -1 }).await;
    self
      .dispatch_like(LikeChangedEvent::new(user_id, target, liked))
      .await;
    Ok(outcome.count)
  }

  /// Whether the cached like state can answer on its own: the counter is
  /// present and, when positive, so is the set.
  async fn like_state_whole(&self, set_key: &str, count_key: &str) -> Result<bool> {
    match self.cache.get_int(count_key).await? {
      None => Ok(false),
      Some(0) => Ok(true),
      Some(_) => Ok(self.cache.exists(set_key).await?),
    }
  }

  /// Seed a cold or split like state from the store before a toggle.
  async fn warm_like_state(&self, target: Target, set_key: &str, count_key: &str) -> Result<()> {
    if self.like_state_whole(set_key, count_key).await? {
      return Ok(());
    }
    let members: Vec<String> = self
      .store
      .list_likers(target)
      .await?
      .into_iter()
      .map(|id| id.to_string())
      .collect();
    let seeded = self
      .cache
      .seed_membership(set_key, count_key, &members)
      .await?;
    debug!(
      target_id = target.id,
      target_type = %target.kind,
      likers = members.len(),
      seeded,
      "Like state warmed"
    );
    Ok(())
  }

  /// Keep a cached projection's like count in step. A failure here only
  /// leaves the projection stale until its TTL.
  async fn bump_projection_likes(&self, target: Target, delta: i64) {
    let (key, field) = match target.kind {
      TargetType::Article => (keys::article(target.id), A_LIKE_COUNT),
      TargetType::Reply => (keys::reply(target.id), F_LIKE_COUNT),
    };
    if let Err(e) = self
      .cache
      .incr_hash_field_if_present(&key, field, delta)
      .await
    {
      warn!(target_id = target.id, target_type = %target.kind, error = %e, "Failed to bump cached like count");
    }
  }

  async fn dispatch_like(&self, event: LikeChangedEvent) {
    if self.config.like_persistence == LikePersistence::Queue {
      match self.broker.publish(Topic::Like, event.encode()).await {
        Ok(()) => return,
        Err(e) => warn!(
          target_id = event.target_id,
          target_type = %event.target_type,
          error = %e,
          "Like publish failed, reconciling directly"
        ),
      }
    }

    let store = self.store.clone();
    let op = if event.liked { "persist_like" } else { "remove_like" };
    self.submit_store(op, event.target(), async move {
      reconcile_like(store.as_ref(), &event).await
    });
  }

  /// Whether `user_id` currently likes `target`.
  ///
  /// A warm like set answers directly. Otherwise the store is asked and the
  /// set is left alone: a single row cannot rebuild its cardinality.
  pub async fn check_like_status(&self, user_id: i64, target: Target) -> Result<bool> {
    validate_id("userId", user_id)?;
    validate_id("targetId", target.id)?;

    let set_key = keys::like_set(&target);
    if self.like_state_whole(&set_key, &keys::like_count(&target)).await? {
      return Ok(self.cache.is_member(&set_key, &user_id.to_string()).await?);
    }
    Ok(self.store.find_like(user_id, target).await?)
  }

  pub async fn like_count(&self, target: Target) -> Result<i64> {
    validate_id("targetId", target.id)?;

    if let Some(count) = self.cache.get_int(&keys::like_count(&target)).await? {
      return Ok(count);
    }
    let count = match target.kind {
      TargetType::Article => self.store.get_article(target.id).await?.map(|a| a.like_count),
      TargetType::Reply => self.store.get_reply(target.id).await?.map(|r| r.like_count),
    };
    Ok(count.unwrap_or(0))
  }
}
