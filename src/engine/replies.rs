//! Reply tree cache
//!
//! Each ranking (an article's top-level replies, a reply's children) is
//! cold, empty or warm. A cold ranking is rebuilt from the store; an empty
//! one holds only the sentinel until its TTL runs out. Page order always
//! comes from the ranking, metadata is resolved per id.

use std::collections::HashMap;
use tracing::{debug, error, info};

use super::{validate_id, validate_page, ForumEngine};
use crate::cache::RankingState;
use crate::error::{ForumError, Result};
use crate::keys;
use crate::types::{
  NewReply, Reply, ReplyMeta, ReplyNode, ReplyPage, Target, A_REPLY_COUNT, F_CHILDREN_COUNT,
};

/// One ranked set of replies
#[derive(Debug, Clone, Copy)]
enum Ranking {
  TopLevel(i64),
  Children(i64),
}

impl Ranking {
  fn key(&self) -> String {
    match self {
      Ranking::TopLevel(article_id) => keys::article_replies(*article_id),
      Ranking::Children(reply_id) => keys::reply_children(*reply_id),
    }
  }
}

impl ForumEngine {
  /// Create a reply and mirror it into the caches.
  pub async fn create_reply(&self, reply: NewReply) -> Result<ReplyMeta> {
    let reply = reply.normalized();
    validate_id("articleId", reply.article_id)?;
    validate_id("postUserId", reply.author_id)?;
    self.validate_content(&reply.content)?;

    self.require_live_article(reply.article_id).await?;
    if let Some(parent_id) = reply.parent_id {
      let parent = self.store.get_reply(parent_id).await?;
      let live = parent.is_some_and(|p| {
        p.article_id == reply.article_id && p.delete_state == 0 && p.state == 0
      });
      if !live {
        return Err(ForumError::ReplyNotFound(parent_id));
      }
    }

    let created = self.store.insert_reply(&reply).await?;
    let article_id = created.article_id;
    info!(
      reply_id = created.id,
      article_id,
      parent_id = created.parent_id.unwrap_or(0),
      "Reply created"
    );

    let store = self.store.clone();
    self.submit_store("incr_reply_count", Target::article(article_id), async move {
      store.adjust_article_reply_count(article_id, 1).await
    });

    match created.parent_id {
      None => {
        self.cache.delete(&keys::article_replies(article_id)).await?;
      }
      Some(parent_id) => {
        self.adjust_children_count(parent_id, 1).await;
        self
          .cache
          .add_to_ranking_if_present(
            &keys::reply_children(parent_id),
            &created.id.to_string(),
            created.score(),
            keys::EMPTY_SENTINEL,
          )
          .await?;
        self
          .cache
          .incr_hash_field_if_present(&keys::reply(parent_id), F_CHILDREN_COUNT, 1)
          .await?;
      }
    }
    self
      .cache
      .incr_hash_field_if_present(&keys::article(article_id), A_REPLY_COUNT, 1)
      .await?;

    // Written before returning: a child created right after must find this
    // hash to bump its childrenCount.
    let meta = ReplyMeta::from(&created);
    self
      .cache
      .put_hash(
        &keys::reply(meta.id),
        &meta.to_fields(),
        Some(self.config.reply_meta_ttl),
      )
      .await?;
    Ok(meta)
  }

  /// Soft-delete a reply owned by `author_id` and mirror it into the caches.
  pub async fn delete_reply(&self, reply_id: i64, author_id: i64, article_id: i64) -> Result<()> {
    validate_id("replyId", reply_id)?;
    validate_id("postUserId", author_id)?;
    validate_id("articleId", article_id)?;

    let Some(deleted) = self
      .store
      .soft_delete_reply(reply_id, author_id, article_id)
      .await?
    else {
      info!(reply_id, author_id, article_id, "Reply delete matched no rows");
      return Err(ForumError::DeleteFailed { reply_id });
    };

    self.cache.delete(&keys::reply(reply_id)).await?;
    self.cache.delete(&keys::reply_children(reply_id)).await?;
    match deleted.parent_id {
      None => {
        self.cache.delete(&keys::article_replies(article_id)).await?;
      }
      Some(parent_id) => {
        self.adjust_children_count(parent_id, -1).await;
        self
          .cache
          .remove_from_ranking(&keys::reply_children(parent_id), &reply_id.to_string())
          .await?;
        self
          .cache
          .incr_hash_field_if_present(&keys::reply(parent_id), F_CHILDREN_COUNT, -1)
          .await?;
      }
    }
    self
      .cache
      .incr_hash_field_if_present(&keys::article(article_id), A_REPLY_COUNT, -1)
      .await?;

    let store = self.store.clone();
    self.submit_store("decr_reply_count", Target::article(article_id), async move {
      store.adjust_article_reply_count(article_id, -1).await
    });
    info!(reply_id, article_id, "Reply deleted");
    Ok(())
  }

  /// One page of an article's top-level replies, newest first, each followed
  /// depth-first by its descendants.
  pub async fn list_replies(&self, article_id: i64, page: u32, size: u32) -> Result<ReplyPage> {
    validate_id("articleId", article_id)?;
    validate_page(page, size, self.config.max_page_size)?;

    let (start, stop) = rank_range(page, size);
    let (top, total) = self
      .ranking_page(Ranking::TopLevel(article_id), start, stop)
      .await?;
    if top.is_empty() {
      return Ok(ReplyPage::empty(article_id, page, size, total));
    }
    Ok(ReplyPage {
      article_id,
      page,
      size,
      total,
      replies: self.expand(top).await?,
    })
  }

  /// One page of a reply's direct children, newest first, not expanded.
  pub async fn list_children(&self, reply_id: i64, page: u32, size: u32) -> Result<Vec<ReplyMeta>> {
    validate_id("replyId", reply_id)?;
    validate_page(page, size, self.config.max_page_size)?;

    let (start, stop) = rank_range(page, size);
    let (children, _) = self
      .ranking_page(Ranking::Children(reply_id), start, stop)
      .await?;
    Ok(children)
  }

  /// Cached projection of one visible reply.
  pub async fn get_reply_meta(&self, reply_id: i64) -> Result<ReplyMeta> {
    validate_id("replyId", reply_id)?;
    self
      .resolve_metas(&[reply_id])
      .await?
      .pop()
      .ok_or(ForumError::ReplyNotFound(reply_id))
  }

  fn validate_content(&self, content: &str) -> Result<()> {
    if content.trim().is_empty() {
      return Err(ForumError::Validation("content must not be empty".to_string()));
    }
    if content.chars().count() > self.config.max_content_len {
      return Err(ForumError::Validation(format!(
        "content exceeds {} characters",
        self.config.max_content_len
      )));
    }
    Ok(())
  }

  /// The store keeps `children_count` exact on every create and delete, so
  /// a later cache fill never reads a stale count.
  async fn adjust_children_count(&self, parent_id: i64, delta: i64) {
    if let Err(e) = self.store.adjust_reply_children_count(parent_id, delta).await {
      error!(reply_id = parent_id, delta, error = %e, "Failed to adjust children count");
    }
  }

  /// Ranks `start..=stop` of a ranking plus its total size.
  async fn ranking_page(
    &self,
    ranking: Ranking,
    start: usize,
    stop: usize,
  ) -> Result<(Vec<ReplyMeta>, u64)> {
    let key = ranking.key();
    match self.cache.ranking_state(&key, keys::EMPTY_SENTINEL).await? {
      RankingState::Empty => Ok((Vec::new(), 0)),
      RankingState::Warm(total) => {
        if start as u64 >= total {
          return Ok((Vec::new(), total));
        }
        let ids: Vec<i64> = self
          .cache
          .ranking_range_desc(&key, start, stop)
          .await?
          .iter()
          .filter_map(|member| member.parse().ok())
          .collect();
        Ok((self.resolve_metas(&ids).await?, total))
      }
      RankingState::Cold => {
        let rows = self.load_ranking(ranking).await?;
        if rows.is_empty() {
          self
            .cache
            .set_placeholder(&key, keys::EMPTY_SENTINEL, self.config.placeholder_ttl)
            .await?;
          debug!(key = %key, "Empty ranking placeholder written");
          return Ok((Vec::new(), 0));
        }

        let entries: Vec<(String, f64)> = rows.iter().map(|r| (r.id.to_string(), r.score())).collect();
        self.cache.replace_ranking(&key, &entries).await?;
        let metas: Vec<ReplyMeta> = rows.iter().map(ReplyMeta::from).collect();
        for meta in &metas {
          self
            .cache
            .put_hash(
              &keys::reply(meta.id),
              &meta.to_fields(),
              Some(self.config.reply_meta_ttl),
            )
            .await?;
        }
        debug!(key = %key, members = rows.len(), "Ranking rebuilt from store");

        let total = rows.len() as u64;
        let page = metas
          .into_iter()
          .skip(start)
          .take(stop.saturating_sub(start) + 1)
          .collect();
        Ok((page, total))
      }
    }
  }

  async fn load_ranking(&self, ranking: Ranking) -> Result<Vec<Reply>> {
    let rows = match ranking {
      Ranking::TopLevel(article_id) => self.store.list_top_level_replies(article_id).await?,
      Ranking::Children(reply_id) => self.store.list_child_replies(reply_id).await?,
    };
    Ok(rows)
  }

  /// Metadata for `ids` in the given order. Misses are fetched from the
  /// store in one scoped query and refilled in the background; ids the store
  /// no longer shows are skipped.
  async fn resolve_metas(&self, ids: &[i64]) -> Result<Vec<ReplyMeta>> {
    let cache_keys: Vec<String> = ids.iter().map(|id| keys::reply(*id)).collect();
    let hashes = self.cache.get_hashes(&cache_keys).await?;

    let mut found: HashMap<i64, ReplyMeta> = HashMap::with_capacity(ids.len());
    let mut missing = Vec::new();
    for (id, hash) in ids.iter().zip(hashes) {
      match hash.as_ref().and_then(ReplyMeta::from_fields) {
        Some(meta) => {
          found.insert(*id, meta);
        }
        None => missing.push(*id),
      }
    }

    if !missing.is_empty() {
      let fetched: Vec<ReplyMeta> = self
        .store
        .get_replies_by_ids(&missing)
        .await?
        .iter()
        .map(ReplyMeta::from)
        .collect();
      debug!(
        missing = missing.len(),
        fetched = fetched.len(),
        "Reply metadata fetched from store"
      );
      for meta in &fetched {
        found.insert(meta.id, meta.clone());
      }
      self.fill_reply_metas(fetched);
    }

    Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
  }

  /// Depth-first expansion of `top`, children newest first.
  async fn expand(&self, top: Vec<ReplyMeta>) -> Result<Vec<ReplyNode>> {
    let last_child = self.config.max_children.saturating_sub(1);
    let mut nodes = Vec::new();
    let mut stack: Vec<(ReplyMeta, u32)> = top.into_iter().rev().map(|m| (m, 0)).collect();

    while let Some((meta, depth)) = stack.pop() {
      let reply_id = meta.id;
      let descend = meta.children_count > 0
        && depth + 1 < self.config.max_depth
        && self.config.max_children > 0;
      nodes.push(ReplyNode { reply: meta, depth });
      if !descend {
        continue;
      }

      let (children, _) = self
        .ranking_page(Ranking::Children(reply_id), 0, last_child)
        .await?;
      stack.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
    }
    Ok(nodes)
  }

  /// Write reply projections through the cache pool.
  fn fill_reply_metas(&self, metas: Vec<ReplyMeta>) {
    let Some(first) = metas.first() else {
      return;
    };
    let target = Target::reply(first.id);
    let cache = self.cache.clone();
    let ttl = self.config.reply_meta_ttl;
    self.cache_pool.submit(super::Job::new("fill_reply_meta", target, async move {
      for meta in metas {
        cache
          .put_hash(&keys::reply(meta.id), &meta.to_fields(), Some(ttl))
          .await?;
      }
      Ok(())
    }));
  }
}

/// Zero-based inclusive rank range of a one-based page.
fn rank_range(page: u32, size: u32) -> (usize, usize) {
  let start = (page.saturating_sub(1) as usize) * size as usize;
  (start, start + (size as usize).saturating_sub(1))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rank_range() {
    assert_eq!(rank_range(1, 10), (0, 9));
    assert_eq!(rank_range(2, 2), (2, 3));
    assert_eq!(rank_range(3, 1), (2, 2));
  }

  #[test]
  fn test_ranking_keys() {
    assert_eq!(Ranking::TopLevel(4).key(), "article:4:replies");
    assert_eq!(Ranking::Children(9).key(), "reply:9:children");
  }
}
