//! Article projection and view recording

use std::collections::HashMap;
use tracing::{debug, info};

use super::{validate_id, ForumEngine, Job};
use crate::error::{ForumError, Result};
use crate::keys;
use crate::mq::Topic;
use crate::types::{Article, ArticleMeta, NewArticle, Target, ViewEvent, A_VISIT_COUNT};

const ABSENT_MISSING: &str = "missing";
const ABSENT_BANNED: &str = "banned";

fn absent_error(article_id: i64, reason: &str) -> ForumError {
  if reason == ABSENT_BANNED {
    ForumError::ArticleBanned(article_id)
  } else {
    ForumError::ArticleNotFound(article_id)
  }
}

/// Classify a store row; `Ok` only for a live article.
fn check_live(article_id: i64, article: Option<Article>) -> Result<Article> {
  match article {
    None => Err(ForumError::ArticleNotFound(article_id)),
    Some(a) if a.is_deleted() || a.is_banned() => Err(ForumError::ArticleBanned(article_id)),
    Some(a) => Ok(a),
  }
}

/// What a cached article hash says, if anything.
enum Cached {
  Live(ArticleMeta),
  Absent(String),
  Miss,
}

fn read_cached(fields: Option<HashMap<String, String>>) -> Cached {
  let Some(fields) = fields else {
    return Cached::Miss;
  };
  if let Some(reason) = fields.get(keys::ABSENT_FIELD) {
    return Cached::Absent(reason.clone());
  }
  match ArticleMeta::from_fields(&fields) {
    Some(meta) => Cached::Live(meta),
    None => Cached::Miss,
  }
}

impl ForumEngine {
  pub async fn create_article(&self, article: NewArticle) -> Result<ArticleMeta> {
    validate_id("boardId", article.board_id)?;
    validate_id("userId", article.user_id)?;
    if article.title.trim().is_empty() {
      return Err(ForumError::Validation("title must not be empty".to_string()));
    }
    if article.content.trim().is_empty() {
      return Err(ForumError::Validation("content must not be empty".to_string()));
    }

    let created = self.store.insert_article(&article).await?;
    let meta = ArticleMeta::from(&created);
    // Overwrites any placeholder left by an earlier miss on this id.
    self
      .cache
      .put_hash(
        &keys::article(created.id),
        &meta.to_fields(),
        Some(self.config.article_meta_ttl),
      )
      .await?;
    info!(article_id = created.id, board_id = created.board_id, "Article created");
    Ok(meta)
  }

  /// Cached article metadata. Missing, banned and deleted articles are
  /// remembered with a short-lived placeholder.
  pub async fn get_article_meta(&self, article_id: i64) -> Result<ArticleMeta> {
    validate_id("articleId", article_id)?;
    let key = keys::article(article_id);

    match read_cached(self.cache.get_hash(&key).await?) {
      Cached::Live(meta) => return Ok(meta),
      Cached::Absent(reason) => return Err(absent_error(article_id, &reason)),
      Cached::Miss => {}
    }

    let row = self.store.get_article(article_id).await?;
    let article = match check_live(article_id, row) {
      Ok(article) => article,
      Err(e) => {
        let reason = match e {
          ForumError::ArticleBanned(_) => ABSENT_BANNED,
          _ => ABSENT_MISSING,
        };
        self
          .cache
          .put_hash(
            &key,
            &[(keys::ABSENT_FIELD.to_string(), reason.to_string())],
            Some(self.config.placeholder_ttl),
          )
          .await?;
        debug!(article_id, reason, "Article placeholder written");
        return Err(e);
      }
    };

    let meta = ArticleMeta::from(&article);
    let cache = self.cache.clone();
    let fields = meta.to_fields();
    let ttl = self.config.article_meta_ttl;
    self.cache_pool.submit(Job::new(
      "fill_article_meta",
      Target::article(article_id),
      async move {
        cache.put_hash(&key, &fields, Some(ttl)).await?;
        Ok(())
      },
    ));
    Ok(meta)
  }

  /// Fail unless the article exists and is neither banned nor deleted.
  /// Reads the cache but never writes it.
  pub(crate) async fn require_live_article(&self, article_id: i64) -> Result<()> {
    match read_cached(self.cache.get_hash(&keys::article(article_id)).await?) {
      Cached::Live(_) => Ok(()),
      Cached::Absent(reason) => Err(absent_error(article_id, &reason)),
      Cached::Miss => {
        let row = self.store.get_article(article_id).await?;
        check_live(article_id, row).map(|_| ())
      }
    }
  }

  /// Count one view. The cached `visitCount` moves now, the store catches up
  /// when the view buffer flushes.
  pub async fn record_view(&self, article_id: i64) -> Result<()> {
    validate_id("articleId", article_id)?;
    self
      .cache
      .incr_hash_field_if_present(&keys::article(article_id), A_VISIT_COUNT, 1)
      .await?;
    self
      .broker
      .publish(Topic::View, ViewEvent::new(article_id).encode())
      .await
      .map_err(|e| ForumError::Publish(e.to_string()))
  }

  /// Mark an article banned and drop its cached projection.
  pub async fn ban_article(&self, article_id: i64) -> Result<bool> {
    validate_id("articleId", article_id)?;
    let changed = self.store.set_article_state(article_id, 1).await?;
    self.cache.delete(&keys::article(article_id)).await?;
    info!(article_id, changed, "Article banned");
    Ok(changed)
  }
}
