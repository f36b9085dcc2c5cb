use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::types::{Article, NewArticle, NewReply, Reply, Target, TargetType};

/// SQL dialect for statement generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
  Postgres,
  Sqlite,
}

impl SqlDialect {
  /// Positional parameter marker, 1-based
  pub fn param(&self, n: usize) -> String {
    match self {
      Self::Postgres => format!("${}", n),
      Self::Sqlite => format!("?{}", n),
    }
  }

  /// `column = max(column + delta, 0)`, delta bound to parameter `n`
  pub fn clamped_add(&self, column: &str, n: usize) -> String {
    let func = match self {
      Self::Postgres => "GREATEST",
      Self::Sqlite => "MAX",
    };
    format!("{col} = {func}({col} + {p}, 0)", col = column, func = func, p = self.param(n))
  }

  /// Statement adjusting a counter column of the row with id parameter 2
  pub fn adjust_counter(&self, table: &str, column: &str) -> String {
    format!(
      "UPDATE {} SET {} WHERE id = {}",
      table,
      self.clamped_add(column, 1),
      self.param(2)
    )
  }
}

/// Table holding the like counter of a target kind
pub fn like_table(kind: TargetType) -> &'static str {
  match kind {
    TargetType::Article => "articles",
    TargetType::Reply => "replies",
  }
}

/// Current time truncated to the millisecond, the precision of ranking scores.
pub(crate) fn now_millis() -> DateTime<Utc> {
  from_millis(Utc::now().timestamp_millis())
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
  Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Primary store for articles, replies and likes
#[async_trait]
pub trait ForumStore: Send + Sync {
  fn dialect(&self) -> SqlDialect;

  async fn init_schema(&self) -> Result<(), anyhow::Error>;

  async fn insert_article(&self, article: &NewArticle) -> Result<Article, anyhow::Error>;
  async fn get_article(&self, article_id: i64) -> Result<Option<Article>, anyhow::Error>;
  /// Set the moderation state (1 = banned). Returns false when no such article.
  async fn set_article_state(&self, article_id: i64, state: i16) -> Result<bool, anyhow::Error>;

  async fn insert_reply(&self, reply: &NewReply) -> Result<Reply, anyhow::Error>;
  async fn get_reply(&self, reply_id: i64) -> Result<Option<Reply>, anyhow::Error>;
  /// Visible (non-deleted, non-banned) replies among `ids`, in no particular order
  async fn get_replies_by_ids(&self, ids: &[i64]) -> Result<Vec<Reply>, anyhow::Error>;
  /// Visible top-level replies of an article, newest first
  async fn list_top_level_replies(&self, article_id: i64) -> Result<Vec<Reply>, anyhow::Error>;
  /// Visible direct children of a reply, newest first
  async fn list_child_replies(&self, parent_id: i64) -> Result<Vec<Reply>, anyhow::Error>;
  /// Soft-delete a live reply owned by `author_id` in `article_id`.
  /// Returns the deleted row, or `None` when nothing matched.
  async fn soft_delete_reply(
    &self,
    reply_id: i64,
    author_id: i64,
    article_id: i64,
  ) -> Result<Option<Reply>, anyhow::Error>;

  async fn adjust_article_reply_count(&self, article_id: i64, delta: i64)
    -> Result<bool, anyhow::Error>;
  async fn adjust_article_view_count(&self, article_id: i64, delta: i64)
    -> Result<bool, anyhow::Error>;
  async fn adjust_reply_children_count(&self, reply_id: i64, delta: i64)
    -> Result<bool, anyhow::Error>;
  async fn adjust_like_count(&self, target: Target, delta: i64) -> Result<bool, anyhow::Error>;

  async fn find_like(&self, user_id: i64, target: Target) -> Result<bool, anyhow::Error>;
  async fn list_likers(&self, target: Target) -> Result<Vec<i64>, anyhow::Error>;
  /// Insert (`liked`) or delete the like row and move the target's
  /// `like_count` by one, in one transaction. Returns false when the row was
  /// already in the requested state, in which case nothing changed.
  async fn apply_like(
    &self,
    user_id: i64,
    target: Target,
    liked: bool,
  ) -> Result<bool, anyhow::Error>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_dialect_counter_sql() {
    assert_eq!(
      SqlDialect::Sqlite.adjust_counter("articles", "reply_count"),
      "UPDATE articles SET reply_count = MAX(reply_count + ?1, 0) WHERE id = ?2"
    );
    assert_eq!(
      SqlDialect::Postgres.adjust_counter("replies", "like_count"),
      "UPDATE replies SET like_count = GREATEST(like_count + $1, 0) WHERE id = $2"
    );
  }

  #[test]
  fn test_now_millis_has_no_sub_millisecond_part() {
    let now = now_millis();
    assert_eq!(now.timestamp_subsec_nanos() % 1_000_000, 0);
  }
}
