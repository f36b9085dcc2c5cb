use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of entity a like can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
  Article,
  Reply,
}

impl TargetType {
  pub fn as_str(&self) -> &'static str {
    match self {
      TargetType::Article => "article",
      TargetType::Reply => "reply",
    }
  }
}

impl std::fmt::Display for TargetType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for TargetType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "article" => Ok(TargetType::Article),
      "reply" => Ok(TargetType::Reply),
      _ => Err(format!("Unknown target type: {}", s)),
    }
  }
}

/// An engagement target: `(targetId, targetType)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
  pub id: i64,
  pub kind: TargetType,
}

impl Target {
  pub fn new(id: i64, kind: TargetType) -> Self {
    Self { id, kind }
  }

  pub fn article(id: i64) -> Self {
    Self::new(id, TargetType::Article)
  }

  pub fn reply(id: i64) -> Self {
    Self::new(id, TargetType::Reply)
  }
}

impl std::fmt::Display for Target {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}", self.kind, self.id)
  }
}

/// Article row as held by the primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
  pub id: i64,
  pub board_id: i64,
  pub user_id: i64,
  pub title: String,
  pub content: String,
  pub reply_count: i64,
  pub like_count: i64,
  pub visit_count: i64,
  /// 1 = banned
  pub state: i16,
  /// 1 = deleted
  pub delete_state: i16,
  pub created_at: DateTime<Utc>,
}

impl Article {
  pub fn is_banned(&self) -> bool {
    self.state != 0
  }

  pub fn is_deleted(&self) -> bool {
    self.delete_state != 0
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewArticle {
  pub board_id: i64,
  pub user_id: i64,
  pub title: String,
  pub content: String,
}

/// Reply row as held by the primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
  pub id: i64,
  pub article_id: i64,
  /// `None` for a top-level reply
  pub parent_id: Option<i64>,
  pub author_id: i64,
  pub reply_user_id: Option<i64>,
  pub content: String,
  pub like_count: i64,
  pub children_count: i64,
  pub state: i16,
  pub delete_state: i16,
  pub created_at: DateTime<Utc>,
}

impl Reply {
  pub fn is_top_level(&self) -> bool {
    self.parent_id.is_none()
  }

  /// Ranking score: creation time in epoch milliseconds.
  pub fn score(&self) -> f64 {
    self.created_at.timestamp_millis() as f64
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReply {
  pub article_id: i64,
  pub parent_id: Option<i64>,
  pub author_id: i64,
  pub reply_user_id: Option<i64>,
  pub content: String,
}

impl NewReply {
  /// A parent id of zero is the wire encoding of "top-level".
  pub fn normalized(mut self) -> Self {
    if matches!(self.parent_id, Some(id) if id <= 0) {
      self.parent_id = None;
    }
    self
  }
}

const F_ID: &str = "id";
const F_ARTICLE_ID: &str = "articleId";
const F_PARENT_ID: &str = "replyId";
const F_AUTHOR_ID: &str = "postUserId";
const F_REPLY_USER_ID: &str = "replyUserId";
const F_CONTENT: &str = "content";
/// Hash field holding a reply's like count.
pub const F_LIKE_COUNT: &str = "likeCount";
const F_CREATE_TIME: &str = "createTime";

/// Hash field holding a reply's direct child count.
pub const F_CHILDREN_COUNT: &str = "childrenCount";

/// Cached projection of a reply, stored as a hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMeta {
  pub id: i64,
  pub article_id: i64,
  pub parent_id: Option<i64>,
  pub author_id: i64,
  pub reply_user_id: Option<i64>,
  pub content: String,
  pub like_count: i64,
  pub children_count: i64,
  pub created_at_ms: i64,
}

impl ReplyMeta {
  pub fn to_fields(&self) -> Vec<(String, String)> {
    vec![
      (F_ID.into(), self.id.to_string()),
      (F_ARTICLE_ID.into(), self.article_id.to_string()),
      (F_PARENT_ID.into(), self.parent_id.unwrap_or(0).to_string()),
      (F_AUTHOR_ID.into(), self.author_id.to_string()),
      (
        F_REPLY_USER_ID.into(),
        self.reply_user_id.unwrap_or(0).to_string(),
      ),
      (F_CONTENT.into(), self.content.clone()),
      (F_LIKE_COUNT.into(), self.like_count.to_string()),
      (F_CHILDREN_COUNT.into(), self.children_count.to_string()),
      (F_CREATE_TIME.into(), self.created_at_ms.to_string()),
    ]
  }

  /// Returns `None` when a required field is missing or malformed, which
  /// callers treat as a cache miss.
  pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
    let int = |name: &str| fields.get(name).and_then(|v| v.parse::<i64>().ok());
    let nonzero = |name: &str| int(name).filter(|v| *v > 0);
    Some(Self {
      id: int(F_ID)?,
      article_id: int(F_ARTICLE_ID)?,
      parent_id: nonzero(F_PARENT_ID),
      author_id: int(F_AUTHOR_ID)?,
      reply_user_id: nonzero(F_REPLY_USER_ID),
      content: fields.get(F_CONTENT)?.clone(),
      like_count: int(F_LIKE_COUNT).unwrap_or(0),
      children_count: int(F_CHILDREN_COUNT).unwrap_or(0),
      created_at_ms: int(F_CREATE_TIME)?,
    })
  }

  pub fn created_at(&self) -> DateTime<Utc> {
    Utc
      .timestamp_millis_opt(self.created_at_ms)
      .single()
      .unwrap_or_default()
  }
}

impl From<&Reply> for ReplyMeta {
  fn from(reply: &Reply) -> Self {
    Self {
      id: reply.id,
      article_id: reply.article_id,
      parent_id: reply.parent_id,
      author_id: reply.author_id,
      reply_user_id: reply.reply_user_id,
      content: reply.content.clone(),
      like_count: reply.like_count,
      children_count: reply.children_count,
      created_at_ms: reply.created_at.timestamp_millis(),
    }
  }
}

/// A reply positioned in a depth-first expansion of the reply tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyNode {
  pub reply: ReplyMeta,
  /// 0 for top-level replies
  pub depth: u32,
}

/// One page of top-level replies with their descendants expanded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPage {
  pub article_id: i64,
  pub page: u32,
  pub size: u32,
  /// Number of top-level replies in the ranking
  pub total: u64,
  pub replies: Vec<ReplyNode>,
}

impl ReplyPage {
  pub fn empty(article_id: i64, page: u32, size: u32, total: u64) -> Self {
    Self {
      article_id,
      page,
      size,
      total,
      replies: Vec::new(),
    }
  }

  /// Only the top-level entries of this page, in ranking order.
  pub fn top_level(&self) -> impl Iterator<Item = &ReplyMeta> {
    self
      .replies
      .iter()
      .filter(|n| n.depth == 0)
      .map(|n| &n.reply)
  }
}

const A_ID: &str = "id";
const A_BOARD_ID: &str = "boardId";
const A_USER_ID: &str = "userId";
const A_TITLE: &str = "title";
const A_CREATE_TIME: &str = "createTime";

/// Hash field holding an article's reply count.
pub const A_REPLY_COUNT: &str = "replyCount";
/// Hash field holding an article's like count.
pub const A_LIKE_COUNT: &str = "likeCount";
/// Hash field holding an article's view count.
pub const A_VISIT_COUNT: &str = "visitCount";

/// Cached projection of an article's metadata and counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleMeta {
  pub id: i64,
  pub board_id: i64,
  pub user_id: i64,
  pub title: String,
  pub reply_count: i64,
  pub like_count: i64,
  pub visit_count: i64,
  pub created_at_ms: i64,
}

impl ArticleMeta {
  pub fn to_fields(&self) -> Vec<(String, String)> {
    vec![
      (A_ID.into(), self.id.to_string()),
      (A_BOARD_ID.into(), self.board_id.to_string()),
      (A_USER_ID.into(), self.user_id.to_string()),
      (A_TITLE.into(), self.title.clone()),
      (A_REPLY_COUNT.into(), self.reply_count.to_string()),
      (A_LIKE_COUNT.into(), self.like_count.to_string()),
      (A_VISIT_COUNT.into(), self.visit_count.to_string()),
      (A_CREATE_TIME.into(), self.created_at_ms.to_string()),
    ]
  }

  pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
    let int = |name: &str| fields.get(name).and_then(|v| v.parse::<i64>().ok());
    Some(Self {
      id: int(A_ID)?,
      board_id: int(A_BOARD_ID)?,
      user_id: int(A_USER_ID)?,
      title: fields.get(A_TITLE)?.clone(),
      reply_count: int(A_REPLY_COUNT).unwrap_or(0),
      like_count: int(A_LIKE_COUNT).unwrap_or(0),
      visit_count: int(A_VISIT_COUNT).unwrap_or(0),
      created_at_ms: int(A_CREATE_TIME)?,
    })
  }
}

impl From<&Article> for ArticleMeta {
  fn from(article: &Article) -> Self {
    Self {
      id: article.id,
      board_id: article.board_id,
      user_id: article.user_id,
      title: article.title.clone(),
      reply_count: article.reply_count,
      like_count: article.like_count,
      visit_count: article.visit_count,
      created_at_ms: article.created_at.timestamp_millis(),
    }
  }
}
