//! Error taxonomy for the engagement core.

use thiserror::Error;

use crate::cache::CacheStoreError;

pub type Result<T> = std::result::Result<T, ForumError>;

/// Coarse classification used by the routing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// Malformed input, rejected before touching cache or store
  Validation,
  /// Expected, user-facing conflict
  BusinessConflict,
  /// The request could not be honored
  System,
}

#[derive(Error, Debug)]
pub enum ForumError {
  #[error("Invalid parameter: {0}")]
  Validation(String),

  #[error("Already liked {target}")]
  AlreadyLiked { target: String },

  #[error("Not currently liked {target}")]
  NotLiked { target: String },

  #[error("Article not found: {0}")]
  ArticleNotFound(i64),

  #[error("Article is banned or deleted: {0}")]
  ArticleBanned(i64),

  #[error("Reply not found: {0}")]
  ReplyNotFound(i64),

  #[error("Delete affected no rows for reply {reply_id}")]
  DeleteFailed { reply_id: i64 },

  #[error("Cache script failed: {0}")]
  CacheScript(String),

  #[error("Cache error: {0}")]
  Cache(#[source] CacheStoreError),

  #[error("Store error: {0}")]
  Store(#[source] anyhow::Error),

  #[error("Publish failed: {0}")]
  Publish(String),
}

impl ForumError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      ForumError::Validation(_) => ErrorKind::Validation,
      ForumError::AlreadyLiked { .. }
      | ForumError::NotLiked { .. }
      | ForumError::ArticleNotFound(_)
      | ForumError::ArticleBanned(_)
      | ForumError::ReplyNotFound(_)
      | ForumError::DeleteFailed { .. } => ErrorKind::BusinessConflict,
      ForumError::CacheScript(_)
      | ForumError::Cache(_)
      | ForumError::Store(_)
      | ForumError::Publish(_) => ErrorKind::System,
    }
  }

  /// Numeric result code returned to clients.
  pub fn code(&self) -> u32 {
    match self {
      ForumError::Validation(_) => 1002,
      ForumError::AlreadyLiked { .. } | ForumError::NotLiked { .. } => 1201,
      ForumError::ArticleNotFound(_) => 1301,
      ForumError::ArticleBanned(_) => 1302,
      ForumError::ReplyNotFound(_) => 1401,
      ForumError::DeleteFailed { .. } => 1402,
      ForumError::CacheScript(_)
      | ForumError::Cache(_)
      | ForumError::Store(_)
      | ForumError::Publish(_) => 2000,
    }
  }

  pub fn is_business_conflict(&self) -> bool {
    self.kind() == ErrorKind::BusinessConflict
  }
}

impl From<CacheStoreError> for ForumError {
  fn from(e: CacheStoreError) -> Self {
    match e {
      CacheStoreError::Script(msg) => ForumError::CacheScript(msg),
      other => ForumError::Cache(other),
    }
  }
}

impl From<anyhow::Error> for ForumError {
  fn from(e: anyhow::Error) -> Self {
    ForumError::Store(e)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_kinds() {
    assert_eq!(
      ForumError::Validation("x".into()).kind(),
      ErrorKind::Validation
    );
    assert!(ForumError::AlreadyLiked {
      target: "article:1".into()
    }
    .is_business_conflict());
    assert!(ForumError::DeleteFailed { reply_id: 1 }.is_business_conflict());
    assert_eq!(
      ForumError::CacheScript("bad reply".into()).kind(),
      ErrorKind::System
    );
    assert_eq!(
      ForumError::from(anyhow::anyhow!("db down")).kind(),
      ErrorKind::System
    );
  }

  #[test]
  fn test_script_failures_map_to_cache_script() {
    let err = ForumError::from(CacheStoreError::Script("NOSCRIPT".into()));
    assert!(matches!(err, ForumError::CacheScript(_)));
    let err = ForumError::from(CacheStoreError::OutOfMemory);
    assert!(matches!(err, ForumError::Cache(_)));
  }

  #[test]
  fn test_error_codes() {
    assert_eq!(ForumError::ArticleNotFound(1).code(), 1301);
    assert_eq!(ForumError::Publish("x".into()).code(), 2000);
  }
}
