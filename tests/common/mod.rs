#![allow(dead_code)]

use async_trait::async_trait;
use forumcache::cache::{CacheStore, EvictionPolicy, InMemoryCacheStore};
use forumcache::db::{ForumStore, SqlDialect, SqliteStore};
use forumcache::engine::{EngineConfig, ForumEngine};
use forumcache::mq::{Broker, MemoryBroker};
use forumcache::types::{Article, NewArticle, NewReply, Reply, Target};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Store wrapper that counts calls per operation and can fail `apply_like`.
pub struct CountingStore {
  inner: SqliteStore,
  calls: Mutex<HashMap<&'static str, usize>>,
  apply_like_failures: AtomicU32,
}

impl CountingStore {
  pub async fn new() -> Self {
    let inner = SqliteStore::in_memory().await.unwrap();
    inner.init_schema().await.unwrap();
    Self {
      inner,
      calls: Mutex::new(HashMap::new()),
      apply_like_failures: AtomicU32::new(0),
    }
  }

  pub fn calls(&self, op: &str) -> usize {
    self.calls.lock().get(op).copied().unwrap_or(0)
  }

  pub fn reset(&self) {
    self.calls.lock().clear();
  }

  /// Make the next `n` calls to `apply_like` fail.
  pub fn fail_apply_like(&self, n: u32) {
    self.apply_like_failures.store(n, Ordering::SeqCst);
  }

  fn record(&self, op: &'static str) {
    *self.calls.lock().entry(op).or_insert(0) += 1;
  }
}

#[async_trait]
impl ForumStore for CountingStore {
  fn dialect(&self) -> SqlDialect {
    self.inner.dialect()
  }

  async fn init_schema(&self) -> Result<(), anyhow::Error> {
    self.inner.init_schema().await
  }

  async fn insert_article(&self, article: &NewArticle) -> Result<Article, anyhow::Error> {
    self.record("insert_article");
    self.inner.insert_article(article).await
  }

  async fn get_article(&self, article_id: i64) -> Result<Option<Article>, anyhow::Error> {
    self.record("get_article");
    self.inner.get_article(article_id).await
  }

  async fn set_article_state(&self, article_id: i64, state: i16) -> Result<bool, anyhow::Error> {
    self.record("set_article_state");
    self.inner.set_article_state(article_id, state).await
  }

  async fn insert_reply(&self, reply: &NewReply) -> Result<Reply, anyhow::Error> {
    self.record("insert_reply");
    self.inner.insert_reply(reply).await
  }

  async fn get_reply(&self, reply_id: i64) -> Result<Option<Reply>, anyhow::Error> {
    self.record("get_reply");
    self.inner.get_reply(reply_id).await
  }

  async fn get_replies_by_ids(&self, ids: &[i64]) -> Result<Vec<Reply>, anyhow::Error> {
    self.record("get_replies_by_ids");
    self.inner.get_replies_by_ids(ids).await
  }

  async fn list_top_level_replies(&self, article_id: i64) -> Result<Vec<Reply>, anyhow::Error> {
    self.record("list_top_level_replies");
    self.inner.list_top_level_replies(article_id).await
  }

  async fn list_child_replies(&self, parent_id: i64) -> Result<Vec<Reply>, anyhow::Error> {
    self.record("list_child_replies");
    self.inner.list_child_replies(parent_id).await
  }

  async fn soft_delete_reply(
    &self,
    reply_id: i64,
    author_id: i64,
    article_id: i64,
  ) -> Result<Option<Reply>, anyhow::Error> {
    self.record("soft_delete_reply");
    self
      .inner
      .soft_delete_reply(reply_id, author_id, article_id)
      .await
  }

  async fn adjust_article_reply_count(
    &self,
    article_id: i64,
    delta: i64,
  ) -> Result<bool, anyhow::Error> {
    self.record("adjust_article_reply_count");
    self.inner.adjust_article_reply_count(article_id, delta).await
  }

  async fn adjust_article_view_count(
    &self,
    article_id: i64,
    delta: i64,
  ) -> Result<bool, anyhow::Error> {
    self.record("adjust_article_view_count");
    self.inner.adjust_article_view_count(article_id, delta).await
  }

  async fn adjust_reply_children_count(
    &self,
    reply_id: i64,
    delta: i64,
  ) -> Result<bool, anyhow::Error> {
    self.record("adjust_reply_children_count");
    self.inner.adjust_reply_children_count(reply_id, delta).await
  }

  async fn adjust_like_count(&self, target: Target, delta: i64) -> Result<bool, anyhow::Error> {
    self.record("adjust_like_count");
    self.inner.adjust_like_count(target, delta).await
  }

  async fn find_like(&self, user_id: i64, target: Target) -> Result<bool, anyhow::Error> {
    self.record("find_like");
    self.inner.find_like(user_id, target).await
  }

  async fn list_likers(&self, target: Target) -> Result<Vec<i64>, anyhow::Error> {
    self.record("list_likers");
    self.inner.list_likers(target).await
  }

  async fn apply_like(
    &self,
    user_id: i64,
    target: Target,
    liked: bool,
  ) -> Result<bool, anyhow::Error> {
    self.record("apply_like");
    let remaining = self.apply_like_failures.load(Ordering::SeqCst);
    if remaining > 0 {
      self.apply_like_failures.store(remaining - 1, Ordering::SeqCst);
      anyhow::bail!("injected apply_like failure");
    }
    self.inner.apply_like(user_id, target, liked).await
  }
}

pub struct Harness {
  pub store: Arc<CountingStore>,
  pub cache: Arc<InMemoryCacheStore>,
  pub broker: Arc<MemoryBroker>,
  pub engine: ForumEngine,
}

impl Harness {
  pub async fn new() -> Self {
    Self::with_config(EngineConfig::default()).await
  }

  pub async fn with_config(config: EngineConfig) -> Self {
    let store = Arc::new(CountingStore::new().await);
    let cache = Arc::new(InMemoryCacheStore::new(64 * 1024 * 1024, EvictionPolicy::Lru));
    let broker = Arc::new(MemoryBroker::new(1024, Duration::from_millis(20)));
    let engine = ForumEngine::new(
      store.clone() as Arc<dyn ForumStore>,
      cache.clone() as Arc<dyn CacheStore>,
      broker.clone() as Arc<dyn Broker>,
      config,
    );
    Self {
      store,
      cache,
      broker,
      engine,
    }
  }

  pub async fn article(&self) -> i64 {
    self
      .engine
      .create_article(NewArticle {
        board_id: 1,
        user_id: 1,
        title: "Welcome".into(),
        content: "First post".into(),
      })
      .await
      .unwrap()
      .id
  }

  /// Create a reply, pausing first so creation timestamps never tie.
  pub async fn reply(&self, article_id: i64, parent_id: Option<i64>, author_id: i64) -> i64 {
    tokio::time::sleep(Duration::from_millis(3)).await;
    self
      .engine
      .create_reply(NewReply {
        article_id,
        parent_id,
        author_id,
        reply_user_id: None,
        content: format!("reply by {}", author_id),
      })
      .await
      .unwrap()
      .id
  }
}
