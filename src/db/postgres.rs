use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::{NoTls, Row};

use super::backend::{like_table, now_millis, ForumStore, SqlDialect};
use crate::types::{Article, NewArticle, NewReply, Reply, Target};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS articles (
    id BIGSERIAL PRIMARY KEY,
    board_id BIGINT NOT NULL,
    user_id BIGINT NOT NULL,
    title VARCHAR(255) NOT NULL,
    content TEXT NOT NULL,
    reply_count BIGINT NOT NULL DEFAULT 0,
    like_count BIGINT NOT NULL DEFAULT 0,
    visit_count BIGINT NOT NULL DEFAULT 0,
    state SMALLINT NOT NULL DEFAULT 0,
    delete_state SMALLINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_articles_board ON articles(board_id, created_at);

CREATE TABLE IF NOT EXISTS replies (
    id BIGSERIAL PRIMARY KEY,
    article_id BIGINT NOT NULL REFERENCES articles(id),
    parent_id BIGINT REFERENCES replies(id),
    author_id BIGINT NOT NULL,
    reply_user_id BIGINT,
    content VARCHAR(500) NOT NULL,
    like_count BIGINT NOT NULL DEFAULT 0,
    children_count BIGINT NOT NULL DEFAULT 0,
    state SMALLINT NOT NULL DEFAULT 0,
    delete_state SMALLINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_replies_article ON replies(article_id, parent_id, created_at);
CREATE INDEX IF NOT EXISTS idx_replies_parent ON replies(parent_id, created_at);

CREATE TABLE IF NOT EXISTS likes (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL,
    target_id BIGINT NOT NULL,
    target_type VARCHAR(16) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (user_id, target_id, target_type)
);
CREATE INDEX IF NOT EXISTS idx_likes_target ON likes(target_id, target_type);
"#;

const ARTICLE_COLUMNS: &str = "id, board_id, user_id, title, content, reply_count, like_count, \
   visit_count, state, delete_state, created_at";

const REPLY_COLUMNS: &str = "id, article_id, parent_id, author_id, reply_user_id, content, \
   like_count, children_count, state, delete_state, created_at";

const VISIBLE: &str = "delete_state = 0 AND state = 0";

/// PostgreSQL primary store
pub struct PostgresStore {
  pool: Pool,
}

impl PostgresStore {
  pub fn new(url: &str, max_connections: usize) -> Result<Self, anyhow::Error> {
    let mut cfg = Config::new();
    cfg.url = Some(url.into());
    cfg.manager = Some(ManagerConfig {
      recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(max_connections.max(1)));
    let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
    Ok(Self { pool })
  }

  async fn adjust(&self, table: &str, column: &str, id: i64, delta: i64)
    -> Result<bool, anyhow::Error> {
    let sql = self.dialect().adjust_counter(table, column);
    let changed = self.pool.get().await?.execute(&sql, &[&delta, &id]).await?;
    Ok(changed > 0)
  }

  async fn list_replies(&self, filter: &str, id: i64) -> Result<Vec<Reply>, anyhow::Error> {
    let sql = format!(
      "SELECT {} FROM replies WHERE {} AND {} ORDER BY created_at DESC, id DESC",
      REPLY_COLUMNS, filter, VISIBLE
    );
    let rows = self.pool.get().await?.query(&sql, &[&id]).await?;
    Ok(rows.iter().map(row_to_reply).collect())
  }
}

#[async_trait]
impl ForumStore for PostgresStore {
  fn dialect(&self) -> SqlDialect {
    SqlDialect::Postgres
  }

  async fn init_schema(&self) -> Result<(), anyhow::Error> {
    self.pool.get().await?.batch_execute(SCHEMA).await?;
    tracing::info!("PostgreSQL schema initialized");
    Ok(())
  }

  async fn insert_article(&self, article: &NewArticle) -> Result<Article, anyhow::Error> {
    let now = now_millis();
    let sql = format!(
      "INSERT INTO articles (board_id, user_id, title, content, created_at) \
       VALUES ($1, $2, $3, $4, $5) RETURNING {}",
      ARTICLE_COLUMNS
    );
    let row = self
      .pool
      .get()
      .await?
      .query_one(
        &sql,
        &[
          &article.board_id,
          &article.user_id,
          &article.title,
          &article.content,
          &now,
        ],
      )
      .await?;
    Ok(row_to_article(&row))
  }

  async fn get_article(&self, article_id: i64) -> Result<Option<Article>, anyhow::Error> {
    let sql = format!("SELECT {} FROM articles WHERE id = $1", ARTICLE_COLUMNS);
    let row = self.pool.get().await?.query_opt(&sql, &[&article_id]).await?;
    Ok(row.as_ref().map(row_to_article))
  }

  async fn set_article_state(&self, article_id: i64, state: i16) -> Result<bool, anyhow::Error> {
    let changed = self
      .pool
      .get()
      .await?
      .execute(
        "UPDATE articles SET state = $1 WHERE id = $2",
        &[&state, &article_id],
      )
      .await?;
    Ok(changed > 0)
  }

  async fn insert_reply(&self, reply: &NewReply) -> Result<Reply, anyhow::Error> {
    let now = now_millis();
    let sql = format!(
      "INSERT INTO replies (article_id, parent_id, author_id, reply_user_id, content, created_at) \
       VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
      REPLY_COLUMNS
    );
    let row = self
      .pool
      .get()
      .await?
      .query_one(
        &sql,
        &[
          &reply.article_id,
          &reply.parent_id,
          &reply.author_id,
          &reply.reply_user_id,
          &reply.content,
          &now,
        ],
      )
      .await?;
    Ok(row_to_reply(&row))
  }

  async fn get_reply(&self, reply_id: i64) -> Result<Option<Reply>, anyhow::Error> {
    let sql = format!("SELECT {} FROM replies WHERE id = $1", REPLY_COLUMNS);
    let row = self.pool.get().await?.query_opt(&sql, &[&reply_id]).await?;
    Ok(row.as_ref().map(row_to_reply))
  }

  async fn get_replies_by_ids(&self, ids: &[i64]) -> Result<Vec<Reply>, anyhow::Error> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let sql = format!(
      "SELECT {} FROM replies WHERE id = ANY($1) AND {}",
      REPLY_COLUMNS, VISIBLE
    );
    let ids = ids.to_vec();
    let rows = self.pool.get().await?.query(&sql, &[&ids]).await?;
    Ok(rows.iter().map(row_to_reply).collect())
  }

  async fn list_top_level_replies(&self, article_id: i64) -> Result<Vec<Reply>, anyhow::Error> {
    self
      .list_replies("article_id = $1 AND parent_id IS NULL", article_id)
      .await
  }

  async fn list_child_replies(&self, parent_id: i64) -> Result<Vec<Reply>, anyhow::Error> {
    self.list_replies("parent_id = $1", parent_id).await
  }

  async fn soft_delete_reply(
    &self,
    reply_id: i64,
    author_id: i64,
    article_id: i64,
  ) -> Result<Option<Reply>, anyhow::Error> {
    let sql = format!(
      "UPDATE replies SET delete_state = 1 \
       WHERE id = $1 AND author_id = $2 AND article_id = $3 AND delete_state = 0 \
       RETURNING {}",
      REPLY_COLUMNS
    );
    let row = self
      .pool
      .get()
      .await?
      .query_opt(&sql, &[&reply_id, &author_id, &article_id])
      .await?;
    Ok(row.as_ref().map(row_to_reply))
  }

  async fn adjust_article_reply_count(
    &self,
    article_id: i64,
    delta: i64,
  ) -> Result<bool, anyhow::Error> {
    self.adjust("articles", "reply_count", article_id, delta).await
  }

  async fn adjust_article_view_count(
    &self,
    article_id: i64,
    delta: i64,
  ) -> Result<bool, anyhow::Error> {
    self.adjust("articles", "visit_count", article_id, delta).await
  }

  async fn adjust_reply_children_count(
    &self,
    reply_id: i64,
    delta: i64,
  ) -> Result<bool, anyhow::Error> {
    self.adjust("replies", "children_count", reply_id, delta).await
  }

  async fn adjust_like_count(&self, target: Target, delta: i64) -> Result<bool, anyhow::Error> {
    self
      .adjust(like_table(target.kind), "like_count", target.id, delta)
      .await
  }

  async fn find_like(&self, user_id: i64, target: Target) -> Result<bool, anyhow::Error> {
    let row = self
      .pool
      .get()
      .await?
      .query_opt(
        "SELECT 1 FROM likes WHERE user_id = $1 AND target_id = $2 AND target_type = $3",
        &[&user_id, &target.id, &target.kind.as_str()],
      )
      .await?;
    Ok(row.is_some())
  }

  async fn list_likers(&self, target: Target) -> Result<Vec<i64>, anyhow::Error> {
    let rows = self
      .pool
      .get()
      .await?
      .query(
        "SELECT user_id FROM likes WHERE target_id = $1 AND target_type = $2 ORDER BY id",
        &[&target.id, &target.kind.as_str()],
      )
      .await?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
  }

  async fn apply_like(
    &self,
    user_id: i64,
    target: Target,
    liked: bool,
  ) -> Result<bool, anyhow::Error> {
    let kind = target.kind.as_str();
    let counter_sql = self.dialect().adjust_counter(like_table(target.kind), "like_count");

    let mut client = self.pool.get().await?;
    let tx = client.transaction().await?;
    let rows = if liked {
      tx.execute(
        "INSERT INTO likes (user_id, target_id, target_type, created_at) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (user_id, target_id, target_type) DO NOTHING",
        &[&user_id, &target.id, &kind, &now_millis()],
      )
      .await?
    } else {
      tx.execute(
        "DELETE FROM likes WHERE user_id = $1 AND target_id = $2 AND target_type = $3",
        &[&user_id, &target.id, &kind],
      )
      .await?
    };
    if rows > 0 {
      let delta: i64 = if liked { 1 } else { -1 };
      tx.execute(&counter_sql, &[&delta, &target.id]).await?;
    }
    tx.commit().await?;
    Ok(rows > 0)
  }
}

fn row_to_article(r: &Row) -> Article {
  Article {
    id: r.get(0),
    board_id: r.get(1),
    user_id: r.get(2),
    title: r.get(3),
    content: r.get(4),
    reply_count: r.get(5),
    like_count: r.get(6),
    visit_count: r.get(7),
    state: r.get(8),
    delete_state: r.get(9),
    created_at: r.get(10),
  }
}

fn row_to_reply(r: &Row) -> Reply {
  Reply {
    id: r.get(0),
    article_id: r.get(1),
    parent_id: r.get(2),
    author_id: r.get(3),
    reply_user_id: r.get(4),
    content: r.get(5),
    like_count: r.get(6),
    children_count: r.get(7),
    state: r.get(8),
    delete_state: r.get(9),
    created_at: r.get(10),
  }
}
