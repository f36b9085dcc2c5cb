use async_trait::async_trait;
use rusqlite::{params, params_from_iter, OptionalExtension};
use tokio_rusqlite::Connection;

use super::backend::{from_millis, like_table, now_millis, ForumStore, SqlDialect};
use crate::types::{Article, NewArticle, NewReply, Reply, Target};

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;
"#;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS articles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    board_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    reply_count INTEGER NOT NULL DEFAULT 0,
    like_count INTEGER NOT NULL DEFAULT 0,
    visit_count INTEGER NOT NULL DEFAULT 0,
    state INTEGER NOT NULL DEFAULT 0,
    delete_state INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_articles_board ON articles(board_id, created_at);

CREATE TABLE IF NOT EXISTS replies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    article_id INTEGER NOT NULL REFERENCES articles(id),
    parent_id INTEGER REFERENCES replies(id),
    author_id INTEGER NOT NULL,
    reply_user_id INTEGER,
    content TEXT NOT NULL,
    like_count INTEGER NOT NULL DEFAULT 0,
    children_count INTEGER NOT NULL DEFAULT 0,
    state INTEGER NOT NULL DEFAULT 0,
    delete_state INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_replies_article ON replies(article_id, parent_id, created_at);
CREATE INDEX IF NOT EXISTS idx_replies_parent ON replies(parent_id, created_at);

CREATE TABLE IF NOT EXISTS likes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    target_type TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (user_id, target_id, target_type)
);
CREATE INDEX IF NOT EXISTS idx_likes_target ON likes(target_id, target_type);
"#;

const ARTICLE_COLUMNS: &str = "id, board_id, user_id, title, content, reply_count, like_count, \
   visit_count, state, delete_state, created_at";

const REPLY_COLUMNS: &str = "id, article_id, parent_id, author_id, reply_user_id, content, \
   like_count, children_count, state, delete_state, created_at";

const VISIBLE: &str = "delete_state = 0 AND state = 0";

/// SQLite primary store
pub struct SqliteStore {
  conn: Connection,
}

impl SqliteStore {
  pub async fn new(path: &str) -> Result<Self, anyhow::Error> {
    let conn = if path == ":memory:" {
      Connection::open_in_memory().await?
    } else {
      Connection::open(path).await?
    };

    conn
      .call(|conn| conn.execute_batch(PRAGMAS).map_err(|e| e.into()))
      .await?;

    Ok(Self { conn })
  }

  pub async fn in_memory() -> Result<Self, anyhow::Error> {
    Self::new(":memory:").await
  }

  async fn adjust(&self, table: &'static str, column: &'static str, id: i64, delta: i64)
    -> Result<bool, anyhow::Error> {
    let sql = self.dialect().adjust_counter(table, column);
    let changed = self
      .conn
      .call(move |conn| {
        conn
          .execute(&sql, params![delta, id])
          .map_err(|e| e.into())
      })
      .await?;
    Ok(changed > 0)
  }

  async fn list_replies(&self, filter: &'static str, id: i64) -> Result<Vec<Reply>, anyhow::Error> {
    let sql = format!(
      "SELECT {} FROM replies WHERE {} AND {} ORDER BY created_at DESC, id DESC",
      REPLY_COLUMNS, filter, VISIBLE
    );
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
          .query_map(params![id], row_to_reply)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }
}

#[async_trait]
impl ForumStore for SqliteStore {
  fn dialect(&self) -> SqlDialect {
    SqlDialect::Sqlite
  }

  async fn init_schema(&self) -> Result<(), anyhow::Error> {
    self
      .conn
      .call(|conn| conn.execute_batch(SCHEMA).map_err(|e| e.into()))
      .await?;
    tracing::info!("SQLite schema initialized");
    Ok(())
  }

  async fn insert_article(&self, article: &NewArticle) -> Result<Article, anyhow::Error> {
    let created_at = now_millis();
    let created_ms = created_at.timestamp_millis();
    let new = article.clone();

    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO articles (board_id, user_id, title, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
          params![new.board_id, new.user_id, new.title, new.content, created_ms],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(Article {
      id,
      board_id: article.board_id,
      user_id: article.user_id,
      title: article.title.clone(),
      content: article.content.clone(),
      reply_count: 0,
      like_count: 0,
      visit_count: 0,
      state: 0,
      delete_state: 0,
      created_at,
    })
  }

  async fn get_article(&self, article_id: i64) -> Result<Option<Article>, anyhow::Error> {
    let sql = format!("SELECT {} FROM articles WHERE id = ?1", ARTICLE_COLUMNS);
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&sql)?;
        Ok(stmt.query_row(params![article_id], row_to_article).optional()?)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn set_article_state(&self, article_id: i64, state: i16) -> Result<bool, anyhow::Error> {
    let changed = self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "UPDATE articles SET state = ?1 WHERE id = ?2",
            params![state, article_id],
          )
          .map_err(|e| e.into())
      })
      .await?;
    Ok(changed > 0)
  }

  async fn insert_reply(&self, reply: &NewReply) -> Result<Reply, anyhow::Error> {
    let created_at = now_millis();
    let created_ms = created_at.timestamp_millis();
    let new = reply.clone();

    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO replies (article_id, parent_id, author_id, reply_user_id, content, created_at) \
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          params![
            new.article_id,
            new.parent_id,
            new.author_id,
            new.reply_user_id,
            new.content,
            created_ms
          ],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(Reply {
      id,
      article_id: reply.article_id,
      parent_id: reply.parent_id,
      author_id: reply.author_id,
      reply_user_id: reply.reply_user_id,
      content: reply.content.clone(),
      like_count: 0,
      children_count: 0,
      state: 0,
      delete_state: 0,
      created_at,
    })
  }

  async fn get_reply(&self, reply_id: i64) -> Result<Option<Reply>, anyhow::Error> {
    let sql = format!("SELECT {} FROM replies WHERE id = ?1", REPLY_COLUMNS);
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&sql)?;
        Ok(stmt.query_row(params![reply_id], row_to_reply).optional()?)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn get_replies_by_ids(&self, ids: &[i64]) -> Result<Vec<Reply>, anyhow::Error> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let markers = (1..=ids.len())
      .map(|n| self.dialect().param(n))
      .collect::<Vec<_>>()
      .join(", ");
    let sql = format!(
      "SELECT {} FROM replies WHERE id IN ({}) AND {}",
      REPLY_COLUMNS, markers, VISIBLE
    );
    let ids = ids.to_vec();

    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(params_from_iter(ids.iter()), row_to_reply)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn list_top_level_replies(&self, article_id: i64) -> Result<Vec<Reply>, anyhow::Error> {
    self
      .list_replies("article_id = ?1 AND parent_id IS NULL", article_id)
      .await
  }

  async fn list_child_replies(&self, parent_id: i64) -> Result<Vec<Reply>, anyhow::Error> {
    self.list_replies("parent_id = ?1", parent_id).await
  }

  async fn soft_delete_reply(
    &self,
    reply_id: i64,
    author_id: i64,
    article_id: i64,
  ) -> Result<Option<Reply>, anyhow::Error> {
    let sql = format!(
      "UPDATE replies SET delete_state = 1 \
       WHERE id = ?1 AND author_id = ?2 AND article_id = ?3 AND delete_state = 0 \
       RETURNING {}",
      REPLY_COLUMNS
    );
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&sql)?;
        Ok(
          stmt
            .query_row(params![reply_id, author_id, article_id], row_to_reply)
            .optional()?,
        )
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
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
    let kind = target.kind.as_str();
    let found = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT 1 FROM likes WHERE user_id = ?1 AND target_id = ?2 AND target_type = ?3",
        )?;
        Ok(stmt.exists(params![user_id, target.id, kind])?)
      })
      .await?;
    Ok(found)
  }

  async fn list_likers(&self, target: Target) -> Result<Vec<i64>, anyhow::Error> {
    let kind = target.kind.as_str();
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT user_id FROM likes WHERE target_id = ?1 AND target_type = ?2 ORDER BY id",
        )?;
        let users = stmt
          .query_map(params![target.id, kind], |row| row.get(0))?
          .collect::<Result<Vec<i64>, _>>()?;
        Ok(users)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn apply_like(
    &self,
    user_id: i64,
    target: Target,
    liked: bool,
  ) -> Result<bool, anyhow::Error> {
    let kind = target.kind.as_str();
    let counter_sql = self.dialect().adjust_counter(like_table(target.kind), "like_count");
    let now_ms = now_millis().timestamp_millis();

    let changed = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let rows = if liked {
          tx.execute(
            "INSERT OR IGNORE INTO likes (user_id, target_id, target_type, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, target.id, kind, now_ms],
          )?
        } else {
          tx.execute(
            "DELETE FROM likes WHERE user_id = ?1 AND target_id = ?2 AND target_type = ?3",
            params![user_id, target.id, kind],
          )?
        };
        if rows > 0 {
          let delta: i64 = if liked { 1 } else { -1 };
          tx.execute(&counter_sql, params![delta, target.id])?;
        }
        tx.commit()?;
        Ok(rows > 0)
      })
      .await?;
    Ok(changed)
  }
}

#[inline]
fn row_to_article(row: &rusqlite::Row) -> Result<Article, rusqlite::Error> {
  Ok(Article {
    id: row.get(0)?,
    board_id: row.get(1)?,
    user_id: row.get(2)?,
    title: row.get(3)?,
    content: row.get(4)?,
    reply_count: row.get(5)?,
    like_count: row.get(6)?,
    visit_count: row.get(7)?,
    state: row.get(8)?,
    delete_state: row.get(9)?,
    created_at: from_millis(row.get(10)?),
  })
}

#[inline]
fn row_to_reply(row: &rusqlite::Row) -> Result<Reply, rusqlite::Error> {
  Ok(Reply {
    id: row.get(0)?,
    article_id: row.get(1)?,
    parent_id: row.get(2)?,
    author_id: row.get(3)?,
    reply_user_id: row.get(4)?,
    content: row.get(5)?,
    like_count: row.get(6)?,
    children_count: row.get(7)?,
    state: row.get(8)?,
    delete_state: row.get(9)?,
    created_at: from_millis(row.get(10)?),
  })
}
