use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;

use super::{next_enqueue_time, Backend, Message};
use crate::fs::{Error, Result};

static SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_name TEXT NOT NULL,
    message_id TEXT NOT NULL,
    data BLOB NOT NULL,
    ts INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_messages_queue ON queue_messages (queue_name, id);

CREATE TABLE IF NOT EXISTS queue_metadata (
    queue_name TEXT PRIMARY KEY,
    last_updated INTEGER NOT NULL DEFAULT 0
);
"#;

fn sql_err<O, P>(operation: O, queue: P, err: sqlx::Error) -> Error
where
    O: Into<String>,
    P: Into<String>,
{
    Error::io(operation, queue, format!("query failed: {}", err))
}

/// SQLite-backed queue store. Each queue maps to rows in `queue_messages`;
/// queue existence and the enqueue cursor live in `queue_metadata`.
pub struct SqlBackend {
    pool: SqlitePool,
}

impl SqlBackend {
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| sql_err("connect", path, e))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| sql_err("connect", path, e))?;

        Ok(Self { pool })
    }

    async fn cursor(&self, queue: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_updated FROM queue_metadata WHERE queue_name = ?")
                .bind(queue)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| sql_err("stat", queue, e))?;

        Ok(row.map(|r| r.0))
    }

    async fn require(&self, operation: &str, queue: &str) -> Result<()> {
        match self.cursor(queue).await? {
            Some(_) => Ok(()),
            None => Err(Error::not_found(operation, queue)),
        }
    }
}

#[async_trait::async_trait]
impl Backend for SqlBackend {
    async fn enqueue(&self, queue: &str, data: Vec<u8>) -> Result<Message> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| sql_err("enqueue", queue, e))?;

        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_updated FROM queue_metadata WHERE queue_name = ?")
                .bind(queue)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| sql_err("enqueue", queue, e))?;

        let ts = next_enqueue_time(row.map(|r| r.0).unwrap_or(0));
        let message = Message {
            id: ts.to_string(),
            data,
            timestamp: ts,
        };

        sqlx::query(
            "INSERT INTO queue_messages (queue_name, message_id, data, ts) VALUES (?, ?, ?, ?)",
        )
        .bind(queue)
        .bind(&message.id)
        .bind(&message.data)
        .bind(message.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(|e| sql_err("enqueue", queue, e))?;

        sqlx::query(
            r#"INSERT INTO queue_metadata (queue_name, last_updated) VALUES (?, ?)
               ON CONFLICT(queue_name) DO UPDATE SET last_updated = excluded.last_updated"#,
        )
        .bind(queue)
        .bind(ts)
        .execute(&mut *tx)
        .await
        .map_err(|e| sql_err("enqueue", queue, e))?;

        tx.commit().await.map_err(|e| sql_err("enqueue", queue, e))?;

        Ok(message)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Message>> {
        self.require("dequeue", queue).await?;

        // select and delete inside one transaction so a message is handed to
        // at most one consumer
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| sql_err("dequeue", queue, e))?;

        let row: Option<(i64, String, Vec<u8>, i64)> = sqlx::query_as(
            "SELECT id, message_id, data, ts FROM queue_messages WHERE queue_name = ? ORDER BY id LIMIT 1",
        )
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| sql_err("dequeue", queue, e))?;

        let (row_id, message_id, data, ts) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        sqlx::query("DELETE FROM queue_messages WHERE id = ?")
            .bind(row_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| sql_err("dequeue", queue, e))?;

        tx.commit().await.map_err(|e| sql_err("dequeue", queue, e))?;

        Ok(Some(Message {
            id: message_id,
            data,
            timestamp: ts,
        }))
    }

    async fn peek(&self, queue: &str) -> Result<Option<Message>> {
        self.require("peek", queue).await?;

        let row: Option<(String, Vec<u8>, i64)> = sqlx::query_as(
            "SELECT message_id, data, ts FROM queue_messages WHERE queue_name = ? ORDER BY id LIMIT 1",
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| sql_err("peek", queue, e))?;

        Ok(row.map(|(id, data, ts)| Message {
            id,
            data,
            timestamp: ts,
        }))
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        self.require("size", queue).await?;

        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?")
                .bind(queue)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| sql_err("size", queue, e))?;

        Ok(row.0 as u64)
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        self.require("clear", queue).await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| sql_err("clear", queue, e))?;

        sqlx::query("DELETE FROM queue_messages WHERE queue_name = ?")
            .bind(queue)
            .execute(&mut *tx)
            .await
            .map_err(|e| sql_err("clear", queue, e))?;

        sqlx::query("UPDATE queue_metadata SET last_updated = 0 WHERE queue_name = ?")
            .bind(queue)
            .execute(&mut *tx)
            .await
            .map_err(|e| sql_err("clear", queue, e))?;

        tx.commit().await.map_err(|e| sql_err("clear", queue, e))
    }

    async fn list_queues(&self, prefix: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = if prefix.is_empty() {
            sqlx::query_as("SELECT queue_name FROM queue_metadata")
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query_as(
                "SELECT queue_name FROM queue_metadata WHERE queue_name = ? OR queue_name LIKE ?",
            )
            .bind(prefix)
            .bind(format!("{}/%", prefix))
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| sql_err("readdir", prefix, e))?;

        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn last_enqueue_time(&self, queue: &str) -> Result<Option<i64>> {
        match self.cursor(queue).await? {
            None => Err(Error::not_found("stat", queue)),
            Some(0) => Ok(None),
            Some(ts) => Ok(Some(ts)),
        }
    }

    async fn remove_queue(&self, queue: &str) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| sql_err("remove", queue, e))?;

        sqlx::query("DELETE FROM queue_messages WHERE queue_name = ?")
            .bind(queue)
            .execute(&mut *tx)
            .await
            .map_err(|e| sql_err("remove", queue, e))?;

        let result = sqlx::query("DELETE FROM queue_metadata WHERE queue_name = ?")
            .bind(queue)
            .execute(&mut *tx)
            .await
            .map_err(|e| sql_err("remove", queue, e))?;

        tx.commit().await.map_err(|e| sql_err("remove", queue, e))?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("remove", queue));
        }

        Ok(())
    }

    async fn create_queue(&self, queue: &str) -> Result<()> {
        if self.cursor(queue).await?.is_some() {
            return Err(Error::already_exists("mkdir", queue));
        }

        sqlx::query("INSERT OR IGNORE INTO queue_metadata (queue_name, last_updated) VALUES (?, 0)")
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|e| sql_err("mkdir", queue, e))?;

        Ok(())
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool> {
        Ok(self.cursor(queue).await?.is_some())
    }
}
