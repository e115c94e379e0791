use crate::core::model::Task;
use anyhow::Context;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// On-disk copy of the last reconciled mirror, so a restarted client can
/// show stale data before its first poll lands.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Default)]
pub struct CachedMirror {
    pub tasks: Vec<Task>,
    pub log_cursor: Option<String>,
    /// Epoch seconds of the last snapshot write.
    pub saved_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum CacheUpdate {
    Tasks(Vec<Task>),
    LogCursor(String),
}

const LOG_CURSOR_KEY: &str = "log_cursor";
const SAVED_AT_KEY: &str = "tasks_saved_at";

impl SqliteStore {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }

        let abs = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            std::env::current_dir()
                .with_context(|| "current_dir")?
                .join(db_path)
        };

        let mut p = abs.to_string_lossy().to_string();
        if cfg!(windows) {
            p = p.replace('\\', "/");
        }

        // mode=rwc creates the file on first use
        let url = if p.starts_with('/') {
            format!("sqlite://{}?mode=rwc", p)
        } else {
            format!("sqlite:///{}?mode=rwc", p)
        };

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .with_context(|| format!("connect sqlite url={} (file={})", url, abs.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_cache (
              ord INTEGER PRIMARY KEY,
              body TEXT NOT NULL,
              updated_at INTEGER NOT NULL
            );
            "#,
        )
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_meta (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );
            "#,
        )
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn now_epoch() -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Replaces the cached snapshot in one transaction.
    pub async fn save_tasks(&self, tasks: &[Task]) -> anyhow::Result<()> {
        let now = Self::now_epoch();
        let mut tx = self.pool.begin().await.context("begin snapshot write")?;

        sqlx::query("DELETE FROM task_cache;")
            .execute(&mut *tx)
            .await?;

        for t in tasks {
            let body = serde_json::to_string(t).with_context(|| format!("encode task {}", t.order))?;
            sqlx::query("INSERT OR REPLACE INTO task_cache (ord, body, updated_at) VALUES (?, ?, ?);")
                .bind(t.order as i64)
                .bind(body)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?);")
            .bind(SAVED_AT_KEY)
            .bind(now.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await.context("commit snapshot write")?;
        debug!(tasks = tasks.len(), "snapshot cached");
        Ok(())
    }

    /// Rows that no longer decode are skipped; the next poll replaces them.
    pub async fn load_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query("SELECT ord, body FROM task_cache ORDER BY ord;")
            .fetch_all(&self.pool)
            .await
            .context("fetch cached tasks")?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let ord: i64 = r.try_get("ord")?;
            let body: String = r.try_get("body")?;
            match serde_json::from_str::<Task>(&body) {
                Ok(t) => out.push(t),
                Err(e) => warn!(order = ord, error = %e, "skipping undecodable cached task"),
            }
        }
        Ok(out)
    }

    pub async fn save_log_cursor(&self, timestamp: &str) -> anyhow::Result<()> {
        self.put_meta(LOG_CURSOR_KEY, timestamp).await
    }

    pub async fn load_log_cursor(&self) -> anyhow::Result<Option<String>> {
        self.get_meta(LOG_CURSOR_KEY).await
    }

    pub async fn load_mirror(&self) -> anyhow::Result<CachedMirror> {
        Ok(CachedMirror {
            tasks: self.load_tasks().await?,
            log_cursor: self.load_log_cursor().await?,
            saved_at: self.get_meta(SAVED_AT_KEY).await?.and_then(|v| v.parse().ok()),
        })
    }

    pub async fn apply(&self, update: &CacheUpdate) -> anyhow::Result<()> {
        match update {
            CacheUpdate::Tasks(tasks) => self.save_tasks(tasks).await,
            CacheUpdate::LogCursor(ts) => self.save_log_cursor(ts).await,
        }
    }

    async fn put_meta(&self, key: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?);")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .with_context(|| format!("write meta {}", key))?;
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM sync_meta WHERE key = ?;")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("read meta {}", key))?;
        match row {
            Some(r) => Ok(Some(r.try_get("value")?)),
            None => Ok(None),
        }
    }
}

/// Serializes cache writes on one background task so the polling loops
/// never wait on disk.
pub fn spawn_writer(store: SqliteStore) -> mpsc::UnboundedSender<CacheUpdate> {
    let (tx, mut rx) = mpsc::unbounded_channel::<CacheUpdate>();
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            if let Err(e) = store.apply(&update).await {
                warn!(error = %e, "mirror cache write failed");
            }
        }
        debug!("mirror cache writer closed");
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::TaskStatus;

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.sqlite");
        let store = SqliteStore::open(&path).await.unwrap();

        let mut running = Task::new(2, TaskStatus::Running);
        running.progress = Some(40);
        running.name = Some("show".into());
        store.save_tasks(&[Task::new(1, TaskStatus::Success), running]).await.unwrap();
        store.save_tasks(&[Task::new(2, TaskStatus::Error)]).await.unwrap();

        let reopened = SqliteStore::open(&path).await.unwrap();
        let cached = reopened.load_mirror().await.unwrap();
        assert_eq!(cached.tasks.len(), 1);
        assert_eq!(cached.tasks[0].order, 2);
        assert_eq!(cached.tasks[0].status, TaskStatus::Error);
        assert!(cached.saved_at.is_some());
        assert_eq!(cached.log_cursor, None);
    }

    #[tokio::test]
    async fn log_cursor_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("c.sqlite")).await.unwrap();
        store.save_log_cursor("2024-05-01 10:00:00").await.unwrap();
        store.apply(&CacheUpdate::LogCursor("2024-05-01 10:00:05".into())).await.unwrap();
        assert_eq!(store.load_log_cursor().await.unwrap().as_deref(), Some("2024-05-01 10:00:05"));
    }

    #[tokio::test]
    async fn writer_applies_updates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("w.sqlite")).await.unwrap();
        let tx = spawn_writer(store.clone());
        tx.send(CacheUpdate::Tasks(vec![Task::new(1, TaskStatus::Normal)])).unwrap();
        tx.send(CacheUpdate::Tasks(vec![Task::new(1, TaskStatus::Running), Task::new(2, TaskStatus::Normal)]))
            .unwrap();
        drop(tx);

        for _ in 0..50 {
            if store.load_tasks().await.unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let tasks = store.load_tasks().await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::Running);
    }
}
