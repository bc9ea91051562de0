use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error};

use crate::media::{MediaId, MediaMeta, MediaRecord, MediaRepository};
use crate::{BoxFuture, Error, Result};

const COLUMNS: &str = "id, message_id, location, file_size, file_name, mime_type, duration, \
                       thumbnail_key, sprite_key, vtt_key, created_at, updated_at";

pub async fn open_media_db(path: &Path) -> Result<SqlitePool> {
    debug!(
        event = "sqlite.open",
        db_path = %path.display(),
        create_if_missing = true,
        "sqlite.open"
    );
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(|e| {
            error!(
                event = "io.sqlite.connect_failed",
                db_path = %path.display(),
                error = %e,
                "io.sqlite.connect_failed"
            );
            e
        })?;

    sqlx::migrate!().run(&pool).await.map_err(|e| {
        error!(
            event = "io.sqlite.migrate_failed",
            db_path = %path.display(),
            error = %e,
            "io.sqlite.migrate_failed"
        );
        e
    })?;
    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct SqliteMediaRepository {
    pool: SqlitePool,
}

impl SqliteMediaRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_media_db(path).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn record_from_row(row: &SqliteRow) -> Result<MediaRecord> {
    let id: String = row.try_get("id")?;
    let id: MediaId = id.parse().map_err(|_| Error::Encode {
        message: format!("media row has malformed id {id:?}"),
    })?;
    Ok(MediaRecord {
        id,
        message_id: row.try_get("message_id")?,
        meta: MediaMeta {
            file_size: row.try_get("file_size")?,
            file_name: row.try_get("file_name")?,
            mime_type: row.try_get("mime_type")?,
            duration: row.try_get("duration")?,
            location: row.try_get("location")?,
        },
        thumbnail_key: row.try_get("thumbnail_key")?,
        sprite_key: row.try_get("sprite_key")?,
        vtt_key: row.try_get("vtt_key")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

impl MediaRepository for SqliteMediaRepository {
    fn get<'a>(&'a self, id: &'a MediaId) -> BoxFuture<'a, Option<MediaRecord>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {COLUMNS} FROM media WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(record_from_row).transpose()
        })
    }

    fn find_by_message<'a>(
        &'a self,
        location: i64,
        message_id: i32,
    ) -> BoxFuture<'a, Option<MediaRecord>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM media WHERE location = ? AND message_id = ?"
            ))
            .bind(location)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(record_from_row).transpose()
        })
    }

    fn list_page<'a>(&'a self, page: u32, per_page: u32) -> BoxFuture<'a, Vec<MediaRecord>> {
        Box::pin(async move {
            let offset = i64::from(page.saturating_sub(1)) * i64::from(per_page);
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM media ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
            ))
            .bind(i64::from(per_page))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(record_from_row).collect()
        })
    }

    fn list_all<'a>(&'a self) -> BoxFuture<'a, Vec<MediaRecord>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM media ORDER BY created_at DESC, id DESC"
            ))
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(record_from_row).collect()
        })
    }

    fn count<'a>(&'a self) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media")
                .fetch_one(&self.pool)
                .await?;
            Ok(count.max(0) as u64)
        })
    }

    fn insert<'a>(&'a self, record: &'a MediaRecord) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(&format!(
                "INSERT INTO media ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(record.id.to_string())
            .bind(record.message_id)
            .bind(record.meta.location)
            .bind(record.meta.file_size)
            .bind(&record.meta.file_name)
            .bind(&record.meta.mime_type)
            .bind(record.meta.duration)
            .bind(&record.thumbnail_key)
            .bind(&record.sprite_key)
            .bind(&record.vtt_key)
            .bind(record.created_at.timestamp_millis())
            .bind(record.updated_at.timestamp_millis())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, id: &'a MediaId) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM media WHERE id = ?")
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::sample_record;

    #[tokio::test]
    async fn records_survive_a_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("media.sqlite3");
        let mut record = sample_record(7, "movie.mkv", "video/x-matroska", 123_456_789_012);
        record.meta.duration = Some(93.5);
        record.thumbnail_key = Some("thumbs/7.jpg".to_string());

        {
            let repo = SqliteMediaRepository::open(&path).await.unwrap();
            repo.insert(&record).await.unwrap();
            repo.pool().close().await;
        }

        let repo = SqliteMediaRepository::open(&path).await.unwrap();
        assert_eq!(repo.get(&record.id).await.unwrap(), Some(record.clone()));
        assert_eq!(repo.find_by_message(100, 7).await.unwrap(), Some(record));
        assert_eq!(repo.find_by_message(101, 7).await.unwrap(), None);
    }

    #[tokio::test]
    async fn pages_are_newest_first_and_one_based() {
        let temp = tempfile::tempdir().unwrap();
        let repo = SqliteMediaRepository::open(&temp.path().join("m.sqlite3"))
            .await
            .unwrap();
        for message_id in 1..=14 {
            repo.insert(&sample_record(message_id, "", "video/mp4", 10))
                .await
                .unwrap();
        }

        let first = repo.list_page(1, 12).await.unwrap();
        let second = repo.list_page(2, 12).await.unwrap();
        assert_eq!(first.len(), 12);
        assert_eq!(first[0].message_id, 14);
        assert_eq!(second.iter().map(|r| r.message_id).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(repo.list_page(0, 12).await.unwrap(), first);
        assert_eq!(repo.count().await.unwrap(), 14);
        assert_eq!(repo.list_all().await.unwrap().len(), 14);
    }

    #[tokio::test]
    async fn duplicate_message_is_rejected_and_delete_reports_presence() {
        let temp = tempfile::tempdir().unwrap();
        let repo = SqliteMediaRepository::open(&temp.path().join("m.sqlite3"))
            .await
            .unwrap();
        let record = sample_record(3, "a.mp4", "video/mp4", 10);
        repo.insert(&record).await.unwrap();

        let dup = sample_record(3, "b.mp4", "video/mp4", 10);
        assert!(matches!(repo.insert(&dup).await, Err(Error::Sqlite(_))));

        assert!(repo.delete(&record.id).await.unwrap());
        assert!(!repo.delete(&record.id).await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 0);
    }
}
