//! rollcall-store — SQLite-backed template store.
//!
//! One row per identity. Descriptors are stored as JSON arrays so the
//! database stays readable with stock tooling; `put` is an upsert, so the
//! last writer wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::store::{StoreError, StoreResult, TemplateStore};
use rollcall_core::{Descriptor, IdentityId, Template};
use rusqlite::OptionalExtension;
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS templates (
    identity_id          TEXT PRIMARY KEY,
    descriptor           TEXT NOT NULL,
    dimension            INTEGER NOT NULL,
    created_at           TEXT NOT NULL,
    source_capture_count INTEGER NOT NULL
);
";

/// Raw column values, decoded outside the connection thread.
struct TemplateRow {
    identity_id: String,
    descriptor: String,
    dimension: i64,
    created_at: String,
    source_capture_count: i64,
}

impl TemplateRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            identity_id: row.get(0)?,
            descriptor: row.get(1)?,
            dimension: row.get(2)?,
            created_at: row.get(3)?,
            source_capture_count: row.get(4)?,
        })
    }

    fn decode(self) -> StoreResult<Template> {
        let corrupt = |reason: String| StoreError::Corrupt {
            identity: self.identity_id.clone(),
            reason,
        };

        let values: Vec<f32> = serde_json::from_str(&self.descriptor)
            .map_err(|e| corrupt(format!("descriptor: {e}")))?;
        if values.len() as i64 != self.dimension {
            return Err(corrupt(format!(
                "descriptor has {} values, row says {}",
                values.len(),
                self.dimension
            )));
        }
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| corrupt(format!("created_at: {e}")))?
            .with_timezone(&Utc);
        let source_capture_count = usize::try_from(self.source_capture_count)
            .map_err(|_| corrupt(format!("capture count {}", self.source_capture_count)))?;

        Ok(Template {
            identity_id: IdentityId::new(self.identity_id),
            descriptor: Descriptor::new(values),
            created_at,
            source_capture_count,
        })
    }
}

fn backend(err: tokio_rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

pub struct SqliteTemplateStore {
    conn: Connection,
}

impl SqliteTemplateStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).await.map_err(backend)?;
        tracing::info!(path = %path.display(), "opened template database");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().await.map_err(backend)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> StoreResult<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(backend)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl TemplateStore for SqliteTemplateStore {
    async fn get(&self, id: &IdentityId) -> StoreResult<Option<Template>> {
        let key = id.as_str().to_string();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT identity_id, descriptor, dimension, created_at, source_capture_count
                         FROM templates WHERE identity_id = ?1",
                        [&key],
                        TemplateRow::from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(backend)?;
        row.map(TemplateRow::decode).transpose()
    }

    async fn put(&self, template: &Template) -> StoreResult<()> {
        if template.descriptor.values.iter().any(|v| !v.is_finite()) {
            return Err(StoreError::Rejected(format!(
                "template for {} contains non-finite values",
                template.identity_id
            )));
        }
        let descriptor = serde_json::to_string(&template.descriptor.values)
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        let identity_id = template.identity_id.as_str().to_string();
        let dimension = template.descriptor.len() as i64;
        let created_at = template.created_at.to_rfc3339();
        let count = template.source_capture_count as i64;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO templates (identity_id, descriptor, dimension, created_at, source_capture_count)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(identity_id) DO UPDATE SET
                         descriptor = excluded.descriptor,
                         dimension = excluded.dimension,
                         created_at = excluded.created_at,
                         source_capture_count = excluded.source_capture_count",
                    rusqlite::params![identity_id, descriptor, dimension, created_at, count],
                )?;
                Ok(())
            })
            .await
            .map_err(backend)?;

        tracing::debug!(identity = %template.identity_id, dimension, "template stored");
        Ok(())
    }

    async fn remove(&self, id: &IdentityId) -> StoreResult<bool> {
        let key = id.as_str().to_string();
        let deleted = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM templates WHERE identity_id = ?1", [&key])?))
            .await
            .map_err(backend)?;
        Ok(deleted > 0)
    }

    async fn list(&self) -> StoreResult<Vec<Template>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity_id, descriptor, dimension, created_at, source_capture_count
                     FROM templates ORDER BY identity_id",
                )?;
                let rows = stmt
                    .query_map([], TemplateRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(backend)?;
        rows.into_iter().map(TemplateRow::decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(id: &str, values: Vec<f32>) -> Template {
        Template {
            identity_id: IdentityId::from(id),
            descriptor: Descriptor::new(values),
            created_at: Utc::now(),
            source_capture_count: 5,
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = SqliteTemplateStore::open_in_memory().await.unwrap();
        let t = template("s1", vec![0.125, -0.5, 0.333]);
        store.put(&t).await.unwrap();

        let got = store.get(&IdentityId::from("s1")).await.unwrap().unwrap();
        assert_eq!(got.descriptor, t.descriptor);
        assert_eq!(got.source_capture_count, 5);
        assert_eq!(got.created_at.timestamp_millis(), t.created_at.timestamp_millis());
        assert!(store.get(&IdentityId::from("nobody")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = SqliteTemplateStore::open_in_memory().await.unwrap();
        store.put(&template("s1", vec![0.1, 0.2])).await.unwrap();
        store.put(&template("s1", vec![0.9, 0.8, 0.7])).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].descriptor.values, vec![0.9, 0.8, 0.7]);
    }

    #[tokio::test]
    async fn test_list_ordered_and_remove() {
        let store = SqliteTemplateStore::open_in_memory().await.unwrap();
        for id in ["c", "a", "b"] {
            store.put(&template(id, vec![0.0])).await.unwrap();
        }
        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.identity_id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        assert!(store.remove(&IdentityId::from("b")).await.unwrap());
        assert!(!store.remove(&IdentityId::from("b")).await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_finite_rejected() {
        let store = SqliteTemplateStore::open_in_memory().await.unwrap();
        let err = store.put(&template("s1", vec![f32::NAN])).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_corrupt_row_reported() {
        let store = SqliteTemplateStore::open_in_memory().await.unwrap();
        store
            .conn
            .call(|conn| {
                conn.execute(
                    "INSERT INTO templates VALUES ('bad', '[1.0, 2.0]', 3, '2024-01-01T00:00:00Z', 3)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store.get(&IdentityId::from("bad")).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.db");

        {
            let store = SqliteTemplateStore::open(&path).await.unwrap();
            store.put(&template("s1", vec![0.5, 0.25])).await.unwrap();
        }

        let store = SqliteTemplateStore::open(&path).await.unwrap();
        let got = store.get(&IdentityId::from("s1")).await.unwrap().unwrap();
        assert_eq!(got.descriptor.values, vec![0.5, 0.25]);
    }
}
