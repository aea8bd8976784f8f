use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Row, Sqlite,
    sqlite::{SqliteArguments, SqlitePool, SqlitePoolOptions, SqliteRow},
};
use tokio::sync::broadcast;

use crate::{
    adapters::{
        Adapter, ChangeFeed, DocKey, EdgeRecord, ObjectRecord, Record, Snapshot, Write,
        expected_versions,
    },
    error::Error,
    query::{IndexMeta, IndexValue, Query},
};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// SQLite adapter using a unified JSON storage model
///
/// Schema:
/// ```sql
/// CREATE TABLE objects (
///     type TEXT NOT NULL,
///     id TEXT NOT NULL,
///     version INTEGER NOT NULL,
///     data TEXT NOT NULL,
///     index_meta TEXT NOT NULL,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     PRIMARY KEY (type, id)
/// );
///
/// CREATE TABLE edges (
///     type TEXT NOT NULL,
///     "from" TEXT NOT NULL,
///     "to" TEXT NOT NULL,
///     version INTEGER NOT NULL,
///     data TEXT NOT NULL,
///     created_at TEXT NOT NULL,
///     PRIMARY KEY (type, "from", "to")
/// );
/// ```
pub struct SqliteAdapter {
    pub(crate) pool: SqlitePool,
    feed: ChangeFeed,
}

impl SqliteAdapter {
    /// Create a new SQLite adapter with a file-based database
    pub async fn new_file(path: &str) -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{}?mode=rwc", path))
            .await?;

        Ok(Self::from_pool(pool))
    }

    /// Create a new SQLite adapter with an in-memory database
    pub async fn new_memory() -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Ok(Self::from_pool(pool))
    }

    /// Create from an existing pool
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            feed: ChangeFeed::new(),
        }
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS objects (
                type TEXT NOT NULL,
                id TEXT NOT NULL,
                version INTEGER NOT NULL,
                data TEXT NOT NULL,
                index_meta TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (type, id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_objects_type_created ON objects(type, created_at DESC)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS edges (
                type TEXT NOT NULL,
                "from" TEXT NOT NULL,
                "to" TEXT NOT NULL,
                version INTEGER NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (type, "from", "to")
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_edges_to ON edges("to", type)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        // store-wide version source; re-created documents never reuse a version
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS version_stamp (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO version_stamp (id, value) VALUES (1, 0)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    fn map_object_row(row: SqliteRow) -> Result<ObjectRecord, Error> {
        let data: String = row.try_get("data")?;
        let index_meta: String = row.try_get("index_meta")?;
        Ok(ObjectRecord {
            id: row.try_get("id")?,
            type_name: row.try_get("type")?,
            version: row.try_get("version")?,
            data: serde_json::from_str(&data).map_err(|e| Error::Deserialize(e.to_string()))?,
            index_meta: serde_json::from_str::<IndexMeta>(&index_meta)
                .map_err(|e| Error::Deserialize(e.to_string()))?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    fn map_edge_row(row: SqliteRow) -> Result<EdgeRecord, Error> {
        let data: String = row.try_get("data")?;
        Ok(EdgeRecord {
            type_name: row.try_get("type")?,
            from: row.try_get("from")?,
            to: row.try_get("to")?,
            version: row.try_get("version")?,
            data: serde_json::from_str(&data).map_err(|e| Error::Deserialize(e.to_string()))?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        })
    }

    async fn read_one<'e, E>(executor: E, key: &DocKey) -> Result<Option<Record>, Error>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        match key {
            DocKey::Object { type_name, id } => {
                let row = sqlx::query(
                    r#"
                    SELECT type, id, version, data, index_meta, created_at, updated_at
                    FROM objects WHERE type = ? AND id = ?
                    "#,
                )
                .bind(type_name)
                .bind(id)
                .fetch_optional(executor)
                .await?;
                row.map(Self::map_object_row)
                    .transpose()
                    .map(|r| r.map(Record::Object))
            }
            DocKey::Edge {
                type_name,
                from,
                to,
            } => {
                let row = sqlx::query(
                    r#"
                    SELECT type, "from", "to", version, data, created_at
                    FROM edges WHERE type = ? AND "from" = ? AND "to" = ?
                    "#,
                )
                .bind(type_name)
                .bind(from)
                .bind(to)
                .fetch_optional(executor)
                .await?;
                row.map(Self::map_edge_row)
                    .transpose()
                    .map(|r| r.map(Record::Edge))
            }
        }
    }

    fn bind_index_value<'q>(query: SqliteQuery<'q>, value: &IndexValue) -> SqliteQuery<'q> {
        match value {
            IndexValue::String(s) => query.bind(s.clone()),
            IndexValue::Int(i) => query.bind(*i),
            IndexValue::Bool(b) => query.bind(*b),
        }
    }
}

#[async_trait]
impl Adapter for SqliteAdapter {
    async fn read(&self, keys: &[DocKey]) -> Result<Snapshot, Error> {
        let mut snapshot = Snapshot::new();
        for key in keys {
            let record = Self::read_one(&self.pool, key).await?;
            snapshot.insert(key.clone(), record);
        }
        Ok(snapshot)
    }

    async fn commit(&self, expected: &[(DocKey, i64)], writes: Vec<Write>) -> Result<(), Error> {
        let versions = expected_versions(expected, &writes)?;
        let mut tx = self.pool.begin().await?;

        for (key, version) in expected {
            let current = Self::read_one(&mut *tx, key)
                .await?
                .map(|r| r.version())
                .unwrap_or(0);
            if current != *version {
                return Err(Error::Conflict);
            }
        }

        let stamp: i64 =
            sqlx::query_scalar("UPDATE version_stamp SET value = value + 1 WHERE id = 1 RETURNING value")
                .fetch_one(&mut *tx)
                .await?;

        let mut changed = Vec::with_capacity(writes.len());
        for write in writes {
            let key = write.key();
            let expected = versions.get(&key).copied().unwrap_or(0);
            let affected = match write {
                Write::Put(Record::Object(r)) if expected == 0 => sqlx::query(
                    r#"
                    INSERT INTO objects (type, id, version, data, index_meta, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&r.type_name)
                .bind(&r.id)
                .bind(stamp)
                .bind(r.data.to_string())
                .bind(serde_json::to_string(&r.index_meta).map_err(|e| Error::Serialize(e.to_string()))?)
                .bind(r.created_at)
                .bind(r.updated_at)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                Write::Put(Record::Object(r)) => sqlx::query(
                    r#"
                    UPDATE objects
                    SET version = ?, data = ?, index_meta = ?, updated_at = ?
                    WHERE type = ? AND id = ? AND version = ?
                    "#,
                )
                .bind(stamp)
                .bind(r.data.to_string())
                .bind(serde_json::to_string(&r.index_meta).map_err(|e| Error::Serialize(e.to_string()))?)
                .bind(r.updated_at)
                .bind(&r.type_name)
                .bind(&r.id)
                .bind(expected)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                Write::Put(Record::Edge(r)) if expected == 0 => sqlx::query(
                    r#"
                    INSERT INTO edges (type, "from", "to", version, data, created_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&r.type_name)
                .bind(&r.from)
                .bind(&r.to)
                .bind(stamp)
                .bind(r.data.to_string())
                .bind(r.created_at)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                Write::Put(Record::Edge(r)) => sqlx::query(
                    r#"
                    UPDATE edges SET version = ?, data = ?
                    WHERE type = ? AND "from" = ? AND "to" = ? AND version = ?
                    "#,
                )
                .bind(stamp)
                .bind(r.data.to_string())
                .bind(&r.type_name)
                .bind(&r.from)
                .bind(&r.to)
                .bind(expected)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                // deleting a document that was read as absent is a no-op
                Write::Delete(_) if expected == 0 => 1,
                Write::Delete(DocKey::Object { ref type_name, ref id }) => sqlx::query(
                    "DELETE FROM objects WHERE type = ? AND id = ? AND version = ?",
                )
                .bind(type_name)
                .bind(id)
                .bind(expected)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                Write::Delete(DocKey::Edge {
                    ref type_name,
                    ref from,
                    ref to,
                }) => sqlx::query(
                    r#"DELETE FROM edges WHERE type = ? AND "from" = ? AND "to" = ? AND version = ?"#,
                )
                .bind(type_name)
                .bind(from)
                .bind(to)
                .bind(expected)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
            };

            if affected != 1 {
                return Err(Error::Conflict);
            }
            changed.push(key);
        }

        tx.commit().await?;
        self.feed.publish(changed);
        Ok(())
    }

    async fn fetch_object(
        &self,
        type_name: &'static str,
        id: &str,
    ) -> Result<Option<ObjectRecord>, Error> {
        let key = DocKey::Object {
            type_name: type_name.to_string(),
            id: id.to_string(),
        };
        match Self::read_one(&self.pool, &key).await? {
            Some(Record::Object(r)) => Ok(Some(r)),
            Some(Record::Edge(_)) => Err(Error::TypeMismatch),
            None => Ok(None),
        }
    }

    async fn query_objects(
        &self,
        type_name: &'static str,
        query: Query,
    ) -> Result<Vec<ObjectRecord>, Error> {
        query.validate_fields()?;

        let mut sql = String::from(
            "SELECT type, id, version, data, index_meta, created_at, updated_at FROM objects WHERE type = ?",
        );
        for filter in &query.filters {
            sql.push_str(&format!(
                " AND json_extract(index_meta, '$.{}') {} ?",
                filter.field,
                filter.comparison.sql()
            ));
        }
        match query.sort {
            Some(sort) => sql.push_str(&format!(
                " ORDER BY json_extract(index_meta, '$.{}') {}, id ASC",
                sort.field,
                if sort.ascending { "ASC" } else { "DESC" }
            )),
            None => sql.push_str(" ORDER BY id ASC"),
        }
        if query.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&sql).bind(type_name);
        for filter in &query.filters {
            q = Self::bind_index_value(q, &filter.value);
        }
        if let Some(limit) = query.limit {
            q = q.bind(limit as i64);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::map_object_row).collect()
    }

    async fn fetch_edge(
        &self,
        type_name: &'static str,
        from: &str,
        to: &str,
    ) -> Result<Option<EdgeRecord>, Error> {
        let key = DocKey::Edge {
            type_name: type_name.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        };
        match Self::read_one(&self.pool, &key).await? {
            Some(Record::Edge(r)) => Ok(Some(r)),
            Some(Record::Object(_)) => Err(Error::TypeMismatch),
            None => Ok(None),
        }
    }

    async fn query_edges(
        &self,
        type_name: &'static str,
        from: &str,
    ) -> Result<Vec<EdgeRecord>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT type, "from", "to", version, data, created_at
            FROM edges WHERE type = ? AND "from" = ?
            ORDER BY created_at ASC, "to" ASC
            "#,
        )
        .bind(type_name)
        .bind(from)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::map_edge_row).collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<DocKey> {
        self.feed.subscribe()
    }
}
