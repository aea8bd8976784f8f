use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    PgPool, Postgres, Row,
    postgres::{PgArguments, PgListener, PgRow},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    adapters::{
        Adapter, ChangeFeed, DocKey, EdgeRecord, ObjectRecord, Record, Snapshot, Write,
        expected_versions,
    },
    error::Error,
    query::{IndexMeta, IndexValue, Query},
};

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// Channel carrying committed document keys between processes.
pub const CHANGE_CHANNEL: &str = "kindred_changes";

/// NOTIFY payload. `origin` lets an adapter skip the echo of its own commits,
/// which it has already published locally.
#[derive(Debug, Serialize, Deserialize)]
struct ChangeNotice {
    origin: Uuid,
    key: DocKey,
}

/// PostgreSQL adapter using a unified JSON storage model
///
/// Schema:
/// ```sql
/// CREATE TABLE public.kindred_objects (
///     type TEXT NOT NULL,
///     id TEXT NOT NULL,
///     version BIGINT NOT NULL,
///     data JSONB NOT NULL,
///     index_meta JSONB NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL,
///     PRIMARY KEY (type, id)
/// );
///
/// CREATE TABLE public.kindred_edges (
///     type TEXT NOT NULL,
///     "from" TEXT NOT NULL,
///     "to" TEXT NOT NULL,
///     version BIGINT NOT NULL,
///     data JSONB NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL,
///     PRIMARY KEY (type, "from", "to")
/// );
/// ```
///
/// Commits lock every read row with `SELECT … FOR UPDATE` and re-check its
/// version; a concurrent insert of a row that was read as absent trips the
/// primary key and surfaces as [`Error::Conflict`].
pub struct PostgresAdapter {
    pub(crate) pool: PgPool,
    feed: ChangeFeed,
    origin: Uuid,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresAdapter {
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            feed: ChangeFeed::new(),
            origin: Uuid::now_v7(),
            listener: Mutex::new(None),
        }
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS public.kindred_objects (
                type TEXT NOT NULL,
                id TEXT NOT NULL,
                version BIGINT NOT NULL,
                data JSONB NOT NULL,
                index_meta JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (type, id)
            );
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_kindred_objects_index_meta
                ON public.kindred_objects USING GIN (index_meta jsonb_path_ops);
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS public.kindred_edges (
                type TEXT NOT NULL,
                "from" TEXT NOT NULL,
                "to" TEXT NOT NULL,
                version BIGINT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (type, "from", "to")
            );
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_kindred_edges_to
                ON public.kindred_edges("to", type);
            "#,
        )
        .execute(&mut *tx)
        .await?;

        // store-wide version source; re-created documents never reuse a version
        sqlx::query("CREATE SEQUENCE IF NOT EXISTS public.kindred_version_seq")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    /// Forward commits made by other adapters into [`Adapter::subscribe`].
    ///
    /// Local commits are always published directly and their echoes are
    /// dropped, so each key reaches subscribers once. Calling this more than
    /// once is a no-op.
    pub async fn listen(&self) -> Result<(), Error> {
        {
            let guard = self
                .listener
                .lock()
                .map_err(|_| Error::Storage("listener state poisoned".to_string()))?;
            if guard.as_ref().is_some_and(|h| !h.is_finished()) {
                return Ok(());
            }
        }

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;

        let feed = self.feed.clone();
        let origin = self.origin;
        let handle = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<ChangeNotice>(notification.payload()) {
                            Ok(notice) if notice.origin == origin => {}
                            Ok(notice) => feed.publish([notice.key]),
                            Err(err) => debug!(error = %err, "ignoring malformed change payload"),
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "change listener failed, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        let mut guard = self
            .listener
            .lock()
            .map_err(|_| Error::Storage("listener state poisoned".to_string()))?;
        if let Some(old) = guard.replace(handle) {
            old.abort();
        }
        Ok(())
    }

    fn map_object_row(row: PgRow) -> Result<ObjectRecord, Error> {
        let index_meta: serde_json::Value = row.try_get("index_meta")?;
        Ok(ObjectRecord {
            id: row.try_get("id")?,
            type_name: row.try_get("type")?,
            version: row.try_get("version")?,
            data: row.try_get("data")?,
            index_meta: serde_json::from_value::<IndexMeta>(index_meta)
                .map_err(|e| Error::Deserialize(e.to_string()))?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    fn map_edge_row(row: PgRow) -> Result<EdgeRecord, Error> {
        Ok(EdgeRecord {
            type_name: row.try_get("type")?,
            from: row.try_get("from")?,
            to: row.try_get("to")?,
            version: row.try_get("version")?,
            data: row.try_get("data")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        })
    }

    async fn read_one<'e, E>(executor: E, key: &DocKey, for_update: bool) -> Result<Option<Record>, Error>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let lock = if for_update { " FOR UPDATE" } else { "" };
        match key {
            DocKey::Object { type_name, id } => {
                let sql = format!(
                    r#"SELECT type, id, version, data, index_meta, created_at, updated_at
                    FROM public.kindred_objects WHERE type = $1 AND id = $2{}"#,
                    lock
                );
                let row = sqlx::query(&sql)
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
                let sql = format!(
                    r#"SELECT type, "from", "to", version, data, created_at
                    FROM public.kindred_edges WHERE type = $1 AND "from" = $2 AND "to" = $3{}"#,
                    lock
                );
                let row = sqlx::query(&sql)
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

    fn bind_index_value<'q>(query: PgQuery<'q>, value: &IndexValue) -> PgQuery<'q> {
        match value {
            IndexValue::String(s) => query.bind(s.clone()),
            IndexValue::Int(i) => query.bind(*i),
            IndexValue::Bool(b) => query.bind(*b),
        }
    }

    fn index_expr(field: &str, value: &IndexValue) -> String {
        match value {
            IndexValue::String(_) => format!("(index_meta->>'{}')", field),
            IndexValue::Int(_) => format!("(index_meta->>'{}')::bigint", field),
            IndexValue::Bool(_) => format!("(index_meta->>'{}')::boolean", field),
        }
    }
}

impl Drop for PostgresAdapter {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.listener.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl Adapter for PostgresAdapter {
    async fn read(&self, keys: &[DocKey]) -> Result<Snapshot, Error> {
        let mut snapshot = Snapshot::new();
        for key in keys {
            let record = Self::read_one(&self.pool, key, false).await?;
            snapshot.insert(key.clone(), record);
        }
        Ok(snapshot)
    }

    async fn commit(&self, expected: &[(DocKey, i64)], writes: Vec<Write>) -> Result<(), Error> {
        let versions = expected_versions(expected, &writes)?;
        let mut tx = self.pool.begin().await?;

        // lock in key order so two commits over the same set cannot deadlock
        let mut ordered: Vec<&(DocKey, i64)> = expected.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, version) in ordered {
            let current = Self::read_one(&mut *tx, key, true)
                .await?
                .map(|r| r.version())
                .unwrap_or(0);
            if current != *version {
                return Err(Error::Conflict);
            }
        }

        let stamp: i64 = sqlx::query_scalar("SELECT nextval('public.kindred_version_seq')")
            .fetch_one(&mut *tx)
            .await?;

        let mut changed = Vec::with_capacity(writes.len());
        for write in writes {
            let key = write.key();
            let expected = versions.get(&key).copied().unwrap_or(0);
            let affected = match write {
                Write::Put(Record::Object(r)) if expected == 0 => sqlx::query(
                    r#"
                    INSERT INTO public.kindred_objects
                        (type, id, version, data, index_meta, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(&r.type_name)
                .bind(&r.id)
                .bind(stamp)
                .bind(&r.data)
                .bind(serde_json::to_value(&r.index_meta).map_err(|e| Error::Serialize(e.to_string()))?)
                .bind(r.created_at)
                .bind(r.updated_at)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                Write::Put(Record::Object(r)) => sqlx::query(
                    r#"
                    UPDATE public.kindred_objects
                    SET version = $1, data = $2, index_meta = $3, updated_at = $4
                    WHERE type = $5 AND id = $6 AND version = $7
                    "#,
                )
                .bind(stamp)
                .bind(&r.data)
                .bind(serde_json::to_value(&r.index_meta).map_err(|e| Error::Serialize(e.to_string()))?)
                .bind(r.updated_at)
                .bind(&r.type_name)
                .bind(&r.id)
                .bind(expected)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                Write::Put(Record::Edge(r)) if expected == 0 => sqlx::query(
                    r#"
                    INSERT INTO public.kindred_edges (type, "from", "to", version, data, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(&r.type_name)
                .bind(&r.from)
                .bind(&r.to)
                .bind(stamp)
                .bind(&r.data)
                .bind(r.created_at)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                Write::Put(Record::Edge(r)) => sqlx::query(
                    r#"
                    UPDATE public.kindred_edges SET version = $1, data = $2
                    WHERE type = $3 AND "from" = $4 AND "to" = $5 AND version = $6
                    "#,
                )
                .bind(stamp)
                .bind(&r.data)
                .bind(&r.type_name)
                .bind(&r.from)
                .bind(&r.to)
                .bind(expected)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                Write::Delete(_) if expected == 0 => 1,
                Write::Delete(DocKey::Object { type_name, id }) => sqlx::query(
                    "DELETE FROM public.kindred_objects WHERE type = $1 AND id = $2 AND version = $3",
                )
                .bind(type_name)
                .bind(id)
                .bind(expected)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                Write::Delete(DocKey::Edge {
                    type_name,
                    from,
                    to,
                }) => sqlx::query(
                    r#"DELETE FROM public.kindred_edges WHERE type = $1 AND "from" = $2 AND "to" = $3 AND version = $4"#,
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

            let notice = ChangeNotice {
                origin: self.origin,
                key: key.clone(),
            };
            let payload =
                serde_json::to_string(&notice).map_err(|e| Error::Serialize(e.to_string()))?;
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(CHANGE_CHANNEL)
                .bind(payload)
                .execute(&mut *tx)
                .await?;
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
        match Self::read_one(&self.pool, &key, false).await? {
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
            "SELECT type, id, version, data, index_meta, created_at, updated_at FROM public.kindred_objects WHERE type = $1",
        );
        let mut param = 1;
        for filter in &query.filters {
            param += 1;
            sql.push_str(&format!(
                " AND {} {} ${}",
                Self::index_expr(filter.field, &filter.value),
                filter.comparison.sql(),
                param
            ));
        }
        match query.sort {
            Some(sort) => sql.push_str(&format!(
                " ORDER BY index_meta->'{}' {}, id ASC",
                sort.field,
                if sort.ascending { "ASC" } else { "DESC" }
            )),
            None => sql.push_str(" ORDER BY id ASC"),
        }
        if query.limit.is_some() {
            param += 1;
            sql.push_str(&format!(" LIMIT ${}", param));
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
        match Self::read_one(&self.pool, &key, false).await? {
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
            FROM public.kindred_edges WHERE type = $1 AND "from" = $2
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
