//! PostgreSQL + pgvector identity store backend.
//!
//! The identity collection is a table:
//!
//! ```sql
//! CREATE TABLE face_embeddings (
//!     id          BIGSERIAL PRIMARY KEY,
//!     label       VARCHAR(100) NOT NULL,
//!     embedding   vector(512) NOT NULL,
//!     enrolled_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```
//!
//! with a b-tree index on `label` and an approximate nearest-neighbor index on
//! `embedding` under inner product (`vector_ip_ops`). pgvector's `<#>` operator
//! returns the *negative* inner product, so similarity is `-(a <#> b)`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    CollectionInfo, SearchHit, StoreEndpoint, StoreError, StoreResult, VectorBackend,
    MAX_LABEL_LEN,
};
use crate::fingerprint::Fingerprint;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Approximate nearest-neighbor index on the embedding column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorIndex {
    Hnsw {
        m: u32,
        ef_construction: u32,
        ef_search: u32,
    },
    IvfFlat {
        lists: u32,
        probes: u32,
    },
}

impl Default for VectorIndex {
    fn default() -> Self {
        VectorIndex::Hnsw {
            m: 16,
            ef_construction: 64,
            ef_search: 40,
        }
    }
}

impl VectorIndex {
    /// IVFFlat with 128 lists, searched with 10 probes.
    pub fn ivfflat() -> Self {
        VectorIndex::IvfFlat {
            lists: 128,
            probes: 10,
        }
    }

    fn create_sql(&self, index_name: &str, table: &str) -> String {
        match self {
            VectorIndex::Hnsw {
                m, ef_construction, ..
            } => format!(
                "CREATE INDEX IF NOT EXISTS {index_name} ON {table} \
                 USING hnsw (embedding vector_ip_ops) WITH (m = {m}, ef_construction = {ef_construction})"
            ),
            VectorIndex::IvfFlat { lists, .. } => format!(
                "CREATE INDEX IF NOT EXISTS {index_name} ON {table} \
                 USING ivfflat (embedding vector_ip_ops) WITH (lists = {lists})"
            ),
        }
    }

    /// Per-transaction search breadth.
    fn search_setting(&self) -> String {
        match self {
            VectorIndex::Hnsw { ef_search, .. } => format!("SET LOCAL hnsw.ef_search = {ef_search}"),
            VectorIndex::IvfFlat { probes, .. } => format!("SET LOCAL ivfflat.probes = {probes}"),
        }
    }
}

impl FromStr for VectorIndex {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hnsw" => Ok(VectorIndex::default()),
            "ivfflat" | "ivf_flat" => Ok(VectorIndex::ivfflat()),
            other => Err(StoreError::Query(format!("unknown vector index '{other}'"))),
        }
    }
}

#[derive(FromRow)]
struct HitRow {
    id: i64,
    label: String,
    similarity: f64,
}

/// Postgres + pgvector backend.
pub struct PgVectorBackend {
    pool: RwLock<Option<PgPool>>,
    index: VectorIndex,
    max_connections: u32,
}

impl PgVectorBackend {
    pub fn new(index: VectorIndex) -> Self {
        Self {
            pool: RwLock::new(None),
            index,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    async fn pool(&self) -> StoreResult<PgPool> {
        self.pool.read().await.clone().ok_or(StoreError::NotConnected)
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
fn quote_ident(input: &str) -> String {
    format!("\"{}\"", input.replace('"', "\"\""))
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

fn index_name(collection: &str, suffix: &str) -> String {
    quote_ident(&format!("{}_{suffix}", sanitize_ident(collection)))
}

/// Map a driver error onto the store taxonomy.
fn classify(err: sqlx::Error, collection: &str) -> StoreError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Connection(err.to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("42P01") => StoreError::CollectionMissing(collection.to_string()),
            // Class 08 (connection exception) and operator intervention.
            Some(code) if code.starts_with("08") || code.starts_with("57P") => {
                StoreError::Connection(err.to_string())
            }
            _ => StoreError::Query(err.to_string()),
        },
        _ => StoreError::Query(err.to_string()),
    }
}

#[async_trait]
impl VectorBackend for PgVectorBackend {
    async fn connect(&self, endpoint: &StoreEndpoint) -> StoreResult<()> {
        let options = PgConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .database(&endpoint.database)
            .username(&endpoint.user)
            .password(&endpoint.password);

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(DEFAULT_ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| classify(e, ""))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| classify(e, ""))?;

        let previous = self.pool.write().await.replace(pool);
        if let Some(old) = previous {
            // close() waits for checked-out connections; never block the caller on it.
            tokio::spawn(async move {
                old.close().await;
                debug!("Superseded Postgres pool closed");
            });
        }
        info!(endpoint = %endpoint, "Postgres pool established");
        Ok(())
    }

    async fn disconnect(&self) {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
        }
    }

    async fn has_collection(&self, collection: &str) -> StoreResult<bool> {
        let pool = self.pool().await?;
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_name = $1
            )
            "#,
        )
        .bind(collection)
        .fetch_one(&pool)
        .await
        .map_err(|e| classify(e, collection))
    }

    async fn create_collection(&self, collection: &str, dimension: usize) -> StoreResult<()> {
        let pool = self.pool().await?;
        let table = quote_ident(collection);

        let statements = [
            "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id BIGSERIAL PRIMARY KEY,
                    label VARCHAR({MAX_LABEL_LEN}) NOT NULL,
                    embedding vector({dimension}) NOT NULL,
                    enrolled_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {table} (label)",
                index_name(collection, "label_idx")
            ),
            self.index
                .create_sql(&index_name(collection, "embedding_idx"), &table),
        ];

        for sql in &statements {
            sqlx::query(sql)
                .execute(&pool)
                .await
                .map_err(|e| classify(e, collection))?;
        }
        debug!(collection, dimension, index = ?self.index, "Created pgvector collection");
        Ok(())
    }

    async fn load_collection(&self, collection: &str) -> StoreResult<()> {
        // Postgres tables are always queryable; loading only checks existence.
        if self.has_collection(collection).await? {
            Ok(())
        } else {
            Err(StoreError::CollectionMissing(collection.to_string()))
        }
    }

    async fn describe_collection(&self, collection: &str) -> StoreResult<CollectionInfo> {
        let pool = self.pool().await?;

        // pgvector stores the declared dimension as the column typmod.
        let typmod: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT a.atttypmod
            FROM pg_attribute a
            JOIN pg_class c ON c.oid = a.attrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = current_schema()
              AND c.relname = $1
              AND a.attname = 'embedding'
              AND NOT a.attisdropped
            "#,
        )
        .bind(collection)
        .fetch_optional(&pool)
        .await
        .map_err(|e| classify(e, collection))?;

        let typmod = typmod.ok_or_else(|| StoreError::CollectionMissing(collection.to_string()))?;

        let embedding_index = format!("{}_embedding_idx", sanitize_ident(collection));
        let index: Option<String> = sqlx::query_scalar(
            r#"
            SELECT indexdef FROM pg_indexes
            WHERE schemaname = current_schema() AND tablename = $1 AND indexname = $2
            "#,
        )
        .bind(collection)
        .bind(&embedding_index)
        .fetch_optional(&pool)
        .await
        .map_err(|e| classify(e, collection))?;

        Ok(CollectionInfo {
            name: collection.to_string(),
            dimension: typmod.max(0) as usize,
            index,
        })
    }

    async fn insert(
        &self,
        collection: &str,
        label: &str,
        fingerprint: &Fingerprint,
    ) -> StoreResult<i64> {
        let pool = self.pool().await?;
        let sql = format!(
            "INSERT INTO {} (label, embedding) VALUES ($1, $2) RETURNING id",
            quote_ident(collection)
        );
        // Autocommit: the row is visible to the next search once this returns.
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(label)
            .bind(Vector::from(fingerprint.as_slice().to_vec()))
            .fetch_one(&pool)
            .await
            .map_err(|e| classify(e, collection))
    }

    async fn search(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
        top_k: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        let pool = self.pool().await?;
        let sql = format!(
            "SELECT id, label, (embedding <#> $1) * -1 AS similarity \
             FROM {} ORDER BY embedding <#> $1 LIMIT $2",
            quote_ident(collection)
        );

        let mut tx = pool.begin().await.map_err(|e| classify(e, collection))?;
        sqlx::query(&self.index.search_setting())
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, collection))?;
        let rows: Vec<HitRow> = sqlx::query_as(&sql)
            .bind(Vector::from(fingerprint.as_slice().to_vec()))
            .bind(top_k as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| classify(e, collection))?;
        tx.commit().await.map_err(|e| classify(e, collection))?;

        Ok(rows
            .into_iter()
            .map(|row| SearchHit {
                internal_id: row.id,
                identity_label: row.label,
                similarity: row.similarity as f32,
            })
            .collect())
    }

    async fn count_label(&self, collection: &str, label: &str) -> StoreResult<u64> {
        let pool = self.pool().await?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE label = $1",
            quote_ident(collection)
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(label)
            .fetch_one(&pool)
            .await
            .map_err(|e| classify(e, collection))?;
        Ok(count.max(0) as u64)
    }

    async fn delete_label(&self, collection: &str, label: &str) -> StoreResult<u64> {
        let pool = self.pool().await?;
        let sql = format!("DELETE FROM {} WHERE label = $1", quote_ident(collection));
        let result = sqlx::query(&sql)
            .bind(label)
            .execute(&pool)
            .await
            .map_err(|e| classify(e, collection))?;
        Ok(result.rows_affected())
    }

    async fn labels(&self, collection: &str) -> StoreResult<Vec<String>> {
        let pool = self.pool().await?;
        let sql = format!(
            "SELECT DISTINCT label FROM {} ORDER BY label",
            quote_ident(collection)
        );
        sqlx::query_scalar(&sql)
            .fetch_all(&pool)
            .await
            .map_err(|e| classify(e, collection))
    }

    fn kind(&self) -> &'static str {
        "pgvector"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FINGERPRINT_DIM;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("face_embeddings"), "\"face_embeddings\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(index_name("my-faces", "label_idx"), "\"my_faces_label_idx\"");
    }

    #[test]
    fn test_index_sql() {
        let sql = VectorIndex::default().create_sql("\"idx\"", "\"faces\"");
        assert!(sql.contains("USING hnsw (embedding vector_ip_ops)"));
        assert!(sql.contains("m = 16"));

        let ivf = VectorIndex::ivfflat();
        assert!(ivf.create_sql("\"idx\"", "\"faces\"").contains("lists = 128"));
        assert_eq!(ivf.search_setting(), "SET LOCAL ivfflat.probes = 10");
    }

    #[test]
    fn test_index_from_str() {
        assert_eq!("HNSW".parse::<VectorIndex>().unwrap(), VectorIndex::default());
        assert_eq!("ivfflat".parse::<VectorIndex>().unwrap(), VectorIndex::ivfflat());
        assert!("annoy".parse::<VectorIndex>().is_err());
    }

    #[test]
    fn test_classify_connectivity() {
        assert!(classify(sqlx::Error::PoolTimedOut, "faces").is_connectivity());
        assert!(classify(sqlx::Error::PoolClosed, "faces").is_connectivity());
        assert!(classify(sqlx::Error::Protocol("eof".into()), "faces").is_connectivity());
        assert!(!classify(sqlx::Error::RowNotFound, "faces").is_connectivity());
    }

    #[tokio::test]
    async fn test_operations_before_connect() {
        let backend = PgVectorBackend::new(VectorIndex::default());
        assert!(matches!(
            backend.labels("faces").await,
            Err(StoreError::NotConnected)
        ));
    }

    /// Endpoint of a pgvector-enabled database, from `PGVECTOR_TEST_*` vars.
    fn test_endpoint() -> StoreEndpoint {
        let var = |name: &str, default: &str| {
            std::env::var(format!("PGVECTOR_TEST_{name}")).unwrap_or_else(|_| default.to_string())
        };
        StoreEndpoint {
            host: var("HOST", "localhost"),
            port: var("PORT", "5432").parse().unwrap(),
            database: var("DATABASE", "faceid_test"),
            user: var("USER", "postgres"),
            password: var("PASSWORD", "postgres"),
        }
    }

    fn axis(index: usize) -> Fingerprint {
        let mut v = vec![0.0; FINGERPRINT_DIM];
        v[index] = 1.0;
        Fingerprint::from_embedding(v).unwrap()
    }

    async fn fresh_collection(backend: &PgVectorBackend, name: &str) {
        let pool = backend.pool().await.unwrap();
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))
            .execute(&pool)
            .await
            .unwrap();
        backend.create_collection(name, FINGERPRINT_DIM).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Postgres with the vector extension"]
    async fn test_pg_insert_search_delete() {
        let backend = PgVectorBackend::new(VectorIndex::default());
        backend.connect(&test_endpoint()).await.unwrap();
        let collection = "faceid_test_roundtrip";
        fresh_collection(&backend, collection).await;

        let info = backend.describe_collection(collection).await.unwrap();
        assert_eq!(info.dimension, FINGERPRINT_DIM);
        assert!(info.index.unwrap().contains("hnsw"));

        backend.insert(collection, "alice", &axis(0)).await.unwrap();
        backend.insert(collection, "bob", &axis(1)).await.unwrap();

        let hits = backend.search(collection, &axis(0), 2).await.unwrap();
        assert_eq!(hits[0].identity_label, "alice");
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);
        assert!(hits[1].similarity.abs() < 1e-5);

        assert_eq!(backend.labels(collection).await.unwrap(), vec!["alice", "bob"]);
        assert_eq!(backend.count_label(collection, "alice").await.unwrap(), 1);
        assert_eq!(backend.delete_label(collection, "alice").await.unwrap(), 1);
        assert_eq!(backend.count_label(collection, "alice").await.unwrap(), 0);
        backend.disconnect().await;
    }

    #[tokio::test]
    #[ignore = "requires Postgres with the vector extension"]
    async fn test_pg_reconnect_does_not_wait_for_checked_out_connections() {
        let backend = PgVectorBackend::new(VectorIndex::default());
        let endpoint = test_endpoint();
        backend.connect(&endpoint).await.unwrap();

        let old_pool = backend.pool().await.unwrap();
        let held = old_pool.acquire().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), backend.connect(&endpoint))
            .await
            .expect("reconnect blocked on the superseded pool")
            .unwrap();
        assert!(!backend.has_collection("faceid_test_absent").await.unwrap());

        drop(held);
        backend.disconnect().await;
    }
}
