//! SQLite-backed mapping table
//!
//! One row per routing rule. The store is opened in WAL mode so a writer
//! (the admin CLI, or a hot swap) never blocks the per-request readers in
//! the workers, and every worker owns its own pool over the shared file.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, ConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors surfaced by the mapping store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be created or opened. Fatal to the worker.
    #[error("failed to initialize mapping store: {0}")]
    Init(String),

    /// The store has no live connection. Fatal to the worker.
    #[error("mapping store unavailable: {0}")]
    Unavailable(String),

    /// A hot swap was rejected or rolled back; the previous database is
    /// still being served.
    #[error("hot replace failed: {0}")]
    HotReplaceFailed(String),

    /// A query against the live database failed.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One routing rule.
///
/// `(domain, front_uri)` is the logical key; duplicates are permitted and
/// yield an arbitrary but deterministic winner at lookup time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct Mapping {
    pub id: String,
    /// Exact host to match, lowercase, no port.
    pub domain: String,
    /// Path prefix without the leading slash; empty matches any path.
    pub front_uri: String,
    /// Loopback destination port.
    pub back_port: u16,
    /// Path fragment substituted for `front_uri` on the upstream.
    pub back_uri: String,
    /// Reserved: external base URL overriding the loopback form.
    pub backend: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS mappings (
        id TEXT PRIMARY KEY,
        domain TEXT NOT NULL,
        front_uri TEXT NOT NULL,
        back_port INTEGER NOT NULL,
        back_uri TEXT NOT NULL,
        backend TEXT DEFAULT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE INDEX IF NOT EXISTS idx_mappings_domain ON mappings(domain)",
    "CREATE INDEX IF NOT EXISTS idx_mappings_front_uri ON mappings(front_uri)",
    "CREATE INDEX IF NOT EXISTS idx_mappings_domain_front_uri ON mappings(domain, front_uri)",
];

const SELECT_COLUMNS: &str =
    "id, domain, front_uri, back_port, back_uri, backend, created_at, updated_at";

/// Persistent, hot-swappable mapping table.
///
/// Lifecycle: `CLOSED -> OPEN`, briefly `CLOSED` again during a hot swap,
/// then `OPEN`. Queries issued against a closed store report
/// [`StoreError::Unavailable`].
pub struct MappingStore {
    path: PathBuf,
    pool: RwLock<Option<SqlitePool>>,
}

impl MappingStore {
    /// Open (or create) the database at `path`, enable WAL journaling and
    /// ensure the schema exists.
    pub async fn initialize(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Init(format!("create {}: {}", parent.display(), e)))?;
            }
        }

        let pool = open_pool(&path, true)
            .await
            .map_err(|e| StoreError::Init(e.to_string()))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| StoreError::Init(e.to_string()))?;
        }

        tracing::info!(path = %path.display(), "mapping store ready");

        Ok(Self {
            path,
            pool: RwLock::new(Some(pool)),
        })
    }

    /// Longest-front-URI lookup for `(domain, request_path)`.
    ///
    /// A row matches when its `front_uri` is empty or `request_path` begins
    /// with `/` + `front_uri`. Ties on length fall back to a fixed ordering
    /// so the winner is stable for a given database state.
    pub async fn get(
        &self,
        domain: &str,
        request_path: &str,
    ) -> Result<Option<Mapping>, StoreError> {
        let pool = self.live_pool().await?;

        let mapping = sqlx::query_as::<_, Mapping>(&format!(
            "SELECT {SELECT_COLUMNS} FROM mappings
             WHERE domain = ?1
               AND (front_uri = '' OR substr(?2, 1, length(front_uri) + 1) = '/' || front_uri)
             ORDER BY length(front_uri) DESC, front_uri DESC, id ASC
             LIMIT 1"
        ))
        .bind(domain)
        .bind(request_path)
        .fetch_optional(&pool)
        .await?;

        Ok(mapping)
    }

    /// All rows, sorted by `(domain, front_uri)`.
    pub async fn get_all(&self) -> Result<Vec<Mapping>, StoreError> {
        let pool = self.live_pool().await?;

        let mappings = sqlx::query_as::<_, Mapping>(&format!(
            "SELECT {SELECT_COLUMNS} FROM mappings ORDER BY domain ASC, front_uri ASC"
        ))
        .fetch_all(&pool)
        .await?;

        Ok(mappings)
    }

    /// Insert a new rule with a fresh id. Duplicate logical keys are allowed.
    pub async fn add(
        &self,
        domain: &str,
        front_uri: &str,
        back_port: u16,
        back_uri: &str,
    ) -> Result<Mapping, StoreError> {
        let pool = self.live_pool().await?;

        let now = chrono::Utc::now().to_rfc3339();
        let mapping = Mapping {
            id: uuid::Uuid::new_v4().to_string(),
            domain: domain.to_string(),
            front_uri: front_uri.to_string(),
            back_port,
            back_uri: back_uri.to_string(),
            backend: None,
            created_at: now.clone(),
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO mappings (id, domain, front_uri, back_port, back_uri, backend, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&mapping.id)
        .bind(&mapping.domain)
        .bind(&mapping.front_uri)
        .bind(mapping.back_port)
        .bind(&mapping.back_uri)
        .bind(&mapping.backend)
        .bind(&mapping.created_at)
        .bind(&mapping.updated_at)
        .execute(&pool)
        .await?;

        Ok(mapping)
    }

    /// Delete a rule by id. Returns whether a row was removed.
    pub async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let pool = self.live_pool().await?;

        let result = sqlx::query("DELETE FROM mappings WHERE id = ?1")
            .bind(id)
            .execute(&pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically replace the backing database with the file at `new_path`.
    ///
    /// The candidate is verified before the live pool is closed. If anything
    /// fails after the close, the original file is reopened and the swap is
    /// reported as failed; if even the reopen fails the store is unusable
    /// and the caller should treat that as fatal.
    pub async fn hot_replace(&self, new_path: impl AsRef<Path>) -> Result<(), StoreError> {
        let new_path = new_path.as_ref();

        self.verify_candidate(new_path).await?;

        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.take() {
            pool.close().await;
        }

        // Stale WAL sidecars of the outgoing database must not be replayed
        // into the incoming file.
        let _ = tokio::fs::remove_file(sidecar(&self.path, "-wal")).await;
        let _ = tokio::fs::remove_file(sidecar(&self.path, "-shm")).await;

        let copied = tokio::fs::copy(new_path, &self.path).await;

        match open_pool(&self.path, false).await {
            Ok(pool) => {
                *guard = Some(pool);
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "mapping store lost during hot swap");
                return Err(StoreError::Unavailable(format!(
                    "could not reopen {} after swap: {}",
                    self.path.display(),
                    e
                )));
            }
        }

        match copied {
            Ok(_) => {
                tracing::info!(
                    from = %new_path.display(),
                    to = %self.path.display(),
                    "mapping table hot-swapped"
                );
                Ok(())
            }
            Err(e) => Err(StoreError::HotReplaceFailed(format!(
                "copy {} over {}: {}",
                new_path.display(),
                self.path.display(),
                e
            ))),
        }
    }

    /// Flush and release the connection pool.
    pub async fn close(&self) {
        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.take() {
            pool.close().await;
        }
    }

    /// Path of the live database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn live_pool(&self) -> Result<SqlitePool, StoreError> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| StoreError::Unavailable("store is closed".to_string()))
    }

    /// A candidate for hot swap must at least open and contain a `mappings`
    /// table; anything else is rejected before the live pool is touched.
    async fn verify_candidate(&self, candidate: &Path) -> Result<(), StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(candidate)
            .read_only(true);

        let mut conn = options
            .connect()
            .await
            .map_err(|e| StoreError::HotReplaceFailed(format!(
                "candidate {} did not open: {}",
                candidate.display(),
                e
            )))?;

        let tables: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'mappings'",
        )
        .fetch_one(&mut conn)
        .await
        .map_err(|e| StoreError::HotReplaceFailed(format!(
            "candidate {} is not readable: {}",
            candidate.display(),
            e
        )))?;

        let _ = conn.close().await;

        if tables == 0 {
            return Err(StoreError::HotReplaceFailed(format!(
                "candidate {} has no mappings table",
                candidate.display()
            )));
        }

        Ok(())
    }
}

async fn open_pool(path: &Path, create: bool) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
