use crate::CaseForms;
use crate::CaseRecord;
use crate::Counts;
use crate::Diff;
use crate::JsonDiff;
use crate::migrations::MIGRATOR;
use chrono::Utc;
use log::LevelFilter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::ConnectOptions;
use sqlx::Row;
use sqlx::SqliteExecutor;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;
use tracing::info;

mod cases;
mod clone;
mod counters;
mod diffs;
mod forms;
mod handle;
mod resume;
#[cfg(test)]
mod test_support;

pub use clone::CASEDIFF_KINDS;
pub use clone::CLONE_MANIFEST;
pub use clone::CloneScope;
pub use clone::CloneTable;
pub use handle::StateDbHandle;
pub use resume::ResumeError;

use forms::IdSetCache;

/// File name suffix of named state databases.
pub const STATE_DB_SUFFIX: &str = "-couch-sql.db";

const UNIQUE_ID_KEY: &str = "db_unique_id";
const KV_PREFIX: &str = "kv-";
const UNIQUE_ID_FORMAT: &str = "%Y%m%d-%H%M%S%.6f";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FILE_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    Memory,
    File { path: PathBuf, read_only: bool },
}

/// Migration state database.
///
/// Owns one SQLite database (a file or a private in-memory database) and the
/// caches layered on top of it. Cached id sets only observe writes made
/// through this instance; writes made by another instance against the same
/// file become visible after this instance's next write to the same set.
pub struct StateDb {
    pool: SqlitePool,
    location: Location,
    is_rebuild: bool,
    unique_id: OnceCell<String>,
    problem_forms: IdSetCache,
    no_action_case_forms: IdSetCache,
}

impl StateDb {
    /// Create the state database at `path`, or migrate it if it already exists.
    ///
    /// A unique id is assigned when the database is first created and kept
    /// for its whole lifetime.
    pub async fn init(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_FILE_CONNECTIONS)
            .connect_with(file_options(&path, false).create_if_missing(true))
            .await?;
        let db = Self::new(
            pool,
            Location::File {
                path,
                read_only: false,
            },
        );
        db.initialize().await?;
        Ok(db)
    }

    /// Create a private in-memory state database.
    ///
    /// The database lives as long as this instance and cannot be shared.
    pub async fn init_in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .log_statements(LevelFilter::Off);
        // Every connection to `:memory:` is a separate database, so the pool
        // must hold exactly one connection for the lifetime of the instance.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self::new(pool, Location::Memory);
        db.initialize().await?;
        Ok(db)
    }

    /// Open an existing state database in read-only mode.
    ///
    /// Nothing is created or migrated. A missing file fails here with the
    /// underlying `sqlx::Error`; a file without the schema fails on the first
    /// operation that touches it.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::connect_existing(path.as_ref().to_path_buf(), true).await
    }

    /// Connect to an existing, already initialized database without running
    /// migrations.
    async fn connect_existing(path: PathBuf, read_only: bool) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_FILE_CONNECTIONS)
            .connect_with(file_options(&path, read_only).create_if_missing(false))
            .await?;
        Ok(Self::new(pool, Location::File { path, read_only }))
    }

    fn new(pool: SqlitePool, location: Location) -> Self {
        Self {
            pool,
            location,
            is_rebuild: false,
            unique_id: OnceCell::new(),
            problem_forms: IdSetCache::default(),
            no_action_case_forms: IdSetCache::default(),
        }
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        MIGRATOR.run(&self.pool).await?;
        let unique_id = Utc::now().format(UNIQUE_ID_FORMAT).to_string();
        let created = sqlx::query(
            r#"
INSERT INTO key_value (key, value)
VALUES (?, ?)
ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(UNIQUE_ID_KEY)
        .bind(unique_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;
        if created {
            info!("created state db {} ({unique_id})", self.describe());
        } else {
            debug!("opened existing state db {}", self.describe());
        }
        Ok(())
    }

    /// Path of the backing file, or `None` for in-memory databases.
    pub fn db_path(&self) -> Option<&Path> {
        match &self.location {
            Location::Memory => None,
            Location::File { path, .. } => Some(path.as_path()),
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(
            self.location,
            Location::File {
                read_only: true,
                ..
            }
        )
    }

    /// Whether resume slots are ignored in favour of caller defaults.
    pub fn is_rebuild(&self) -> bool {
        self.is_rebuild
    }

    pub fn set_rebuild(&mut self, is_rebuild: bool) {
        self.is_rebuild = is_rebuild;
    }

    /// Fingerprint assigned when the database was created.
    pub async fn unique_id(&self) -> anyhow::Result<&str> {
        let unique_id = self
            .unique_id
            .get_or_try_init(|| async {
                get_kv(&self.pool, UNIQUE_ID_KEY)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("state db has no unique id"))
            })
            .await?;
        Ok(unique_id.as_str())
    }

    /// Read the setting `name`, returning `default` when it was never set.
    pub async fn get<T: DeserializeOwned>(&self, name: &str, default: T) -> anyhow::Result<T> {
        match get_kv(&self.pool, &format!("{KV_PREFIX}{name}")).await? {
            Some(value) => Ok(serde_json::from_str(value.as_str())?),
            None => Ok(default),
        }
    }

    /// Store the setting `name`, replacing any previous value.
    pub async fn set<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> anyhow::Result<()> {
        let value = serde_json::to_string(value)?;
        set_kv(&self.pool, &format!("{KV_PREFIX}{name}"), value.as_str()).await
    }

    /// Close the connection pool, waiting for every connection to be released.
    pub async fn close(self) {
        self.pool.close().await;
    }

    fn describe(&self) -> String {
        match &self.location {
            Location::Memory => ":memory:".to_string(),
            Location::File { path, .. } => path.display().to_string(),
        }
    }
}

impl std::fmt::Debug for StateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDb")
            .field("location", &self.location)
            .field("is_rebuild", &self.is_rebuild)
            .finish_non_exhaustive()
    }
}

fn file_options(path: &Path, read_only: bool) -> SqliteConnectOptions {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(read_only)
        .busy_timeout(BUSY_TIMEOUT)
        .log_statements(LevelFilter::Off);
    if read_only {
        options
    } else {
        options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
    }
}

pub(crate) async fn get_kv<'e, E>(executor: E, key: &str) -> anyhow::Result<Option<String>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query("SELECT value FROM key_value WHERE key = ?")
        .bind(key)
        .fetch_optional(executor)
        .await?;
    row.map(|row| row.try_get("value"))
        .transpose()
        .map_err(Into::into)
}

/// Every write bumps the row's `generation`, including writes of an
/// unchanged value.
pub(crate) async fn set_kv<'e, E>(executor: E, key: &str, value: &str) -> anyhow::Result<()>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        r#"
INSERT INTO key_value (key, value)
VALUES (?, ?)
ON CONFLICT(key) DO UPDATE SET
    value = excluded.value,
    generation = generation + 1
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(executor)
    .await?;
    Ok(())
}
