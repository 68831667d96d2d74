//! Database initialization, migration, and connection management for the
//! router directory.

use std::{
    env,
    fs::OpenOptions,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use sqlx::{migrate::Migrator, sqlite::SqlitePoolOptions, SqlitePool};
use tracing::warn;
use url::Url;

mod error;
pub mod hosts;
pub mod options;
pub mod users;

pub use error::{DbError, DbResult};

static ROUTER_MIGRATOR: Migrator = sqlx::migrate!("./migrations/router");

const ROUTER_DB_ENV: &str = "FV_ROUTER_DB_URL";

/// Return a human-friendly string describing where the router DB will live.
/// Prefers a filesystem path when available, otherwise returns the configured URL.
pub fn display_router_db_path() -> String {
    if let Ok(val) = env::var(ROUTER_DB_ENV) {
        return val;
    }
    default_router_path().display().to_string()
}

/// A pooled connection plus where it points.
pub struct DbHandle {
    pub pool: SqlitePool,
    pub url: String,
    pub path: Option<PathBuf>,
    pub freshly_created: bool,
}

impl DbHandle {
    pub fn into_pool(self) -> SqlitePool {
        self.pool
    }
}

/// Establish a pooled SQLite connection for the router directory.
pub async fn router_db() -> DbResult<DbHandle> {
    let location = resolve_router_location().await?;
    init_pool(location).await
}

/// Apply the router migrations to the provided pool.
pub async fn migrate_router(handle: &DbHandle) -> DbResult<()> {
    ROUTER_MIGRATOR.run(&handle.pool).await?;
    if handle.freshly_created {
        warn!(db = %display_path(handle), "initialized router database and applied migrations");
    }
    Ok(())
}

/// True when the directory database file already exists on disk.
/// Used by `create-config` to refuse to clobber an installation.
pub async fn router_db_exists() -> bool {
    if env::var(ROUTER_DB_ENV).is_ok() {
        // URL-configured databases are managed by the operator.
        return false;
    }
    tokio::fs::try_exists(default_router_path()).await.unwrap_or(false)
}

async fn resolve_router_location() -> DbResult<DbLocation> {
    if let Ok(value) = env::var(ROUTER_DB_ENV) {
        return build_location_from_env(value).await;
    }

    build_location_from_path(default_router_path()).await
}

async fn build_location_from_env(value: String) -> DbResult<DbLocation> {
    if value.starts_with("sqlite:") {
        Ok(DbLocation {
            url: value,
            path: None,
            freshly_created: false,
        })
    } else {
        build_location_from_path(PathBuf::from(value)).await
    }
}

async fn build_location_from_path(path: PathBuf) -> DbResult<DbLocation> {
    let existed = tokio::fs::try_exists(&path).await.unwrap_or(false);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DbError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
    }
    if !existed {
        let path_clone = path.clone();
        tokio::task::spawn_blocking(move || {
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                let mut options = OpenOptions::new();
                options.create_new(true).write(true).mode(0o600);
                match options.open(&path_clone) {
                    Ok(_) => Ok(()),
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
                    Err(err) => Err(DbError::FileCreationFailed {
                        path: path_clone.clone(),
                        source: err,
                    }),
                }
            }
            #[cfg(not(unix))]
            {
                // Best-effort fallback on non-Unix platforms.
                let mut options = OpenOptions::new();
                options.create_new(true).write(true);
                match options.open(&path_clone) {
                    Ok(_) => Ok(()),
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
                    Err(err) => Err(DbError::FileCreationFailed {
                        path: path_clone.clone(),
                        source: err,
                    }),
                }
            }
        })
        .await
        .map_err(|e| DbError::TaskPanicked(e.to_string()))??;
    }
    let url = sqlite_url_from_path(&path)?;
    Ok(DbLocation {
        url,
        path: Some(path),
        freshly_created: !existed,
    })
}

fn sqlite_url_from_path(path: &Path) -> DbResult<String> {
    let url = Url::from_file_path(path).map_err(|_| DbError::InvalidPath(path.to_path_buf()))?;
    let mut url_string: String = url.into();
    url_string.replace_range(..4, "sqlite");
    Ok(url_string)
}

async fn init_pool(location: DbLocation) -> DbResult<DbHandle> {
    let max_connections = env::var("FV_DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(20);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&location.url)
        .await
        .map_err(|e| DbError::ConnectionFailed {
            path: location.url.clone(),
            source: e,
        })?;

    Ok(DbHandle {
        pool,
        url: location.url,
        path: location.path,
        freshly_created: location.freshly_created,
    })
}

fn default_router_path() -> PathBuf {
    preferred_state_dir().join("farview").join("router.db")
}

fn preferred_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_dir)
        .unwrap_or_else(|| fallback_home().join(".local/state"))
}

fn fallback_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn display_path(handle: &DbHandle) -> String {
    handle
        .path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| handle.url.clone())
}

pub(crate) fn current_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

struct DbLocation {
    url: String,
    path: Option<PathBuf>,
    freshly_created: bool,
}
