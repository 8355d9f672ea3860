use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

use crate::STATE_DB_SUFFIX;
use crate::StateDb;

const STATE_DB_SUBDIR: &str = "db";
const SQLITE_COMPANION_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// Location of the state database for the migration run `name`.
pub fn state_db_path(name: &str, state_dir: &Path) -> PathBuf {
    state_dir
        .join(STATE_DB_SUBDIR)
        .join(format!("{name}{STATE_DB_SUFFIX}"))
}

/// Create (or reopen and migrate) the state database for `name`.
pub async fn init_state_db(name: &str, state_dir: &Path) -> anyhow::Result<StateDb> {
    StateDb::init(state_db_path(name, state_dir)).await
}

/// Open the existing state database for `name` in read-only mode.
///
/// The database file is never created; opening fails if it does not exist.
pub async fn open_state_db(name: &str, state_dir: &Path) -> anyhow::Result<StateDb> {
    StateDb::open(state_db_path(name, state_dir)).await
}

/// Remove the state database for `name`, including SQLite's companion files.
///
/// Missing files are not an error.
pub async fn delete_state_db(name: &str, state_dir: &Path) -> anyhow::Result<()> {
    let db_path = state_db_path(name, state_dir);
    remove_if_exists(&db_path).await?;
    for suffix in SQLITE_COMPANION_SUFFIXES {
        let mut companion = db_path.clone().into_os_string();
        companion.push(suffix);
        remove_if_exists(Path::new(&companion)).await?;
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("removed state db file {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(anyhow::anyhow!(
            "failed to remove state db file {}: {err}",
            path.display()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn state_db_path_is_deterministic() {
        let dir = Path::new("/tmp/migrations");
        assert_eq!(
            state_db_path("demo", dir),
            PathBuf::from("/tmp/migrations/db/demo-couch-sql.db")
        );
    }

    #[tokio::test]
    async fn delete_removes_companion_files_and_ignores_missing() {
        let state_dir = tempfile::tempdir().expect("tempdir");
        let db_path = state_db_path("demo", state_dir.path());
        tokio::fs::create_dir_all(db_path.parent().expect("parent"))
            .await
            .expect("create db dir");
        for suffix in ["", "-wal", "-shm"] {
            let path = format!("{}{suffix}", db_path.display());
            tokio::fs::write(path, b"state").await.expect("write");
        }

        delete_state_db("demo", state_dir.path())
            .await
            .expect("delete state db");
        for suffix in ["", "-wal", "-shm"] {
            let path = format!("{}{suffix}", db_path.display());
            assert_eq!(
                tokio::fs::try_exists(path).await.expect("check path"),
                false
            );
        }

        delete_state_db("demo", state_dir.path())
            .await
            .expect("delete missing state db");
    }
}
