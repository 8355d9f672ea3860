use super::*;
use serde::Deserialize;

/// Serializable description of an open state database.
///
/// A handle carries enough to reconnect to the same database file from
/// another process; it carries none of the data or cached state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDbHandle {
    pub db_path: PathBuf,
    pub read_only: bool,
    #[serde(default)]
    pub is_rebuild: bool,
}

impl StateDbHandle {
    /// Open a new accessor for the described database.
    ///
    /// The schema is expected to exist already; nothing is created or
    /// migrated. Fails when the database file no longer exists.
    pub async fn connect(&self) -> anyhow::Result<StateDb> {
        let mut db = StateDb::connect_existing(self.db_path.clone(), self.read_only).await?;
        db.set_rebuild(self.is_rebuild);
        Ok(db)
    }
}

impl StateDb {
    /// Describe this database so it can be reopened elsewhere.
    ///
    /// In-memory databases cannot be shared and have no handle.
    pub fn handle(&self) -> anyhow::Result<StateDbHandle> {
        match &self.location {
            Location::Memory => Err(anyhow::anyhow!(
                "in-memory state db cannot be shared across processes"
            )),
            Location::File { path, read_only } => Ok(StateDbHandle {
                db_path: path.clone(),
                read_only: *read_only,
                is_rebuild: self.is_rebuild,
            }),
        }
    }
}
