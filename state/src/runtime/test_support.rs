#[cfg(test)]
use std::path::Path;

#[cfg(test)]
use serde_json::json;
#[cfg(test)]
use tempfile::TempDir;

#[cfg(test)]
use crate::JsonDiff;

/// Temporary state directory removed when dropped.
#[cfg(test)]
pub(super) struct TestStateDir {
    dir: TempDir,
}

#[cfg(test)]
impl TestStateDir {
    pub(super) fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create state dir"),
        }
    }

    pub(super) fn path(&self) -> &Path {
        self.dir.path()
    }
}

#[cfg(test)]
pub(super) fn make_diff(id: usize) -> JsonDiff {
    JsonDiff::new(
        "type",
        vec!["path".to_string(), id.to_string()],
        Some(json!(format!("old{id}"))),
        Some(json!(format!("new{id}"))),
    )
}
