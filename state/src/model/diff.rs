use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

/// A single field-level difference between two snapshots of a document.
///
/// A side that does not exist at `path` is `None`, which is distinct from a
/// side holding JSON `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonDiff {
    pub diff_type: String,
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

impl JsonDiff {
    pub fn new(
        diff_type: impl Into<String>,
        path: Vec<String>,
        old_value: Option<Value>,
        new_value: Option<Value>,
    ) -> Self {
        Self {
            diff_type: diff_type.into(),
            path,
            old_value,
            new_value,
        }
    }
}

/// A stored diff together with the document it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    /// Document kind, e.g. `XFormInstance` or `stock state`.
    pub kind: String,
    /// Document id. Sub-document diffs encode a path, e.g. `<case_id>/x/y`.
    pub doc_id: String,
    pub json_diff: JsonDiff,
}

#[derive(Debug)]
pub(crate) struct DiffRow {
    kind: String,
    doc_id: String,
    json_diff: String,
}

impl DiffRow {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            kind: row.try_get("kind")?,
            doc_id: row.try_get("doc_id")?,
            json_diff: row.try_get("json_diff")?,
        })
    }
}

impl TryFrom<DiffRow> for Diff {
    type Error = anyhow::Error;

    fn try_from(row: DiffRow) -> std::result::Result<Self, Self::Error> {
        let json_diff = serde_json::from_str(row.json_diff.as_str()).map_err(|err| {
            anyhow::anyhow!("invalid diff for {}/{}: {err}", row.kind, row.doc_id)
        })?;
        Ok(Self {
            kind: row.kind,
            doc_id: row.doc_id,
            json_diff,
        })
    }
}
