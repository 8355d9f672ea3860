use anyhow::Result;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

/// Form counts reported by the migration driver for one case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseRecord {
    /// The case identifier.
    pub id: String,
    /// Number of forms known to update the case.
    pub total_forms: i64,
    /// Number of forms updating the case that have been processed since the
    /// last report.
    pub processed_forms: i64,
}

impl CaseRecord {
    pub fn new(id: impl Into<String>, total_forms: i64, processed_forms: i64) -> Self {
        Self {
            id: id.into(),
            total_forms,
            processed_forms,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.total_forms < 0 || self.processed_forms < 0 {
            anyhow::bail!(
                "negative form count for case {}: total={} processed={}",
                self.id,
                self.total_forms,
                self.processed_forms
            );
        }
        Ok(())
    }
}

/// Persisted progress of a single case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CaseForms {
    pub case_id: String,
    pub total_forms: i64,
    pub processed_forms: i64,
}

impl CaseForms {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            case_id: row.try_get("case_id")?,
            total_forms: row.try_get("total_forms")?,
            processed_forms: row.try_get("processed_forms")?,
        })
    }

    pub fn has_unprocessed_forms(&self) -> bool {
        self.processed_forms < self.total_forms
    }
}

impl From<CaseForms> for (String, i64, i64) {
    fn from(value: CaseForms) -> Self {
        (value.case_id, value.total_forms, value.processed_forms)
    }
}
