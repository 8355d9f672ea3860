use super::*;
use sqlx::Connection;
use sqlx::SqliteConnection;
use tracing::warn;

/// Diff kinds written by the case diff process.
pub const CASEDIFF_KINDS: [&str; 3] = ["CommCareCase", "CommCareCase-Deleted", "stock state"];

const CASEDIFF_SCHEMA: &str = "cddb";

/// How a table takes part in [`StateDb::clone_casediff_data_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneScope {
    /// Every row is replaced by the secondary's rows.
    All,
    /// Rows matching the predicate are replaced. The predicate is applied to
    /// both databases and may refer to the secondary as `cddb`.
    Matching(&'static str),
    /// Owned by the primary database and never copied.
    Excluded,
}

/// One persisted table and its clone behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloneTable {
    pub name: &'static str,
    /// Copied columns; surrogate integer ids are left out.
    pub columns: &'static str,
    pub scope: CloneScope,
}

/// Every table of the state schema. Adding a table to the schema requires an
/// entry here; the schema test fails otherwise.
pub const CLONE_MANIFEST: &[CloneTable] = &[
    CloneTable {
        name: "case_forms",
        columns: "case_id, total_forms, processed_forms",
        scope: CloneScope::All,
    },
    CloneTable {
        name: "diff",
        columns: "kind, doc_id, json_diff",
        scope: CloneScope::Matching(
            "kind IN ('CommCareCase', 'CommCareCase-Deleted', 'stock state')",
        ),
    },
    CloneTable {
        name: "key_value",
        columns: "key, value, generation",
        scope: CloneScope::Matching(
            "key IN (SELECT key FROM cddb.key_value WHERE key LIKE 'resume-%')",
        ),
    },
    CloneTable {
        name: "doc_count",
        columns: "kind, value",
        scope: CloneScope::Matching("kind LIKE '%CommCareCase%'"),
    },
    CloneTable {
        name: "missing_doc",
        columns: "kind, doc_id",
        scope: CloneScope::Matching("kind LIKE '%CommCareCase%'"),
    },
    CloneTable {
        name: "no_action_case_form",
        columns: "id",
        scope: CloneScope::Excluded,
    },
    CloneTable {
        name: "problem_form",
        columns: "id",
        scope: CloneScope::Excluded,
    },
];

impl StateDb {
    /// Copy the case diff data of a secondary state database into this one.
    ///
    /// Case progress, case and stock diffs, case counters, missing cases and
    /// the secondary's resume slots replace their counterparts here. Problem
    /// forms, no-action forms, form diffs, other resume slots and the unique
    /// id of this database are left alone. The copy runs in one transaction.
    pub async fn clone_casediff_data_from(&self, casediff_path: &Path) -> anyhow::Result<()> {
        info!("checking casediff data preconditions...");
        let casediff = StateDb::open(casediff_path).await?;
        let checked = check_casediff_data(&casediff).await;
        casediff.close().await;
        checked?;

        let path = casediff_path.to_str().ok_or_else(|| {
            anyhow::anyhow!("non UTF-8 casediff path: {}", casediff_path.display())
        })?;
        match self.location {
            // The only connection of an in-memory database cannot leave the
            // pool; a stale attachment is dropped by the next clone instead.
            Location::Memory => {
                let mut conn = self.pool.acquire().await?;
                attach_and_copy(&mut conn, path).await?;
            }
            Location::File { .. } => {
                // Detached from the pool: a cancelled clone closes it.
                let mut conn = self.pool.acquire().await?.detach();
                let copied = attach_and_copy(&mut conn, path).await;
                conn.close().await?;
                copied?;
            }
        }
        info!("cloned casediff data from {}", casediff_path.display());
        Ok(())
    }
}

async fn attach_and_copy(conn: &mut SqliteConnection, path: &str) -> anyhow::Result<()> {
    let stale: Option<i64> =
        sqlx::query_scalar("SELECT seq FROM pragma_database_list WHERE name = ?")
            .bind(CASEDIFF_SCHEMA)
            .fetch_optional(&mut *conn)
            .await?;
    if stale.is_some() {
        warn!("detaching stale {CASEDIFF_SCHEMA} database");
        sqlx::query(&format!("DETACH DATABASE {CASEDIFF_SCHEMA}"))
            .execute(&mut *conn)
            .await?;
    }
    sqlx::query(&format!("ATTACH DATABASE ? AS {CASEDIFF_SCHEMA}"))
        .bind(path)
        .execute(&mut *conn)
        .await?;
    let copied = copy_casediff_tables(conn).await;
    let detached = sqlx::query(&format!("DETACH DATABASE {CASEDIFF_SCHEMA}"))
        .execute(&mut *conn)
        .await;
    copied?;
    detached?;
    Ok(())
}

async fn check_casediff_data(casediff: &StateDb) -> anyhow::Result<()> {
    let diff_kinds: Vec<String> = sqlx::query_scalar("SELECT DISTINCT kind FROM diff")
        .fetch_all(&casediff.pool)
        .await?;
    let unexpected: Vec<&String> = diff_kinds
        .iter()
        .filter(|kind| !CASEDIFF_KINDS.contains(&kind.as_str()))
        .collect();
    if !unexpected.is_empty() {
        anyhow::bail!("unexpected casediff diff kinds: {unexpected:?}");
    }

    let resume_keys: Vec<String> =
        sqlx::query_scalar("SELECT key FROM key_value WHERE key LIKE 'resume-%'")
            .fetch_all(&casediff.pool)
            .await?;
    require_all(&resume_keys, "Case", "resume keys")?;

    let count_kinds: Vec<String> = sqlx::query_scalar("SELECT DISTINCT kind FROM doc_count")
        .fetch_all(&casediff.pool)
        .await?;
    require_all(&count_kinds, "CommCareCase", "counter kinds")?;

    let missing_kinds: Vec<String> = sqlx::query_scalar("SELECT DISTINCT kind FROM missing_doc")
        .fetch_all(&casediff.pool)
        .await?;
    require_all(&missing_kinds, "CommCareCase", "missing doc kinds")
}

fn require_all(values: &[String], needle: &str, what: &str) -> anyhow::Result<()> {
    let unexpected: Vec<&String> = values
        .iter()
        .filter(|value| !value.contains(needle))
        .collect();
    if unexpected.is_empty() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("unexpected casediff {what}: {unexpected:?}"))
    }
}

async fn copy_casediff_tables(conn: &mut SqliteConnection) -> anyhow::Result<()> {
    let mut tx = conn.begin().await?;
    for table in CLONE_MANIFEST {
        let filter = match table.scope {
            CloneScope::Excluded => continue,
            CloneScope::All => String::new(),
            CloneScope::Matching(predicate) => format!(" WHERE {predicate}"),
        };
        info!("copying casediff data: {}", table.name);
        let name = table.name;
        let columns = table.columns;
        let delete = format!("DELETE FROM main.{name}{filter}");
        sqlx::query(&delete).execute(&mut *tx).await?;
        let insert = format!(
            "INSERT INTO main.{name} ({columns}) \
             SELECT {columns} FROM {CASEDIFF_SCHEMA}.{name}{filter}"
        );
        sqlx::query(&insert).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}
