use super::*;
use crate::json_diff::json_diff;
use crate::model::DiffRow;
use serde_json::Value;
use sqlx::Sqlite;
use sqlx::Transaction;
use std::collections::BTreeMap;

const DEFAULT_FORM_KIND: &str = "XFormInstance";

impl StateDb {
    /// Append `diffs` to those already stored for `(kind, doc_id)`.
    pub async fn add_diffs(
        &self,
        kind: &str,
        doc_id: &str,
        diffs: &[JsonDiff],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_diffs(&mut tx, kind, doc_id, diffs).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replace every diff stored for `(kind, doc_id)` with `diffs`.
    ///
    /// Readers observe either the old or the new set, never an empty one in
    /// between.
    pub async fn replace_case_diffs(
        &self,
        kind: &str,
        doc_id: &str,
        diffs: &[JsonDiff],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        delete_diffs(&mut tx, kind, doc_id).await?;
        insert_diffs(&mut tx, kind, doc_id, diffs).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Diff two snapshots of a form and store the result.
    ///
    /// The kind comes from the old snapshot's `doc_type`. The id comes from
    /// the new snapshot's `_id`, or the old one's when the new snapshot has
    /// none. When the snapshots are equal every stored diff for the form is
    /// removed.
    pub async fn save_form_diffs(
        &self,
        old_doc: &Value,
        new_doc: &Value,
        replace: bool,
    ) -> anyhow::Result<()> {
        let kind = old_doc
            .get("doc_type")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_FORM_KIND);
        let doc_id = new_doc
            .get("_id")
            .or_else(|| old_doc.get("_id"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("cannot save diffs for {kind} without an _id"))?;
        let diffs = json_diff(old_doc, new_doc);
        debug!("saving {} diffs for {kind} {doc_id}", diffs.len());

        let mut tx = self.pool.begin().await?;
        if replace || diffs.is_empty() {
            delete_diffs(&mut tx, kind, doc_id).await?;
        }
        insert_diffs(&mut tx, kind, doc_id, &diffs).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Every stored diff, in insertion order.
    pub async fn get_diffs(&self) -> anyhow::Result<Vec<Diff>> {
        let rows = sqlx::query("SELECT kind, doc_id, json_diff FROM diff ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| DiffRow::try_from_row(row).and_then(Diff::try_from))
            .collect()
    }

    /// Number of stored diffs per document kind.
    pub async fn get_diff_stats(&self) -> anyhow::Result<BTreeMap<String, i64>> {
        let rows = sqlx::query("SELECT kind, COUNT(*) AS n FROM diff GROUP BY kind")
            .fetch_all(&self.pool)
            .await?;
        let mut stats: BTreeMap<String, i64> = BTreeMap::new();
        for row in rows {
            stats.insert(row.try_get("kind")?, row.try_get("n")?);
        }
        Ok(stats)
    }
}

async fn delete_diffs(
    tx: &mut Transaction<'_, Sqlite>,
    kind: &str,
    doc_id: &str,
) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM diff WHERE kind = ? AND doc_id = ?")
        .bind(kind)
        .bind(doc_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_diffs(
    tx: &mut Transaction<'_, Sqlite>,
    kind: &str,
    doc_id: &str,
    diffs: &[JsonDiff],
) -> anyhow::Result<()> {
    for diff in diffs {
        let json_diff = serde_json::to_string(diff)?;
        sqlx::query("INSERT INTO diff (kind, doc_id, json_diff) VALUES (?, ?, ?)")
            .bind(kind)
            .bind(doc_id)
            .bind(json_diff)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::make_diff;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn diff(kind: &str, doc_id: &str, id: usize) -> Diff {
        Diff {
            kind: kind.to_string(),
            doc_id: doc_id.to_string(),
            json_diff: make_diff(id),
        }
    }

    fn form(name: &str) -> Value {
        json!({"doc_type": "XFormInstance", "_id": "test", "name": name})
    }

    #[tokio::test]
    async fn replace_case_diffs_leaves_other_docs_untouched() {
        let db = StateDb::init_in_memory().await.expect("init");
        let case_id = "865413246874321";
        let ledger_x = format!("{case_id}/x/y");
        let ledger_y = format!("{case_id}/y/z");
        db.replace_case_diffs("CommCareCase", case_id, &[make_diff(0)])
            .await
            .expect("replace");
        db.replace_case_diffs("CommCareCase", "unaffected", &[make_diff(1)])
            .await
            .expect("replace");
        db.add_diffs("stock state", &ledger_x, &[make_diff(2)])
            .await
            .expect("add");
        db.add_diffs("stock state", "unaffected/x/y", &[make_diff(3)])
            .await
            .expect("add");

        db.replace_case_diffs("CommCareCase", case_id, &[make_diff(4)])
            .await
            .expect("replace");
        db.add_diffs("stock state", &ledger_y, &[make_diff(5)])
            .await
            .expect("add");

        let expected = vec![
            diff("CommCareCase", "unaffected", 1),
            diff("stock state", &ledger_x, 2),
            diff("stock state", "unaffected/x/y", 3),
            diff("CommCareCase", case_id, 4),
            diff("stock state", &ledger_y, 5),
        ];
        assert_eq!(db.get_diffs().await.expect("diffs"), expected);
    }

    #[tokio::test]
    async fn save_form_diffs_appends_or_replaces() {
        let db = StateDb::init_in_memory().await.expect("init");
        db.save_form_diffs(&form("a"), &form("b"), false)
            .await
            .expect("save");
        db.save_form_diffs(&form("a"), &form("c"), false)
            .await
            .expect("save");
        assert_eq!(db.get_diffs().await.expect("diffs").len(), 2);

        db.save_form_diffs(&form("a"), &form("d"), true)
            .await
            .expect("save");
        let diffs = db.get_diffs().await.expect("diffs");
        assert_eq!(diffs.len(), 1);
        assert_eq!(
            diffs[0].json_diff.new_value,
            Some(json!("d")),
            "{:?}",
            diffs[0]
        );

        db.save_form_diffs(&form("a"), &form("a"), true)
            .await
            .expect("save");
        assert_eq!(db.get_diffs().await.expect("diffs"), Vec::new());
    }

    #[tokio::test]
    async fn save_form_diffs_without_changes_clears_stale_diffs() {
        let db = StateDb::init_in_memory().await.expect("init");
        db.save_form_diffs(&form("a"), &form("b"), false)
            .await
            .expect("save");
        db.save_form_diffs(&form("a"), &form("a"), false)
            .await
            .expect("save");
        assert_eq!(db.get_diffs().await.expect("diffs"), Vec::new());
    }

    #[tokio::test]
    async fn save_form_diffs_falls_back_to_old_id() {
        let db = StateDb::init_in_memory().await.expect("init");
        db.save_form_diffs(
            &json!({"doc_type": "XFormArchived", "_id": "form"}),
            &json!({}),
            false,
        )
        .await
        .expect("save");
        let keys: BTreeSet<(String, String)> = db
            .get_diffs()
            .await
            .expect("diffs")
            .into_iter()
            .map(|diff| (diff.kind, diff.doc_id))
            .collect();
        assert_eq!(
            keys,
            BTreeSet::from([("XFormArchived".to_string(), "form".to_string())])
        );

        db.save_form_diffs(&json!({}), &json!({"name": "x"}), false)
            .await
            .expect_err("no id");
    }

    #[tokio::test]
    async fn diff_stats_count_by_kind() {
        let db = StateDb::init_in_memory().await.expect("init");
        db.add_diffs("CommCareCase", "a", &[make_diff(0), make_diff(1)])
            .await
            .expect("add");
        db.add_diffs("XFormInstance", "f", &[make_diff(2)])
            .await
            .expect("add");
        assert_eq!(
            db.get_diff_stats().await.expect("stats"),
            BTreeMap::from([
                ("CommCareCase".to_string(), 2),
                ("XFormInstance".to_string(), 1),
            ])
        );
    }
}
