use super::*;
use std::collections::BTreeMap;

impl StateDb {
    /// Add `delta` to the counter `kind`, creating it at zero first.
    pub async fn increment_counter(&self, kind: &str, delta: i64) -> anyhow::Result<()> {
        if delta < 0 {
            anyhow::bail!("counter increment must be non-negative for {kind}: {delta}");
        }
        sqlx::query(
            r#"
INSERT INTO doc_count (kind, value)
VALUES (?, ?)
ON CONFLICT(kind) DO UPDATE SET value = value + excluded.value
            "#,
        )
        .bind(kind)
        .bind(delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record documents of `kind` that were not found on the SQL side.
    pub async fn add_missing_docs(&self, kind: &str, doc_ids: &[&str]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for doc_id in doc_ids {
            sqlx::query(
                r#"
INSERT INTO missing_doc (kind, doc_id)
VALUES (?, ?)
ON CONFLICT(kind, doc_id) DO NOTHING
                "#,
            )
            .bind(kind)
            .bind(*doc_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Forget a document previously recorded as missing.
    pub async fn doc_not_missing(&self, kind: &str, doc_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM missing_doc WHERE kind = ? AND doc_id = ?")
            .bind(kind)
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_missing_docs(&self, kind: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM missing_doc WHERE kind = ?")
            .bind(kind)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Counter totals and missing document counts for every known kind.
    pub async fn get_doc_counts(&self) -> anyhow::Result<BTreeMap<String, Counts>> {
        let mut counts: BTreeMap<String, Counts> = BTreeMap::new();
        let totals = sqlx::query("SELECT kind, value FROM doc_count")
            .fetch_all(&self.pool)
            .await?;
        for row in totals {
            counts.entry(row.try_get("kind")?).or_default().total = row.try_get("value")?;
        }
        let missing = sqlx::query("SELECT kind, COUNT(*) AS n FROM missing_doc GROUP BY kind")
            .fetch_all(&self.pool)
            .await?;
        for row in missing {
            counts.entry(row.try_get("kind")?).or_default().missing = row.try_get("n")?;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn counters_and_missing_docs() {
        let db = StateDb::init_in_memory().await.expect("init");
        db.increment_counter("abc", 1).await.expect("increment");
        db.add_missing_docs("abc", &["doc1"])
            .await
            .expect("missing");
        db.increment_counter("def", 2).await.expect("increment");
        db.increment_counter("abc", 3).await.expect("increment");
        db.add_missing_docs("abc", &["doc2", "doc4"])
            .await
            .expect("missing");
        db.add_missing_docs("ghi", &["doc1"])
            .await
            .expect("missing");
        assert_eq!(
            db.get_doc_counts().await.expect("counts"),
            BTreeMap::from([
                ("abc".to_string(), Counts::new(4, 3)),
                ("def".to_string(), Counts::new(2, 0)),
                ("ghi".to_string(), Counts::new(0, 1)),
            ])
        );
    }

    #[tokio::test]
    async fn missing_docs_are_a_set() {
        let db = StateDb::init_in_memory().await.expect("init");
        db.add_missing_docs("abc", &["doc1", "doc2"])
            .await
            .expect("missing");
        db.add_missing_docs("abc", &["doc1"])
            .await
            .expect("missing");
        assert_eq!(
            db.get_doc_counts().await.expect("counts")["abc"],
            Counts::new(0, 2)
        );

        db.doc_not_missing("abc", "doc1")
            .await
            .expect("not missing");
        assert_eq!(
            db.get_doc_counts().await.expect("counts")["abc"],
            Counts::new(0, 1)
        );

        db.delete_missing_docs("abc").await.expect("delete");
        assert_eq!(db.get_doc_counts().await.expect("counts").len(), 0);
    }

    #[tokio::test]
    async fn negative_increment_is_rejected() {
        let db = StateDb::init_in_memory().await.expect("init");
        db.increment_counter("abc", -1)
            .await
            .expect_err("negative increment");
    }
}
