use super::*;
use futures::Stream;
use futures::TryStreamExt;
use futures::stream;
use std::collections::HashSet;

/// Number of rows fetched per query while iterating unprocessed cases.
const ITER_CHUNK_SIZE: i64 = 1000;

enum Cursor {
    Start,
    After(String),
    Done,
}

impl StateDb {
    /// Merge form counts into the case progress table.
    ///
    /// `total_forms` keeps the largest value ever reported for a case and
    /// `processed_forms` accumulates. Returns the resulting counts of every
    /// case in `records`, in input order, each case listed once.
    pub async fn update_cases(&self, records: &[CaseRecord]) -> anyhow::Result<Vec<CaseForms>> {
        for record in records {
            record.validate()?;
        }
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
INSERT INTO case_forms (case_id, total_forms, processed_forms)
VALUES (?, ?, ?)
ON CONFLICT(case_id) DO UPDATE SET
    total_forms = MAX(total_forms, excluded.total_forms),
    processed_forms = processed_forms + excluded.processed_forms
                "#,
            )
            .bind(record.id.as_str())
            .bind(record.total_forms)
            .bind(record.processed_forms)
            .execute(&mut *tx)
            .await?;
        }

        let mut seen = HashSet::new();
        let mut updated = Vec::with_capacity(records.len());
        for record in records {
            if !seen.insert(record.id.as_str()) {
                continue;
            }
            let row = sqlx::query(
                "SELECT case_id, total_forms, processed_forms FROM case_forms WHERE case_id = ?",
            )
            .bind(record.id.as_str())
            .fetch_one(&mut *tx)
            .await?;
            updated.push(CaseForms::try_from_row(&row)?);
        }
        tx.commit().await?;
        Ok(updated)
    }

    /// Add processed form counts to cases that are already tracked.
    ///
    /// Unknown cases are not created; they are reported as
    /// `(case_id, None, None)`.
    pub async fn add_processed_forms(
        &self,
        cases: &[(&str, i64)],
    ) -> anyhow::Result<Vec<(String, Option<i64>, Option<i64>)>> {
        if let Some((case_id, delta)) = cases.iter().find(|(_, delta)| *delta < 0) {
            anyhow::bail!("negative processed form count for case {case_id}: {delta}");
        }
        let mut tx = self.pool.begin().await?;
        for (case_id, delta) in cases {
            sqlx::query(
                "UPDATE case_forms SET processed_forms = processed_forms + ? WHERE case_id = ?",
            )
            .bind(*delta)
            .bind(*case_id)
            .execute(&mut *tx)
            .await?;
        }

        let mut seen = HashSet::new();
        let mut updated = Vec::with_capacity(cases.len());
        for (case_id, _) in cases {
            if !seen.insert(*case_id) {
                continue;
            }
            let row = sqlx::query(
                "SELECT case_id, total_forms, processed_forms FROM case_forms WHERE case_id = ?",
            )
            .bind(*case_id)
            .fetch_optional(&mut *tx)
            .await?;
            match row {
                Some(row) => {
                    let case = CaseForms::try_from_row(&row)?;
                    updated.push((
                        case.case_id,
                        Some(case.total_forms),
                        Some(case.processed_forms),
                    ));
                }
                None => updated.push(((*case_id).to_string(), None, None)),
            }
        }
        tx.commit().await?;
        Ok(updated)
    }

    /// Stream `(case_id, total_forms)` for every case with fewer processed
    /// forms than total forms, ordered by case id.
    ///
    /// Rows are fetched lazily in batches. Each call starts a new scan.
    pub fn iter_cases_with_unprocessed_forms(
        &self,
    ) -> impl Stream<Item = anyhow::Result<(String, i64)>> + '_ {
        stream::try_unfold(Cursor::Start, move |cursor| self.unprocessed_batch(cursor))
            .map_ok(|batch| stream::iter(batch.into_iter().map(anyhow::Ok)))
            .try_flatten()
    }

    async fn unprocessed_batch(
        &self,
        cursor: Cursor,
    ) -> anyhow::Result<Option<(Vec<(String, i64)>, Cursor)>> {
        let query = match cursor {
            Cursor::Done => return Ok(None),
            Cursor::Start => sqlx::query(
                r#"
SELECT case_id, total_forms
FROM case_forms
WHERE processed_forms < total_forms
ORDER BY case_id
LIMIT ?
                "#,
            )
            .bind(ITER_CHUNK_SIZE),
            Cursor::After(last_case_id) => sqlx::query(
                r#"
SELECT case_id, total_forms
FROM case_forms
WHERE processed_forms < total_forms AND case_id > ?
ORDER BY case_id
LIMIT ?
                "#,
            )
            .bind(last_case_id)
            .bind(ITER_CHUNK_SIZE),
        };
        let rows = query.fetch_all(&self.pool).await?;
        let batch = rows
            .iter()
            .map(|row| -> anyhow::Result<(String, i64)> {
                Ok((row.try_get("case_id")?, row.try_get("total_forms")?))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let next = match batch.last() {
            None => return Ok(None),
            Some((case_id, _)) if batch.len() as i64 == ITER_CHUNK_SIZE => {
                Cursor::After(case_id.clone())
            }
            Some(_) => Cursor::Done,
        };
        Ok(Some((batch, next)))
    }

    /// Total forms known for `case_id`, or 0 for an unknown case.
    pub async fn get_forms_count(&self, case_id: &str) -> anyhow::Result<i64> {
        let total: Option<i64> =
            sqlx::query_scalar("SELECT total_forms FROM case_forms WHERE case_id = ?")
                .bind(case_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(total.unwrap_or(0))
    }
}
