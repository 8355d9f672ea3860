use super::*;
use thiserror::Error;

const RESUME_PREFIX: &str = "resume-";
/// Marks a slot whose value was consumed and not saved again.
const RESUME_NOT_ALLOWED: &str = "RESUME NOT ALLOWED";

/// A flow tried to resume, but the previous session consumed its resume
/// state without saving a new one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("previous session did not save resume state for {key}")]
pub struct ResumeError {
    pub key: String,
}

pub(super) fn resume_key(key: &str) -> String {
    format!("{RESUME_PREFIX}{key}")
}

impl StateDb {
    /// Save resume state for `key`, replacing any previous value.
    pub async fn set_resume_state<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> anyhow::Result<()> {
        let value = serde_json::to_string(value)?;
        set_kv(&self.pool, &resume_key(key), value.as_str()).await
    }

    /// Run `body` with the resume state saved for `key`.
    ///
    /// `body` receives `default` when nothing was ever saved. When `body`
    /// succeeds the slot is marked consumed, so the next session must save
    /// state again before it can resume; a value saved by `body` itself is
    /// kept, even when it equals the value `body` received. When `body`
    /// fails nothing is written and its error is returned unchanged, so the
    /// same value is available on the next attempt.
    ///
    /// Returns [`ResumeError`] without running `body` when the slot was
    /// consumed and never saved again. In rebuild mode an existing slot is
    /// ignored and `default` is used.
    pub async fn pop_resume_state<T, R, F>(
        &self,
        key: &str,
        default: T,
        body: F,
    ) -> anyhow::Result<R>
    where
        T: DeserializeOwned,
        F: AsyncFnOnce(T) -> anyhow::Result<R>,
    {
        let resume_key = resume_key(key);
        let stored = sqlx::query("SELECT value, generation FROM key_value WHERE key = ?")
            .bind(resume_key.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| -> anyhow::Result<(String, i64)> {
                Ok((row.try_get("value")?, row.try_get("generation")?))
            })
            .transpose()?;
        match stored {
            None => {
                let result = body(default).await?;
                sqlx::query(
                    r#"
INSERT INTO key_value (key, value)
VALUES (?, ?)
ON CONFLICT(key) DO NOTHING
                    "#,
                )
                .bind(resume_key.as_str())
                .bind(RESUME_NOT_ALLOWED)
                .execute(&self.pool)
                .await?;
                Ok(result)
            }
            Some(_) if self.is_rebuild => {
                debug!("rebuild: ignoring resume state for {key}");
                body(default).await
            }
            Some((value, _)) if value == RESUME_NOT_ALLOWED => Err(ResumeError {
                key: key.to_string(),
            }
            .into()),
            Some((value, generation)) => {
                let resumed = serde_json::from_str(value.as_str())?;
                let result = body(resumed).await?;
                let consumed = sqlx::query(
                    r#"
UPDATE key_value
SET value = ?, generation = generation + 1
WHERE key = ? AND generation = ?
                    "#,
                )
                .bind(RESUME_NOT_ALLOWED)
                .bind(resume_key.as_str())
                .bind(generation)
                .execute(&self.pool)
                .await?
                .rows_affected();
                if consumed == 0 {
                    debug!("keeping resume state for {key} saved while resuming");
                }
                Ok(result)
            }
        }
    }
}
