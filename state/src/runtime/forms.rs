use super::*;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::PoisonError;

/// Lazily loaded copy of an id table.
///
/// Only writes made through the owning `StateDb` invalidate the copy.
#[derive(Debug, Default)]
pub(super) struct IdSetCache {
    ids: Mutex<Option<BTreeSet<String>>>,
}

impl IdSetCache {
    fn get(&self) -> Option<BTreeSet<String>> {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, ids: BTreeSet<String>) {
        *self.ids.lock().unwrap_or_else(PoisonError::into_inner) = Some(ids);
    }

    fn invalidate(&self) {
        *self.ids.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormSet {
    /// Error forms with a normal doc type, migrated with unprocessed forms.
    Problem,
    /// Forms that touch cases without changing them.
    NoActionCase,
}

impl FormSet {
    const fn insert_sql(self) -> &'static str {
        match self {
            FormSet::Problem => {
                "INSERT INTO problem_form (id) VALUES (?) ON CONFLICT(id) DO NOTHING"
            }
            FormSet::NoActionCase => {
                "INSERT INTO no_action_case_form (id) VALUES (?) ON CONFLICT(id) DO NOTHING"
            }
        }
    }

    const fn select_sql(self) -> &'static str {
        match self {
            FormSet::Problem => "SELECT id FROM problem_form",
            FormSet::NoActionCase => "SELECT id FROM no_action_case_form",
        }
    }
}

impl StateDb {
    /// Flag a form to be migrated together with unprocessed forms.
    ///
    /// Adding a form twice is a no-op.
    pub async fn add_problem_form(&self, form_id: &str) -> anyhow::Result<()> {
        self.add_form(FormSet::Problem, form_id).await
    }

    pub async fn get_problem_forms(&self) -> anyhow::Result<BTreeSet<String>> {
        self.get_forms(FormSet::Problem).await
    }

    /// Record a form that does not act on any of the cases it references.
    ///
    /// Adding a form twice is a no-op.
    pub async fn add_no_action_case_form(&self, form_id: &str) -> anyhow::Result<()> {
        self.add_form(FormSet::NoActionCase, form_id).await
    }

    pub async fn get_no_action_case_forms(&self) -> anyhow::Result<BTreeSet<String>> {
        self.get_forms(FormSet::NoActionCase).await
    }

    fn form_cache(&self, set: FormSet) -> &IdSetCache {
        match set {
            FormSet::Problem => &self.problem_forms,
            FormSet::NoActionCase => &self.no_action_case_forms,
        }
    }

    async fn add_form(&self, set: FormSet, form_id: &str) -> anyhow::Result<()> {
        let result = sqlx::query(set.insert_sql())
            .bind(form_id)
            .execute(&self.pool)
            .await?;
        self.form_cache(set).invalidate();
        if result.rows_affected() == 0 {
            debug!("{set:?} form {form_id} already recorded");
        }
        Ok(())
    }

    async fn get_forms(&self, set: FormSet) -> anyhow::Result<BTreeSet<String>> {
        let cache = self.form_cache(set);
        if let Some(ids) = cache.get() {
            return Ok(ids);
        }
        let ids: Vec<String> = sqlx::query_scalar(set.select_sql())
            .fetch_all(&self.pool)
            .await?;
        let ids: BTreeSet<String> = ids.into_iter().collect();
        cache.store(ids.clone());
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_state_db;
    use crate::runtime::test_support::TestStateDir;
    use pretty_assertions::assert_eq;

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn problem_forms_persist_across_instances() {
        let state = TestStateDir::new();
        let db = init_state_db("test", state.path()).await.expect("init");
        db.add_problem_form("abc").await.expect("add");
        db.close().await;

        let db = init_state_db("test", state.path()).await.expect("init");
        db.add_problem_form("def").await.expect("add");
        assert_eq!(
            db.get_problem_forms().await.expect("problem forms"),
            ids(&["abc", "def"])
        );
        db.close().await;
    }

    #[tokio::test]
    async fn no_action_case_forms_cache_is_cleared_on_add() {
        let state = TestStateDir::new();
        let db = init_state_db("test", state.path()).await.expect("init");
        db.add_no_action_case_form("abc").await.expect("add");
        db.close().await;

        let db = init_state_db("test", state.path()).await.expect("init");
        assert_eq!(
            db.get_no_action_case_forms().await.expect("forms"),
            ids(&["abc"])
        );
        db.add_no_action_case_form("def").await.expect("add");
        assert_eq!(
            db.get_no_action_case_forms().await.expect("forms"),
            ids(&["abc", "def"])
        );
        db.close().await;
    }

    #[tokio::test]
    async fn cache_does_not_observe_other_instances_until_own_write() {
        let state = TestStateDir::new();
        let first = init_state_db("test", state.path()).await.expect("init");
        let second = init_state_db("test", state.path()).await.expect("init");
        assert_eq!(
            first.get_no_action_case_forms().await.expect("forms"),
            ids(&[])
        );

        second.add_no_action_case_form("abc").await.expect("add");
        assert_eq!(
            first.get_no_action_case_forms().await.expect("forms"),
            ids(&[])
        );

        first.add_no_action_case_form("def").await.expect("add");
        assert_eq!(
            first.get_no_action_case_forms().await.expect("forms"),
            ids(&["abc", "def"])
        );
        first.close().await;
        second.close().await;
    }

    #[tokio::test]
    async fn duplicate_forms_are_ignored() {
        let db = StateDb::init_in_memory().await.expect("init");
        db.add_no_action_case_form("abc").await.expect("add");
        db.add_no_action_case_form("abc").await.expect("add again");
        db.add_problem_form("abc").await.expect("add");
        db.add_problem_form("abc").await.expect("add again");
        assert_eq!(
            db.get_no_action_case_forms().await.expect("forms"),
            ids(&["abc"])
        );
        assert_eq!(db.get_problem_forms().await.expect("forms"), ids(&["abc"]));
    }
}
