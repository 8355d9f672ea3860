//! SQLite-backed state for couch-to-SQL migrations.
//!
//! A state database records per-case form progress, diffs between the two
//! representations of each migrated document, counters, missing documents
//! and resumable iteration state, so an interrupted migration can continue
//! exactly where it stopped. The migration driver itself lives elsewhere.

pub mod json_diff;
mod migrations;
mod model;
mod paths;
mod runtime;

pub use model::CaseForms;
pub use model::CaseRecord;
pub use model::Counts;
pub use model::Diff;
pub use model::JsonDiff;
/// Preferred entrypoint: owns the connection pool and in-memory caches.
pub use runtime::StateDb;
pub use runtime::StateDbHandle;

pub use paths::delete_state_db;
pub use paths::init_state_db;
pub use paths::open_state_db;
pub use paths::state_db_path;
pub use runtime::CASEDIFF_KINDS;
pub use runtime::CLONE_MANIFEST;
pub use runtime::CloneScope;
pub use runtime::CloneTable;
pub use runtime::ResumeError;
pub use runtime::STATE_DB_SUFFIX;
