mod case_forms;
mod counts;
mod diff;

pub use case_forms::CaseForms;
pub use case_forms::CaseRecord;
pub use counts::Counts;
pub use diff::Diff;
pub use diff::JsonDiff;

pub(crate) use diff::DiffRow;
