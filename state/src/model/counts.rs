/// Aggregate counts reported for one counter name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Sum of all `increment_counter` deltas.
    pub total: i64,
    /// Number of ids in the missing-doc set.
    pub missing: i64,
}

impl Counts {
    pub const fn new(total: i64, missing: i64) -> Self {
        Self { total, missing }
    }
}
