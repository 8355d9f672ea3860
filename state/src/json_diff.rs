//! Field-level differences between two JSON document snapshots.
//!
//! List elements are compared pairwise and reported under the `[*]` path
//! segment rather than their index, so a shifted element produces one diff
//! per differing position without leaking positions into the stored path.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::JsonDiff;

/// Both sides hold a value of the same JSON type but different contents.
pub const DIFF: &str = "diff";
/// One side lacks a value present on the other.
pub const MISSING: &str = "missing";
/// The two sides hold values of different JSON types.
pub const TYPE: &str = "type";

const LIST_ITEM: &str = "[*]";

/// Compute the differences between `old` and `new`.
///
/// Returns an empty vector when the documents are equal.
pub fn json_diff(old: &Value, new: &Value) -> Vec<JsonDiff> {
    let mut diffs = Vec::new();
    let mut path = Vec::new();
    diff_values(&mut path, old, new, &mut diffs);
    diffs
}

fn diff_values(path: &mut Vec<String>, old: &Value, new: &Value, diffs: &mut Vec<JsonDiff>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let keys: BTreeSet<&String> = old_map.keys().chain(new_map.keys()).collect();
            for key in keys {
                path.push(key.clone());
                diff_optional(path, old_map.get(key), new_map.get(key), diffs);
                path.pop();
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            path.push(LIST_ITEM.to_string());
            for index in 0..old_items.len().max(new_items.len()) {
                diff_optional(path, old_items.get(index), new_items.get(index), diffs);
            }
            path.pop();
        }
        _ if std::mem::discriminant(old) != std::mem::discriminant(new) => {
            diffs.push(JsonDiff::new(
                TYPE,
                path.clone(),
                Some(old.clone()),
                Some(new.clone()),
            ));
        }
        _ if old != new => {
            diffs.push(JsonDiff::new(
                DIFF,
                path.clone(),
                Some(old.clone()),
                Some(new.clone()),
            ));
        }
        _ => {}
    }
}

fn diff_optional(
    path: &mut Vec<String>,
    old: Option<&Value>,
    new: Option<&Value>,
    diffs: &mut Vec<JsonDiff>,
) {
    match (old, new) {
        (Some(old), Some(new)) => diff_values(path, old, new, diffs),
        (None, None) => {}
        (old, new) => diffs.push(JsonDiff::new(
            MISSING,
            path.clone(),
            old.cloned(),
            new.cloned(),
        )),
    }
}
