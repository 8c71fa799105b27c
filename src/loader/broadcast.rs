//! Column broadcasting.

use std::collections::BTreeMap;

use crate::load::{LoadError, LoadResult};
use crate::value::Value;

/// Align a set of named columns to one common length.
///
/// Singleton columns are replicated to the length of the non-singleton
/// ones; two non-singleton columns of different lengths are an error. An
/// all-singleton set stays at length one.
pub fn broadcast(
    columns: BTreeMap<String, Vec<Value>>,
) -> LoadResult<(usize, BTreeMap<String, Vec<Value>>)> {
    let mut target = 1usize;
    for values in columns.values() {
        if values.len() != 1 {
            if target != 1 && values.len() != target {
                return Err(LoadError::BroadcastMismatch(target, values.len()));
            }
            target = values.len();
        }
    }

    let mut out = BTreeMap::new();
    for (name, values) in columns {
        let values = if values.len() == target {
            values
        } else {
            // values.len() == 1 here; mismatches were rejected above.
            vec![values[0].clone(); target]
        };
        out.insert(name, values);
    }
    Ok((target, out))
}
