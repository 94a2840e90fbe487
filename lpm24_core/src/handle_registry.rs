//! Process-wide directory of named tables.

use crate::{errors::Error, LpmTable};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::Arc;

static REGISTRY: Lazy<DashMap<String, Arc<LpmTable>>> = Lazy::new(DashMap::new);

/// Publish `table` under its name.
pub fn register(table: Arc<LpmTable>) -> Result<(), Error> {
    match REGISTRY.entry(table.name().to_owned()) {
        Entry::Occupied(_) => Err(Error::AlreadyExists),
        Entry::Vacant(slot) => {
            slot.insert(table);
            Ok(())
        }
    }
}

pub fn find(name: &str) -> Option<Arc<LpmTable>> {
    REGISTRY.get(name).map(|e| Arc::clone(e.value()))
}

pub fn contains(name: &str) -> bool {
    REGISTRY.contains_key(name)
}

/// Remove `table`'s entry, but only if the name still refers to this very
/// table and not to a newer one created under the same name.
pub fn unregister(table: &Arc<LpmTable>) -> bool {
    REGISTRY
        .remove_if(table.name(), |_, current| Arc::ptr_eq(current, table))
        .is_some()
}

/// Names of all registered tables, in no particular order.
pub fn names() -> Vec<String> {
    REGISTRY.iter().map(|e| e.key().clone()).collect()
}
