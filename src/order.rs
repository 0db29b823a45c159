//! Stable processing order over listed items.
//!
//! Listing APIs paginate and reorder freely between calls, so the engine never trusts
//! the order it receives. Items sort by `(last_modified, id)` ascending; an item without
//! a timestamp sorts before every timestamped item, which reduces to plain id order when
//! no item carries one. Ids compare as raw strings. Copies of one id that agree on the
//! timestamp are ordered by size, then by their payload as compact JSON.

use std::collections::HashSet;

use crate::model::{ItemMetadata, ListFilters};

/// Sort `items` deterministically and drop repeated ids.
///
/// Repeated ids are further ordered by size and payload, so the survivor does not
/// depend on the order they were listed in.
pub fn deterministic_order(mut items: Vec<ItemMetadata>) -> Vec<ItemMetadata> {
    items.sort_by_cached_key(|item| {
        (
            item.last_modified,
            item.id.clone(),
            item.size,
            item.payload.to_string(),
        )
    });

    let mut seen = HashSet::with_capacity(items.len());
    items.retain(|item| {
        let fresh = seen.insert(item.id.clone());
        if !fresh {
            log::warn!(target: "engine::order", "Dropping repeated item id: {}", item.id);
        }
        fresh
    });

    items
}

/// Re-apply the request filters to an already ordered list.
pub fn apply_filters(mut items: Vec<ItemMetadata>, filters: &ListFilters) -> Vec<ItemMetadata> {
    if let Some(cutoff) = filters.modified_after {
        items.retain(|item| item.last_modified.is_none_or(|ts| ts >= cutoff));
    }
    if let Some(max) = filters.max_items {
        items.truncate(max);
    }
    items
}
