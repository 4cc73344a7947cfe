//! Keyed operations on vectors kept sorted by a monotonic string id.
//!
//! Ids are compared lexicographically, which matches creation order for
//! every collection the server maintains. Each operation reports whether it
//! changed anything so callers can skip change notifications for no-ops.

use std::collections::HashMap;

use tether_types::{
    AskUserRequest, FileDiff, Message, Part, PermissionRequest, PlanReviewRequest, Project,
    Session, Todo,
};

pub trait Keyed {
    fn key(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Search {
    pub found: bool,
    pub index: usize,
}

/// Binary search by key. When absent, `index` is the insertion point that
/// keeps the vector sorted.
pub fn search<T: Keyed>(items: &[T], id: &str) -> Search {
    match items.binary_search_by(|item| item.key().cmp(id)) {
        Ok(index) => Search { found: true, index },
        Err(index) => Search {
            found: false,
            index,
        },
    }
}

pub fn get<'a, T: Keyed>(items: &'a [T], id: &str) -> Option<&'a T> {
    let hit = search(items, id);
    hit.found.then(|| &items[hit.index])
}

/// Replaces the entry with the same key in place, or splices the item in at
/// its sorted position. Returns `false` when an identical entry was already
/// present.
pub fn upsert<T: Keyed + PartialEq>(items: &mut Vec<T>, item: T) -> bool {
    let hit = search(items, item.key());
    if hit.found {
        if items[hit.index] == item {
            return false;
        }
        items[hit.index] = item;
    } else {
        items.insert(hit.index, item);
    }
    true
}

pub fn remove<T: Keyed>(items: &mut Vec<T>, id: &str) -> Option<T> {
    let hit = search(items, id);
    hit.found.then(|| items.remove(hit.index))
}

/// Makes `items` equal to `next`, keeping `next`'s order. Entries are
/// matched by key, so an existing entry that compares equal to its
/// replacement is kept even when inserts or removals shift its position.
pub fn reconcile<T: Keyed + PartialEq>(items: &mut Vec<T>, next: Vec<T>) -> bool {
    if items.len() == next.len() && items.iter().zip(&next).all(|(a, b)| a == b) {
        return false;
    }

    let mut previous: HashMap<String, T> = items
        .drain(..)
        .map(|item| (item.key().to_string(), item))
        .collect();
    items.extend(next.into_iter().map(|item| match previous.remove(item.key()) {
        Some(kept) if kept == item => kept,
        _ => item,
    }));
    true
}

/// Sorts by key and keeps only the last entry for each key, so
/// server-provided lists satisfy the same invariants as upserted ones.
pub fn sorted_unique<T: Keyed>(items: Vec<T>) -> Vec<T> {
    let mut indexed: Vec<(usize, T)> = items.into_iter().enumerate().collect();
    indexed.sort_by(|(ia, a), (ib, b)| a.key().cmp(b.key()).then(ib.cmp(ia)));
    indexed.dedup_by(|(_, later), (_, kept)| later.key() == kept.key());
    indexed.into_iter().map(|(_, item)| item).collect()
}

macro_rules! keyed_by_id {
    ($($ty:ty),* $(,)?) => {
        $(impl Keyed for $ty {
            fn key(&self) -> &str {
                &self.id
            }
        })*
    };
}

keyed_by_id!(
    Session,
    Message,
    Part,
    Project,
    Todo,
    PermissionRequest,
    AskUserRequest,
    PlanReviewRequest,
);

impl Keyed for FileDiff {
    fn key(&self) -> &str {
        &self.file
    }
}
