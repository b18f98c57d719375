//! Ordered group storage shared by every view kind.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use viewdb_store::AnyObject;
use viewdb_types::EntityId;

/// Type-erased comparator over the objects of one view.
pub(crate) type Sorter = Arc<dyn Fn(&AnyObject, &AnyObject) -> Ordering + Send + Sync>;

/// One member of a view group.
#[derive(Clone)]
pub struct ViewEntry {
    pub id: EntityId,
    pub object: AnyObject,
}

impl std::fmt::Debug for ViewEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ViewEntry").field(&self.id).finish()
    }
}

/// Groups of entries, each kept sorted by the view's comparator.
///
/// Entries the comparator reports as equal stay in insertion order: new
/// entries go after every equal entry already present.
#[derive(Clone, Default)]
pub(crate) struct ViewLayout {
    groups: im::OrdMap<String, im::Vector<ViewEntry>>,
    members: im::HashMap<EntityId, (String, AnyObject)>,
}

/// Persisted form: the ordered ids of every group.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PersistedLayout {
    pub(crate) groups: BTreeMap<String, Vec<EntityId>>,
}

/// First index whose entry does not satisfy `before`.
fn partition_point<F>(entries: &im::Vector<ViewEntry>, mut before: F) -> usize
where
    F: FnMut(&ViewEntry) -> bool,
{
    let (mut lo, mut hi) = (0, entries.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if before(&entries[mid]) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

impl ViewLayout {
    pub(crate) fn insert(&mut self, group: String, id: EntityId, object: AnyObject, sorter: &Sorter) {
        let mut entries = self.groups.remove(&group).unwrap_or_default();
        let at = partition_point(&entries, |e| sorter(&e.object, &object) != Ordering::Greater);
        entries.insert(
            at,
            ViewEntry {
                id: id.clone(),
                object: Arc::clone(&object),
            },
        );
        self.groups.insert(group.clone(), entries);
        self.members.insert(id, (group, object));
    }

    /// Append to the end of a group. Callers guarantee order.
    pub(crate) fn push_back(&mut self, group: String, id: EntityId, object: AnyObject) {
        let mut entries = self.groups.remove(&group).unwrap_or_default();
        entries.push_back(ViewEntry {
            id: id.clone(),
            object: Arc::clone(&object),
        });
        self.groups.insert(group.clone(), entries);
        self.members.insert(id, (group, object));
    }

    /// Remove `id` from its group. Returns the group and object it had.
    pub(crate) fn remove(&mut self, id: &EntityId, sorter: &Sorter) -> Option<(String, AnyObject)> {
        let (group, object) = self.members.remove(id)?;
        if let Some(index) = self.position_in(&group, id, &object, sorter) {
            if let Some(mut entries) = self.groups.remove(&group) {
                entries.remove(index);
                if !entries.is_empty() {
                    self.groups.insert(group.clone(), entries);
                }
            }
        }
        Some((group, object))
    }

    /// Remove every member stored in `collection`.
    pub(crate) fn remove_collection(&mut self, collection: &str, sorter: &Sorter) -> usize {
        let doomed: Vec<EntityId> = self
            .members
            .keys()
            .filter(|id| id.is_in(collection))
            .cloned()
            .collect();
        for id in &doomed {
            self.remove(id, sorter);
        }
        doomed.len()
    }

    fn position_in(
        &self,
        group: &str,
        id: &EntityId,
        object: &AnyObject,
        sorter: &Sorter,
    ) -> Option<usize> {
        let entries = self.groups.get(group)?;
        let start = partition_point(entries, |e| sorter(&e.object, object) == Ordering::Less);
        let found = entries
            .iter()
            .skip(start)
            .take_while(|e| sorter(&e.object, object) == Ordering::Equal)
            .position(|e| &e.id == id)
            .map(|offset| start + offset);
        // A comparator that is not a total order can hide the entry from the
        // bounded scan.
        found.or_else(|| entries.iter().position(|e| &e.id == id))
    }

    pub(crate) fn member(&self, id: &EntityId) -> Option<&(String, AnyObject)> {
        self.members.get(id)
    }

    pub(crate) fn group(&self, group: &str) -> Option<&im::Vector<ViewEntry>> {
        self.groups.get(group)
    }

    pub(crate) fn groups(&self) -> impl Iterator<Item = (&String, &im::Vector<ViewEntry>)> {
        self.groups.iter()
    }

    pub(crate) fn index_of(&self, id: &EntityId, sorter: &Sorter) -> Option<usize> {
        let (group, object) = self.members.get(id)?;
        self.position_in(group, id, object, sorter)
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn to_persisted(&self) -> PersistedLayout {
        PersistedLayout {
            groups: self
                .groups
                .iter()
                .map(|(group, entries)| {
                    (group.clone(), entries.iter().map(|e| e.id.clone()).collect())
                })
                .collect(),
        }
    }
}
