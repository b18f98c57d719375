//! Per-commit change notifications.

use std::collections::{HashMap, HashSet};
use std::fmt;

use viewdb_types::EntityId;

/// How an entity changed within one commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Inserted,
    Updated,
    Removed,
    /// Marked changed without any data modification.
    Touched,
}

impl ChangeKind {
    /// Coalesce a later change into an earlier one for the same entity.
    fn merge(self, later: Self) -> Self {
        use ChangeKind::*;
        match (self, later) {
            (current, Touched) => current,
            (Touched, next) => next,
            (Inserted, Updated) => Inserted,
            (Removed, Inserted) | (Removed, Updated) => Updated,
            (_, next) => next,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inserted => "inserted",
            Self::Updated => "updated",
            Self::Removed => "removed",
            Self::Touched => "touched",
        };
        f.write_str(s)
    }
}

/// One entry of a [`Changeset`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub id: EntityId,
    pub kind: ChangeKind,
}

/// Every entity mutated or touched by one commit, each reported exactly once,
/// in first-touched order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Changeset {
    seq: u64,
    changes: Vec<Change>,
}

impl Changeset {
    /// Commit sequence number this changeset belongs to.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn kind_of(&self, id: &EntityId) -> Option<ChangeKind> {
        self.changes.iter().find(|c| &c.id == id).map(|c| c.kind)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.kind_of(id).is_some()
    }

    /// Changes limited to one collection.
    pub fn in_collection<'a>(&'a self, collection: &'a str) -> impl Iterator<Item = &'a Change> + 'a {
        self.changes.iter().filter(move |c| c.id.is_in(collection))
    }
}

/// Accumulates changes during a write transaction.
///
/// While the transaction runs, an entity inserted and then removed reads as
/// [`ChangeKind::Removed`]. The finished [`Changeset`] leaves it out.
#[derive(Clone, Debug, Default)]
pub struct ChangesetBuilder {
    changes: Vec<Change>,
    positions: HashMap<EntityId, usize>,
    /// Entities that did not exist before this transaction.
    created: HashSet<EntityId>,
}

impl ChangesetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: EntityId, kind: ChangeKind) {
        match self.positions.get(&id) {
            Some(&pos) => {
                let entry = &mut self.changes[pos];
                entry.kind = entry.kind.merge(kind);
                if entry.kind == ChangeKind::Updated && self.created.contains(&entry.id) {
                    entry.kind = ChangeKind::Inserted;
                }
            }
            None => {
                if kind == ChangeKind::Inserted {
                    self.created.insert(id.clone());
                }
                self.positions.insert(id.clone(), self.changes.len());
                self.changes.push(Change { id, kind });
            }
        }
    }

    pub fn kind_of(&self, id: &EntityId) -> Option<ChangeKind> {
        self.positions.get(id).map(|&pos| self.changes[pos].kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn finish(self, seq: u64) -> Changeset {
        let created = self.created;
        let changes = self
            .changes
            .into_iter()
            .filter(|c| !(c.kind == ChangeKind::Removed && created.contains(&c.id)))
            .collect();
        Changeset { seq, changes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(key: &str) -> EntityId {
        EntityId::new("messages", key)
    }

    #[test]
    fn each_entity_reported_once() {
        let mut b = ChangesetBuilder::new();
        b.record(id("a"), ChangeKind::Inserted);
        b.record(id("a"), ChangeKind::Updated);
        b.record(id("a"), ChangeKind::Touched);
        b.record(id("b"), ChangeKind::Touched);
        let cs = b.finish(3);
        assert_eq!(cs.seq(), 3);
        assert_eq!(cs.len(), 2);
        assert_eq!(cs.kind_of(&id("a")), Some(ChangeKind::Inserted));
        assert_eq!(cs.kind_of(&id("b")), Some(ChangeKind::Touched));
    }

    #[test]
    fn touch_is_upgraded_by_real_change() {
        let mut b = ChangesetBuilder::new();
        b.record(id("a"), ChangeKind::Touched);
        b.record(id("a"), ChangeKind::Updated);
        assert_eq!(b.kind_of(&id("a")), Some(ChangeKind::Updated));
    }

    #[test]
    fn remove_then_insert_is_update() {
        let mut b = ChangesetBuilder::new();
        b.record(id("a"), ChangeKind::Removed);
        b.record(id("a"), ChangeKind::Inserted);
        assert_eq!(b.kind_of(&id("a")), Some(ChangeKind::Updated));
    }

    #[test]
    fn insert_then_remove_is_not_reported() {
        let mut b = ChangesetBuilder::new();
        b.record(id("a"), ChangeKind::Inserted);
        b.record(id("a"), ChangeKind::Removed);
        b.record(id("b"), ChangeKind::Removed);
        assert_eq!(b.kind_of(&id("a")), Some(ChangeKind::Removed));

        let cs = b.finish(1);
        assert!(!cs.contains(&id("a")));
        assert_eq!(cs.kind_of(&id("b")), Some(ChangeKind::Removed));
    }

    #[test]
    fn insert_remove_insert_is_insert() {
        let mut b = ChangesetBuilder::new();
        b.record(id("a"), ChangeKind::Inserted);
        b.record(id("a"), ChangeKind::Removed);
        b.record(id("a"), ChangeKind::Inserted);
        assert_eq!(b.finish(1).kind_of(&id("a")), Some(ChangeKind::Inserted));
    }

    #[test]
    fn order_is_first_touched() {
        let mut b = ChangesetBuilder::new();
        b.record(id("z"), ChangeKind::Inserted);
        b.record(EntityId::new("conversations", "c"), ChangeKind::Touched);
        b.record(id("z"), ChangeKind::Updated);
        let cs = b.finish(1);
        let keys: Vec<_> = cs.iter().map(|c| c.id.key().to_string()).collect();
        assert_eq!(keys, vec!["z", "c"]);
        assert_eq!(cs.in_collection("conversations").count(), 1);
    }
}
