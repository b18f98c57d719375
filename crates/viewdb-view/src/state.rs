use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

use viewdb_store::{AnyObject, ExtensionState, RowChange, StoreError, StoreResult, Upstream};
use viewdb_types::EntityId;

use crate::layout::{Sorter, ViewLayout};

/// Type-erased grouping function: `(collection, key, object) -> group`.
pub(crate) type Grouper = Arc<dyn Fn(&str, &str, &AnyObject) -> Option<String> + Send + Sync>;

/// Type-erased filter predicate: `(group, collection, key, object) -> keep`.
pub(crate) type Filter = Arc<dyn Fn(&str, &str, &str, &AnyObject) -> bool + Send + Sync>;

/// How a view decides membership when a row changes.
#[derive(Clone)]
pub(crate) enum Membership {
    /// Group every matching row with the view's own grouping function.
    Grouped {
        grouper: Grouper,
        allowed: Option<Arc<HashSet<String>>>,
    },
    /// Keep the subset of a parent view's members that pass a predicate.
    Filtered { parent: String, filter: Filter },
}

/// Snapshot state of a view: the ordered groups plus what maintains them.
#[derive(Clone)]
pub struct ViewState {
    pub(crate) layout: ViewLayout,
    pub(crate) sorter: Sorter,
    pub(crate) membership: Membership,
}

impl ViewState {
    pub(crate) fn new(sorter: Sorter, membership: Membership) -> Self {
        Self {
            layout: ViewLayout::default(),
            sorter,
            membership,
        }
    }

    fn apply_grouped(
        &mut self,
        change: &RowChange<'_>,
        grouper: &Grouper,
        allowed: Option<&HashSet<String>>,
    ) {
        if allowed.is_some_and(|allowed| !allowed.contains(change.collection())) {
            return;
        }
        match change {
            RowChange::Upsert { id, object } => {
                self.layout.remove(id, &self.sorter);
                if let Some(group) = grouper(id.collection(), id.key(), object) {
                    self.layout
                        .insert(group, (*id).clone(), Arc::clone(*object), &self.sorter);
                }
            }
            RowChange::Remove { id } => {
                self.layout.remove(id, &self.sorter);
            }
            RowChange::RemoveAll { collection } => {
                self.layout.remove_collection(collection, &self.sorter);
            }
        }
    }

    fn apply_filtered(&mut self, change: &RowChange<'_>, parent: &ViewState, filter: &Filter) {
        match change {
            RowChange::Upsert { id, .. } => {
                self.layout.remove(id, &self.sorter);
                self.admit(id, parent, filter);
            }
            RowChange::Remove { id } => {
                self.layout.remove(id, &self.sorter);
            }
            RowChange::RemoveAll { collection } => {
                self.layout.remove_collection(collection, &self.sorter);
            }
        }
    }

    /// Insert `id` if it is in `parent` and passes `filter`.
    fn admit(&mut self, id: &EntityId, parent: &ViewState, filter: &Filter) {
        if let Some((group, object)) = parent.layout.member(id) {
            if filter(group, id.collection(), id.key(), object) {
                self.layout
                    .insert(group.clone(), id.clone(), Arc::clone(object), &self.sorter);
            }
        }
    }
}

impl ExtensionState for ViewState {
    fn clone_state(&self) -> Box<dyn ExtensionState> {
        Box::new(self.clone())
    }

    fn apply(&mut self, change: &RowChange<'_>, upstream: &Upstream<'_>) -> StoreResult<()> {
        match self.membership.clone() {
            Membership::Grouped { grouper, allowed } => {
                self.apply_grouped(change, &grouper, allowed.as_deref());
            }
            Membership::Filtered { parent, filter } => {
                let parent_state = upstream
                    .state::<ViewState>(&parent)
                    .ok_or_else(|| StoreError::ExtensionNotFound(parent.clone()))?;
                self.apply_filtered(change, parent_state, &filter);
            }
        }
        Ok(())
    }

    fn persist(&self) -> StoreResult<Option<Vec<u8>>> {
        bincode::serialize(&self.layout.to_persisted())
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for ViewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.membership {
            Membership::Grouped { .. } => "grouped".to_string(),
            Membership::Filtered { parent, .. } => format!("filtered({parent})"),
        };
        f.debug_struct("ViewState")
            .field("kind", &kind)
            .field("members", &self.layout.len())
            .finish()
    }
}
