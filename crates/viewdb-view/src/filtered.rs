//! Views that narrow an existing view with a predicate.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;
use viewdb_store::{AnyObject, BuildContext, Extension, ExtensionState, StoreError, StoreResult};

use crate::layout::PersistedLayout;
use crate::state::{Filter, Membership, ViewState};

type Filtering<T> = dyn Fn(&str, &str, &str, &T) -> bool + Send + Sync;

/// A subset of a parent view, in the parent's order.
///
/// `filtering` receives `(group, collection, key, record)` and is re-run
/// only for the record a write touched. The parent may itself be filtered.
pub struct FilteredView<T> {
    parent: String,
    filtering: Arc<Filtering<T>>,
    tag: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> FilteredView<T> {
    pub fn new<F>(parent: impl Into<String>, filtering: F, tag: impl Into<String>) -> Self
    where
        F: Fn(&str, &str, &str, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            parent: parent.into(),
            filtering: Arc::new(filtering),
            tag: tag.into(),
            _marker: PhantomData,
        }
    }

    fn filter(&self) -> Filter {
        let filtering = Arc::clone(&self.filtering);
        Arc::new(
            move |group: &str, collection: &str, key: &str, object: &AnyObject| {
                object
                    .downcast_ref::<T>()
                    .is_some_and(|value| filtering(group, collection, key, value))
            },
        )
    }

    fn parent_state<'a>(&self, ctx: &BuildContext<'a>) -> StoreResult<&'a ViewState> {
        ctx.upstream()
            .state::<ViewState>(&self.parent)
            .ok_or_else(|| StoreError::ExtensionNotFound(self.parent.clone()))
    }

    fn empty_state(&self, parent: &ViewState) -> ViewState {
        ViewState::new(
            Arc::clone(&parent.sorter),
            Membership::Filtered {
                parent: self.parent.clone(),
                filter: self.filter(),
            },
        )
    }
}

impl<T: Any + Send + Sync> Extension for FilteredView<T> {
    fn kind(&self) -> &'static str {
        "filtered-view"
    }

    fn version_tag(&self) -> &str {
        &self.tag
    }

    fn parent(&self) -> Option<&str> {
        Some(self.parent.as_str())
    }

    fn build(&self, ctx: &BuildContext<'_>) -> StoreResult<Box<dyn ExtensionState>> {
        let parent = self.parent_state(ctx)?;
        let filter = self.filter();
        let mut state = self.empty_state(parent);
        for (group, entries) in parent.layout.groups() {
            for entry in entries.iter() {
                if filter(group, entry.id.collection(), entry.id.key(), &entry.object) {
                    state
                        .layout
                        .push_back(group.clone(), entry.id.clone(), Arc::clone(&entry.object));
                }
            }
        }
        debug!(
            parent = %self.parent,
            tag = %self.tag,
            members = state.layout.len(),
            "filtered view built"
        );
        Ok(Box::new(state))
    }

    fn restore(
        &self,
        ctx: &BuildContext<'_>,
        persisted: &[u8],
    ) -> StoreResult<Option<Box<dyn ExtensionState>>> {
        let Ok(persisted) = bincode::deserialize::<PersistedLayout>(persisted) else {
            return Ok(None);
        };
        let parent = self.parent_state(ctx)?;
        let mut state = self.empty_state(parent);
        for (group, ids) in persisted.groups {
            for id in ids {
                let Some((parent_group, object)) = parent.layout.member(&id) else {
                    return Ok(None);
                };
                if parent_group != &group {
                    return Ok(None);
                }
                state.layout.push_back(group.clone(), id, Arc::clone(object));
            }
        }
        debug!(parent = %self.parent, tag = %self.tag, "filtered view restored");
        Ok(Some(Box::new(state)))
    }
}
