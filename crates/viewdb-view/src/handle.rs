//! Read API over a registered view.

use std::any::Any;
use std::sync::Arc;

use viewdb_store::{AnyObject, Reader};
use viewdb_types::EntityId;

use crate::error::{ViewError, ViewResult};
use crate::layout::ViewEntry;
use crate::state::ViewState;

/// Borrowed access to one view inside a read or write transaction.
///
/// Positional lookups are O(log n) in the group size.
#[derive(Clone, Copy)]
pub struct ViewHandle<'a> {
    name: &'a str,
    state: &'a ViewState,
}

impl<'a> ViewHandle<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Number of members in `group`; 0 for an unknown group.
    pub fn count(&self, group: &str) -> usize {
        self.state.layout.group(group).map_or(0, |entries| entries.len())
    }

    /// Number of members across all groups.
    pub fn total_count(&self) -> usize {
        self.state.layout.len()
    }

    /// Non-empty groups, in label order.
    pub fn groups(&self) -> Vec<&'a str> {
        self.state
            .layout
            .groups()
            .map(|(group, _)| group.as_str())
            .collect()
    }

    fn entry_at(&self, index: usize, group: &str) -> Option<&'a ViewEntry> {
        self.state.layout.group(group).and_then(|entries| entries.get(index))
    }

    fn typed<T: Any + Send + Sync>(&self, object: &AnyObject) -> ViewResult<Arc<T>> {
        Arc::clone(object)
            .downcast::<T>()
            .map_err(|_| ViewError::TypeMismatch {
                view: self.name.to_string(),
                requested: std::any::type_name::<T>(),
            })
    }

    /// The member at `index` within `group`.
    pub fn object_at<T: Any + Send + Sync>(&self, index: usize, group: &str) -> ViewResult<Option<Arc<T>>> {
        self.entry_at(index, group)
            .map(|entry| self.typed(&entry.object))
            .transpose()
    }

    pub fn first_object<T: Any + Send + Sync>(&self, group: &str) -> ViewResult<Option<Arc<T>>> {
        self.object_at(0, group)
    }

    /// The greatest member of `group` under the view's sort order.
    pub fn last_object<T: Any + Send + Sync>(&self, group: &str) -> ViewResult<Option<Arc<T>>> {
        match self.count(group) {
            0 => Ok(None),
            n => self.object_at(n - 1, group),
        }
    }

    /// Identity of the member at `index` within `group`.
    pub fn key_at(&self, index: usize, group: &str) -> Option<&'a EntityId> {
        self.entry_at(index, group).map(|entry| &entry.id)
    }

    pub fn group_of(&self, collection: &str, key: &str) -> Option<&'a str> {
        self.state
            .layout
            .member(&EntityId::new(collection, key))
            .map(|(group, _)| group.as_str())
    }

    pub fn index_of(&self, collection: &str, key: &str) -> Option<usize> {
        self.state
            .layout
            .index_of(&EntityId::new(collection, key), &self.state.sorter)
    }

    pub fn contains(&self, collection: &str, key: &str) -> bool {
        self.group_of(collection, key).is_some()
    }

    /// Members of `group` in order.
    pub fn iter_group(&self, group: &str) -> impl Iterator<Item = &'a ViewEntry> + 'a {
        self.state
            .layout
            .group(group)
            .into_iter()
            .flat_map(|entries| entries.iter())
    }

    /// Ids of `group` in order.
    pub fn keys(&self, group: &str) -> Vec<EntityId> {
        self.iter_group(group).map(|entry| entry.id.clone()).collect()
    }

    /// Typed members of `group` in order.
    pub fn objects<T: Any + Send + Sync>(&self, group: &str) -> ViewResult<Vec<Arc<T>>> {
        self.iter_group(group)
            .map(|entry| self.typed(&entry.object))
            .collect()
    }
}

impl std::fmt::Debug for ViewHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewHandle")
            .field("name", &self.name)
            .field("members", &self.total_count())
            .finish()
    }
}

/// View lookup for anything that can read the store.
pub trait ViewAccess: Reader {
    /// The view registered as `name`.
    fn view<'a>(&'a self, name: &'a str) -> ViewResult<ViewHandle<'a>> {
        let state = self
            .extension_state(name)
            .ok_or_else(|| ViewError::NotRegistered(name.to_string()))?;
        let state = state
            .as_any()
            .downcast_ref::<ViewState>()
            .ok_or_else(|| ViewError::NotAView(name.to_string()))?;
        Ok(ViewHandle { name, state })
    }
}

impl<R: Reader + ?Sized> ViewAccess for R {}
