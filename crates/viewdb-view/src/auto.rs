//! Views defined by a grouping and a sorting function.

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;
use viewdb_store::{
    AnyObject, BuildContext, Extension, ExtensionState, StoreError, StoreResult,
};
use viewdb_types::EntityId;

use crate::layout::{PersistedLayout, Sorter};
use crate::state::{Grouper, Membership, ViewState};

/// Registration options shared by view kinds.
#[derive(Clone, Debug, Default)]
pub struct ViewOptions {
    /// If set, only rows of these collections are offered to the view.
    pub allowed_collections: Option<HashSet<String>>,
}

impl ViewOptions {
    /// Restrict the view to the given collections.
    pub fn allow<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_collections: Some(collections.into_iter().map(Into::into).collect()),
        }
    }
}

type Grouping<T> = dyn Fn(&str, &str, &T) -> Option<String> + Send + Sync;
type Sorting<T> = dyn Fn(&T, &T) -> Ordering + Send + Sync;

/// A named, incrementally maintained ordering over records of type `T`.
///
/// `grouping` maps `(collection, key, record)` to a group label, or `None`
/// to leave the record out. `sorting` must be a total order within a group.
/// Records of any other type are never members.
pub struct AutoView<T> {
    grouping: Arc<Grouping<T>>,
    sorting: Arc<Sorting<T>>,
    tag: String,
    options: ViewOptions,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> AutoView<T> {
    pub fn new<G, S>(grouping: G, sorting: S, tag: impl Into<String>) -> Self
    where
        G: Fn(&str, &str, &T) -> Option<String> + Send + Sync + 'static,
        S: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        Self {
            grouping: Arc::new(grouping),
            sorting: Arc::new(sorting),
            tag: tag.into(),
            options: ViewOptions::default(),
            _marker: PhantomData,
        }
    }

    pub fn with_options(mut self, options: ViewOptions) -> Self {
        self.options = options;
        self
    }

    fn sorter(&self) -> Sorter {
        let sorting = Arc::clone(&self.sorting);
        Arc::new(move |a: &AnyObject, b: &AnyObject| {
            match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                (Some(a), Some(b)) => sorting(a, b),
                _ => Ordering::Equal,
            }
        })
    }

    fn grouper(&self) -> Grouper {
        let grouping = Arc::clone(&self.grouping);
        Arc::new(move |collection: &str, key: &str, object: &AnyObject| {
            object
                .downcast_ref::<T>()
                .and_then(|value| grouping(collection, key, value))
        })
    }

    fn empty_state(&self) -> ViewState {
        ViewState::new(
            self.sorter(),
            Membership::Grouped {
                grouper: self.grouper(),
                allowed: self.options.allowed_collections.clone().map(Arc::new),
            },
        )
    }

    /// Collections to scan, checking that whitelisted ones hold `T`.
    fn source_collections(&self, ctx: &BuildContext<'_>) -> StoreResult<Vec<String>> {
        let snapshot = ctx.snapshot();
        let Some(allowed) = &self.options.allowed_collections else {
            return Ok(snapshot
                .collections()
                .into_iter()
                .filter(|c| snapshot.schema(c).is_some_and(|s| s.record_type_id() == TypeId::of::<T>()))
                .collect());
        };

        let mut collections: Vec<String> = allowed.iter().cloned().collect();
        collections.sort();
        for collection in &collections {
            if let Some(schema) = snapshot.schema(collection) {
                if schema.record_type_id() != TypeId::of::<T>() {
                    return Err(StoreError::TypeMismatch {
                        collection: collection.clone(),
                        key: "*".into(),
                        reason: format!(
                            "collection {collection} holds {}, view expects {}",
                            schema.type_name(),
                            std::any::type_name::<T>()
                        ),
                    });
                }
            }
        }
        Ok(collections
            .into_iter()
            .filter(|c| snapshot.schema(c).is_some())
            .collect())
    }
}

impl<T: Any + Send + Sync> Extension for AutoView<T> {
    fn kind(&self) -> &'static str {
        "view"
    }

    fn version_tag(&self) -> &str {
        &self.tag
    }

    fn build(&self, ctx: &BuildContext<'_>) -> StoreResult<Box<dyn ExtensionState>> {
        let mut state = self.empty_state();
        let grouper = self.grouper();
        for collection in self.source_collections(ctx)? {
            for (key, object) in ctx.snapshot().objects(&collection)? {
                if let Some(group) = grouper(&collection, &key, &object) {
                    state.layout.insert(
                        group,
                        EntityId::new(collection.as_str(), key),
                        object,
                        &state.sorter,
                    );
                }
            }
        }
        debug!(tag = %self.tag, members = state.layout.len(), "view built");
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
        let mut state = self.empty_state();
        for (group, ids) in persisted.groups {
            for id in ids {
                let Ok(Some(object)) = ctx.snapshot().object(id.collection(), id.key()) else {
                    return Ok(None);
                };
                if !object.is::<T>() {
                    return Ok(None);
                }
                state.layout.push_back(group.clone(), id, object);
            }
        }
        debug!(tag = %self.tag, members = state.layout.len(), "view restored");
        Ok(Some(Box::new(state)))
    }
}
