//! Domain indices: event-driven lookup structures rebuilt by replaying a stream.

use std::any::{self, Any};
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::errors::IndexError;
use crate::event::Event;

/// Receives every persisted event, in append order.
///
/// `apply_event` takes `&self`; indices keep their state behind interior
/// mutability so a cache can be shared across tasks.
pub trait DomainIndex: Any + Send + Sync {
    /// Updates the index with one event.
    fn apply_event(&self, event: &Event) -> Result<(), IndexError>;

    /// Name used in diagnostics.
    fn name(&self) -> &str {
        any::type_name::<Self>()
    }

    /// Upcast used for typed lookup.
    fn as_any(&self) -> &dyn Any;
}

/// Ordered collection of domain indices.
///
/// A failing index is logged and skipped; the remaining indices still see
/// the event.
#[derive(Default, Clone)]
pub struct InMemoryCache {
    indices: Vec<Arc<dyn DomainIndex>>,
}

impl InMemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an index. Indices are notified in the order they were added.
    #[must_use]
    pub fn with_index(mut self, index: impl DomainIndex) -> Self {
        self.indices.push(Arc::new(index));
        self
    }

    /// Adds a shared index.
    #[must_use]
    pub fn with_shared_index(mut self, index: Arc<dyn DomainIndex>) -> Self {
        self.indices.push(index);
        self
    }

    /// Forwards `event` to every index.
    pub fn apply_event(&self, event: &Event) {
        for index in &self.indices {
            if let Err(error) = index.apply_event(event) {
                warn!(
                    index = index.name(),
                    event = event.kind_name(),
                    resource_type = %event.resource_type_name,
                    entity_id = event.entity_id,
                    %error,
                    "domain index failed to apply event"
                );
            }
        }
    }

    /// The first index of type `T`.
    pub fn index<T: DomainIndex>(&self) -> Option<&T> {
        self.indices
            .iter()
            .find_map(|index| index.as_any().downcast_ref::<T>())
    }

    /// Number of indices.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether the cache holds no index.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

impl fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.indices.iter().map(|index| index.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::resource::ResourceTypeRegistry;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use tracing_test::traced_test;

    struct Widget;

    #[derive(Default)]
    struct LiveIds {
        ids: Mutex<BTreeSet<i32>>,
    }

    impl DomainIndex for LiveIds {
        fn apply_event(&self, event: &Event) -> Result<(), IndexError> {
            match event.kind {
                EventKind::Created => {
                    let _ = self.ids.lock().insert(event.entity_id);
                }
                EventKind::Deleted => {
                    let _ = self.ids.lock().remove(&event.entity_id);
                }
                EventKind::PropertyChanged(_) => {}
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct AlwaysFails;

    impl DomainIndex for AlwaysFails {
        fn apply_event(&self, _event: &Event) -> Result<(), IndexError> {
            Err(IndexError::Rejected("unsupported".to_string()))
        }

        fn name(&self) -> &str {
            "always-fails"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    #[traced_test]
    fn failing_indices_do_not_block_the_others() {
        // Given
        let registry = ResourceTypeRegistry::new();
        let widgets = registry.register::<Widget>("Widget", None).unwrap();
        let cache = InMemoryCache::new()
            .with_index(AlwaysFails)
            .with_index(LiveIds::default());

        // When
        cache.apply_event(&Event::created(&widgets, 1, "u"));
        cache.apply_event(&Event::created(&widgets, 2, "u"));
        cache.apply_event(&Event::deleted(&widgets, 1, "u"));

        // Then
        let ids = cache.index::<LiveIds>().unwrap().ids.lock().clone();
        assert_eq!(ids, BTreeSet::from([2]));
        assert!(logs_contain("domain index failed to apply event"));
        assert!(logs_contain("always-fails"));
    }

    #[test]
    fn index_lookup_returns_none_for_missing_types() {
        let cache = InMemoryCache::new().with_index(AlwaysFails);
        assert!(cache.index::<LiveIds>().is_none());
        assert_eq!(cache.len(), 1);
    }
}
