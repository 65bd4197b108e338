//! Per-kind snapshots keyed by reference, and the diff between two of them.

use std::collections::HashMap;

use catsync_core::{CatalogEntry, CatalogService, ResourceReference};

/// A catalog value with a primary key and a monotonic version.
pub trait Versioned: Clone {
    fn reference(&self) -> ResourceReference;
    fn modify_index(&self) -> u64;
}

impl Versioned for CatalogEntry {
    fn reference(&self) -> ResourceReference {
        self.reference.clone()
    }

    fn modify_index(&self) -> u64 {
        self.modify_index
    }
}

impl Versioned for CatalogService {
    fn reference(&self) -> ResourceReference {
        CatalogService::reference(self)
    }

    fn modify_index(&self) -> u64 {
        self.modify_index
    }
}

/// One kind's worth of catalog values. Built whole, never edited in place
/// once published.
#[derive(Debug, Clone)]
pub struct ReferenceMap<T> {
    inner: HashMap<ResourceReference, T>,
}

impl<T> Default for ReferenceMap<T> {
    fn default() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }
}

impl<T: Versioned> ReferenceMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, value: T) {
        self.inner.insert(value.reference(), value);
    }

    pub fn get(&self, reference: &ResourceReference) -> Option<&T> {
        self.inner.get(reference)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Every value, ordered by reference.
    pub fn entries(&self) -> Vec<T> {
        let mut refs: Vec<_> = self.inner.keys().collect();
        refs.sort();
        refs.into_iter()
            .filter_map(|reference| self.inner.get(reference).cloned())
            .collect()
    }

    /// Values that are new or newer in `newer`, followed by values that
    /// disappeared from it (as their last known snapshot).
    ///
    /// An entry present in both maps is reported only when its modify index
    /// strictly increased.
    pub fn diff(&self, newer: &ReferenceMap<T>) -> Vec<T> {
        let mut changed: Vec<&T> = newer
            .inner
            .iter()
            .filter(|(reference, value)| match self.inner.get(*reference) {
                None => true,
                Some(old) => old.modify_index() < value.modify_index(),
            })
            .map(|(_, value)| value)
            .collect();
        changed.sort_by_key(|value| value.reference());

        let mut removed: Vec<&T> = self
            .inner
            .iter()
            .filter(|(reference, _)| !newer.inner.contains_key(*reference))
            .map(|(_, value)| value)
            .collect();
        removed.sort_by_key(|value| value.reference());

        changed.into_iter().chain(removed).cloned().collect()
    }
}

impl<T: Versioned> FromIterator<T> for ReferenceMap<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut map = Self::new();
        for value in iter {
            map.set(value);
        }
        map
    }
}
