//! Opaque handle registry owned by a driver instance

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Maps opaque `u64` handles to native objects.
///
/// Each driver instance owns its own registry, so independent adapters (and
/// tests) never share handle space.
pub struct HandleRegistry<T> {
    next: AtomicU64,
    entries: Mutex<HashMap<u64, T>>,
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, T>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `value` and return its freshly issued handle
    pub fn insert(&self, value: T) -> u64 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(handle, value);
        handle
    }

    /// Release a handle, returning the object it referred to
    pub fn remove(&self, handle: u64) -> Option<T> {
        self.lock().remove(&handle)
    }

    pub fn contains(&self, handle: u64) -> bool {
        self.lock().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run `f` against the entry for `handle` while the registry is locked
    pub fn with<R>(&self, handle: u64, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.lock().get_mut(&handle).map(f)
    }

    /// Release every handle
    pub fn drain(&self) -> Vec<(u64, T)> {
        self.lock().drain().collect()
    }
}

impl<T: Clone> HandleRegistry<T> {
    pub fn get(&self, handle: u64) -> Option<T> {
        self.lock().get(&handle).cloned()
    }

    /// Every entry matching `predicate`
    pub fn filter(&self, predicate: impl Fn(&T) -> bool) -> Vec<(u64, T)> {
        self.lock()
            .iter()
            .filter(|(_, value)| predicate(value))
            .map(|(handle, value)| (*handle, value.clone()))
            .collect()
    }

    /// First entry matching `predicate`
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<(u64, T)> {
        self.lock()
            .iter()
            .find(|(_, value)| predicate(value))
            .map(|(handle, value)| (*handle, value.clone()))
    }
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique_and_released() {
        let registry = HandleRegistry::new();
        let a = registry.insert("a");
        let b = registry.insert("b");
        assert_ne!(a, b);
        assert_eq!(registry.get(a), Some("a"));
        assert_eq!(registry.remove(a), Some("a"));
        assert!(!registry.contains(a));
        assert_eq!(registry.remove(a), None);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find(|v| *v == "b"), Some((b, "b")));
    }

    #[test]
    fn test_registries_are_independent() {
        let first: HandleRegistry<u8> = HandleRegistry::new();
        let second: HandleRegistry<u8> = HandleRegistry::new();
        let handle = first.insert(7);
        assert!(!second.contains(handle));
        let bumped = first.with(handle, |v| {
            *v += 1;
            *v
        });
        assert_eq!(bumped, Some(8));
        assert_eq!(first.drain().len(), 1);
        assert!(first.is_empty());
    }
}
