//! Whole-value swap cell for configuration that can be reloaded at runtime.
//!
//! Readers take an `Arc` snapshot and keep using it for the rest of their request, so a
//! reload never shows them half of an old value and half of a new one. The default
//! backend is `ArcSwap`; feature `adaptive-rwlock` switches to an `RwLock`.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::RwLock;

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared handle to a value that is replaced, never mutated in place.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
        }
    }

    /// Current value.
    pub fn get(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
        }
    }

    /// Replace the value; later `get` calls see the new one.
    pub fn set(&self, value: T) {
        let value = Arc::new(value);
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(value);
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;

    #[test]
    fn snapshots_survive_replacement() {
        let cell = DynamicConfig::new(String::from("v1"));
        let before = cell.get();
        cell.set(String::from("v2"));
        assert_eq!(*before, "v1");
        assert_eq!(*cell.get(), "v2");
    }

    #[test]
    fn clones_observe_the_same_value() {
        let cell = DynamicConfig::new(1);
        let other = cell.clone();
        other.set(7);
        assert_eq!(*cell.get(), 7);
    }
}
