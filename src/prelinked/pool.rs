//! Owned storage for serialized kext fragments.
//!
//! The prelink info document references each injected kext's serialized
//! dictionary instead of copying it, so the fragments are parked here until the
//! context is torn down.

use tracing::debug;

use crate::error::Error;

/// Insertion-ordered pool that owns values until it is dropped.
#[derive(Debug)]
pub struct DependencyPool<T> {
    entries: Vec<T>,
}

impl<T> DependencyPool<T> {
    /// Creates an empty pool without allocating.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Takes ownership of `item`.
    ///
    /// When the pool is full its capacity grows to `2 * (capacity + 1)`.
    /// Existing entries keep their order. If growing fails, the pool is left
    /// untouched and `item` is handed back alongside the error.
    pub fn insert(&mut self, item: T) -> Result<(), (T, Error)> {
        if self.entries.len() == self.entries.capacity() {
            let target = self
                .entries
                .capacity()
                .checked_add(1)
                .and_then(|c| c.checked_mul(2));
            let Some(target) = target else {
                return Err((item, Error::CapacityOverflow));
            };
            if let Err(e) = self.entries.try_reserve_exact(target - self.entries.len()) {
                return Err((item, Error::out_of_memory("dependency pool", e)));
            }
            debug!(capacity = self.entries.capacity(), "grew dependency pool");
        }
        self.entries.push(item);
        Ok(())
    }

    /// Returns the number of pooled entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the pool holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the current capacity.
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// Iterates over the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Drops every entry and releases the backing storage.
    pub fn clear(&mut self) {
        self.entries = Vec::new();
    }
}

impl<T> Default for DependencyPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
