//! Device handle arena
//!
//! Open device connections live in slots addressed by [`DeviceToken`]s. A
//! token carries the slot generation it was issued for; closing a device
//! bumps the generation, so a stale token can never reach a reused slot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Opaque identifier for an open device connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceToken {
    index: u32,
    generation: u32,
}

impl fmt::Display for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

/// Generation-checked slot storage
pub struct HandleArena<T> {
    inner: RwLock<Slots<T>>,
}

impl<T> HandleArena<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Store a value and issue its token
    pub fn insert(&self, value: T) -> DeviceToken {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let value = Some(Arc::new(value));

        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.value = value;
            return DeviceToken {
                index,
                generation: slot.generation,
            };
        }

        let index = inner.slots.len() as u32;
        inner.slots.push(Slot {
            generation: 0,
            value,
        });
        DeviceToken {
            index,
            generation: 0,
        }
    }

    /// Look up a live value
    pub fn get(&self, token: DeviceToken) -> Option<Arc<T>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .slots
            .get(token.index as usize)
            .filter(|slot| slot.generation == token.generation)
            .and_then(|slot| slot.value.clone())
    }

    /// Remove a value, invalidating its token
    ///
    /// Returns `None` if the token is stale or was never issued.
    pub fn remove(&self, token: DeviceToken) -> Option<Arc<T>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let slot = inner
            .slots
            .get_mut(token.index as usize)
            .filter(|slot| slot.generation == token.generation)?;

        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(token.index);
        Some(value)
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.slots.len() - inner.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tokens of every live value
    pub fn tokens(&self) -> Vec<DeviceToken> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| DeviceToken {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let arena = HandleArena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");

        assert_ne!(a, b);
        assert_eq!(*arena.get(a).unwrap(), "a");
        assert_eq!(*arena.get(b).unwrap(), "b");
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_stale_token_rejected_after_reuse() {
        let arena = HandleArena::new();
        let old = arena.insert(1u32);
        assert_eq!(arena.remove(old).as_deref(), Some(&1));

        // Same slot, next generation
        let new = arena.insert(2u32);
        assert_ne!(old, new);
        assert!(arena.get(old).is_none());
        assert_eq!(*arena.get(new).unwrap(), 2);
    }

    #[test]
    fn test_double_remove() {
        let arena = HandleArena::new();
        let token = arena.insert(());
        assert!(arena.remove(token).is_some());
        assert!(arena.remove(token).is_none());
        assert!(arena.is_empty());
    }

    #[test]
    fn test_tokens_lists_live_values() {
        let arena = HandleArena::new();
        let a = arena.insert('a');
        let b = arena.insert('b');
        arena.remove(a);

        assert_eq!(arena.tokens(), vec![b]);
        assert_eq!(b.to_string(), "dev1.0");
    }
}
