//! Named value stacks shared across program instances
//!
//! A stack is an ordered list of slots keyed by a caller-chosen integer
//! index. Writing to an existing `(name, index)` pair overwrites in place;
//! reading never removes. Slots die only through timeout expiry, after which
//! empty stacks are dropped entirely.
//!
//! The whole store serializes behind one mutex: concurrent writes to
//! different stacks and a write racing the expiry sweep both observe
//! consistent slot lists.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::logic::LValue;

/// Stack name used when an instruction omits one.
pub const DEFAULT_STACK: &str = "default";

#[derive(Debug, Clone)]
struct Slot {
    index: i64,
    value: LValue,
    written: Instant,
}

/// Shared store of named slot stacks with timeout expiry.
#[derive(Default)]
pub struct StackStore {
    stacks: Mutex<HashMap<String, Vec<Slot>>>,
}

impl StackStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value` into the slot at `(name, index)`.
    ///
    /// Overwrites an existing slot in place and refreshes its write time;
    /// otherwise appends a new slot. The stack is created on first write.
    pub fn write(&self, name: &str, index: i64, value: LValue) {
        let mut stacks = self.stacks.lock();
        let slots = stacks.entry(name.to_string()).or_default();
        let now = Instant::now();
        if let Some(slot) = slots.iter_mut().find(|slot| slot.index == index) {
            slot.value = value;
            slot.written = now;
        } else {
            slots.push(Slot {
                index,
                value,
                written: now,
            });
        }
    }

    /// Read the slot at `(name, index)` without removing it.
    pub fn read(&self, name: &str, index: i64) -> Option<LValue> {
        let stacks = self.stacks.lock();
        stacks
            .get(name)?
            .iter()
            .find(|slot| slot.index == index)
            .map(|slot| slot.value.clone())
    }

    /// Drop slots older than `timeout` as of `now`, then drop empty stacks.
    pub fn expire(&self, now: Instant, timeout: Duration) {
        let mut stacks = self.stacks.lock();
        for slots in stacks.values_mut() {
            slots.retain(|slot| now.saturating_duration_since(slot.written) <= timeout);
        }
        stacks.retain(|_, slots| !slots.is_empty());
    }

    /// Number of stacks currently held.
    pub fn stack_count(&self) -> usize {
        self.stacks.lock().len()
    }

    /// Number of slots in the named stack, zero if absent.
    pub fn slot_count(&self, name: &str) -> usize {
        self.stacks
            .lock()
            .get(name)
            .map(|slots| slots.len())
            .unwrap_or(0)
    }
}
