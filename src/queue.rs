//! The cross-thread update queue: foreign threads push characteristic-change
//! notifications from the front, the event-loop-thread dispatcher pops from
//! the back, one entry per tick.

use std::{
    collections::VecDeque,
    sync::Mutex,
};

use crate::path::ObjectPath;

/// A unit of work in the update queue: a characteristic or descriptor whose
/// value changed and should be re-read and announced via
/// `PropertiesChanged`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpdateEntry {
    pub object_path: ObjectPath,
    pub interface_name: &'static str,
}

impl UpdateEntry {
    /// The `"<path>|<interface>"` wire encoding used by the host-facing
    /// `pop_update` facade.
    pub fn encode(&self) -> String {
        format!("{}|{}", self.object_path, self.interface_name)
    }
}

/// A mutex-guarded double-ended queue. `push_front`/`pop_back` never block
/// across a D-Bus call — the lock is held only for the `VecDeque` splice
/// itself.
#[derive(Default)]
pub struct UpdateQueue(Mutex<VecDeque<UpdateEntry>>);

impl UpdateQueue {
    pub fn new() -> Self {
        Self(Mutex::new(VecDeque::new()))
    }

    /// O(1), lock-guarded, always succeeds.
    pub fn push_front(&self, entry: UpdateEntry) {
        self.0.lock().expect("UpdateQueue mutex poisoned").push_front(entry);
    }

    /// Pops the oldest entry (from the back). `keep == true` leaves the
    /// entry in place and returns a clone instead of removing it, matching
    /// the host-facing `pop_update(..., keep)` contract.
    pub fn pop_back(&self, keep: bool) -> Option<UpdateEntry> {
        let mut q = self.0.lock().expect("UpdateQueue mutex poisoned");
        if keep {
            q.back().cloned()
        } else {
            q.pop_back()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().expect("UpdateQueue mutex poisoned").is_empty()
    }

    pub fn size(&self) -> usize {
        self.0.lock().expect("UpdateQueue mutex poisoned").len()
    }

    pub fn clear(&self) {
        self.0.lock().expect("UpdateQueue mutex poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> UpdateEntry {
        UpdateEntry { object_path: ObjectPath::parse(path).unwrap(), interface_name: "org.bluez.GattCharacteristic1" }
    }

    #[test]
    fn fifo_order_under_mutex() {
        let q = UpdateQueue::new();
        q.push_front(entry("/com/bzperi/a"));
        q.push_front(entry("/com/bzperi/b"));
        q.push_front(entry("/com/bzperi/c"));
        // pushes are front-inserted, so the oldest push ends up at the back
        // and is popped first: a, then b, then c.
        assert_eq!(q.pop_back(false).unwrap().object_path.as_str(), "/com/bzperi/a");
        assert_eq!(q.pop_back(false).unwrap().object_path.as_str(), "/com/bzperi/b");
        assert_eq!(q.pop_back(false).unwrap().object_path.as_str(), "/com/bzperi/c");
        assert!(q.pop_back(false).is_none());
    }

    #[test]
    fn keep_leaves_entry_in_place() {
        let q = UpdateQueue::new();
        q.push_front(entry("/com/bzperi/a"));
        assert_eq!(q.pop_back(true).unwrap().object_path.as_str(), "/com/bzperi/a");
        assert_eq!(q.size(), 1);
        assert_eq!(q.pop_back(false).unwrap().object_path.as_str(), "/com/bzperi/a");
        assert!(q.is_empty());
    }

    #[test]
    fn encode_matches_wire_format() {
        let e = entry("/com/bzperi/battery/level");
        assert_eq!(e.encode(), "/com/bzperi/battery/level|org.bluez.GattCharacteristic1");
    }

    #[test]
    fn clear_empties_queue() {
        let q = UpdateQueue::new();
        q.push_front(entry("/com/bzperi/a"));
        q.push_front(entry("/com/bzperi/b"));
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.size(), 0);
    }
}
