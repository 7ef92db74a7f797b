//! Per-object monitors with recursive ownership

use crate::gc::Obj;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

/// Monitor state for one object.
#[derive(Debug, Clone, Copy)]
struct Monitor {
    owner: u64,
    count: u32,
}

/// Machine-wide monitor table.
///
/// Any object can be locked. A monitor is recursive: the owning thread may
/// re-acquire it, and it is freed when the entry count returns to zero.
/// Contending threads block until the owner releases.
pub struct MonitorTable {
    table: Mutex<FxHashMap<u64, Monitor>>,
    released: Condvar,
}

impl MonitorTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(FxHashMap::default()),
            released: Condvar::new(),
        }
    }

    /// Acquire the monitor of `o` for `thread`, blocking while another
    /// thread owns it.
    pub fn acquire(&self, thread: u64, o: Obj) {
        let key = o.bits();
        let mut table = self.table.lock();
        loop {
            match table.get_mut(&key) {
                None => {
                    table.insert(key, Monitor { owner: thread, count: 1 });
                    return;
                }
                Some(monitor) if monitor.owner == thread => {
                    monitor.count += 1;
                    return;
                }
                Some(_) => {
                    self.released.wait(&mut table);
                }
            }
        }
    }

    /// Release one entry of the monitor of `o`.
    ///
    /// Returns `false` when `thread` does not own the monitor; the caller
    /// decides whether that is an error.
    pub fn release(&self, thread: u64, o: Obj) -> bool {
        let key = o.bits();
        let mut table = self.table.lock();
        match table.get_mut(&key) {
            Some(monitor) if monitor.owner == thread => {
                monitor.count -= 1;
                if monitor.count == 0 {
                    table.remove(&key);
                    self.released.notify_all();
                }
                true
            }
            _ => false,
        }
    }

    /// Current entry count of `thread` on the monitor of `o` (0 when not
    /// owned by it).
    pub fn entry_count(&self, thread: u64, o: Obj) -> u32 {
        let table = self.table.lock();
        match table.get(&o.bits()) {
            Some(monitor) if monitor.owner == thread => monitor.count,
            _ => 0,
        }
    }
}

impl Default for MonitorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;
    use crate::object::Cell;

    fn some_object() -> Obj {
        Heap::new(None).alloc(Cell::Int(0))
    }

    #[test]
    fn test_uncontended_acquire_release() {
        let monitors = MonitorTable::new();
        let o = some_object();

        monitors.acquire(1, o);
        assert_eq!(monitors.entry_count(1, o), 1);

        assert!(monitors.release(1, o));
        assert_eq!(monitors.entry_count(1, o), 0);
    }

    #[test]
    fn test_recursive_acquire() {
        let monitors = MonitorTable::new();
        let o = some_object();

        monitors.acquire(1, o);
        monitors.acquire(1, o);
        monitors.acquire(1, o);
        assert_eq!(monitors.entry_count(1, o), 3);

        assert!(monitors.release(1, o));
        assert!(monitors.release(1, o));
        assert_eq!(monitors.entry_count(1, o), 1);
        assert!(monitors.release(1, o));
        assert_eq!(monitors.entry_count(1, o), 0);
    }

    #[test]
    fn test_release_non_owner() {
        let monitors = MonitorTable::new();
        let o = some_object();

        monitors.acquire(1, o);
        assert!(!monitors.release(2, o));
        assert_eq!(monitors.entry_count(1, o), 1);
    }

    #[test]
    fn test_contended_acquire() {
        use std::sync::Arc;

        let monitors = Arc::new(MonitorTable::new());
        let o = some_object();

        monitors.acquire(1, o);

        let contender = {
            let monitors = Arc::clone(&monitors);
            std::thread::spawn(move || {
                monitors.acquire(2, o);
                assert_eq!(monitors.entry_count(2, o), 1);
                monitors.release(2, o);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(10));
        monitors.release(1, o);
        contender.join().unwrap();
    }
}
