//! Synchronization primitives
//!
//! The monitor table implements `monitorenter`/`monitorexit` and
//! synchronized-method locking with recursive ownership per thread.

mod monitor;

pub use monitor::MonitorTable;
