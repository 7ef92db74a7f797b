//! Managed heap: cell arena and opaque handles
//!
//! The heap is an arena of tagged cells. Handles ([`Obj`]) are stable
//! indices, so resolved references and captured traces never dangle while
//! the machine is alive; the external collector compacts by rewriting cells
//! in place, never by moving them. Roots are the machine's class registry,
//! the weak-reference registry, and each thread's tagged stack region.

mod heap;

pub use heap::{Heap, Obj};
