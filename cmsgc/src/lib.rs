//! A conservative, stop-the-world mark and sweep garbage collector.
//!
//! Objects are untyped byte payloads carved out of a page based block arena.
//! Reachability is found without any type information: every aligned word on
//! the machine stack, in the callee-saved registers, in registered root ranges
//! and inside reachable payloads is treated as a possible pointer.
//!
//! ```
//! use cmsgc::{Heap, HeapConfig};
//!
//! let anchor = 0usize;
//! let heap = Heap::new(&anchor, HeapConfig::default()).unwrap();
//!
//! let list = heap.allocate(64);
//! let item = heap.allocate(16);
//! unsafe { list.as_ptr().cast::<usize>().write(item.as_ptr() as usize) };
//!
//! // `item` is only reachable through `list`.
//! heap.collect_with(&[&list]);
//! assert!(heap.is_live(item));
//! ```

mod collect;
mod config;
mod error;
mod gc;
mod header;
mod heap;
mod roots;
mod scan;
mod stats;
mod trace;

pub use crate::config::{HeapConfig, StackScan, Verbosity, DEFAULT_GROWTH_FACTOR, DEFAULT_INITIAL_THRESHOLD};
pub use crate::error::{GcError, GcResult};
pub use crate::gc::Gc;
pub use crate::header::{Finalizer, HEADER_SIZE};
pub use crate::heap::Heap;
pub use crate::roots::{RootRange, RootRemoval};
pub use crate::scan::Visitor;
pub use crate::stats::HeapStats;
pub use crate::trace::Trace;

pub use cmsgc_arena::ArenaConfig;

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::ptr::NonNull;

    use cmsgc_arena::ArenaConfig;

    use crate::{HeapConfig, StackScan};

    thread_local! {
        static FINALIZED: RefCell<Vec<usize>> = RefCell::new(Vec::new());
    }

    /// A heap config that only sees explicit roots.
    pub fn config(initial_threshold: usize) -> HeapConfig {
        HeapConfig {
            initial_threshold,
            stack_scan: StackScan::Disabled,
            arena: ArenaConfig { reserve_bytes: 16 * 1024 * 1024 },
            ..HeapConfig::default()
        }
    }

    pub fn record_finalizer(payload: NonNull<u8>) {
        FINALIZED.with(|finalized| finalized.borrow_mut().push(payload.as_ptr() as usize));
    }

    pub fn finalized() -> Vec<usize> {
        FINALIZED.with(|finalized| finalized.borrow().clone())
    }

    pub fn reset_finalized() {
        FINALIZED.with(|finalized| finalized.borrow_mut().clear());
    }
}
