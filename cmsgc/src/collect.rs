use std::time::Instant;

use log::{debug, trace};

use crate::header::Header;
use crate::scan::{current_stack_pointer, spill_registers, stack_span, Visitor};
use crate::{Heap, StackScan, Trace, Verbosity};

#[derive(Default)]
struct Sweep {
    live_bytes: usize,
    reclaimed_objects: usize,
    reclaimed_bytes: usize,
    finalized: u64,
}

impl Heap {
    /// Runs a full collection.
    pub fn collect(&self) {
        self.collect_internal(&[]);
    }

    /// Runs a full collection that also keeps alive whatever `roots` report.
    pub fn collect_with(&self, roots: &[&dyn Trace]) {
        self.collect_internal(roots);
    }

    /// Collects when more bytes are live than the threshold allows. Returns
    /// whether it did.
    pub fn collect_if_necessary(&self) -> bool {
        if self.over_threshold() {
            self.collect();
            true
        } else {
            false
        }
    }

    pub(crate) fn over_threshold(&self) -> bool {
        self.allocated.get() > self.threshold.get()
    }

    // Kept out of line so the callers' frames are fully on the stack by the
    // time it is scanned.
    #[inline(never)]
    fn collect_internal(&self, extra_roots: &[&dyn Trace]) {
        let start = Instant::now();
        let verbosity = self.verbosity.get();

        if verbosity >= Verbosity::Summary {
            debug!(
                "-- gc begin: {} bytes allocated, threshold {}",
                self.allocated.get(),
                self.threshold.get()
            );
        }

        let mut visitor = Visitor::new(&self.arena, verbosity);
        let mut stack_bytes = 0;

        if self.stack_scan == StackScan::Enabled {
            let registers = std::hint::black_box(spill_registers());
            let (low, high) = stack_span(self.stack_base, current_stack_pointer());
            stack_bytes = high - low;

            unsafe {
                visitor.visit_range(low, high);
            }

            for register in &registers {
                visitor.visit(*register);
            }
        }

        for range in self.roots.borrow().iter() {
            if range.is_empty() {
                continue;
            }

            unsafe {
                visitor.visit_range(range.from, range.to);
            }
        }

        for root in extra_roots {
            root.trace(&mut visitor);
        }

        visitor.drain();
        debug_assert!(visitor.is_drained());
        let marked = visitor.marked();

        let sweep = self.sweep(verbosity);
        self.allocated.set(sweep.live_bytes);

        let threshold = self.threshold.get();
        if sweep.live_bytes > threshold {
            let grown = (sweep.live_bytes as f64 * self.growth_factor) as usize;
            self.threshold.set(grown.max(sweep.live_bytes));

            if verbosity >= Verbosity::Summary {
                debug!("-- gc threshold {} -> {}", threshold, self.threshold.get());
            }
        }

        let elapsed = start.elapsed();

        self.update_stats(|stats| {
            stats.collections += 1;
            stats.last_marked_objects = marked;
            stats.last_reclaimed_objects = sweep.reclaimed_objects;
            stats.last_reclaimed_bytes = sweep.reclaimed_bytes;
            stats.last_stack_bytes = stack_bytes;
            stats.last_collection_micros = elapsed.as_micros() as u64;
            stats.finalizers_run += sweep.finalized;
        });

        if verbosity >= Verbosity::Summary {
            debug!(
                "-- gc end: kept {} objects, freed {} objects ({} bytes), {} bytes allocated, took {:?}",
                marked,
                sweep.reclaimed_objects,
                sweep.reclaimed_bytes,
                sweep.live_bytes,
                elapsed
            );
        }
    }

    fn sweep(&self, verbosity: Verbosity) -> Sweep {
        let mut sweep = Sweep::default();

        self.arena.visit_blocks(|block, size| {
            let header = unsafe {
                Header::from_block(block)
            };

            if header.is_marked() {
                header.set_marked(false);
                sweep.live_bytes += size;
                return true;
            }

            if let Some(finalizer) = header.finalizer() {
                finalizer(header.payload());
                sweep.finalized += 1;
            }

            if verbosity >= Verbosity::Trace {
                trace!("--free {:p} ({} bytes)", block, size);
            }

            header.retire();
            sweep.reclaimed_objects += 1;
            sweep.reclaimed_bytes += size;

            unsafe {
                self.arena.free(block);
            }

            true
        });

        sweep
    }
}
