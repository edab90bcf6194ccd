use std::cell::{Cell, RefCell};
use std::ptr::{self, NonNull};

use cmsgc_arena::{Arena, ArenaError, MIN_ALIGN, SMALL_SIZE_MAX};
use log::debug;

use crate::header::{Finalizer, Header, HEADER_SIZE};
use crate::roots::{RootRange, RootRemoval, Roots};
use crate::stats::HeapStats;
use crate::{Gc, GcResult, HeapConfig, StackScan, Verbosity};

/// A garbage collected heap.
///
/// Objects are plain byte payloads. Anything that looks like a payload address
/// on the stack, in the callee-saved registers, in a registered root range or
/// inside another reachable payload keeps that payload alive.
///
/// A heap belongs to the thread that created it and must never be shared;
/// payloads from one heap must not be handed to another.
pub struct Heap {
    pub(crate) arena: Arena,

    pub(crate) allocated: Cell<usize>,
    pub(crate) threshold: Cell<usize>,
    pub(crate) roots: RefCell<Roots>,

    /// One end of the scanned stack, the other is wherever a collection runs.
    pub(crate) stack_base: usize,
    pub(crate) stack_scan: StackScan,

    pub(crate) growth_factor: f64,
    pub(crate) verbosity: Cell<Verbosity>,
    pub(crate) stats: Cell<HeapStats>,
}

impl Heap {
    /// Creates a heap. `stack_reference` must be a local living in a frame
    /// that outlives the heap; the stack between it and the collecting frame
    /// is scanned for roots. Locals of that same frame may or may not be
    /// covered, keep objects in deeper frames or registered ranges.
    pub fn new<T>(stack_reference: &T, config: HeapConfig) -> GcResult<Heap> {
        config.validate()?;

        let arena = Arena::new(config.arena)?;

        Ok(Self {
            arena,
            allocated: Cell::new(0),
            threshold: Cell::new(config.initial_threshold),
            roots: RefCell::new(Roots::default()),
            stack_base: stack_reference as *const T as usize,
            stack_scan: config.stack_scan,
            growth_factor: config.growth_factor,
            verbosity: Cell::new(config.verbosity),
            stats: Cell::new(HeapStats::default()),
        })
    }

    /// Tears the heap down and releases its arena. Finalizers of objects that
    /// are still live do not run.
    pub fn destroy(self) {
        drop(self);
    }

    /// Allocates `size` zeroed bytes, collecting first when the heap is over
    /// its threshold. Running out of memory is fatal.
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        self.collect_if_necessary();

        // Even an empty payload needs a word so that pointers to it land
        // inside its block.
        let real_size = match block_size(size.max(1)) {
            Ok(real_size) => real_size,
            Err(err) => alloc_failed(size, err),
        };

        let block = if real_size <= SMALL_SIZE_MAX {
            self.arena.alloc_small(real_size)
        } else {
            self.arena.alloc_aligned(real_size, MIN_ALIGN)
        };

        let block = match block {
            Ok(block) => block,
            Err(err) => alloc_failed(size, err),
        };

        self.allocated.set(self.allocated.get() + real_size);

        unsafe {
            block.as_ptr().add(HEADER_SIZE).write_bytes(0, real_size - HEADER_SIZE);
            Header::init(block).payload()
        }
    }

    /// Resizes the object at `payload`, returning its possibly moved payload.
    /// A `new_size` of 0 frees the object and returns `None`. The old address
    /// must not be used afterwards.
    ///
    /// # Safety
    /// `payload` must be a live payload of this heap.
    pub unsafe fn reallocate(&self, payload: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        debug_assert!(self.is_live(payload), "reallocate of {:p} which is not live", payload);

        if new_size == 0 {
            self.free(payload);
            return None;
        }

        if self.over_threshold() {
            // The object being resized stays alive even if only the caller knows it.
            self.collect_with(&[&payload]);
        }

        let block = Header::block_of(payload);
        let old_size = self.arena.usable_size(block);
        let block = match block_size(new_size).and_then(|real_size| self.arena.realloc(block, real_size)) {
            Ok(block) => block,
            Err(err) => alloc_failed(new_size, err),
        };

        let new_size = self.arena.usable_size(block);
        if new_size > old_size {
            block.as_ptr().add(old_size).write_bytes(0, new_size - old_size);
            self.allocated.set(self.allocated.get() + (new_size - old_size));
        }

        Some(Header::from_block(block).payload())
    }

    /// Frees the object at `payload` right away, running its finalizer first.
    ///
    /// # Safety
    /// `payload` must be a live payload of this heap and nothing may use it
    /// afterwards. Freeing twice is undefined.
    pub unsafe fn free(&self, payload: NonNull<u8>) {
        debug_assert!(self.is_live(payload), "free of {:p} which is not live", payload);

        let header = Header::from_payload(payload);
        header.set_live(false);

        if let Some(finalizer) = header.finalizer() {
            finalizer(payload);
            self.update_stats(|stats| stats.finalizers_run += 1);
        }

        let block = header.block();
        let size = self.arena.usable_size(block);
        self.allocated.set(self.allocated.get().saturating_sub(size));

        self.arena.free(block);
    }

    /// Sets the function called with the payload once the object is freed or
    /// reclaimed, replacing any earlier one. The finalizer must neither
    /// allocate from nor collect this heap.
    ///
    /// # Safety
    /// `payload` must be a live payload of this heap.
    pub unsafe fn register_finalizer(&self, payload: NonNull<u8>, finalizer: Finalizer) {
        debug_assert!(self.is_live(payload), "finalizer for {:p} which is not live", payload);

        Header::from_payload(payload).set_finalizer(Some(finalizer));
    }

    /// Moves `value` into the heap. Its destructor, if any, runs when the
    /// object is reclaimed.
    pub fn manage<T: 'static>(&self, value: T) -> Gc<T> {
        assert!(
            std::mem::align_of::<T>() <= MIN_ALIGN,
            "{} needs an alignment above {}",
            std::any::type_name::<T>(),
            MIN_ALIGN
        );

        let payload = self.allocate(std::mem::size_of::<T>());

        unsafe {
            payload.cast::<T>().as_ptr().write(value);

            if std::mem::needs_drop::<T>() {
                self.register_finalizer(payload, drop_payload::<T>);
            }

            Gc::from_payload(payload)
        }
    }

    /// Whether `payload` is currently a live object of this heap. Any address
    /// may be asked about.
    pub fn is_live(&self, payload: NonNull<u8>) -> bool {
        let Some(block) = (payload.as_ptr() as usize).checked_sub(HEADER_SIZE) else {
            return false;
        };

        if !self.arena.check_owned(block) {
            return false;
        }

        unsafe {
            Header::from_payload(payload).is_live()
        }
    }

    /// Registers `[from, to)` as a range of words to scan for roots. The
    /// memory is owned by the caller and must stay readable until removed.
    pub fn add_root<T>(&self, from: *const T, to: *const T) {
        let range = RootRange::new(from, to);

        if self.verbosity.get() >= Verbosity::Summary {
            debug!("adding root range {:#x}->{:#x} ({} bytes)", range.from, range.to, range.len());
        }

        self.roots.borrow_mut().add(range);
    }

    /// Unregisters a range previously passed to [`Heap::add_root`].
    pub fn remove_root<T>(&self, from: *const T, to: *const T) -> RootRemoval {
        self.roots.borrow_mut().remove(RootRange::new(from, to))
    }

    pub fn roots(&self) -> Vec<RootRange> {
        self.roots.borrow().snapshot()
    }

    /// Bytes counted as live: exact right after a collection, since then
    /// raised by every allocation.
    pub fn allocated(&self) -> usize {
        self.allocated.get()
    }

    pub fn threshold(&self) -> usize {
        self.threshold.get()
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity.get()
    }

    pub fn set_verbosity(&self, verbosity: Verbosity) {
        self.verbosity.set(verbosity);
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            allocated: self.allocated(),
            threshold: self.threshold(),
            ..self.stats.get()
        }
    }

    pub(crate) fn update_stats(&self, update: impl FnOnce(&mut HeapStats)) {
        let mut stats = self.stats.get();
        update(&mut stats);
        self.stats.set(stats);
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if self.verbosity.get() >= Verbosity::Summary {
            debug!(
                "destroying heap with {} bytes in {} bytes of blocks",
                self.allocated.get(),
                self.arena.bytes_used()
            );
        }
    }
}

fn drop_payload<T>(payload: NonNull<u8>) {
    unsafe {
        ptr::drop_in_place(payload.cast::<T>().as_ptr());
    }
}

/// Arena block size holding a header and `payload` bytes.
fn block_size(payload: usize) -> Result<usize, ArenaError> {
    payload
        .checked_add(HEADER_SIZE)
        .map(Arena::good_size)
        .ok_or(ArenaError::OutOfMemory { requested: payload })
}

#[inline(never)]
#[cold]
fn alloc_failed(size: usize, err: ArenaError) -> ! {
    panic!("allocation of {} bytes failed: {}", size, err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{config, finalized, record_finalizer, reset_finalized};

    #[test]
    fn allocate_counts_rounded_size() {
        let anchor = 0usize;
        let heap = Heap::new(&anchor, config(1 << 20)).unwrap();

        let a = heap.allocate(64);
        assert_eq!(heap.allocated(), 128);
        assert!(heap.is_live(a));
        assert_eq!(a.as_ptr() as usize % MIN_ALIGN, 0);

        let big = heap.allocate(10_000);
        assert_eq!(heap.allocated(), 128 + 3 * 4096);
        assert!(heap.is_live(big));
    }

    #[test]
    fn payloads_start_zeroed() {
        let anchor = 0usize;
        let heap = Heap::new(&anchor, config(1 << 20)).unwrap();

        let a = heap.allocate(48);
        let keep = heap.allocate(48);
        unsafe {
            a.as_ptr().write_bytes(0xff, 48);
            heap.free(a);
        }

        // The lowest free slot of a page is handed out first.
        let b = heap.allocate(48);
        assert_eq!(a, b);
        assert!(heap.is_live(keep));
        let bytes = unsafe { std::slice::from_raw_parts(b.as_ptr(), 48) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn zero_sized_objects_are_distinct() {
        let anchor = 0usize;
        let heap = Heap::new(&anchor, config(1 << 20)).unwrap();

        let a = heap.allocate(0);
        let b = heap.allocate(0);
        assert_ne!(a, b);
        assert!(heap.is_live(a) && heap.is_live(b));
    }

    #[test]
    fn free_runs_finalizer_immediately() {
        reset_finalized();
        let anchor = 0usize;
        let heap = Heap::new(&anchor, config(1 << 20)).unwrap();

        let a = heap.allocate(16);
        unsafe {
            heap.register_finalizer(a, record_finalizer);
            heap.free(a);
        }

        assert_eq!(finalized(), vec![a.as_ptr() as usize]);
        assert!(!heap.is_live(a));
        assert_eq!(heap.allocated(), 0);
        assert_eq!(heap.stats().finalizers_run, 1);

        // Nothing is left for a sweep to finalize again.
        heap.collect();
        assert_eq!(finalized().len(), 1);
    }

    #[test]
    fn last_finalizer_wins() {
        fn other(_: NonNull<u8>) {
            panic!("replaced finalizer ran");
        }

        reset_finalized();
        let anchor = 0usize;
        let heap = Heap::new(&anchor, config(1 << 20)).unwrap();

        let a = heap.allocate(16);
        unsafe {
            heap.register_finalizer(a, other);
            heap.register_finalizer(a, record_finalizer);
            heap.free(a);
        }

        assert_eq!(finalized(), vec![a.as_ptr() as usize]);
    }

    #[test]
    fn reallocate_keeps_contents_and_header() {
        reset_finalized();
        let anchor = 0usize;
        let heap = Heap::new(&anchor, config(1 << 20)).unwrap();

        let a = heap.allocate(16);
        unsafe {
            a.as_ptr().cast::<u64>().write(77);
            heap.register_finalizer(a, record_finalizer);

            let b = heap.reallocate(a, 9000).unwrap();
            assert_ne!(a, b);
            assert!(!heap.is_live(a));
            assert!(heap.is_live(b));
            assert_eq!(b.as_ptr().cast::<u64>().read(), 77);
            assert_eq!(b.as_ptr().add(8999).read(), 0);
            assert_eq!(heap.allocated(), 3 * 4096);

            // The move itself is not a reclamation.
            assert!(finalized().is_empty());

            assert_eq!(heap.reallocate(b, 0), None);
            assert_eq!(finalized(), vec![b.as_ptr() as usize]);
            assert!(!heap.is_live(b));
        }
    }

    #[test]
    fn reallocate_in_place_when_it_fits() {
        let anchor = 0usize;
        let heap = Heap::new(&anchor, config(1 << 20)).unwrap();

        let a = heap.allocate(20);
        let b = unsafe { heap.reallocate(a, 40).unwrap() };
        assert_eq!(a, b);
        assert_eq!(heap.allocated(), 64);
    }

    #[test]
    fn reallocated_object_survives_triggered_collection() {
        let anchor = 0usize;
        let heap = Heap::new(&anchor, config(64)).unwrap();

        let a = heap.allocate(100);
        assert!(heap.allocated() > heap.threshold());

        let b = unsafe { heap.reallocate(a, 5000).unwrap() };
        assert_eq!(heap.stats().collections, 1);
        assert!(heap.is_live(b));
    }

    #[test]
    fn foreign_addresses_are_not_live() {
        let anchor = 0usize;
        let heap = Heap::new(&anchor, config(1 << 20)).unwrap();
        let local = 5u64;

        assert!(!heap.is_live(NonNull::from(&local).cast()));
        assert!(!heap.is_live(NonNull::dangling()));

        let a = heap.allocate(32);
        assert!(!heap.is_live(unsafe { NonNull::new_unchecked(a.as_ptr().add(16)) }));
    }

    #[test]
    fn root_registration() {
        let anchor = 0usize;
        let heap = Heap::new(&anchor, config(1 << 20)).unwrap();
        let words = [0usize; 8];
        let range = words.as_ptr_range();

        assert_eq!(heap.remove_root(range.start, range.end), RootRemoval::NoRoots);

        heap.add_root(range.start, range.end);
        assert_eq!(heap.roots(), vec![RootRange::of_slice(&words)]);
        assert_eq!(heap.remove_root(range.start, range.start), RootRemoval::NotFound);
        assert_eq!(heap.remove_root(range.start, range.end), RootRemoval::Removed);
        assert!(heap.roots().is_empty());
    }

    #[test]
    fn invalid_config_is_an_error() {
        let anchor = 0usize;
        let config = HeapConfig { growth_factor: 0.9, ..config(1024) };
        assert!(matches!(Heap::new(&anchor, config), Err(crate::GcError::InvalidConfig(_))));
    }

    #[test]
    #[should_panic(expected = "allocation of 18446744073709551615 bytes failed")]
    fn allocating_everything_is_fatal() {
        let anchor = 0usize;
        let heap = Heap::new(&anchor, config(1 << 20)).unwrap();
        heap.allocate(usize::MAX);
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn page_count_overflow_is_fatal() {
        let anchor = 0usize;
        let heap = Heap::new(&anchor, config(1 << 20)).unwrap();
        heap.allocate((1 << 44) + 1);
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn growing_past_the_arena_is_fatal() {
        let anchor = 0usize;
        let heap = Heap::new(&anchor, config(1 << 20)).unwrap();
        let a = heap.allocate(16);
        unsafe { heap.reallocate(a, usize::MAX - 8) };
    }

    #[test]
    fn alternating_garbage_sizes_reuse_memory() {
        let anchor = 0usize;
        let config = HeapConfig {
            arena: cmsgc_arena::ArenaConfig { reserve_bytes: 1024 * 1024 },
            ..config(1 << 20)
        };
        let heap = Heap::new(&anchor, config).unwrap();

        for _ in 0..500 {
            heap.allocate(5000);
            heap.collect();
            heap.allocate(9000);
            heap.collect();
            assert_eq!(heap.allocated(), 0);
        }

        // Small and large garbage share the same pages.
        for round in 0..500 {
            heap.allocate(if round % 2 == 0 { 40 } else { 20_000 });
            heap.allocate(3000);
            heap.collect();
        }
        assert_eq!(heap.allocated(), 0);
    }

    #[test]
    fn destroy_does_not_finalize() {
        reset_finalized();
        let anchor = 0usize;
        let heap = Heap::new(&anchor, config(1 << 20)).unwrap();

        let a = heap.allocate(16);
        unsafe { heap.register_finalizer(a, record_finalizer) };
        heap.destroy();

        assert!(finalized().is_empty());
    }
}
