use serde::Serialize;

/// Counters a heap keeps about its collections.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    pub collections: u64,
    pub allocated: usize,
    pub threshold: usize,

    /// Objects found reachable by the last collection.
    pub last_marked_objects: usize,
    pub last_reclaimed_objects: usize,
    pub last_reclaimed_bytes: usize,
    /// Bytes of machine stack the last collection scanned.
    pub last_stack_bytes: usize,
    pub last_collection_micros: u64,

    /// Finalizers run so far, by `free` or by a sweep.
    pub finalizers_run: u64,
}
