//! Conservative root scanning.
//!
//! Every word looked at here is only ever a *candidate* pointer. A word counts
//! as a reference when `word - HEADER_SIZE` is the start of a block the arena
//! has handed out and `word` itself falls inside that block. This is the only
//! place that turns raw addresses into [`Header`]s.

use std::mem::size_of;
use std::ptr::{self, NonNull};

use arrayvec::ArrayVec;
use cmsgc_arena::Arena;
use log::trace;

use crate::header::{Header, HEADER_SIZE};
use crate::Verbosity;

const WORD: usize = size_of::<usize>();

/// Finds objects reachable from the words it is shown and keeps the pending
/// ones on a LIFO worklist until [`Visitor::drain`] traces them.
pub struct Visitor<'heap> {
    arena: &'heap Arena,
    worklist: Vec<NonNull<Header>>,
    verbosity: Verbosity,
    marked: usize,
}

impl<'heap> Visitor<'heap> {
    pub(crate) fn new(arena: &'heap Arena, verbosity: Verbosity) -> Self {
        Self {
            arena,
            worklist: Vec::new(),
            verbosity,
            marked: 0,
        }
    }

    /// Treats `word` as a possible pointer to a payload and marks the object
    /// it points at, if there is one.
    pub fn visit(&mut self, word: usize) {
        if word == 0 {
            return;
        }

        let Some(block) = word.checked_sub(HEADER_SIZE) else {
            return;
        };

        if !self.arena.check_owned(block) || !self.arena.contains_block(block, word) {
            return;
        }

        let header = unsafe {
            Header::from_block(NonNull::new_unchecked(block as *mut u8))
        };

        if header.is_live() && !header.is_marked() {
            if self.verbosity >= Verbosity::Trace {
                trace!("--mark {:#x}", block);
            }

            header.set_marked(true);
            self.marked += 1;
            self.worklist.push(NonNull::from(header));
        }
    }

    /// Scans every aligned word in `[from, to)`.
    ///
    /// # Safety
    /// The whole range must be readable.
    pub unsafe fn visit_range(&mut self, from: usize, to: usize) {
        if self.verbosity >= Verbosity::Trace {
            trace!("-mark {:#x}->{:#x} ({} words)", from, to, to.saturating_sub(from) / WORD);
        }

        let mut addr = from.next_multiple_of(WORD);
        while addr + WORD <= to {
            let word = ptr::read_volatile(addr as *const usize);
            self.visit(word);
            addr += WORD;
        }
    }

    /// Traces pending objects until nothing new is found. Each object's
    /// payload is scanned like any other range.
    pub(crate) fn drain(&mut self) {
        while let Some(header) = self.worklist.pop() {
            let block = header.cast::<u8>();
            let start = block.as_ptr() as usize;
            let size = self.arena.usable_size(block);

            unsafe {
                self.visit_range(start + HEADER_SIZE, start + size);
            }
        }
    }

    /// Number of objects marked through this visitor.
    pub fn marked(&self) -> usize {
        self.marked
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.worklist.is_empty()
    }
}

/// Address of a local in a frame below the caller, a close stand-in for the
/// stack pointer.
#[inline(never)]
pub(crate) fn current_stack_pointer() -> usize {
    let marker = 0usize;
    std::hint::black_box(&marker) as *const usize as usize
}

/// The `[low, high)` span between two stack addresses, whichever way the
/// stack grows.
pub(crate) fn stack_span(a: usize, b: usize) -> (usize, usize) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

const SAVED_REGISTERS: usize = 12;

pub(crate) type Registers = ArrayVec<usize, SAVED_REGISTERS>;

// One `mov` per register, so no operand can be handed a register that is
// still waiting to be read.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
macro_rules! read_register {
    ($reg:literal) => {{
        let value: usize;
        unsafe {
            std::arch::asm!(concat!("mov {}, ", $reg), out(reg) value, options(nomem, nostack, preserves_flags));
        }
        value
    }};
}

/// Copies the callee-saved registers into a snapshot so that pointers only
/// held in registers by frames above the collector get scanned.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
pub(crate) fn spill_registers() -> Registers {
    [
        read_register!("rbx"),
        read_register!("rbp"),
        read_register!("r12"),
        read_register!("r13"),
        read_register!("r14"),
        read_register!("r15"),
    ]
    .into_iter()
    .collect()
}

#[cfg(target_arch = "aarch64")]
#[inline(never)]
pub(crate) fn spill_registers() -> Registers {
    [
        read_register!("x19"),
        read_register!("x20"),
        read_register!("x21"),
        read_register!("x22"),
        read_register!("x23"),
        read_register!("x24"),
        read_register!("x25"),
        read_register!("x26"),
        read_register!("x27"),
        read_register!("x28"),
        read_register!("x29"),
    ]
    .into_iter()
    .collect()
}

// Without a known register file only values the compiler already spilled to
// the stack are seen.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(never)]
pub(crate) fn spill_registers() -> Registers {
    std::hint::black_box(Registers::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmsgc_arena::{ArenaConfig, MIN_ALIGN};

    fn arena() -> Arena {
        Arena::new(ArenaConfig { reserve_bytes: 4 * 1024 * 1024 }).unwrap()
    }

    fn object(arena: &Arena, size: usize) -> NonNull<u8> {
        let block = arena.alloc_aligned(size + HEADER_SIZE, MIN_ALIGN).unwrap();
        unsafe {
            block.as_ptr().write_bytes(0, arena.usable_size(block));
            Header::init(block).payload()
        }
    }

    fn header(payload: NonNull<u8>) -> &'static Header {
        unsafe { Header::from_payload(payload) }
    }

    #[test]
    fn marks_payload_pointers_only() {
        let arena = arena();
        let object = object(&arena, 32);
        let mut visitor = Visitor::new(&arena, Verbosity::Off);

        visitor.visit(0);
        visitor.visit(object.as_ptr() as usize + 8);
        visitor.visit(object.as_ptr() as usize - HEADER_SIZE);
        visitor.visit(usize::MAX);
        visitor.visit(HEADER_SIZE - 1);
        assert!(!header(object).is_marked());
        assert_eq!(visitor.marked(), 0);

        visitor.visit(object.as_ptr() as usize);
        assert!(header(object).is_marked());

        // A second sighting does not queue it again.
        visitor.visit(object.as_ptr() as usize);
        assert_eq!(visitor.marked(), 1);
        assert_eq!(visitor.worklist.len(), 1);
    }

    #[test]
    fn dead_headers_are_ignored() {
        let arena = arena();
        let object = object(&arena, 32);
        header(object).set_live(false);

        let mut visitor = Visitor::new(&arena, Verbosity::Off);
        visitor.visit(object.as_ptr() as usize);
        assert!(!header(object).is_marked());
    }

    #[test]
    fn nulls_do_not_end_a_range() {
        let arena = arena();
        let a = object(&arena, 16);
        let b = object(&arena, 16);
        let words = [a.as_ptr() as usize, 0, 0, 12345, b.as_ptr() as usize];

        let mut visitor = Visitor::new(&arena, Verbosity::Off);
        let range = words.as_ptr_range();
        unsafe { visitor.visit_range(range.start as usize, range.end as usize) };

        assert!(header(a).is_marked());
        assert!(header(b).is_marked());
    }

    #[test]
    fn drain_follows_payload_words() {
        let arena = arena();
        let a = object(&arena, 128);
        let b = object(&arena, 16);
        let c = object(&arena, 6000);
        let unrelated = object(&arena, 16);

        unsafe {
            a.as_ptr().cast::<usize>().add(2).write(b.as_ptr() as usize);
            b.as_ptr().cast::<usize>().write(c.as_ptr() as usize);
            // Last word of a ream sized payload.
            let last = arena.usable_size(Header::block_of(c)) - HEADER_SIZE - WORD;
            c.as_ptr().add(last).cast::<usize>().write(a.as_ptr() as usize);
        }

        let mut visitor = Visitor::new(&arena, Verbosity::Off);
        visitor.visit(a.as_ptr() as usize);
        visitor.drain();

        assert!(visitor.is_drained());
        assert_eq!(visitor.marked(), 3);
        assert!(header(b).is_marked());
        assert!(header(c).is_marked());
        assert!(!header(unrelated).is_marked());
    }

    #[test]
    fn stack_span_is_ordered() {
        assert_eq!(stack_span(10, 20), (10, 20));
        assert_eq!(stack_span(20, 10), (10, 20));
    }

    #[test]
    fn stack_pointer_is_near_locals() {
        let local = 0usize;
        let here = std::hint::black_box(&local) as *const usize as usize;
        let sp = current_stack_pointer();
        assert!(here.abs_diff(sp) < 64 * 1024);
    }

    #[test]
    fn registers_fit_snapshot() {
        let registers = spill_registers();
        assert!(registers.len() <= SAVED_REGISTERS);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn snapshot_holds_every_callee_saved_register() {
        assert_eq!(spill_registers().len(), 6);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn snapshot_holds_every_callee_saved_register() {
        assert_eq!(spill_registers().len(), 11);
    }
}
