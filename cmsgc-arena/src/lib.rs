//! A size-classed block allocator over a single reserved address range.
//!
//! Small requests are served from pages carved into equally sized blocks,
//! anything bigger than a page gets a run of whole pages (a "ream"). Every
//! page keeps a bitmap of its allocated blocks, which is what lets the arena
//! answer ownership questions about arbitrary addresses and walk all live
//! blocks.

mod size_class;
mod space;

use std::cell::Cell;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use size_class::SizeClass;
use space::{bytes_to_pages, AddrSpace, PdList, PdRef};

pub use cmsgc_mmap::MapError;
pub use space::PAGE_BYTES;

/// Largest request served from a size-classed page.
pub const SMALL_SIZE_MAX: usize = PAGE_BYTES;

/// Every block is aligned to at least this.
pub const MIN_ALIGN: usize = 16;

pub const DEFAULT_RESERVE_BYTES: usize = 256 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ArenaError {
    #[error("out of memory, {requested} bytes requested")]
    OutOfMemory { requested: usize },

    #[error("alignment {align} is not a power of two no larger than a page")]
    BadAlignment { align: usize },

    #[error("{size} bytes is too large for a small allocation")]
    NotSmall { size: usize },

    #[error("cannot reserve an arena of {reserve_bytes} bytes")]
    BadReservation { reserve_bytes: usize },

    #[error(transparent)]
    Map(#[from] MapError),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Virtual memory reserved up front. Pages are only committed once touched.
    pub reserve_bytes: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            reserve_bytes: DEFAULT_RESERVE_BYTES,
        }
    }
}

pub struct Arena {
    space: AddrSpace,

    free_reams: PdList,
    free_pages: PdList,
    free_sized: [PdList; SizeClass::SMALL.len()],

    full_reams: PdList,
    full_pages: PdList,

    bytes_used: Cell<usize>,
}

impl Arena {
    pub fn new(config: ArenaConfig) -> Result<Arena, ArenaError> {
        let space = AddrSpace::create(config.reserve_bytes)?;

        let arena = Self {
            free_reams: space.new_reserved(),
            free_pages: space.new_reserved(),
            free_sized: [
                space.new_reserved(),
                space.new_reserved(),
                space.new_reserved(),
                space.new_reserved(),
                space.new_reserved(),
                space.new_reserved(),
                space.new_reserved(),
                space.new_reserved(),
                space.new_reserved(),
            ],

            full_reams: space.new_reserved(),
            full_pages: space.new_reserved(),
            space,
            bytes_used: Cell::new(0),
        };

        let ream = arena.space.new_ream(arena.space.available_pages());
        arena.free_reams.push(ream);

        Ok(arena)
    }

    /// The size a request for `size` bytes is actually served with.
    pub fn good_size(size: usize) -> usize {
        match SizeClass::for_size(size) {
            Some(class) => class.block_bytes().unwrap_or(PAGE_BYTES),
            None => bytes_to_pages(size).saturating_mul(PAGE_BYTES),
        }
    }

    /// Bytes held by allocated blocks, rounded to their size class.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used.get()
    }

    pub fn alloc_small(&self, size: usize) -> Result<NonNull<u8>, ArenaError> {
        let class = SizeClass::for_size(size).ok_or(ArenaError::NotSmall { size })?;
        self.alloc_class(class)
    }

    pub fn alloc_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, ArenaError> {
        if !align.is_power_of_two() || align > PAGE_BYTES {
            return Err(ArenaError::BadAlignment { align });
        }

        // Blocks are aligned to their own size, reams to a page.
        match SizeClass::for_size(size.max(align)) {
            Some(class) => self.alloc_class(class),
            None => {
                let pages = u32::try_from(bytes_to_pages(size))
                    .map_err(|_| ArenaError::OutOfMemory { requested: size })?;

                self.alloc_ream(pages)
            },
        }
    }

    /// Grows or keeps the block at `ptr` so it can hold `new_size` bytes. When
    /// the block has to move its contents are copied and the old block freed.
    ///
    /// # Safety
    /// `ptr` must be a block allocated by this arena that has not been freed.
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, ArenaError> {
        let old_size = self.usable_size(ptr);
        if new_size <= old_size {
            return Ok(ptr);
        }

        let new = self.alloc_aligned(new_size, MIN_ALIGN)?;
        std::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old_size);
        self.free(ptr);

        Ok(new)
    }

    /// # Safety
    /// `ptr` must be a block allocated by this arena that has not been freed,
    /// and nothing may use it afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let (page, index) = match self.space.find_block(addr) {
            Some(found) => found,
            None => {
                debug_assert!(false, "{:p} is not an allocated block", ptr);
                return;
            },
        };

        debug_assert_eq!(page.data(index) as usize, addr, "free of an interior pointer");

        self.bytes_used.set(self.bytes_used.get() - page.block_size());

        if page.class() == SizeClass::Ream {
            page.unmark(0);
            page.unlink();
            self.release_ream(page);
            return;
        }

        let was_full = page.is_full();
        page.unmark(index);

        if page.is_empty() {
            page.unlink();
            self.free_pages.push(page);
        } else if was_full {
            page.unlink();
            self.sized_list(page.class()).push(page);
        }
    }

    /// Full size of the allocated block starting at `ptr`, or 0 if there is none.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        match self.space.find_block(addr) {
            Some((page, index)) if page.data(index) as usize == addr => page.block_size(),
            _ => 0,
        }
    }

    /// Whether `addr` is the start of a block that is currently allocated.
    /// Safe to call with any address at all.
    pub fn check_owned(&self, addr: usize) -> bool {
        self.space
            .find_block(addr)
            .map_or(false, |(page, index)| page.data(index) as usize == addr)
    }

    /// Whether `addr` lies inside the allocated block that starts at `block`.
    pub fn contains_block(&self, block: usize, addr: usize) -> bool {
        match self.space.find_block(block) {
            Some((page, index)) if page.data(index) as usize == block => {
                addr >= block && addr < block + page.block_size()
            },
            _ => false,
        }
    }

    /// Calls `visitor` with every allocated block and its full size. The
    /// visitor may free the block it is handed; returning `false` stops the
    /// walk. Pages emptied during the walk are merged with their free
    /// neighbours once it is over.
    pub fn visit_blocks<F>(&self, mut visitor: F)
    where
        F: FnMut(NonNull<u8>, usize) -> bool,
    {
        let bytes_used = self.bytes_used();

        'walk: for page in self.space.pds() {
            if page.class() == SizeClass::Tail {
                continue;
            }

            let size = page.block_size();

            for index in page.allocated() {
                let block = unsafe {
                    NonNull::new_unchecked(page.data(index))
                };

                if !visitor(block, size) {
                    break 'walk;
                }
            }
        }

        if self.bytes_used() < bytes_used {
            self.coalesce();
        }
    }

    /// Merges every run of adjacent free pages into a single free ream.
    fn coalesce(&self) {
        let mut run: Option<(PdRef, bool)> = None;

        for page in self.space.pds() {
            if !page.is_empty() {
                if let Some((head, true)) = run.take() {
                    self.release_ream(head);
                }

                continue;
            }

            run = match run {
                None => Some((page, false)),
                Some((head, grown)) => {
                    if !grown {
                        head.unlink();
                    }

                    page.unlink();
                    head.absorb(page);

                    Some((head, true))
                },
            };
        }

        if let Some((head, true)) = run {
            self.release_ream(head);
        }
    }

    fn sized_list(&self, size_class: SizeClass) -> &PdList {
        &self.free_sized[size_class.list_index()]
    }

    fn release_ream(&self, page: PdRef) {
        if page.is_single_page() {
            self.free_pages.push(page);
        } else {
            self.free_reams.push(page);
        }
    }

    fn take_ream(&self, pages: u32) -> Result<PdRef, ArenaError> {
        if let Some(page) = self.find_ream(pages) {
            return Ok(page);
        }

        // Frees outside of a block walk leave fragments behind.
        self.coalesce();

        self.find_ream(pages).ok_or(ArenaError::OutOfMemory {
            requested: pages as usize * PAGE_BYTES,
        })
    }

    fn find_ream(&self, pages: u32) -> Option<PdRef> {
        if pages == 1 {
            if let Some(page) = self.free_pages.first(&self.space) {
                page.unlink();
                return Some(page);
            }
        }

        for ream in self.free_reams.iter(&self.space) {
            let (ream, rest) = match ream.split(pages as _) {
                Some(x) => x,
                None => continue,
            };

            if let Some(rest) = rest {
                self.release_ream(rest);
            }

            ream.unlink();
            return Some(ream);
        }

        None
    }

    fn alloc_ream(&self, pages: u32) -> Result<NonNull<u8>, ArenaError> {
        let page = self.take_ream(pages)?;

        page.set_class(SizeClass::Ream);
        page.set_empty();
        page.take_next_block();
        page.claim_tails();
        self.full_reams.push(page);

        self.bytes_used.set(self.bytes_used.get() + page.block_size());

        Ok(unsafe { NonNull::new_unchecked(page.data(0)) })
    }

    fn alloc_class(&self, size_class: SizeClass) -> Result<NonNull<u8>, ArenaError> {
        let list = self.sized_list(size_class);

        let page = match list.first(&self.space) {
            Some(page) => page,
            None => {
                let page = self.take_ream(1)?;

                list.push(page);
                page.set_class(size_class);
                page.set_empty();
                page
            },
        };

        let index = match page.take_next_block() {
            Some(index) => index,
            None => unreachable!("full page in free list"),
        };

        if page.is_full() {
            page.unlink();
            self.full_pages.push(page);
        }

        let bytes = page.block_size();
        self.bytes_used.set(self.bytes_used.get() + bytes);

        Ok(unsafe { NonNull::new_unchecked(page.data(index)) })
    }
}
