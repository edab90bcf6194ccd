use std::cell::Cell;

use cmsgc_mmap::MemoryMap;

use crate::size_class::SizeClass;
use crate::ArenaError;

pub const PAGE_BYTES: usize = 4096;

/// Returns the number of pages needed for `n` bytes (rounding up).
pub const fn bytes_to_pages(n: usize) -> usize {
    if n % PAGE_BYTES != 0 {
        n / PAGE_BYTES + 1
    } else {
        n / PAGE_BYTES
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct PdIdx(u32);

/// Layout of the reservation: page descriptors, then one bitmap per page, then
/// the data pages themselves.
pub struct AddrSpace {
    mem: MemoryMap,

    data_pages: usize,
    pd_bytes: usize,
    data_start: usize,

    used_pds: Cell<u32>,
    reserved_pds: Cell<u32>,
}

impl AddrSpace {
    /// Room for the list sentinels plus a handful of usable pages.
    pub const MIN_DATA_PAGES: usize = 64;

    pub fn create(reserve_bytes: usize) -> Result<Self, ArenaError> {
        let data_pages = reserve_bytes / PAGE_BYTES;
        if data_pages < Self::MIN_DATA_PAGES || data_pages > u32::MAX as usize {
            return Err(ArenaError::BadReservation { reserve_bytes });
        }

        let pd_pages = bytes_to_pages(data_pages * std::mem::size_of::<PageDescriptor>());
        let bitmap_pages = bytes_to_pages(data_pages * std::mem::size_of::<Bitmap>());

        let pd_bytes = pd_pages * PAGE_BYTES;
        let data_start = pd_bytes + bitmap_pages * PAGE_BYTES;

        let mem = MemoryMap::new(data_start + data_pages * PAGE_BYTES)?;

        Ok(Self {
            mem,
            data_pages,
            pd_bytes,
            data_start,
            used_pds: Cell::new(0),
            reserved_pds: Cell::new(0),
        })
    }

    /// Constructs a [`PdRef`] for the specified [`PdIdx`].
    pub unsafe fn pd(&self, idx: PdIdx) -> PdRef<'_> {
        PdRef {
            idx,
            space: self,
        }
    }

    /// Constructs a [`PdRef`] for the specified index.
    pub unsafe fn pd_at(&self, index: u32) -> PdRef<'_> {
        PdRef {
            idx: PdIdx(index),
            space: self,
        }
    }

    fn data_base(&self) -> usize {
        self.mem.data() as usize + self.data_start
    }

    /// The descriptor of the page `addr` is in, if it is a usable data page.
    /// Any address may be passed in, including ones that were never handed out.
    pub fn page_of(&self, addr: usize) -> Option<PdRef<'_>> {
        let base = self.data_base();
        if addr < base {
            return None;
        }

        let index = (addr - base) / PAGE_BYTES;
        if index < self.reserved_pds.get() as usize || index >= self.used_pds.get() as usize {
            return None;
        }

        Some(unsafe { self.pd_at(index as u32) })
    }

    /// Finds the allocated block containing `addr` as its page and block index.
    pub fn find_block(&self, addr: usize) -> Option<(PdRef<'_>, usize)> {
        let page = self.page_of(addr)?;

        match page.class() {
            SizeClass::Tail => {
                let head = page.head();
                let offset = page.idx.0.checked_sub(head.idx.0)? as usize;

                let in_ream = head.class() == SizeClass::Ream
                    && offset < head.pages()
                    && head.is_marked(0);

                in_ream.then_some((head, 0))
            },
            SizeClass::Ream => page.is_marked(0).then_some((page, 0)),
            class => {
                let size = class.block_bytes()?;
                let index = (addr - page.data(0) as usize) / size;

                page.is_marked(index).then_some((page, index))
            },
        }
    }

    /// Return an iterator over all created [`PageDescriptor`]s.
    pub fn pds(&self) -> impl Iterator<Item = PdRef<'_>> {
        let end = self.used_pds.get();
        let mut index = self.reserved_pds.get();
        std::iter::from_fn(move || {
            if index >= end {
                return None;
            }

            let pd = unsafe {
                self.pd_at(index)
            };

            index += pd.pages() as u32;

            Some(pd)
        })
    }

    pub fn available_pages(&self) -> u32 {
        let used_pages = self.used_pds.get();
        self.data_pages as u32 - used_pages
    }

    pub(crate) fn new_reserved(&self) -> PdList {
        debug_assert_eq!(self.reserved_pds.get(), self.used_pds.get(), "You cannot call new_reserved after init");

        let ream = self.new_ream(1);
        self.reserved_pds.set(self.reserved_pds.get() + 1);
        PdList::new(ream.idx)
    }

    /// Constructs a ream of specified size.
    pub fn new_ream(&self, count: u32) -> PdRef<'_> {
        let used_pages = self.used_pds.get();

        debug_assert!(count > 0);
        debug_assert!((used_pages + count) as usize <= self.data_pages);

        self.used_pds.set(used_pages + count);

        unsafe {
            let ptr = self.mem.data().cast::<PageDescriptor>().add(used_pages as _);
            ptr.write_bytes(0, count as _);

            let ptr = self.mem.data().add(self.pd_bytes).cast::<Bitmap>().add(used_pages as _);
            ptr.write_bytes(0, count as _);
        }

        let page = unsafe {
            self.pd_at(used_pages)
        };

        unsafe { page.force_unlink() };
        page.pd().len.set(count - 1);
        page
    }
}

#[derive(Debug)]
struct PageDescriptor {
    prev: Cell<PdIdx>,
    next: Cell<PdIdx>,

    /// First page of the ream, only meaningful for [`SizeClass::Tail`].
    head: Cell<PdIdx>,

    class: Cell<SizeClass>,

    /// Additional pages
    len: Cell<u32>,
}

/// One bit per block of the page, set while the block is allocated.
struct Bitmap([Cell<u64>; 4]);

#[derive(Copy, Clone)]
pub struct PdRef<'space> {
    idx: PdIdx,
    space: &'space AddrSpace,
}

impl<'space> PdRef<'space> {
    fn pd(self) -> &'space PageDescriptor {
        unsafe {
            let offset = self.idx.0 as usize * std::mem::size_of::<PageDescriptor>();
            let ptr = self.space.mem.data().add(offset).cast::<PageDescriptor>();
            &*ptr
        }
    }

    fn bitmap(self) -> &'space Bitmap {
        unsafe {
            let offset = self.idx.0 as usize * std::mem::size_of::<Bitmap>() + self.space.pd_bytes;
            let ptr = self.space.mem.data().add(offset).cast::<Bitmap>();
            &*ptr
        }
    }

    pub fn pages(self) -> usize {
        self.pd().len.get() as usize + 1
    }

    pub fn is_single_page(self) -> bool {
        self.pages() == 1
    }

    pub fn set_class(self, size_class: SizeClass) {
        self.pd().class.set(size_class)
    }

    pub fn class(self) -> SizeClass {
        self.pd().class.get()
    }

    /// Size in bytes of every block on this page.
    pub fn block_size(self) -> usize {
        self.class()
            .block_bytes()
            .unwrap_or(self.pages() * PAGE_BYTES)
    }

    fn head(self) -> PdRef<'space> {
        PdRef {
            idx: self.pd().head.get(),
            space: self.space,
        }
    }

    /// Tags every page after the first as a tail pointing back at `self`.
    pub fn claim_tails(self) {
        for offset in 1..self.pages() as u32 {
            let tail = unsafe {
                self.space.pd_at(self.idx.0 + offset)
            };

            tail.set_class(SizeClass::Tail);
            tail.pd().head.set(self.idx);
        }
    }

    //TODO Move to bitmap
    pub fn set_empty(self) {
        for word in self.bitmap().0.iter() {
            word.set(0)
        }
    }

    //TODO Move to bitmap
    pub fn is_empty(self) -> bool {
        self.bitmap().0.iter().all(|w| w.get() == 0)
    }

    //TODO Move to bitmap
    pub fn is_full(self) -> bool {
        let mut blocks = self.class().total_blocks();
        let mut mask = || {
            let mask = if blocks >= 64 {
                !0
            } else {
                (1u64 << blocks) - 1
            };

            blocks = blocks.saturating_sub(64);
            mask
        };

        let mut is_full = true;

        for word in self.bitmap().0.iter() {
            is_full &= word.get() == mask();
        }

        is_full
    }

    /// Indices of the allocated blocks, as of the moment of the call.
    pub fn allocated(self) -> impl Iterator<Item = usize> {
        let words: [u64; 4] = std::array::from_fn(|i| self.bitmap().0[i].get());
        let total = self.class().total_blocks();

        words
            .into_iter()
            .enumerate()
            .flat_map(|(word, mut bits)| {
                std::iter::from_fn(move || {
                    if bits == 0 {
                        return None;
                    }

                    let bit = bits.trailing_zeros() as usize;
                    bits &= bits - 1;

                    Some(word * 64 + bit)
                })
            })
            .filter(move |&index| index < total)
    }

    pub fn data(self, index: usize) -> *mut u8 {
        let offset = self.space.data_start
            + self.idx.0 as usize * PAGE_BYTES
            + index * self.class().block_bytes().unwrap_or(1);

        unsafe {
            self.space.mem.data().add(offset)
        }
    }

    pub fn is_marked(self, index: usize) -> bool {
        debug_assert!(index < self.class().total_blocks());

        let word = index / 64;
        let bit = index % 64;

        let word = &self.bitmap().0[word];
        word.get() & (1 << bit) != 0
    }

    pub fn unmark(self, index: usize) {
        debug_assert!(index < self.class().total_blocks());

        let word = index / 64;
        let bit = index % 64;

        let word = &self.bitmap().0[word];
        word.set(word.get() & !(1 << bit));
    }

    pub fn next(self) -> PdRef<'space> {
        PdRef {
            idx: self.pd().next.get(),
            space: self.space,
        }
    }

    pub fn prev(self) -> PdRef<'space> {
        PdRef {
            idx: self.pd().prev.get(),
            space: self.space,
        }
    }

    /// Force self to be unlinked, this will *not* remove it from any list.
    pub unsafe fn force_unlink(self) {
        self.pd().next.set(self.idx);
        self.pd().prev.set(self.idx);
    }

    pub fn unlink(self) {
        let prev = self.prev();
        let next = self.next();

        prev.pd().next.set(next.idx);
        next.pd().prev.set(prev.idx);

        // Unlink by setting next and prev on self to self.
        self.pd().next.set(self.idx);
        self.pd().prev.set(self.idx);
    }

    //TODO Move to bitmap
    pub fn take_next_block(self) -> Option<usize> {
        let mut blocks = self.class().total_blocks();
        let mut mask = || {
            let mask = if blocks >= 64 {
                !0
            } else {
                (1u64 << blocks) - 1
            };

            blocks = blocks.saturating_sub(64);
            mask
        };

        for (index, word) in self.bitmap().0.iter().enumerate() {
            if word.get() == mask() {
                continue;
            }

            let idx = word.get().trailing_ones() as usize;
            word.set(word.get() | 1 << idx);

            return Some(index * 64 + idx);
        }

        None
    }

    pub fn split(self, split: usize) -> Option<(Self, Option<Self>)> {
        assert!(!self.is_single_page());
        assert!(split > 0);

        if self.pages() == split {
            Some((self, None))
        } else if self.pages() < split {
            None
        } else {
            let rest_len = self.pages() - split - 1;
            let rest = unsafe {
                self.space.pd_at(self.idx.0 + split as u32)
            };
            unsafe { rest.force_unlink() };
            rest.pd().len.set(rest_len as _);
            rest.set_class(SizeClass::Ream);
            rest.set_empty();

            self.pd().len.set(split as u32 - 1);

            Some((self, Some(rest)))
        }
    }

    /// Grows this free run over `next`, the free run right behind it. Neither
    /// may be on a list.
    pub fn absorb(self, next: PdRef<'space>) {
        debug_assert_eq!(self.idx.0 as usize + self.pages(), next.idx.0 as usize);
        debug_assert!(self.is_empty() && next.is_empty());

        let len = self.pages() + next.pages() - 1;
        self.set_class(SizeClass::Ream);
        self.pd().len.set(len as u32);

        next.set_class(SizeClass::Tail);
        next.pd().head.set(self.idx);
    }
}

pub struct PdList {
    root: PdIdx,
}

impl PdList {
    pub fn new(root: PdIdx) -> Self {
        Self {
            root,
        }
    }

    pub fn iter<'space>(&self, space: &'space AddrSpace) -> impl Iterator<Item = PdRef<'space>> {
        let root = unsafe {
            space.pd(self.root)
        };

        let mut current = root.next();

        std::iter::from_fn(move || {
            let value = if current.idx == root.idx {
                return None;
            } else {
                current
            };

            current = current.next();

            Some(value)
        })
    }

    pub fn first<'space>(&self, space: &'space AddrSpace) -> Option<PdRef<'space>> {
        let root = unsafe {
            space.pd(self.root)
        };

        if root.next().idx != root.idx {
            Some(root.next())
        } else {
            None
        }
    }

    pub fn push(&self, item: PdRef) {
        let root = unsafe {
            item.space.pd(self.root)
        };

        let next = root.next();

        next.pd().prev.set(item.idx);
        root.pd().next.set(item.idx);

        item.pd().prev.set(self.root);
        item.pd().next.set(next.idx);
    }
}
