use std::cell::Cell;
use std::ptr::NonNull;

use cmsgc_arena::MIN_ALIGN;

/// Called with the payload address right before an object's memory goes back
/// to the arena.
pub type Finalizer = fn(NonNull<u8>);

/// Distance between the start of a block and the payload handed to the host.
pub const HEADER_SIZE: usize = std::mem::size_of::<Header>();

const _: () = assert!(HEADER_SIZE % MIN_ALIGN == 0);

const LIVE: usize = 1 << 0;
const MARK: usize = 1 << 1;

/// Metadata stored in front of every managed payload.
#[repr(C, align(16))]
pub(crate) struct Header {
    flags: Cell<usize>,
    finalizer: Cell<Option<Finalizer>>,
}

impl Header {
    /// Writes a fresh live, unmarked header at the start of `block`.
    ///
    /// # Safety
    /// `block` must be a freshly allocated arena block of at least `HEADER_SIZE` bytes.
    pub unsafe fn init<'a>(block: NonNull<u8>) -> &'a Header {
        let header = block.cast::<Header>();
        header.as_ptr().write(Header {
            flags: Cell::new(LIVE),
            finalizer: Cell::new(None),
        });

        header.as_ref()
    }

    /// # Safety
    /// `block` must be an allocated block carrying an initialized header.
    pub unsafe fn from_block<'a>(block: NonNull<u8>) -> &'a Header {
        block.cast::<Header>().as_ref()
    }

    /// # Safety
    /// `payload` must have been returned by the heap and not been freed.
    pub unsafe fn from_payload<'a>(payload: NonNull<u8>) -> &'a Header {
        Self::from_block(Self::block_of(payload))
    }

    pub fn block_of(payload: NonNull<u8>) -> NonNull<u8> {
        unsafe {
            NonNull::new_unchecked(payload.as_ptr().sub(HEADER_SIZE))
        }
    }

    pub fn block(&self) -> NonNull<u8> {
        NonNull::from(self).cast()
    }

    pub fn payload(&self) -> NonNull<u8> {
        unsafe {
            NonNull::new_unchecked(self.block().as_ptr().add(HEADER_SIZE))
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.flags.get() & LIVE != 0
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.flags.get() & MARK != 0
    }

    #[inline]
    pub fn set_marked(&self, marked: bool) {
        self.set_flag(MARK, marked);
    }

    #[inline]
    pub fn set_live(&self, live: bool) {
        self.set_flag(LIVE, live);
    }

    /// Drops both flags, the object is about to be returned to the arena.
    pub fn retire(&self) {
        self.flags.set(0);
    }

    pub fn finalizer(&self) -> Option<Finalizer> {
        self.finalizer.get()
    }

    pub fn set_finalizer(&self, finalizer: Option<Finalizer>) {
        self.finalizer.set(finalizer);
    }

    fn set_flag(&self, flag: usize, on: bool) {
        let flags = self.flags.get();
        self.flags.set(if on { flags | flag } else { flags & !flag });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nothing(_: NonNull<u8>) {}

    #[repr(align(16))]
    struct Block([u8; 64]);

    impl Block {
        fn start(&mut self) -> NonNull<u8> {
            NonNull::new(self.0.as_mut_ptr()).unwrap()
        }
    }

    #[test]
    fn header_keeps_payload_aligned() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(std::mem::align_of::<Header>(), 16);
    }

    #[test]
    fn flags() {
        let mut storage = Block([0; 64]);
        let block = storage.start();

        let header = unsafe { Header::init(block) };
        assert!(header.is_live());
        assert!(!header.is_marked());
        assert!(header.finalizer().is_none());

        header.set_marked(true);
        assert!(header.is_live() && header.is_marked());

        header.set_finalizer(Some(nothing));
        assert!(header.finalizer().is_some());

        header.retire();
        assert!(!header.is_live() && !header.is_marked());
        assert!(header.finalizer().is_some());
    }

    #[test]
    fn payload_round_trip() {
        let mut storage = Block([0; 64]);
        let block = storage.start();

        let header = unsafe { Header::init(block) };
        let payload = header.payload();
        assert_eq!(payload.as_ptr() as usize - block.as_ptr() as usize, HEADER_SIZE);
        assert_eq!(Header::block_of(payload), block);
        assert!(unsafe { Header::from_payload(payload) }.is_live());
    }
}
