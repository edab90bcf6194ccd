use crate::space::PAGE_BYTES;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SizeClass {
    Ream = 0,
    /// A page inside a ream, other than its first.
    Tail = 1,
    Block16 = 4,
    Block32 = 5,
    Block64 = 6,
    Block128 = 7,
    Block256 = 8,
    Block512 = 9,
    Block1024 = 10,
    Block2048 = 11,
    Block4096 = 12,
}

impl SizeClass {
    pub const SMALL: [Self; 9] = [
        Self::Block16,
        Self::Block32,
        Self::Block64,
        Self::Block128,
        Self::Block256,
        Self::Block512,
        Self::Block1024,
        Self::Block2048,
        Self::Block4096,
    ];

    const SMALL_SHIFT: u32 = Self::Block16 as u32;

    /// Smallest size class that fits `bytes`, or `None` if it needs a ream.
    pub fn for_size(bytes: usize) -> Option<Self> {
        if bytes > PAGE_BYTES {
            return None;
        }

        let bin_log = bytes.max(1).next_power_of_two().trailing_zeros();
        let index = bin_log.saturating_sub(Self::SMALL_SHIFT) as usize;

        Self::SMALL.get(index).copied()
    }

    pub const fn block_bytes(self) -> Option<usize> {
        match self {
            Self::Ream | Self::Tail => None,
            _ => Some(1 << (self as usize)),
        }
    }

    pub const fn total_blocks(self) -> usize {
        if let Some(size) = self.block_bytes() {
            PAGE_BYTES / size
        } else {
            1
        }
    }

    pub(crate) fn list_index(self) -> usize {
        debug_assert!(self.block_bytes().is_some());
        (self as u32 - Self::SMALL_SHIFT) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_power_of_two() {
        assert_eq!(SizeClass::for_size(0), Some(SizeClass::Block16));
        assert_eq!(SizeClass::for_size(1), Some(SizeClass::Block16));
        assert_eq!(SizeClass::for_size(16), Some(SizeClass::Block16));
        assert_eq!(SizeClass::for_size(17), Some(SizeClass::Block32));
        assert_eq!(SizeClass::for_size(144), Some(SizeClass::Block256));
        assert_eq!(SizeClass::for_size(4096), Some(SizeClass::Block4096));
        assert_eq!(SizeClass::for_size(4097), None);
    }

    #[test]
    fn blocks_fill_a_page() {
        for class in SizeClass::SMALL {
            assert_eq!(class.total_blocks() * class.block_bytes().unwrap(), PAGE_BYTES);
        }
        assert_eq!(SizeClass::Block16.total_blocks(), 256);
        assert_eq!(SizeClass::Ream.total_blocks(), 1);
    }
}
