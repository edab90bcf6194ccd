use std::ptr;
use thiserror::Error;

//TODO support windows (using 'windows' crate)
//TODO use libc::MAP_HUGETLB on supported platforms

#[derive(Error, Debug)]
pub enum MapError {
    #[error("cannot map a zero sized region")]
    Empty,

    #[error("mmap of {size} bytes failed: {source}")]
    Failed {
        size: usize,
        source: std::io::Error,
    },
}

/// A private, anonymous and lazily committed region of virtual memory.
pub struct MemoryMap {
    size: usize,
    data: *mut u8,
}

impl MemoryMap {
    pub fn data(&self) -> *mut u8 {
        self.data
    }

}

#[cfg(miri)]
impl MemoryMap {
    const ALIGN: usize = 4096;

    pub fn new(size: usize) -> Result<Self, MapError> {
        if size == 0 {
            return Err(MapError::Empty);
        }

        let layout = std::alloc::Layout::from_size_align(size, Self::ALIGN)
            .map_err(|_| MapError::Empty)?;
        let data = unsafe { std::alloc::alloc_zeroed(layout) };

        if data.is_null() {
            return Err(MapError::Failed {
                size,
                source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
            });
        }

        Ok(Self { size, data })
    }
}

#[cfg(miri)]
impl Drop for MemoryMap {
    fn drop(&mut self) {
        unsafe {
            let layout = std::alloc::Layout::from_size_align_unchecked(self.size, Self::ALIGN);
            std::alloc::dealloc(self.data, layout);
        }
    }
}

#[cfg(all(not(miri), unix))]
impl MemoryMap {
    pub fn new(size: usize) -> Result<Self, MapError> {
        if size == 0 {
            return Err(MapError::Empty);
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if addr.is_null() || addr == libc::MAP_FAILED {
            return Err(MapError::Failed {
                size,
                source: std::io::Error::last_os_error(),
            });
        }

        Ok(Self {
            data: addr as _,
            size,
        })
    }
}

#[cfg(all(not(miri), unix))]
impl Drop for MemoryMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.data as _, self.size);
        }
    }
}
