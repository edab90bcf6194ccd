/// A caller owned span of memory whose words are scanned as possible pointers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RootRange {
    pub from: usize,
    pub to: usize,
}

impl RootRange {
    pub fn new<T>(from: *const T, to: *const T) -> Self {
        Self {
            from: from as usize,
            to: to as usize,
        }
    }

    /// The range covering every element of `slice`.
    pub fn of_slice<T>(slice: &[T]) -> Self {
        let range = slice.as_ptr_range();
        Self::new(range.start, range.end)
    }

    pub fn len(&self) -> usize {
        self.to.saturating_sub(self.from)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of [`crate::Heap::remove_root`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RootRemoval {
    Removed,
    NotFound,
    /// There were no roots registered at all.
    NoRoots,
}

#[derive(Debug, Default)]
pub(crate) struct Roots {
    ranges: Vec<RootRange>,
}

impl Roots {
    pub fn add(&mut self, range: RootRange) {
        self.ranges.push(range);
    }

    /// Removes the first range equal to `range`.
    pub fn remove(&mut self, range: RootRange) -> RootRemoval {
        if self.ranges.is_empty() {
            return RootRemoval::NoRoots;
        }

        match self.ranges.iter().position(|r| *r == range) {
            Some(index) => {
                self.ranges.remove(index);
                RootRemoval::Removed
            },
            None => RootRemoval::NotFound,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RootRange> {
        self.ranges.iter()
    }

    pub fn snapshot(&self) -> Vec<RootRange> {
        self.ranges.clone()
    }
}
