use std::fmt;

use serde::{Deserialize, Serialize};

/// A half-open block range `[start, end)`.
///
/// The range of a closed boundary is never empty and the ranges closed by one bundler are
/// contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// The window of `size` blocks that `block` opens.
    ///
    /// The end is aligned on the next multiple of `size` while the start stays at `block`, so a
    /// first window opened mid-way is shorter and every following one is aligned.
    ///
    /// Returns `None` when the end does not fit in a `u64`.
    pub fn window(block: u64, size: u64) -> Option<Self> {
        let end = (block - block % size).checked_add(size)?;
        Some(Self { start: block, end })
    }

    pub fn contains(&self, block: u64) -> bool {
        self.start <= block && block < self.end
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// `0000000100-0000000200.jsonl`
    pub fn file_name(&self, extension: &str) -> String {
        format!("{:010}-{:010}.{extension}", self.start, self.end)
    }

    /// `0000000100-0000000200.tmp.jsonl`, the name of the in-progress file of the boundary.
    pub fn working_file_name(&self, extension: &str) -> String {
        format!("{:010}-{:010}.tmp.{extension}", self.start, self.end)
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
