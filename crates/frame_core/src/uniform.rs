//! Alignment-padded packing for dynamically offset uniform data
//!
//! A dynamic uniform offset must be a multiple of the device's
//! `minUniformBufferOffsetAlignment`. Per-frame replicas of a uniform block
//! therefore sit `align_up(size_of::<Block>())` bytes apart inside one buffer.

/// Round `size` up to the next multiple of `min_alignment`
///
/// `min_alignment` comes from the device limits and is a power of two, or zero
/// when the device imposes no alignment (in which case `size` is returned as is).
pub const fn align_up(size: u64, min_alignment: u64) -> u64 {
    if min_alignment == 0 {
        return size;
    }
    debug_assert!(min_alignment.is_power_of_two());
    (size + min_alignment - 1) & !(min_alignment - 1)
}

/// Placement of `count` replicas of a uniform block inside one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaLayout {
    block_size: u64,
    stride: u64,
    count: usize,
}

impl ReplicaLayout {
    /// Lay out `count` replicas of a `block_size` byte block
    pub const fn new(block_size: u64, min_alignment: u64, count: usize) -> Self {
        Self {
            block_size,
            stride: align_up(block_size, min_alignment),
            count,
        }
    }

    /// Lay out `count` replicas of `T`
    pub const fn of<T>(min_alignment: u64, count: usize) -> Self {
        Self::new(std::mem::size_of::<T>() as u64, min_alignment, count)
    }

    /// Unpadded size of one replica
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Distance between consecutive replicas
    pub const fn stride(&self) -> u64 {
        self.stride
    }

    /// Number of replicas
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Byte offset of replica `index`
    pub const fn offset(&self, index: usize) -> u64 {
        index as u64 * self.stride
    }

    /// Dynamic offset argument for replica `index`
    ///
    /// `None` when the offset does not fit the 32-bit bind-time argument.
    pub fn dynamic_offset(&self, index: usize) -> Option<u32> {
        u32::try_from(self.offset(index)).ok()
    }

    /// Bytes needed to hold every replica
    pub const fn total_size(&self) -> u64 {
        self.count as u64 * self.stride
    }
}
