//! Space allocation strategies.
//!
//! A strategy decides how much capacity a new record gets for a payload of a
//! given length. Growing records relocate, so padding capacity on top of the
//! payload trades disk space for fewer relocations.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::layout::MAX_CAPACITY;

/// Policy mapping a requested payload length to a granted record capacity.
pub trait SpaceAllocationStrategy: Send + Sync + std::fmt::Debug {
    /// Capacity of the scratch buffers handed to writers of new records.
    fn default_capacity(&self) -> usize;

    /// Capacity to allocate for a new record, given the payload length the
    /// writer produced and the capacity of the buffer it used. The returned
    /// value must be >= `length`.
    fn capacity(&self, length: usize, buffer_capacity: usize) -> usize;
}

/// Grants exactly the capacity of the buffer the writer filled: the writer
/// decides how much slack a record gets.
#[derive(Debug)]
pub struct WriterDecides {
    default_capacity: usize,
}

impl WriterDecides {
    pub fn new(default_capacity: usize) -> StorageResult<Self> {
        if default_capacity == 0 || default_capacity > MAX_CAPACITY {
            return Err(StorageError::CapacityOutOfRange {
                capacity: default_capacity,
                max: MAX_CAPACITY,
            });
        }
        Ok(Self { default_capacity })
    }
}

impl SpaceAllocationStrategy for WriterDecides {
    fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    fn capacity(&self, length: usize, buffer_capacity: usize) -> usize {
        buffer_capacity.max(length)
    }
}

/// Grants the payload length plus a fixed percentage of headroom, with a
/// floor of `min_capacity`, capped at [`MAX_CAPACITY`].
#[derive(Debug)]
pub struct LengthPlusFixedPercent {
    default_capacity: usize,
    min_capacity: usize,
    percent_on_top: usize,
}

impl LengthPlusFixedPercent {
    pub fn new(
        default_capacity: usize,
        min_capacity: usize,
        percent_on_top: usize,
    ) -> StorageResult<Self> {
        if default_capacity == 0 || default_capacity > MAX_CAPACITY {
            return Err(StorageError::CapacityOutOfRange {
                capacity: default_capacity,
                max: MAX_CAPACITY,
            });
        }
        if min_capacity == 0 || min_capacity > default_capacity {
            return Err(StorageError::CapacityOutOfRange {
                capacity: min_capacity,
                max: default_capacity,
            });
        }
        Ok(Self {
            default_capacity,
            min_capacity,
            percent_on_top,
        })
    }
}

impl SpaceAllocationStrategy for LengthPlusFixedPercent {
    fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    fn capacity(&self, length: usize, _buffer_capacity: usize) -> usize {
        let advised = length + length * self.percent_on_top / 100 + 1;
        advised.max(self.min_capacity).min(MAX_CAPACITY)
    }
}
