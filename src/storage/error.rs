//! Storage layer error types.

use thiserror::Error;

/// Errors that can occur in the storage layer.
///
/// Variants fall into a few classes: caller bugs (invalid ids, out-of-range
/// capacities/lengths), recoverable logical state (`AlreadyDeleted`), file
/// corruption, lifecycle misuse (`ClosedStorage`, reopen mismatches), and
/// environment failures (I/O, cache exhaustion).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid record id: {id} (must be > 0)")]
    InvalidRecordId { id: u32 },

    #[error("Record id {id} is not yet allocated (allocated ids are all < {next_id})")]
    RecordIdNotAllocated { id: u32, next_id: u32 },

    #[error("Capacity {capacity} is out of range [0, {max}]")]
    CapacityOutOfRange { capacity: usize, max: usize },

    #[error("Length {length} is out of range [0, {max}]")]
    LengthOutOfRange { length: usize, max: usize },

    #[error("Page size {page_size} is out of range [{min}, {max}] or not a multiple of {bucket}")]
    PageSizeOutOfRange {
        page_size: usize,
        min: usize,
        max: usize,
        bucket: usize,
    },

    #[error("Record {id} is deleted")]
    AlreadyDeleted { id: u32 },

    #[error("Storage is corrupted: {reason}")]
    Corrupted { reason: String },

    #[error("Redirect chain starting at record {id} is longer than {max}: circular reference?")]
    RedirectChainTooLong { id: u32, max: usize },

    #[error("Storage is already closed")]
    ClosedStorage,

    #[error("Stored page size {stored} does not match the configured page size {configured}")]
    WrongPageSize { stored: u32, configured: u32 },

    #[error("Stored format version {stored} does not match the current version {current}")]
    WrongStorageVersion { stored: u32, current: u32 },

    #[error("Page cache is full: cannot allocate a frame")]
    CacheFull,

    #[error("Page {page_id} does not exist")]
    PageNotFound { page_id: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
