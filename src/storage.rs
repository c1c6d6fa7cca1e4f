//! Storage layer implementation for blobstore.
//!
//! This module provides persistent blob storage over a single page-based
//! file. Key components:
//!
//! - **PageFile**: Handles reading/writing fixed-size pages to disk
//! - **PageCache**: In-memory cache of pages with per-page locks, pinning
//!   and LRU eviction
//! - **layout**: The on-disk record format (ACTUAL/MOVED/PADDING headers
//!   with size classes)
//! - **Addressing**: Maps 32-bit record ids to bucket-aligned byte offsets
//! - **BlobStore**: CRUD over records with redirect chains, sequential
//!   scans, persistent counters and a crash-status signal
//!
//! Space freed by deleted and relocated records is not reclaimed here;
//! compaction is a maintenance concern layered on top of this module.

pub mod addressing;
pub mod alloc;
pub mod buffer;
pub mod disk;
pub mod error;
pub mod layout;
pub mod store;

pub use addressing::{Addressing, RecordId, OFFSET_BUCKET};
pub use alloc::{LengthPlusFixedPercent, SpaceAllocationStrategy, WriterDecides};
pub use buffer::{PageCache, PageReadGuard, PageWriteGuard};
pub use disk::{PageFile, PageId, DEFAULT_PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use store::{BlobStore, StoreConfig, HEADER_SIZE, MAX_REDIRECTS, STORAGE_MAGIC, STORAGE_VERSION};
