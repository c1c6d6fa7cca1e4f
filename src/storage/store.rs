//! The blob record store.
//!
//! A [`BlobStore`] keeps variable-length binary records in a single file,
//! addressed by positive 32-bit [`RecordId`]s. The file starts with a fixed
//! header (magic word, format version, page size, crash status, allocation
//! cursor and live-record counters) followed by the record stream; records
//! are laid out by [`crate::storage::layout`] and never cross a page
//! boundary.
//!
//! Records that outgrow their capacity are relocated: the old slot becomes a
//! MOVED record pointing at the new id (or at NULL, which marks deletion).
//! Read and write operations follow these redirect chains transparently, up
//! to [`MAX_REDIRECTS`] hops, and report the resolved id back so callers can
//! drop stale ids. `delete` deliberately does *not* follow the chain: its job
//! is to retire one specific slot, not the live record it points at.
//!
//! The store is `Send + Sync`. Page-level locking is delegated to the
//! [`PageCache`]; the store itself only serializes the allocation cursor.

use byteorder::{ByteOrder, LittleEndian};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::storage::addressing::{Addressing, RecordId, OFFSET_BUCKET};
use crate::storage::alloc::SpaceAllocationStrategy;
use crate::storage::buffer::{lru::LruReplacer, PageCache};
use crate::storage::disk::{PageFile, PageId, DEFAULT_PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::layout::{self, RecordHeader};

pub const STORAGE_MAGIC: [u8; 4] = *b"BLBS";
pub const STORAGE_VERSION: u32 = 1;

/// Fixed header size; records start at the first bucket boundary after it.
pub const HEADER_SIZE: usize = 64;

/// Max length of a redirect chain before it is reported as corruption.
pub const MAX_REDIRECTS: usize = 1024;

const FILE_STATUS_OPENED: u32 = 0;
const FILE_STATUS_PROPERLY_CLOSED: u32 = 1;

const HEADER_OFFSET_MAGIC: usize = 0;
const HEADER_OFFSET_STORAGE_VERSION: usize = 4;
const HEADER_OFFSET_PAGE_SIZE: usize = 8;
const HEADER_OFFSET_FILE_STATUS: usize = 12;
const HEADER_OFFSET_NEXT_RECORD_ID: usize = 16;
const HEADER_OFFSET_RECORDS_ALLOCATED: usize = 20;
const HEADER_OFFSET_RECORDS_RELOCATED: usize = 24;
const HEADER_OFFSET_RECORDS_DELETED: usize = 28;
const HEADER_OFFSET_LIVE_PAYLOAD_BYTES: usize = 32;
const HEADER_OFFSET_LIVE_CAPACITY_BYTES: usize = 40;
const HEADER_OFFSET_DATA_FORMAT_VERSION: usize = 48;

const SCRATCH_POOL_LIMIT: usize = 8;

/// Store construction parameters.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Page size of the backing file. Persisted in the header; reopening
    /// with a different page size fails.
    pub page_size: usize,
    /// Max pages kept in the cache.
    pub cache_frames: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_frames: 64,
        }
    }
}

/// Persistent blob storage over a paged file.
pub struct BlobStore {
    cache: PageCache,
    strategy: Box<dyn SpaceAllocationStrategy>,
    addressing: Addressing,
    page_size: usize,

    /// Guards cursor advancement; the cursor itself is atomic so id-range
    /// checks do not need the lock.
    alloc_lock: Mutex<()>,
    next_record_id: AtomicU32,

    closed: AtomicBool,
    was_closed_properly: bool,

    recs_allocated: AtomicU32,
    recs_relocated: AtomicU32,
    recs_deleted: AtomicU32,
    live_payload_bytes: AtomicU64,
    live_capacity_bytes: AtomicU64,

    scratch: Mutex<Vec<BytesMut>>,
}

impl BlobStore {
    /// Opens the store at `path`, creating the file if it does not exist.
    pub fn open(
        path: &Path,
        config: StoreConfig,
        strategy: Box<dyn SpaceAllocationStrategy>,
    ) -> StorageResult<BlobStore> {
        let file = if path.exists() {
            PageFile::open(path, config.page_size)?
        } else {
            PageFile::create(path, config.page_size)?
        };
        let replacer = Box::new(LruReplacer::new(config.cache_frames));
        let cache = PageCache::new(file, replacer, config.cache_frames);
        let addressing = Addressing::new(HEADER_SIZE as u64);

        let page_size = config.page_size;
        let first_id = addressing.first_record_id();

        let mut next_record_id = first_id.0;
        let mut was_closed_properly = true;
        let mut recs_allocated = 0u32;
        let mut recs_relocated = 0u32;
        let mut recs_deleted = 0u32;
        let mut live_payload_bytes = 0u64;
        let mut live_capacity_bytes = 0u64;

        let has_header = cache.len()? >= HEADER_SIZE as u64;
        {
            let mut page = cache.fetch_page_write(PageId(0))?;
            if has_header {
                if page[HEADER_OFFSET_MAGIC..HEADER_OFFSET_MAGIC + 4] != STORAGE_MAGIC {
                    return Err(StorageError::Corrupted {
                        reason: format!("{}: bad magic word", path.display()),
                    });
                }
                let version = header_u32(&page, HEADER_OFFSET_STORAGE_VERSION);
                if version != STORAGE_VERSION {
                    return Err(StorageError::WrongStorageVersion {
                        stored: version,
                        current: STORAGE_VERSION,
                    });
                }
                let stored_page_size = header_u32(&page, HEADER_OFFSET_PAGE_SIZE);
                if stored_page_size as usize != page_size {
                    return Err(StorageError::WrongPageSize {
                        stored: stored_page_size,
                        configured: page_size as u32,
                    });
                }

                let status = header_u32(&page, HEADER_OFFSET_FILE_STATUS);
                was_closed_properly = status == FILE_STATUS_PROPERLY_CLOSED;
                if !was_closed_properly {
                    log::warn!(
                        "{}: storage was not closed properly, cursor and counters may be stale",
                        path.display()
                    );
                }

                next_record_id = header_u32(&page, HEADER_OFFSET_NEXT_RECORD_ID).max(first_id.0);
                recs_allocated = header_u32(&page, HEADER_OFFSET_RECORDS_ALLOCATED);
                recs_relocated = header_u32(&page, HEADER_OFFSET_RECORDS_RELOCATED);
                recs_deleted = header_u32(&page, HEADER_OFFSET_RECORDS_DELETED);
                live_payload_bytes = header_u64(&page, HEADER_OFFSET_LIVE_PAYLOAD_BYTES);
                live_capacity_bytes = header_u64(&page, HEADER_OFFSET_LIVE_CAPACITY_BYTES);
            } else {
                page[HEADER_OFFSET_MAGIC..HEADER_OFFSET_MAGIC + 4].copy_from_slice(&STORAGE_MAGIC);
                put_header_u32(&mut page, HEADER_OFFSET_STORAGE_VERSION, STORAGE_VERSION);
                put_header_u32(&mut page, HEADER_OFFSET_PAGE_SIZE, page_size as u32);
                put_header_u32(&mut page, HEADER_OFFSET_NEXT_RECORD_ID, next_record_id);
                log::debug!("{}: created new blob storage", path.display());
            }
            put_header_u32(&mut page, HEADER_OFFSET_FILE_STATUS, FILE_STATUS_OPENED);
        }
        // persist the OPENED status right away so an unclean shutdown is
        // visible on the next open
        cache.sync()?;

        Ok(BlobStore {
            cache,
            strategy,
            addressing,
            page_size,
            alloc_lock: Mutex::new(()),
            next_record_id: AtomicU32::new(next_record_id),
            closed: AtomicBool::new(false),
            was_closed_properly,
            recs_allocated: AtomicU32::new(recs_allocated),
            recs_relocated: AtomicU32::new(recs_relocated),
            recs_deleted: AtomicU32::new(recs_deleted),
            live_payload_bytes: AtomicU64::new(live_payload_bytes),
            live_capacity_bytes: AtomicU64::new(live_capacity_bytes),
            scratch: Mutex::new(Vec::new()),
        })
    }

    // === record operations ===

    /// True if `id` resolves (through MOVED links) to a live record. NULL
    /// and not-yet-allocated ids are simply `false`.
    pub fn has_record(&self, id: RecordId) -> StorageResult<bool> {
        Ok(self.has_record_resolving(id)?.0)
    }

    /// Like [`Self::has_record`], additionally returning the last id on the
    /// redirect chain, which callers should use going forward.
    pub fn has_record_resolving(&self, id: RecordId) -> StorageResult<(bool, RecordId)> {
        self.check_not_closed()?;
        if id.is_null() || id.0 >= self.next_record_id.load(Ordering::SeqCst) {
            return Ok((false, id));
        }
        let mut current = id;
        for _ in 0..MAX_REDIRECTS {
            let offset = self.addressing.id_to_offset(current);
            let page = self.cache.fetch_page(self.page_of(offset))?;
            match self.decode_record(&page, offset)? {
                RecordHeader::Actual { .. } => return Ok((true, current)),
                RecordHeader::Moved { redirect_to, .. } => {
                    if redirect_to.is_null() {
                        return Ok((false, current));
                    }
                    self.check_redirect_target(current, redirect_to)?;
                    current = redirect_to;
                }
                RecordHeader::Padding { .. } => {
                    return Err(self.padding_in_chain(current, offset))
                }
            }
        }
        Err(StorageError::RedirectChainTooLong {
            id: id.0,
            max: MAX_REDIRECTS,
        })
    }

    /// Reads the record `id` resolves to, handing its payload to `reader`.
    /// Returns the reader's result and the resolved id.
    pub fn read<R>(
        &self,
        id: RecordId,
        reader: impl FnOnce(&[u8]) -> R,
    ) -> StorageResult<(R, RecordId)> {
        self.check_not_closed()?;
        self.check_id_exists(id)?;
        let mut current = id;
        for _ in 0..MAX_REDIRECTS {
            let offset = self.addressing.id_to_offset(current);
            let in_page = self.offset_in_page(offset);
            let page = self.cache.fetch_page(self.page_of(offset))?;
            match self.decode_record(&page, offset)? {
                RecordHeader::Actual { kind, length, .. } => {
                    let data_start = in_page + kind.header_size();
                    let out = reader(&page[data_start..data_start + length]);
                    return Ok((out, current));
                }
                RecordHeader::Moved { redirect_to, .. } => {
                    if redirect_to.is_null() {
                        return Err(StorageError::AlreadyDeleted { id: current.0 });
                    }
                    self.check_redirect_target(current, redirect_to)?;
                    current = redirect_to;
                }
                RecordHeader::Padding { .. } => {
                    return Err(self.padding_in_chain(current, offset))
                }
            }
        }
        Err(StorageError::RedirectChainTooLong {
            id: id.0,
            max: MAX_REDIRECTS,
        })
    }

    /// Copies the resolved record payload out into a `Vec`.
    pub fn read_to_vec(&self, id: RecordId) -> StorageResult<(Vec<u8>, RecordId)> {
        self.read(id, |payload| payload.to_vec())
    }

    /// Inserts a new record (`id` = NULL) or updates an existing one.
    ///
    /// The writer receives a scratch buffer: empty for an insert, loaded with
    /// the current payload for an update. Returning `Ok(false)` skips the
    /// write entirely; returning `Ok(true)` makes the buffer's content the
    /// new payload. Content that no longer fits the record's capacity
    /// relocates it: the new record is written first, then the old slot is
    /// rewritten as a MOVED tombstone pointing at the new id (if
    /// `keep_redirect_on_move`) or at NULL (which deletes the old id).
    ///
    /// Returns the id to use for the record from now on.
    pub fn write(
        &self,
        id: RecordId,
        writer: impl FnOnce(&mut BytesMut) -> StorageResult<bool>,
        size_hint: usize,
        keep_redirect_on_move: bool,
    ) -> StorageResult<RecordId> {
        self.check_not_closed()?;

        if id.is_null() {
            // insert
            let mut buf = self.acquire_scratch(size_hint);
            let out = match writer(&mut buf) {
                Err(e) => Err(e),
                Ok(false) => Ok(RecordId::NULL),
                Ok(true) => self.insert_payload(&buf, buf.capacity()),
            };
            self.release_scratch(buf);
            return out;
        }

        self.check_id_exists(id)?;
        let mut current = id;
        for _ in 0..MAX_REDIRECTS {
            let offset = self.addressing.id_to_offset(current);
            let in_page = self.offset_in_page(offset);
            let mut page = self.cache.fetch_page_write(self.page_of(offset))?;
            match self.decode_record(&page, offset)? {
                RecordHeader::Moved { redirect_to, .. } => {
                    if redirect_to.is_null() {
                        return Err(StorageError::AlreadyDeleted { id: current.0 });
                    }
                    self.check_redirect_target(current, redirect_to)?;
                    current = redirect_to;
                }
                RecordHeader::Padding { .. } => {
                    return Err(self.padding_in_chain(current, offset))
                }
                RecordHeader::Actual {
                    kind,
                    capacity,
                    length,
                } => {
                    let data_start = in_page + kind.header_size();
                    let mut buf = self.acquire_scratch(capacity.max(size_hint));
                    buf.extend_from_slice(&page[data_start..data_start + length]);

                    let out = match writer(&mut buf) {
                        Err(e) => Err(e),
                        Ok(false) => Ok(current),
                        Ok(true) if buf.len() <= capacity => {
                            // new content fits in place; only the payload and
                            // length change
                            let new_length = buf.len();
                            page[data_start..data_start + new_length].copy_from_slice(&buf);
                            let result = layout::put_length(&mut page[in_page..], new_length);
                            match result {
                                Ok(()) => {
                                    self.adjust_live_payload(length, new_length);
                                    Ok(current)
                                }
                                Err(e) => Err(e),
                            }
                        }
                        Ok(true) => {
                            // relocate: write the new record first, then
                            // tombstone the old slot, so a crash in between
                            // leaves the new record unreachable rather than
                            // the old one lost
                            drop(page);
                            self.relocate(current, offset, &buf, keep_redirect_on_move)
                        }
                    };
                    self.release_scratch(buf);
                    return out;
                }
            }
        }
        Err(StorageError::RedirectChainTooLong {
            id: id.0,
            max: MAX_REDIRECTS,
        })
    }

    /// Convenience wrapper: inserts `payload` as a new record.
    pub fn insert(&self, payload: &[u8]) -> StorageResult<RecordId> {
        self.write(
            RecordId::NULL,
            |buf| {
                buf.extend_from_slice(payload);
                Ok(true)
            },
            payload.len(),
            false,
        )
    }

    /// Deletes the record slot at exactly `id`.
    ///
    /// Unlike reads and writes this never follows the redirect chain: the
    /// chain exists so stale slots can be retired individually once their
    /// clients re-learned the new id, and following it here would make the
    /// stale slots impossible to delete without killing the live record.
    pub fn delete(&self, id: RecordId) -> StorageResult<()> {
        self.check_not_closed()?;
        self.check_id_exists(id)?;

        let offset = self.addressing.id_to_offset(id);
        let in_page = self.offset_in_page(offset);
        let mut page = self.cache.fetch_page_write(self.page_of(offset))?;
        match self.decode_record(&page, offset)? {
            RecordHeader::Moved { redirect_to, .. } => {
                if redirect_to.is_null() {
                    return Err(StorageError::AlreadyDeleted { id: id.0 });
                }
                // finalize the tombstone; the record itself was already
                // discounted when it was relocated
                layout::put_redirect(&mut page[in_page..], RecordId::NULL)?;
                Ok(())
            }
            RecordHeader::Actual {
                kind,
                capacity,
                length,
            } => {
                // the slot keeps its total on-disk size, so its capacity is
                // recomputed for the MOVED header
                let moved_capacity =
                    kind.full_record_size(capacity) - layout::MOVED_HEADER_SIZE;
                layout::put_moved(&mut page[in_page..], moved_capacity, RecordId::NULL)?;
                self.recs_deleted.fetch_add(1, Ordering::SeqCst);
                self.sub_live(length, capacity);
                Ok(())
            }
            RecordHeader::Padding { .. } => Err(self.padding_in_chain(id, offset)),
        }
    }

    /// Scans every record slot in offset order, without following redirects.
    ///
    /// The visitor receives `(id, capacity, length, payload)`; `length` is
    /// negative (and the payload empty) for non-ACTUAL records. PADDING
    /// fillers are skipped. Returns the number of records visited; a `false`
    /// from the visitor stops the scan early.
    pub fn for_each(
        &self,
        mut visitor: impl FnMut(RecordId, usize, i64, &[u8]) -> bool,
    ) -> StorageResult<usize> {
        self.check_not_closed()?;
        let end = self
            .addressing
            .id_to_offset(RecordId(self.next_record_id.load(Ordering::SeqCst)));
        let mut offset = self.addressing.records_start();
        let mut visited = 0usize;
        while offset < end {
            let in_page = self.offset_in_page(offset);
            let page = self.cache.fetch_page(self.page_of(offset))?;
            let header = self.decode_record(&page, offset)?;
            match header {
                RecordHeader::Actual {
                    kind,
                    capacity,
                    length,
                } => {
                    visited += 1;
                    let data_start = in_page + kind.header_size();
                    let id = self.addressing.offset_to_id(offset)?;
                    if !visitor(
                        id,
                        capacity,
                        length as i64,
                        &page[data_start..data_start + length],
                    ) {
                        return Ok(visited);
                    }
                }
                RecordHeader::Moved { capacity, .. } => {
                    visited += 1;
                    let id = self.addressing.offset_to_id(offset)?;
                    if !visitor(id, capacity, -1, &[]) {
                        return Ok(visited);
                    }
                }
                RecordHeader::Padding { .. } => {}
            }
            offset += header.full_record_size() as u64;
        }
        Ok(visited)
    }

    // === header accessors & monitoring ===

    pub fn storage_version(&self) -> StorageResult<u32> {
        self.check_not_closed()?;
        let page = self.cache.fetch_page(PageId(0))?;
        Ok(header_u32(&page, HEADER_OFFSET_STORAGE_VERSION))
    }

    pub fn data_format_version(&self) -> StorageResult<u32> {
        self.check_not_closed()?;
        let page = self.cache.fetch_page(PageId(0))?;
        Ok(header_u32(&page, HEADER_OFFSET_DATA_FORMAT_VERSION))
    }

    pub fn set_data_format_version(&self, version: u32) -> StorageResult<()> {
        self.check_not_closed()?;
        let mut page = self.cache.fetch_page_write(PageId(0))?;
        put_header_u32(&mut page, HEADER_OFFSET_DATA_FORMAT_VERSION, version);
        Ok(())
    }

    /// Whether the file carried the properly-closed status when this store
    /// opened it. `false` signals an unclean shutdown; this layer performs no
    /// repair, recovery policy is the caller's.
    pub fn was_closed_properly(&self) -> StorageResult<bool> {
        self.check_not_closed()?;
        Ok(self.was_closed_properly)
    }

    pub fn records_allocated(&self) -> StorageResult<u32> {
        self.check_not_closed()?;
        Ok(self.recs_allocated.load(Ordering::SeqCst))
    }

    pub fn records_relocated(&self) -> StorageResult<u32> {
        self.check_not_closed()?;
        Ok(self.recs_relocated.load(Ordering::SeqCst))
    }

    pub fn records_deleted(&self) -> StorageResult<u32> {
        self.check_not_closed()?;
        Ok(self.recs_deleted.load(Ordering::SeqCst))
    }

    pub fn live_records_count(&self) -> StorageResult<u32> {
        self.check_not_closed()?;
        let allocated = self.recs_allocated.load(Ordering::SeqCst) as i64;
        let deleted = self.recs_deleted.load(Ordering::SeqCst) as i64;
        let relocated = self.recs_relocated.load(Ordering::SeqCst) as i64;
        Ok((allocated - deleted - relocated).max(0) as u32)
    }

    pub fn total_live_records_payload_bytes(&self) -> StorageResult<u64> {
        self.check_not_closed()?;
        Ok(self.live_payload_bytes.load(Ordering::SeqCst))
    }

    pub fn total_live_records_capacity_bytes(&self) -> StorageResult<u64> {
        self.check_not_closed()?;
        Ok(self.live_capacity_bytes.load(Ordering::SeqCst))
    }

    /// Logical size of the record stream, up to the allocation cursor. The
    /// backing file itself is page-granular and may be longer.
    pub fn size_in_bytes(&self) -> u64 {
        self.addressing
            .id_to_offset(RecordId(self.next_record_id.load(Ordering::SeqCst)))
    }

    /// Largest payload a single record can hold for this page size.
    pub fn max_payload_supported(&self) -> usize {
        layout::MAX_CAPACITY.min(self.max_capacity_for_page())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_dirty(&self) -> bool {
        self.cache.is_dirty()
    }

    // === lifecycle ===

    /// Persists the header (cursor and counters) and flushes the page cache
    /// to durable storage.
    pub fn force(&self) -> StorageResult<()> {
        self.check_not_closed()?;
        {
            let mut page = self.cache.fetch_page_write(PageId(0))?;
            self.write_header_state(&mut page, FILE_STATUS_OPENED);
        }
        self.cache.sync()
    }

    /// Marks the file properly closed, persists everything and shuts the
    /// store down. Idempotent.
    pub fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut page = self.cache.fetch_page_write(PageId(0))?;
            self.write_header_state(&mut page, FILE_STATUS_PROPERLY_CLOSED);
        }
        self.cache.sync()?;
        log::debug!("{}: blob storage closed", self.cache.path().display());
        Ok(())
    }

    /// Closes the store and removes the backing file.
    pub fn close_and_clean(&self) -> StorageResult<()> {
        let path = self.cache.path();
        self.close()?;
        std::fs::remove_file(path)?;
        Ok(())
    }

    // === implementation ===

    fn check_not_closed(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::ClosedStorage);
        }
        Ok(())
    }

    fn check_id_exists(&self, id: RecordId) -> StorageResult<()> {
        if !id.is_valid() {
            return Err(StorageError::InvalidRecordId { id: id.0 });
        }
        let next_id = self.next_record_id.load(Ordering::SeqCst);
        if id.0 >= next_id {
            return Err(StorageError::RecordIdNotAllocated { id: id.0, next_id });
        }
        Ok(())
    }

    fn check_redirect_target(&self, from: RecordId, target: RecordId) -> StorageResult<()> {
        if target.0 >= self.next_record_id.load(Ordering::SeqCst) {
            return Err(StorageError::Corrupted {
                reason: format!(
                    "record {} redirects to {} which is outside the allocated id range",
                    from, target
                ),
            });
        }
        Ok(())
    }

    fn padding_in_chain(&self, id: RecordId, offset: u64) -> StorageError {
        StorageError::Corrupted {
            reason: format!(
                "record {} at offset {} is a padding record, which must never be addressed",
                id, offset
            ),
        }
    }

    /// Decodes the record header at `offset` and checks its extent stays on
    /// the page.
    fn decode_record(&self, page: &[u8], offset: u64) -> StorageResult<RecordHeader> {
        let in_page = self.offset_in_page(offset);
        let header = layout::read_header(&page[in_page..])?;
        if in_page + header.full_record_size() > self.page_size {
            return Err(StorageError::Corrupted {
                reason: format!("record at offset {} crosses its page boundary", offset),
            });
        }
        Ok(header)
    }

    fn page_of(&self, offset: u64) -> PageId {
        PageId((offset / self.page_size as u64) as u32)
    }

    fn offset_in_page(&self, offset: u64) -> usize {
        (offset % self.page_size as u64) as usize
    }

    fn max_capacity_for_page(&self) -> usize {
        self.page_size - layout::LARGE_HEADER_SIZE
    }

    /// Allocates a slot and persists `payload` as a fresh ACTUAL record.
    fn insert_payload(&self, payload: &[u8], buffer_capacity: usize) -> StorageResult<RecordId> {
        let length = payload.len();
        if length > self.max_payload_supported() {
            return Err(StorageError::LengthOutOfRange {
                length,
                max: self.max_payload_supported(),
            });
        }

        let advised = self.strategy.capacity(length, buffer_capacity);
        if advised < length {
            return Err(StorageError::CapacityOutOfRange {
                capacity: advised,
                max: layout::MAX_CAPACITY,
            });
        }
        let requested_capacity = advised.min(self.max_payload_supported());

        let kind = layout::actual_kind_for_capacity(requested_capacity)?;
        let full_size = kind.full_record_size(requested_capacity);
        let (id, granted_size) = self.allocate_slot(full_size)?;
        // the grant is bucket-rounded, so re-derive the class and capacity
        // that exactly fill it
        let (_, capacity) = layout::actual_for_full_size(granted_size)?;

        let offset = self.addressing.id_to_offset(id);
        let in_page = self.offset_in_page(offset);
        {
            let mut page = self.cache.fetch_page_write(self.page_of(offset))?;
            layout::put_actual(
                &mut page[in_page..in_page + granted_size],
                capacity,
                length,
                payload,
            )?;
        }

        self.recs_allocated.fetch_add(1, Ordering::SeqCst);
        self.add_live(length, capacity);
        Ok(id)
    }

    /// Relocation tail of [`Self::write`]: the new record is written before
    /// the old slot (now unlocked) is rewritten as a tombstone.
    fn relocate(
        &self,
        old_id: RecordId,
        old_offset: u64,
        payload: &[u8],
        keep_redirect_on_move: bool,
    ) -> StorageResult<RecordId> {
        let new_id = self.insert_payload(payload, payload.len())?;

        let in_page = self.offset_in_page(old_offset);
        let mut page = self.cache.fetch_page_write(self.page_of(old_offset))?;
        match self.decode_record(&page, old_offset)? {
            RecordHeader::Actual {
                kind,
                capacity,
                length,
            } => {
                let moved_capacity =
                    kind.full_record_size(capacity) - layout::MOVED_HEADER_SIZE;
                let redirect = if keep_redirect_on_move {
                    new_id
                } else {
                    RecordId::NULL
                };
                layout::put_moved(&mut page[in_page..], moved_capacity, redirect)?;
                self.sub_live(length, capacity);
                if keep_redirect_on_move {
                    self.recs_relocated.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.recs_deleted.fetch_add(1, Ordering::SeqCst);
                }
            }
            _ => {
                // the slot was relocated or deleted by a concurrent writer
                // while it was unlocked; the record written above stands on
                // its own and the counters were already adjusted by whoever
                // rewrote the slot
                log::debug!(
                    "record {} changed concurrently during relocation; new record {} detached",
                    old_id,
                    new_id
                );
            }
        }
        Ok(new_id)
    }

    /// Finds a slot of at least `total_size` bytes for a new record, never
    /// crossing a page boundary. Returns the new id and the granted size
    /// (bucket-rounded, possibly padded with the page's unusable tail).
    fn allocate_slot(&self, total_size: usize) -> StorageResult<(RecordId, usize)> {
        if total_size > self.page_size {
            return Err(StorageError::CapacityOutOfRange {
                capacity: total_size,
                max: self.page_size,
            });
        }

        let _guard = self.alloc_lock.lock();
        // at most two iterations: either the record fits the cursor page, or
        // the cursor moves to a fresh page where it must fit
        loop {
            let id = RecordId(self.next_record_id.load(Ordering::SeqCst));
            let offset = self.addressing.id_to_offset(id);
            let in_page = self.offset_in_page(offset);
            let granted = round_size_up_to_bucket(in_page, self.page_size, total_size);

            if in_page + granted <= self.page_size {
                let next = self.addressing.offset_to_id(offset + granted as u64)?;
                self.next_record_id.store(next.0, Ordering::SeqCst);
                return Ok((id, granted));
            }

            // the record would straddle the page boundary: fill the tail of
            // the page with a padding record and retry on the next page
            self.put_padding_record(offset)?;
            let next_page_start = (offset / self.page_size as u64 + 1) * self.page_size as u64;
            let next = self.addressing.offset_to_id(next_page_start)?;
            self.next_record_id.store(next.0, Ordering::SeqCst);
        }
    }

    fn put_padding_record(&self, offset: u64) -> StorageResult<()> {
        let in_page = self.offset_in_page(offset);
        let remaining = self.page_size - in_page;
        let mut page = self.cache.fetch_page_write(self.page_of(offset))?;
        layout::put_padding(
            &mut page[in_page..],
            remaining - layout::PADDING_HEADER_SIZE,
        )
    }

    fn write_header_state(&self, page: &mut [u8], status: u32) {
        put_header_u32(page, HEADER_OFFSET_FILE_STATUS, status);
        put_header_u32(
            page,
            HEADER_OFFSET_NEXT_RECORD_ID,
            self.next_record_id.load(Ordering::SeqCst),
        );
        put_header_u32(
            page,
            HEADER_OFFSET_RECORDS_ALLOCATED,
            self.recs_allocated.load(Ordering::SeqCst),
        );
        put_header_u32(
            page,
            HEADER_OFFSET_RECORDS_RELOCATED,
            self.recs_relocated.load(Ordering::SeqCst),
        );
        put_header_u32(
            page,
            HEADER_OFFSET_RECORDS_DELETED,
            self.recs_deleted.load(Ordering::SeqCst),
        );
        put_header_u64(
            page,
            HEADER_OFFSET_LIVE_PAYLOAD_BYTES,
            self.live_payload_bytes.load(Ordering::SeqCst),
        );
        put_header_u64(
            page,
            HEADER_OFFSET_LIVE_CAPACITY_BYTES,
            self.live_capacity_bytes.load(Ordering::SeqCst),
        );
    }

    fn add_live(&self, payload: usize, capacity: usize) {
        self.live_payload_bytes
            .fetch_add(payload as u64, Ordering::SeqCst);
        self.live_capacity_bytes
            .fetch_add(capacity as u64, Ordering::SeqCst);
    }

    fn sub_live(&self, payload: usize, capacity: usize) {
        self.live_payload_bytes
            .fetch_sub(payload as u64, Ordering::SeqCst);
        self.live_capacity_bytes
            .fetch_sub(capacity as u64, Ordering::SeqCst);
    }

    fn adjust_live_payload(&self, old_length: usize, new_length: usize) {
        if new_length >= old_length {
            self.live_payload_bytes
                .fetch_add((new_length - old_length) as u64, Ordering::SeqCst);
        } else {
            self.live_payload_bytes
                .fetch_sub((old_length - new_length) as u64, Ordering::SeqCst);
        }
    }

    fn acquire_scratch(&self, capacity_hint: usize) -> BytesMut {
        let want = capacity_hint.max(self.strategy.default_capacity());
        {
            let mut pool = self.scratch.lock();
            if let Some(pos) = pool.iter().position(|b| b.capacity() >= want) {
                let mut buf = pool.swap_remove(pos);
                buf.clear();
                return buf;
            }
        }
        BytesMut::with_capacity(want)
    }

    fn release_scratch(&self, mut buf: BytesMut) {
        // keep pooled buffers from ballooning past the strategy's sizing
        if buf.capacity() > 2 * self.strategy.default_capacity() {
            return;
        }
        buf.clear();
        let mut pool = self.scratch.lock();
        if pool.len() < SCRATCH_POOL_LIMIT {
            pool.push(buf);
        }
    }
}

fn header_u32(page: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&page[offset..offset + 4])
}

fn put_header_u32(page: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut page[offset..offset + 4], value);
}

fn header_u64(page: &[u8], offset: usize) -> u64 {
    LittleEndian::read_u64(&page[offset..offset + 8])
}

fn put_header_u64(page: &mut [u8], offset: usize, value: u64) {
    LittleEndian::write_u64(&mut page[offset..offset + 8], value);
}

/// Rounds a record size up to bucket granularity, then merges in the page's
/// remaining tail when it is too small to ever host another record.
fn round_size_up_to_bucket(offset_in_page: usize, page_size: usize, raw_size: usize) -> usize {
    let bucket = OFFSET_BUCKET as usize;
    let mut rounded = raw_size;
    if rounded % bucket != 0 {
        rounded = (rounded / bucket + 1) * bucket;
    }
    let remaining = page_size.saturating_sub(offset_in_page + rounded);
    if remaining > 0 && remaining < bucket {
        rounded += remaining;
    }
    rounded
}
