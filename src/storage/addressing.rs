//! Mapping between record ids and byte offsets.
//!
//! Record offsets step in fixed [`OFFSET_BUCKET`]-byte units, so a 32-bit id
//! can address files up to `i32::MAX * OFFSET_BUCKET` bytes while every record
//! starts bucket-aligned. Id 0 is reserved as the NULL id.

use crate::storage::error::{StorageError, StorageResult};
use std::fmt;

/// Fixed alignment quantum for record offsets.
pub const OFFSET_BUCKET: u64 = 8;

/// Opaque handle to a record. Always positive; [`RecordId::NULL`] (= 0) is
/// the reserved invalid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId(pub u32);

impl RecordId {
    pub const NULL: RecordId = RecordId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bidirectional id <-> offset mapping for one storage file.
#[derive(Debug, Clone, Copy)]
pub struct Addressing {
    records_start: u64,
}

impl Addressing {
    /// Records begin at the first bucket boundary at or after the header.
    pub fn new(header_size: u64) -> Self {
        let records_start = if header_size % OFFSET_BUCKET > 0 {
            (header_size / OFFSET_BUCKET + 1) * OFFSET_BUCKET
        } else {
            header_size
        };
        Self { records_start }
    }

    pub fn records_start(&self) -> u64 {
        self.records_start
    }

    /// Id of the first record in the file.
    pub fn first_record_id(&self) -> RecordId {
        RecordId(1)
    }

    pub fn id_to_offset(&self, id: RecordId) -> u64 {
        debug_assert!(id.is_valid(), "id {} is not a valid record id", id);
        // id 0 is reserved as NULL, hence the '-1'
        self.records_start + (id.0 as u64 - 1) * OFFSET_BUCKET
    }

    /// Inverse of [`Self::id_to_offset`]. The offset must be bucket-aligned
    /// and within the 32-bit id range; anything else means the file (or a
    /// stored offset) is corrupt.
    pub fn offset_to_id(&self, offset: u64) -> StorageResult<RecordId> {
        if offset < self.records_start || (offset - self.records_start) % OFFSET_BUCKET != 0 {
            return Err(StorageError::Corrupted {
                reason: format!(
                    "offset {} is not aligned to a record bucket (records start at {})",
                    offset, self.records_start
                ),
            });
        }
        let id = (offset - self.records_start) / OFFSET_BUCKET + 1;
        if id > u32::MAX as u64 {
            return Err(StorageError::Corrupted {
                reason: format!("offset {} is out of the 32-bit id range", offset),
            });
        }
        Ok(RecordId(id as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_start_rounds_up_to_bucket() {
        assert_eq!(Addressing::new(64).records_start(), 64);
        assert_eq!(Addressing::new(52).records_start(), 56);
        assert_eq!(Addressing::new(1).records_start(), 8);
        assert_eq!(Addressing::new(0).records_start(), 0);
    }

    #[test]
    fn test_id_offset_round_trip() {
        let addressing = Addressing::new(64);

        for id in [1u32, 2, 3, 100, 1_000_000] {
            let offset = addressing.id_to_offset(RecordId(id));
            assert_eq!(addressing.offset_to_id(offset).unwrap(), RecordId(id));
        }
    }

    #[test]
    fn test_first_id_maps_to_records_start() {
        let addressing = Addressing::new(64);
        assert_eq!(addressing.id_to_offset(RecordId(1)), 64);
        assert_eq!(addressing.offset_to_id(64).unwrap(), RecordId(1));
    }

    #[test]
    fn test_ids_step_by_bucket() {
        let addressing = Addressing::new(64);
        assert_eq!(
            addressing.id_to_offset(RecordId(2)) - addressing.id_to_offset(RecordId(1)),
            OFFSET_BUCKET
        );
    }

    #[test]
    fn test_unaligned_offset_is_corruption() {
        let addressing = Addressing::new(64);
        assert!(matches!(
            addressing.offset_to_id(65),
            Err(StorageError::Corrupted { .. })
        ));
        assert!(matches!(
            addressing.offset_to_id(8),
            Err(StorageError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_null_id() {
        assert!(RecordId::NULL.is_null());
        assert!(!RecordId::NULL.is_valid());
        assert!(RecordId(1).is_valid());
    }
}
