//! On-disk record layout.
//!
//! A record is a type-tagged header followed by up to `capacity` payload
//! bytes. The two high bits of the first header byte carry the tag, which
//! encodes both the record type and its size class, so the codec can pick the
//! smallest header that fits a requested capacity:
//!
//! ```text
//! tag 0b00  ACTUAL (small)  byte0 = tag | capacity(6 bits), byte1 = length u8   -> 2-byte header
//! tag 0b01  ACTUAL (large)  byte0 = tag, capacity u16, length u16               -> 5-byte header
//! tag 0b10  MOVED           byte0 = tag, capacity u16, redirect_to u32          -> 7-byte header
//! tag 0b11  PADDING         byte0 = tag, capacity u16                           -> 3-byte header
//! ```
//!
//! `capacity` is the allocated payload size *excluding* the header, so the
//! full on-disk extent of a record is `header_size + capacity`. For ACTUAL
//! records `length <= capacity` is the number of payload bytes actually
//! written; the rest of the capacity is trash. A MOVED record is a forwarding
//! pointer left behind by relocation; `redirect_to == NULL` marks a deleted
//! record. PADDING records fill otherwise unusable page tails and are never
//! addressed by an id.
//!
//! All multi-byte fields are little-endian.

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::addressing::RecordId;
use crate::storage::error::{StorageError, StorageResult};

/// Max capacity of the large record classes (capacity fields are u16).
pub const MAX_CAPACITY: usize = 0xFFFF;
/// Max capacity encodable in a small ACTUAL header (6 bits of byte 0).
pub const SMALL_MAX_CAPACITY: usize = 0b0011_1111;

pub const SMALL_HEADER_SIZE: usize = 2;
pub const LARGE_HEADER_SIZE: usize = 5;
pub const MOVED_HEADER_SIZE: usize = 7;
pub const PADDING_HEADER_SIZE: usize = 3;

const TAG_SHIFT: u8 = 6;
const SMALL_CAPACITY_MASK: u8 = 0b0011_1111;

const TAG_ACTUAL_SMALL: u8 = 0b00;
const TAG_ACTUAL_LARGE: u8 = 0b01;
const TAG_MOVED: u8 = 0b10;
const TAG_PADDING: u8 = 0b11;

/// Record type + size class, as encoded in the tag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    ActualSmall,
    ActualLarge,
    Moved,
    Padding,
}

impl RecordKind {
    pub fn is_actual(self) -> bool {
        matches!(self, RecordKind::ActualSmall | RecordKind::ActualLarge)
    }

    pub fn header_size(self) -> usize {
        match self {
            RecordKind::ActualSmall => SMALL_HEADER_SIZE,
            RecordKind::ActualLarge => LARGE_HEADER_SIZE,
            RecordKind::Moved => MOVED_HEADER_SIZE,
            RecordKind::Padding => PADDING_HEADER_SIZE,
        }
    }

    /// Full on-disk extent of a record of this kind with the given capacity.
    pub fn full_record_size(self, capacity: usize) -> usize {
        self.header_size() + capacity
    }
}

/// Reads the record tag at the start of `buf`. Every byte value decodes to
/// one of the four kinds; garbage surfaces later as out-of-range fields.
pub fn record_kind(buf: &[u8]) -> RecordKind {
    match buf[0] >> TAG_SHIFT {
        TAG_ACTUAL_SMALL => RecordKind::ActualSmall,
        TAG_ACTUAL_LARGE => RecordKind::ActualLarge,
        TAG_MOVED => RecordKind::Moved,
        _ => RecordKind::Padding,
    }
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordHeader {
    Actual {
        kind: RecordKind,
        capacity: usize,
        length: usize,
    },
    Moved {
        capacity: usize,
        redirect_to: RecordId,
    },
    Padding {
        capacity: usize,
    },
}

impl RecordHeader {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordHeader::Actual { kind, .. } => *kind,
            RecordHeader::Moved { .. } => RecordKind::Moved,
            RecordHeader::Padding { .. } => RecordKind::Padding,
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            RecordHeader::Actual { capacity, .. } => *capacity,
            RecordHeader::Moved { capacity, .. } => *capacity,
            RecordHeader::Padding { capacity } => *capacity,
        }
    }

    pub fn header_size(&self) -> usize {
        self.kind().header_size()
    }

    pub fn full_record_size(&self) -> usize {
        self.header_size() + self.capacity()
    }
}

/// Decodes the record header at the start of `buf`.
pub fn read_header(buf: &[u8]) -> StorageResult<RecordHeader> {
    let kind = record_kind(buf);
    match kind {
        RecordKind::ActualSmall => {
            let capacity = (buf[0] & SMALL_CAPACITY_MASK) as usize;
            let length = buf[1] as usize;
            if length > capacity {
                return Err(StorageError::Corrupted {
                    reason: format!(
                        "small record length {} exceeds its capacity {}",
                        length, capacity
                    ),
                });
            }
            Ok(RecordHeader::Actual {
                kind,
                capacity,
                length,
            })
        }
        RecordKind::ActualLarge => {
            let capacity = LittleEndian::read_u16(&buf[1..3]) as usize;
            let length = LittleEndian::read_u16(&buf[3..5]) as usize;
            if length > capacity {
                return Err(StorageError::Corrupted {
                    reason: format!(
                        "large record length {} exceeds its capacity {}",
                        length, capacity
                    ),
                });
            }
            Ok(RecordHeader::Actual {
                kind,
                capacity,
                length,
            })
        }
        RecordKind::Moved => {
            let capacity = LittleEndian::read_u16(&buf[1..3]) as usize;
            let redirect_to = RecordId(LittleEndian::read_u32(&buf[3..7]));
            Ok(RecordHeader::Moved {
                capacity,
                redirect_to,
            })
        }
        RecordKind::Padding => {
            let capacity = LittleEndian::read_u16(&buf[1..3]) as usize;
            Ok(RecordHeader::Padding { capacity })
        }
    }
}

/// Smallest ACTUAL class able to represent `capacity`.
pub fn actual_kind_for_capacity(capacity: usize) -> StorageResult<RecordKind> {
    if capacity <= SMALL_MAX_CAPACITY {
        Ok(RecordKind::ActualSmall)
    } else if capacity <= MAX_CAPACITY {
        Ok(RecordKind::ActualLarge)
    } else {
        Err(StorageError::CapacityOutOfRange {
            capacity,
            max: MAX_CAPACITY,
        })
    }
}

/// Inverse of [`RecordKind::full_record_size`] over granted slot sizes:
/// splits a full on-disk size into the ACTUAL class and capacity that exactly
/// fill it. Total for every `full_size >= SMALL_HEADER_SIZE` up to
/// `LARGE_HEADER_SIZE + MAX_CAPACITY`.
pub fn actual_for_full_size(full_size: usize) -> StorageResult<(RecordKind, usize)> {
    if full_size >= SMALL_HEADER_SIZE && full_size - SMALL_HEADER_SIZE <= SMALL_MAX_CAPACITY {
        return Ok((RecordKind::ActualSmall, full_size - SMALL_HEADER_SIZE));
    }
    if full_size >= LARGE_HEADER_SIZE && full_size - LARGE_HEADER_SIZE <= MAX_CAPACITY {
        return Ok((RecordKind::ActualLarge, full_size - LARGE_HEADER_SIZE));
    }
    Err(StorageError::CapacityOutOfRange {
        capacity: full_size,
        max: LARGE_HEADER_SIZE + MAX_CAPACITY,
    })
}

/// Writes an ACTUAL record (header + payload) at the start of `buf`, picking
/// the smallest class that can represent `capacity`.
pub fn put_actual(
    buf: &mut [u8],
    capacity: usize,
    length: usize,
    payload: &[u8],
) -> StorageResult<RecordKind> {
    if length > capacity {
        return Err(StorageError::LengthOutOfRange {
            length,
            max: capacity,
        });
    }
    debug_assert_eq!(payload.len(), length);
    let kind = actual_kind_for_capacity(capacity)?;
    match kind {
        RecordKind::ActualSmall => {
            buf[0] = (TAG_ACTUAL_SMALL << TAG_SHIFT) | capacity as u8;
            buf[1] = length as u8;
        }
        RecordKind::ActualLarge => {
            buf[0] = TAG_ACTUAL_LARGE << TAG_SHIFT;
            LittleEndian::write_u16(&mut buf[1..3], capacity as u16);
            LittleEndian::write_u16(&mut buf[3..5], length as u16);
        }
        _ => unreachable!(),
    }
    let data_start = kind.header_size();
    buf[data_start..data_start + length].copy_from_slice(payload);
    Ok(kind)
}

/// Rewrites the length field of the ACTUAL record at the start of `buf`.
pub fn put_length(buf: &mut [u8], length: usize) -> StorageResult<()> {
    match record_kind(buf) {
        RecordKind::ActualSmall => {
            let capacity = (buf[0] & SMALL_CAPACITY_MASK) as usize;
            if length > capacity {
                return Err(StorageError::LengthOutOfRange {
                    length,
                    max: capacity,
                });
            }
            buf[1] = length as u8;
            Ok(())
        }
        RecordKind::ActualLarge => {
            let capacity = LittleEndian::read_u16(&buf[1..3]) as usize;
            if length > capacity {
                return Err(StorageError::LengthOutOfRange {
                    length,
                    max: capacity,
                });
            }
            LittleEndian::write_u16(&mut buf[3..5], length as u16);
            Ok(())
        }
        kind => Err(StorageError::Corrupted {
            reason: format!("cannot set length on a {:?} record", kind),
        }),
    }
}

/// Writes a MOVED record header at the start of `buf`. `redirect_to == NULL`
/// marks the record as deleted ("moved nowhere").
pub fn put_moved(buf: &mut [u8], capacity: usize, redirect_to: RecordId) -> StorageResult<()> {
    if capacity > MAX_CAPACITY {
        return Err(StorageError::CapacityOutOfRange {
            capacity,
            max: MAX_CAPACITY,
        });
    }
    buf[0] = TAG_MOVED << TAG_SHIFT;
    LittleEndian::write_u16(&mut buf[1..3], capacity as u16);
    LittleEndian::write_u32(&mut buf[3..7], redirect_to.0);
    Ok(())
}

/// Rewrites the redirect field of the MOVED record at the start of `buf`.
pub fn put_redirect(buf: &mut [u8], redirect_to: RecordId) -> StorageResult<()> {
    if record_kind(buf) != RecordKind::Moved {
        return Err(StorageError::Corrupted {
            reason: format!(
                "cannot set a redirect on a {:?} record",
                record_kind(buf)
            ),
        });
    }
    LittleEndian::write_u32(&mut buf[3..7], redirect_to.0);
    Ok(())
}

/// Writes a PADDING record header at the start of `buf`.
pub fn put_padding(buf: &mut [u8], capacity: usize) -> StorageResult<()> {
    if capacity > MAX_CAPACITY {
        return Err(StorageError::CapacityOutOfRange {
            capacity,
            max: MAX_CAPACITY,
        });
    }
    buf[0] = TAG_PADDING << TAG_SHIFT;
    LittleEndian::write_u16(&mut buf[1..3], capacity as u16);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_small_actual_round_trip() -> Result<()> {
        let mut buf = vec![0u8; 128];
        let payload = b"hello";
        let kind = put_actual(&mut buf, 10, payload.len(), payload)?;
        assert_eq!(kind, RecordKind::ActualSmall);

        let header = read_header(&buf)?;
        assert_eq!(
            header,
            RecordHeader::Actual {
                kind: RecordKind::ActualSmall,
                capacity: 10,
                length: 5,
            }
        );
        assert_eq!(&buf[SMALL_HEADER_SIZE..SMALL_HEADER_SIZE + 5], payload);
        Ok(())
    }

    #[test]
    fn test_large_actual_round_trip() -> Result<()> {
        let mut buf = vec![0u8; 2048];
        let payload = vec![0xAB; 500];
        let kind = put_actual(&mut buf, 1000, payload.len(), &payload)?;
        assert_eq!(kind, RecordKind::ActualLarge);

        let header = read_header(&buf)?;
        assert_eq!(
            header,
            RecordHeader::Actual {
                kind: RecordKind::ActualLarge,
                capacity: 1000,
                length: 500,
            }
        );
        assert_eq!(&buf[LARGE_HEADER_SIZE..LARGE_HEADER_SIZE + 500], &payload[..]);
        Ok(())
    }

    #[test]
    fn test_class_selection_boundary() -> Result<()> {
        assert_eq!(
            actual_kind_for_capacity(SMALL_MAX_CAPACITY)?,
            RecordKind::ActualSmall
        );
        assert_eq!(
            actual_kind_for_capacity(SMALL_MAX_CAPACITY + 1)?,
            RecordKind::ActualLarge
        );
        assert_eq!(actual_kind_for_capacity(MAX_CAPACITY)?, RecordKind::ActualLarge);
        assert!(actual_kind_for_capacity(MAX_CAPACITY + 1).is_err());
        Ok(())
    }

    #[test]
    fn test_full_size_inverse_is_total_over_bucket_grants() -> Result<()> {
        // every bucket-rounded grant must split into a representable class
        for full in (8..=4096usize).step_by(8) {
            let (kind, capacity) = actual_for_full_size(full)?;
            assert_eq!(kind.full_record_size(capacity), full);
        }
        Ok(())
    }

    #[test]
    fn test_moved_round_trip() -> Result<()> {
        let mut buf = vec![0u8; 64];
        put_moved(&mut buf, 25, RecordId(42))?;
        assert_eq!(
            read_header(&buf)?,
            RecordHeader::Moved {
                capacity: 25,
                redirect_to: RecordId(42),
            }
        );

        put_redirect(&mut buf, RecordId::NULL)?;
        assert_eq!(
            read_header(&buf)?,
            RecordHeader::Moved {
                capacity: 25,
                redirect_to: RecordId::NULL,
            }
        );
        Ok(())
    }

    #[test]
    fn test_padding_round_trip() -> Result<()> {
        let mut buf = vec![0u8; 64];
        put_padding(&mut buf, 13)?;
        assert_eq!(read_header(&buf)?, RecordHeader::Padding { capacity: 13 });
        assert_eq!(
            read_header(&buf)?.full_record_size(),
            PADDING_HEADER_SIZE + 13
        );
        Ok(())
    }

    #[test]
    fn test_put_length_in_place() -> Result<()> {
        let mut buf = vec![0u8; 64];
        put_actual(&mut buf, 20, 4, b"abcd")?;
        put_length(&mut buf, 11)?;
        assert_eq!(
            read_header(&buf)?,
            RecordHeader::Actual {
                kind: RecordKind::ActualSmall,
                capacity: 20,
                length: 11,
            }
        );
        Ok(())
    }

    #[test]
    fn test_length_over_capacity_rejected() {
        let mut buf = vec![0u8; 64];
        assert!(matches!(
            put_actual(&mut buf, 4, 5, b"abcde"),
            Err(StorageError::LengthOutOfRange { .. })
        ));
        put_actual(&mut buf, 4, 4, b"abcd").unwrap();
        assert!(matches!(
            put_length(&mut buf, 5),
            Err(StorageError::LengthOutOfRange { .. })
        ));
    }

    #[test]
    fn test_corrupt_length_detected() {
        let mut buf = vec![0u8; 64];
        // small record claiming length > capacity
        buf[0] = 3;
        buf[1] = 7;
        assert!(matches!(
            read_header(&buf),
            Err(StorageError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_redirect_on_non_moved_rejected() {
        let mut buf = vec![0u8; 64];
        put_actual(&mut buf, 4, 0, b"").unwrap();
        assert!(matches!(
            put_redirect(&mut buf, RecordId(1)),
            Err(StorageError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_empty_payload() -> Result<()> {
        let mut buf = vec![0u8; 8];
        put_actual(&mut buf, 0, 0, b"")?;
        assert_eq!(
            read_header(&buf)?,
            RecordHeader::Actual {
                kind: RecordKind::ActualSmall,
                capacity: 0,
                length: 0,
            }
        );
        Ok(())
    }
}
