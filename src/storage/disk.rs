//! Page-granular file I/O.

use crate::storage::error::{StorageError, StorageResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::addressing::OFFSET_BUCKET;

pub const DEFAULT_PAGE_SIZE: usize = 8192;
/// Page size bounds: a page must hold the storage header plus at least one
/// record, and capacity fields are u16, so a record (and hence a page tail)
/// never exceeds 64KiB.
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(pub u32);

/// Reads and writes fixed-size pages of a single backing file, extending the
/// file as pages past the current end are written.
pub struct PageFile {
    file: File,
    path: PathBuf,
    page_size: usize,
}

impl PageFile {
    pub fn create(path: &Path, page_size: usize) -> StorageResult<Self> {
        validate_page_size(page_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
        })
    }

    pub fn open(path: &Path, page_size: usize) -> StorageResult<Self> {
        validate_page_size(page_size)?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> StorageResult<()> {
        debug_assert_eq!(buf.len(), self.page_size);

        let offset = self.page_offset(page_id);
        if offset >= self.len()? {
            return Err(StorageError::PageNotFound { page_id: page_id.0 });
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
        debug_assert_eq!(data.len(), self.page_size);

        let offset = self.page_offset(page_id);
        let end = offset + self.page_size as u64;
        if end > self.len()? {
            self.file.set_len(end)?;
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    pub fn len(&self) -> StorageResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn num_pages(&self) -> StorageResult<u32> {
        Ok((self.len()? / self.page_size as u64) as u32)
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn page_offset(&self, page_id: PageId) -> u64 {
        page_id.0 as u64 * self.page_size as u64
    }
}

fn validate_page_size(page_size: usize) -> StorageResult<()> {
    if page_size < MIN_PAGE_SIZE
        || page_size > MAX_PAGE_SIZE
        || page_size % OFFSET_BUCKET as usize != 0
    {
        return Err(StorageError::PageSizeOutOfRange {
            page_size,
            min: MIN_PAGE_SIZE,
            max: MAX_PAGE_SIZE,
            bucket: OFFSET_BUCKET as usize,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 4096;

    #[test]
    fn test_create_and_open() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.blob");

        {
            let pf = PageFile::create(&file_path, PAGE_SIZE)?;
            assert_eq!(pf.num_pages()?, 0);
            assert_eq!(pf.page_size(), PAGE_SIZE);
        }

        {
            let pf = PageFile::open(&file_path, PAGE_SIZE)?;
            assert_eq!(pf.num_pages()?, 0);
        }

        Ok(())
    }

    #[test]
    fn test_open_nonexistent_file_fails() -> Result<()> {
        let dir = tempdir()?;
        let result = PageFile::open(&dir.path().join("missing.blob"), PAGE_SIZE);
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_invalid_page_sizes_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.blob");
        for page_size in [0usize, 100, 511, 513, MAX_PAGE_SIZE + 8] {
            assert!(matches!(
                PageFile::create(&path, page_size),
                Err(StorageError::PageSizeOutOfRange { .. })
            ));
        }
    }

    #[test]
    fn test_write_and_read_page() -> Result<()> {
        let dir = tempdir()?;
        let mut pf = PageFile::create(&dir.path().join("test.blob"), PAGE_SIZE)?;

        let mut write_buf = vec![0u8; PAGE_SIZE];
        write_buf[0] = 42;
        write_buf[PAGE_SIZE - 1] = 24;
        pf.write_page(PageId(0), &write_buf)?;

        let mut read_buf = vec![0u8; PAGE_SIZE];
        pf.read_page(PageId(0), &mut read_buf)?;

        assert_eq!(read_buf[0], 42);
        assert_eq!(read_buf[PAGE_SIZE - 1], 24);
        Ok(())
    }

    #[test]
    fn test_read_nonexistent_page() -> Result<()> {
        let dir = tempdir()?;
        let mut pf = PageFile::create(&dir.path().join("test.blob"), PAGE_SIZE)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            pf.read_page(PageId(3), &mut buf),
            Err(StorageError::PageNotFound { page_id: 3 })
        ));
        Ok(())
    }

    #[test]
    fn test_file_growth_on_sparse_write() -> Result<()> {
        let dir = tempdir()?;
        let mut pf = PageFile::create(&dir.path().join("test.blob"), PAGE_SIZE)?;

        // writing page 5 extends the file to 6 pages
        let buf = vec![5u8; PAGE_SIZE];
        pf.write_page(PageId(5), &buf)?;
        assert_eq!(pf.num_pages()?, 6);

        // the skipped pages read back as zeros
        let mut read_buf = vec![1u8; PAGE_SIZE];
        pf.read_page(PageId(2), &mut read_buf)?;
        assert!(read_buf.iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn test_persistence_across_reopen() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.blob");

        {
            let mut pf = PageFile::create(&file_path, PAGE_SIZE)?;
            let buf = vec![99u8; PAGE_SIZE];
            pf.write_page(PageId(0), &buf)?;
            pf.sync()?;
        }

        {
            let mut pf = PageFile::open(&file_path, PAGE_SIZE)?;
            let mut buf = vec![0u8; PAGE_SIZE];
            pf.read_page(PageId(0), &mut buf)?;
            assert_eq!(buf[0], 99);
        }

        Ok(())
    }

    #[test]
    fn test_adjacent_pages_do_not_overlap() -> Result<()> {
        let dir = tempdir()?;
        let mut pf = PageFile::create(&dir.path().join("test.blob"), PAGE_SIZE)?;

        pf.write_page(PageId(0), &vec![1u8; PAGE_SIZE])?;
        pf.write_page(PageId(1), &vec![2u8; PAGE_SIZE])?;

        let mut buf = vec![0u8; PAGE_SIZE];
        pf.read_page(PageId(0), &mut buf)?;
        assert!(buf.iter().all(|&b| b == 1));

        pf.read_page(PageId(1), &mut buf)?;
        assert!(buf.iter().all(|&b| b == 2));
        Ok(())
    }
}
