use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, HEADER_PAGE_ID, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// Page id allocation state. Freed ids are recycled smallest-first; the
/// persistence of this map is out of scope, so it lives in memory only.
struct AllocState {
    next_page_id: PageId,
    free_pages: BTreeSet<PageId>,
}

/// DiskManager is responsible for the actual disk I/O: fixed-size page reads
/// and writes against a single database file, plus page id allocation.
pub struct DiskManager {
    db_file: Mutex<File>,
    alloc: Mutex<AllocState>,
}

impl DiskManager {
    /// Open (or create) the database file. A fresh database gets its header
    /// page materialized immediately so that page id 0 stays reserved.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        let file_size = file.metadata()?.len();
        let allocated = (file_size as usize / PAGE_SIZE) as PageId;

        let manager = Self {
            db_file: Mutex::new(file),
            alloc: Mutex::new(AllocState {
                // Page 0 is the header page; user pages start at 1.
                next_page_id: allocated.max(1),
                free_pages: BTreeSet::new(),
            }),
        };

        if allocated == 0 {
            let header = Page::new(HEADER_PAGE_ID);
            manager.write_page(&header)?;
        }

        Ok(manager)
    }

    /// Read a page from disk. Reading past the end of the file yields a
    /// zeroed page: allocation extends the id space lazily and the first
    /// write materializes the bytes.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), DiskManagerError> {
        if page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = Self::page_offset(page_id);
        let mut file = self.db_file.lock();

        let file_size = file.metadata()?.len();
        if offset as u64 >= file_size {
            page.data.fill(0);
            page.page_id = page_id;
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset as u64))?;
        file.read_exact(&mut page.data)?;
        page.page_id = page_id;

        Ok(())
    }

    /// Write a page to disk, synchronously.
    pub fn write_page(&self, page: &Page) -> Result<(), DiskManagerError> {
        if page.page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        let offset = Self::page_offset(page.page_id);
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(&page.data)?;
        file.flush()?;

        Ok(())
    }

    /// Allocate a fresh page id, recycling deallocated ids first.
    pub fn allocate_page(&self) -> PageId {
        let mut alloc = self.alloc.lock();
        if let Some(&page_id) = alloc.free_pages.iter().next() {
            alloc.free_pages.remove(&page_id);
            return page_id;
        }
        let page_id = alloc.next_page_id;
        alloc.next_page_id += 1;
        page_id
    }

    /// Mark a page id free for reuse. The header page is never deallocated.
    pub fn deallocate_page(&self, page_id: PageId) {
        if page_id == INVALID_PAGE_ID || page_id == HEADER_PAGE_ID {
            return;
        }
        let mut alloc = self.alloc.lock();
        if page_id < alloc.next_page_id {
            alloc.free_pages.insert(page_id);
        }
    }

    fn page_offset(page_id: PageId) -> usize {
        page_id as usize * PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_disk_manager() -> (DiskManager, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(file.path()).unwrap();
        (dm, file)
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (dm, _file) = create_disk_manager();

        let page_id = dm.allocate_page();
        let mut page = Page::new(page_id);
        page.data[0..5].copy_from_slice(b"hello");
        dm.write_page(&page).unwrap();

        let mut readback = Page::new(INVALID_PAGE_ID);
        dm.read_page(page_id, &mut readback).unwrap();
        assert_eq!(readback.page_id, page_id);
        assert_eq!(&readback.data[0..5], b"hello");
    }

    #[test]
    fn test_read_past_eof_is_zeroed() {
        let (dm, _file) = create_disk_manager();

        let mut page = Page::new(INVALID_PAGE_ID);
        dm.read_page(42, &mut page).unwrap();
        assert_eq!(page.page_id, 42);
        assert!(page.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_allocation_skips_header_page() {
        let (dm, _file) = create_disk_manager();
        assert_eq!(dm.allocate_page(), 1);
        assert_eq!(dm.allocate_page(), 2);
    }

    #[test]
    fn test_deallocated_ids_are_recycled() {
        let (dm, _file) = create_disk_manager();
        let a = dm.allocate_page();
        let b = dm.allocate_page();
        assert_ne!(a, b);

        dm.deallocate_page(a);
        assert_eq!(dm.allocate_page(), a);

        // The header page id must never come back from the allocator.
        dm.deallocate_page(HEADER_PAGE_ID);
        assert_ne!(dm.allocate_page(), HEADER_PAGE_ID);
    }

    #[test]
    fn test_reopen_preserves_allocation_frontier() {
        let file = NamedTempFile::new().unwrap();
        let first_id;
        {
            let dm = DiskManager::new(file.path()).unwrap();
            first_id = dm.allocate_page();
            let page = Page::new(first_id);
            dm.write_page(&page).unwrap();
        }
        let dm = DiskManager::new(file.path()).unwrap();
        assert!(dm.allocate_page() > first_id);
    }
}
