use crate::common::types::{Page, PAGE_SIZE};
use crate::storage::page::error::PageError;
use crate::storage::page::header::PageHeader;
use crate::storage::page::layout::{RecordLocation, HEADER_SIZE, RECORD_OFFSET_SIZE};

/// Slotted record page operations.
///
/// Record data is written from just past the header; the slot array grows
/// backwards from the end of the page. The index header page uses this layout
/// to persist one record per index.
pub struct PageManager;

impl Default for PageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PageManager {
    pub fn new() -> Self {
        Self
    }

    pub fn init_page(&self, page: &mut Page) {
        let header = PageHeader::new();
        page.data[0..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    }

    /// Format the page only if it has never been formatted. Returns true if
    /// formatting happened.
    pub fn init_page_if_needed(&self, page: &mut Page) -> bool {
        if self.get_header(page).is_initialized() {
            return false;
        }
        self.init_page(page);
        true
    }

    /// Append a record, returning its slot index.
    pub fn insert_record(&self, page: &mut Page, data: &[u8]) -> Result<u32, PageError> {
        let mut header = self.get_header(page);

        // Record size plus the slot entry for the record
        let record_size = data.len() as u32;
        let total_space_needed = record_size + RECORD_OFFSET_SIZE as u32;
        if header.free_space_size < total_space_needed {
            return Err(PageError::InsufficientSpace);
        }

        let slot_pos = Self::slot_position(header.record_count);
        let record_loc = RecordLocation {
            offset: header.free_space_offset,
            length: record_size,
        };

        let data_end = header.free_space_offset as usize + data.len();
        page.data[header.free_space_offset as usize..data_end].copy_from_slice(data);
        page.data[slot_pos..slot_pos + RECORD_OFFSET_SIZE].copy_from_slice(&record_loc.to_bytes());

        header.free_space_offset += record_size;
        header.free_space_size -= total_space_needed;
        header.record_count += 1;
        page.data[0..HEADER_SIZE].copy_from_slice(&header.to_bytes());

        Ok(header.record_count - 1)
    }

    /// Overwrite a record in place. Growth beyond the original length
    /// relocates the data to the free-space frontier under the same slot.
    pub fn update_record(&self, page: &mut Page, slot: u32, data: &[u8]) -> Result<(), PageError> {
        let mut header = self.get_header(page);
        if slot >= header.record_count {
            return Err(PageError::InvalidRecordId);
        }

        let slot_pos = Self::slot_position(slot);
        let record_loc = Self::record_location(page, slot_pos);
        let new_size = data.len() as u32;

        if new_size > record_loc.length {
            let space_needed = new_size;
            if header.free_space_size < space_needed {
                return Err(PageError::InsufficientSpace);
            }

            let new_offset = header.free_space_offset;
            let new_end = new_offset as usize + data.len();
            page.data[new_offset as usize..new_end].copy_from_slice(data);

            let new_loc = RecordLocation {
                offset: new_offset,
                length: new_size,
            };
            page.data[slot_pos..slot_pos + RECORD_OFFSET_SIZE].copy_from_slice(&new_loc.to_bytes());

            header.free_space_offset += new_size;
            header.free_space_size -= space_needed;
            page.data[0..HEADER_SIZE].copy_from_slice(&header.to_bytes());
            return Ok(());
        }

        let start = record_loc.offset as usize;
        page.data[start..start + data.len()].copy_from_slice(data);

        if new_size < record_loc.length {
            let new_loc = RecordLocation {
                offset: record_loc.offset,
                length: new_size,
            };
            page.data[slot_pos..slot_pos + RECORD_OFFSET_SIZE].copy_from_slice(&new_loc.to_bytes());
        }

        Ok(())
    }

    pub fn get_record(&self, page: &Page, slot: u32) -> Result<Vec<u8>, PageError> {
        let header = self.get_header(page);
        if slot >= header.record_count {
            return Err(PageError::InvalidRecordId);
        }

        let slot_pos = Self::slot_position(slot);
        let record_loc = Self::record_location(page, slot_pos);
        if record_loc.length == 0 {
            return Err(PageError::RecordNotFound);
        }

        let start = record_loc.offset as usize;
        let end = start + record_loc.length as usize;
        Ok(page.data[start..end].to_vec())
    }

    pub fn record_count(&self, page: &Page) -> u32 {
        self.get_header(page).record_count
    }

    pub fn get_free_space(&self, page: &Page) -> u32 {
        self.get_header(page).free_space_size
    }

    pub fn get_header(&self, page: &Page) -> PageHeader {
        PageHeader::from_bytes(&page.data[0..HEADER_SIZE])
    }

    fn slot_position(slot: u32) -> usize {
        PAGE_SIZE - RECORD_OFFSET_SIZE * (slot as usize + 1)
    }

    fn record_location(page: &Page, slot_pos: usize) -> RecordLocation {
        RecordLocation::from_bytes(&page.data[slot_pos..slot_pos + RECORD_OFFSET_SIZE])
    }
}
