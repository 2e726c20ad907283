use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{PageId, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// DiskManager translates page identifiers to byte-offset reads and writes
/// on a single heap file. Page 0 is the header page; fresh page ids are
/// handed out from 1 upward.
pub struct DiskManager {
    db_file: Mutex<File>,
    next_page_id: AtomicI32,
}

impl DiskManager {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        // Resume allocation after the last page already on disk. Page 0 is
        // always reserved, so an empty file still starts at 1.
        let pages_on_disk = (file.metadata()?.len() / PAGE_SIZE as u64) as PageId;
        let next_page_id = pages_on_disk.max(1);

        Ok(Self {
            db_file: Mutex::new(file),
            next_page_id: AtomicI32::new(next_page_id),
        })
    }

    /// Read a page's bytes into `data`. Reading a page the file does not
    /// cover yet yields zeroed bytes, so freshly allocated pages are valid
    /// before their first flush.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8]) -> Result<(), DiskManagerError> {
        if page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();

        let file_size = file.metadata()?.len();
        if offset + PAGE_SIZE as u64 > file_size {
            data.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(data)?;
        Ok(())
    }

    /// Write a page's bytes at its byte offset, extending the file if needed.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<(), DiskManagerError> {
        if page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    /// Hand out a fresh page id.
    pub fn allocate_page(&self) -> Result<PageId, DiskManagerError> {
        let page_id = self.next_page_id.fetch_add(1, Ordering::SeqCst);
        debug!("allocated page {}", page_id);
        Ok(page_id)
    }

    /// Release a page id. Ids are not recycled.
    pub fn deallocate_page(&self, page_id: PageId) {
        debug!("deallocated page {}", page_id);
    }
}
