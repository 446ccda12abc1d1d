use crate::page::PageId;
use anyhow::{bail, Context, Result};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 8192;

/// One page worth of bytes.
pub type PageData = [u8; PAGE_SIZE];

/// Block-addressable I/O on a single backing file. Pages live at
/// `page_id * PAGE_SIZE`; the file grows on demand when a page beyond the
/// current end is written.
pub struct DiskManager {
    file: File,
}

impl DiskManager {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create file: {:?}", path))?;

        Ok(Self { file })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open file: {:?}", path))?;

        Ok(Self { file })
    }

    /// Reads one page into `buf`. A page that has never been flushed has no
    /// backing block yet; reading it yields zeroes rather than an error.
    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            bail!(
                "Buffer size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                buf.len()
            );
        }

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            debug!("read of unwritten page {}, zero-filling", page_id);
            buf.fill(0);
            return Ok(());
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.read_exact(buf).context("Failed to read page")?;

        Ok(())
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            bail!(
                "Data size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                data.len()
            );
        }

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        // Extend file if necessary
        if offset >= file_size {
            let new_size = offset + PAGE_SIZE as u64;
            self.file
                .set_len(new_size)
                .context("Failed to extend file")?;
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.write_all(data).context("Failed to write page")?;
        self.file.sync_all().context("Failed to sync")?;

        Ok(())
    }

    pub fn num_pages(&self) -> Result<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as u32)
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 as u64 * PAGE_SIZE as u64
    }
}
