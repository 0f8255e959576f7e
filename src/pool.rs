//! The page pool: a fixed-size file of pages, a free-space bitmap, and the
//! positioned reads/writes used to get node and data pages on and off disk.
//!
//! Page 0 is reserved (metadata: currently just the root page number, see
//! [`crate::database`]). Pages `1..=B` hold the free-space bitmap. Page
//! `B+1` is the root node. Every other page is either a node page or a data
//! page, as tracked by the bitmap alone -- nothing in a page's own bytes
//! says which kind it is.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use crate::error::{err, Error};
use crate::page::{self, NodeImage};

pub const META_PAGE: u32 = 0;

/// A file-backed pool of fixed-size pages with an in-memory free-space
/// bitmap, flushed to disk after every allocation and every free.
pub struct PagePool {
    file: File,
    page_size: usize,
    n_pages: u32,
    k: usize,
    bitmap: Vec<u8>,
}

impl PagePool {
    /// Creates a new, empty page file of `total_bytes` (rounded down to a
    /// whole number of pages) with the default page size.
    pub fn create<P: AsRef<Path>>(path: P, total_bytes: u64) -> Result<Self, Error> {
        Self::create_with_page_size(path, total_bytes, page::DEFAULT_PAGE_SIZE)
    }

    /// Creates a new page file with an explicit page size. Exposed mainly so
    /// tests can exercise small values of `K` without a multi-gigabyte file.
    pub fn create_with_page_size<P: AsRef<Path>>(
        path: P,
        total_bytes: u64,
        page_size: usize,
    ) -> Result<Self, Error> {
        let k = page::node_capacity(page_size);
        if k < 3 {
            return Err(err!(
                InvalidArgument,
                "page size {} is too small to hold a node (K={})",
                page_size,
                k
            ));
        }

        let n_pages = (total_bytes / page_size as u64) as u32;
        if n_pages < 3 {
            return Err(err!(
                InvalidArgument,
                "database of {} bytes holds fewer than 3 pages at page size {}",
                total_bytes,
                page_size
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(n_pages as u64 * page_size as u64)?;

        let bitmap_pages = bitmap_pages_for(n_pages, page_size);
        let mut pool = PagePool {
            file,
            page_size,
            n_pages,
            k,
            bitmap: vec![0u8; bitmap_pages as usize * page_size],
        };

        pool.mark_used(META_PAGE);
        for p in 1..=bitmap_pages {
            pool.mark_used(p);
        }
        pool.flush_bitmap()?;
        Ok(pool)
    }

    /// Reopens an existing page file, rebuilding the in-memory bitmap from
    /// disk. The page size is assumed to be the crate default; this engine
    /// does not persist a custom page size across a reopen.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let page_size = page::DEFAULT_PAGE_SIZE;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let n_pages = (len / page_size as u64) as u32;
        let k = page::node_capacity(page_size);
        let bitmap_pages = bitmap_pages_for(n_pages, page_size);

        let mut bitmap = vec![0u8; bitmap_pages as usize * page_size];
        read_exact_at(&file, page_size as u64, &mut bitmap)?;

        Ok(PagePool {
            file,
            page_size,
            n_pages,
            k,
            bitmap,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn n_pages(&self) -> u32 {
        self.n_pages
    }

    pub fn max_value_len(&self) -> usize {
        page::max_value_len(self.page_size)
    }

    fn bit(&self, page: u32) -> bool {
        let byte = (page / 8) as usize;
        let bit = page % 8;
        self.bitmap[byte] & (1 << bit) != 0
    }

    fn mark_used(&mut self, page: u32) {
        let byte = (page / 8) as usize;
        let bit = page % 8;
        self.bitmap[byte] |= 1 << bit;
    }

    fn mark_free(&mut self, page: u32) {
        let byte = (page / 8) as usize;
        let bit = page % 8;
        self.bitmap[byte] &= !(1 << bit);
    }

    fn flush_bitmap(&mut self) -> Result<(), Error> {
        write_all_at(&self.file, self.page_size as u64, &self.bitmap)?;
        Ok(())
    }

    /// Finds the lowest-numbered free page, marks it used, and returns it.
    pub fn alloc(&mut self) -> Result<u32, Error> {
        for page in 0..self.n_pages {
            if !self.bit(page) {
                self.mark_used(page);
                self.flush_bitmap()?;
                return Ok(page);
            }
        }
        Err(Error::OutOfSpace)
    }

    /// Marks a page free again.
    pub fn free(&mut self, page: u32) -> Result<(), Error> {
        if page == 0 || page >= self.n_pages {
            return Err(err!(Corruption, "cannot free out-of-range page {}", page));
        }
        if !self.bit(page) {
            return Err(err!(Corruption, "double free of page {}", page));
        }
        self.mark_free(page);
        self.flush_bitmap()
    }

    fn page_offset(&self, page: u32) -> u64 {
        page as u64 * self.page_size as u64
    }

    pub fn read_node(&self, page: u32) -> Result<NodeImage, Error> {
        let mut buf = vec![0u8; self.page_size];
        read_exact_at(&self.file, self.page_offset(page), &mut buf)?;
        NodeImage::from_bytes(buf, self.k)
    }

    pub fn write_node(&mut self, node: &NodeImage) -> Result<(), Error> {
        let offset = self.page_offset(node.page());
        write_all_at(&self.file, offset, node.as_bytes())?;
        Ok(())
    }

    pub fn read_data(&self, page: u32) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; self.page_size];
        read_exact_at(&self.file, self.page_offset(page), &mut buf)?;
        page::decode_data(&buf)
    }

    pub fn write_data(&mut self, page: u32, value: &[u8]) -> Result<(), Error> {
        let buf = page::encode_data(self.page_size, value)?;
        write_all_at(&self.file, self.page_offset(page), &buf)?;
        Ok(())
    }

    /// Writes the 4-byte metadata page body: the current root page number.
    pub fn write_meta_root(&mut self, root: u32) -> Result<(), Error> {
        let mut buf = vec![0u8; self.page_size];
        buf[0..4].copy_from_slice(&root.to_le_bytes());
        write_all_at(&self.file, self.page_offset(META_PAGE), &buf)?;
        Ok(())
    }

    /// Reads the root page number out of the metadata page.
    pub fn read_meta_root(&self) -> Result<u32, Error> {
        let mut buf = vec![0u8; 4];
        read_exact_at(&self.file, self.page_offset(META_PAGE), &mut buf)?;
        Ok(u32::from_le_bytes(buf.try_into().unwrap()))
    }

    pub fn sync(&self) -> Result<(), Error> {
        self.file.sync_all()?;
        Ok(())
    }
}

fn bitmap_pages_for(n_pages: u32, page_size: usize) -> u32 {
    let bits_per_page = page_size as u32 * 8;
    n_pages.div_ceil(bits_per_page)
}

/// Positioned I/O that does not disturb the file's cursor. Unix's
/// `read_at`/`write_at` are already exact; Windows' `seek_read`/`seek_write`
/// are not guaranteed to fill or drain the whole buffer in one call, so they
/// are looped here to match.
fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = read_at(file, offset, buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read_at returned 0 bytes",
            ));
        }
        offset += n as u64;
        buf = &mut buf[n..];
    }
    Ok(())
}

fn write_all_at(file: &File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = write_at(file, offset, buf)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write_at returned 0 bytes"));
        }
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt as _;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt as _;
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt as _;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt as _;
    file.seek_write(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn tiny_pool() -> (NamedTempFile, PagePool) {
        let file = NamedTempFile::new().unwrap();
        let pool = PagePool::create_with_page_size(file.path(), 64 * 128, 128).unwrap();
        (file, pool)
    }

    #[test]
    fn create_marks_metadata_and_bitmap_pages_used() {
        let (_file, mut pool) = tiny_pool();
        // metadata + at least one bitmap page are already used, so the
        // first alloc must skip past them.
        let first = pool.alloc().unwrap();
        assert!(first >= 2);
    }

    #[test]
    fn alloc_reuses_freed_pages() {
        let (_file, mut pool) = tiny_pool();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        pool.free(a).unwrap();
        let c = pool.alloc().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn double_free_is_corruption() {
        let (_file, mut pool) = tiny_pool();
        let a = pool.alloc().unwrap();
        pool.free(a).unwrap();
        assert!(pool.free(a).is_err());
    }

    #[test]
    fn node_round_trips_through_disk() {
        let (_file, mut pool) = tiny_pool();
        let page = pool.alloc().unwrap();
        let node = NodeImage::new(pool.page_size(), pool.k(), page, 0, true);
        pool.write_node(&node).unwrap();
        let reloaded = pool.read_node(page).unwrap();
        assert_eq!(reloaded.page(), page);
        assert!(reloaded.is_leaf());
    }

    #[test]
    fn data_round_trips_through_disk() {
        let (_file, mut pool) = tiny_pool();
        let page = pool.alloc().unwrap();
        pool.write_data(page, b"hi").unwrap();
        assert_eq!(pool.read_data(page).unwrap(), b"hi");
    }

    #[test]
    fn exhausting_the_pool_returns_out_of_space() {
        let (_file, mut pool) = tiny_pool();
        let mut last_err = false;
        for _ in 0..200 {
            if pool.alloc().is_err() {
                last_err = true;
                break;
            }
        }
        assert!(last_err);
    }

    #[test]
    fn reopen_recovers_allocation_state() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        let page_size = page::DEFAULT_PAGE_SIZE;
        let mut pool = PagePool::create_with_page_size(&path, page_size as u64 * 64, page_size)
            .unwrap();
        let a = pool.alloc().unwrap();
        pool.write_meta_root(a).unwrap();
        drop(pool);

        let reopened = PagePool::open(&path).unwrap();
        assert_eq!(reopened.read_meta_root().unwrap(), a);
    }
}
