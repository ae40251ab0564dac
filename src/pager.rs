use crate::page::{Page, PAGE_SIZE};
use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Reads and writes contiguous runs of pages at byte offsets. Offsets must
/// be non-negative multiples of PAGE_SIZE. Reading past the end of the
/// backing store is not an error; missing trailing pages come back zeroed.
/// Durability is the caller's concern: bulk writes never sync, `sync` is
/// invoked explicitly after meta rewrites.
pub trait Pager: Send + Sync {
    fn read_pages_at(&self, pages: &mut [Page], offset: i64) -> Result<()>;
    fn write_pages_at(&self, pages: &[Page], offset: i64) -> Result<()>;
    fn sync(&self) -> Result<()>;
}

impl<P: Pager> Pager for Arc<P> {
    fn read_pages_at(&self, pages: &mut [Page], offset: i64) -> Result<()> {
        (**self).read_pages_at(pages, offset)
    }

    fn write_pages_at(&self, pages: &[Page], offset: i64) -> Result<()> {
        (**self).write_pages_at(pages, offset)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

fn page_index(offset: i64) -> Result<usize> {
    if offset < 0 || offset % PAGE_SIZE as i64 != 0 {
        return Err(Error::InvalidOffset(offset));
    }
    Ok((offset / PAGE_SIZE as i64) as usize)
}

/// Vector-backed pager for tests and benchmarks.
#[derive(Default)]
pub struct MemoryPager {
    pages: RwLock<Vec<Page>>,
}

impl MemoryPager {
    pub fn new() -> MemoryPager {
        MemoryPager::default()
    }
}

impl Pager for MemoryPager {
    fn read_pages_at(&self, pages: &mut [Page], offset: i64) -> Result<()> {
        let index = page_index(offset)?;
        let store = self.pages.read().unwrap();
        for (i, page) in pages.iter_mut().enumerate() {
            match store.get(index + i) {
                Some(stored) => *page = stored.clone(),
                None => *page = Page::new(),
            }
        }
        Ok(())
    }

    fn write_pages_at(&self, pages: &[Page], offset: i64) -> Result<()> {
        let index = page_index(offset)?;
        let mut store = self.pages.write().unwrap();
        if index > store.len() {
            return Err(Error::InvalidOffset(offset));
        }
        for (i, page) in pages.iter().enumerate() {
            if index + i < store.len() {
                store[index + i] = page.clone();
            } else {
                store.push(page.clone());
            }
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed pager using positioned I/O, so concurrent reads need no
/// lock of their own.
pub struct FilePager {
    file: File,
    durable: bool,
}

impl FilePager {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FilePager> {
        FilePager::with_durability(path, true)
    }

    /// `durable: false` turns the sync barrier into a no-op. Useful for
    /// tests and benchmarks; production trees want the default.
    pub fn with_durability<P: AsRef<Path>>(path: P, durable: bool) -> Result<FilePager> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(FilePager { file, durable })
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

impl Pager for FilePager {
    fn read_pages_at(&self, pages: &mut [Page], offset: i64) -> Result<()> {
        page_index(offset)?;
        for (i, page) in pages.iter_mut().enumerate() {
            *page = Page::new();
            let page_off = offset as u64 + (i * PAGE_SIZE) as u64;
            let buf = page.as_bytes_mut();
            let mut pos = 0usize;
            // short reads at the tail leave the rest of the page zeroed
            while pos < buf.len() {
                match read_at(&self.file, &mut buf[pos..], page_off + pos as u64) {
                    Ok(0) => break,
                    Ok(read) => pos += read,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    fn write_pages_at(&self, pages: &[Page], offset: i64) -> Result<()> {
        page_index(offset)?;
        for (i, page) in pages.iter().enumerate() {
            let page_off = offset as u64 + (i * PAGE_SIZE) as u64;
            write_all_at(&self.file, page.as_bytes(), page_off)?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if self.durable {
            self.file.sync_data()?;
        }
        Ok(())
    }
}
