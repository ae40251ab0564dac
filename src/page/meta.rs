use super::Page;
use byteorder::{ByteOrder, LittleEndian};

const VERSION_OFFSET: usize = 8;
const NEXT_OFFSET_OFFSET: usize = 16;
const ROOT_OFFSET: usize = 24;

/// View over the single page at file offset 0: format version, the root
/// page offset and the bump-allocator cursor. A root of 0 means the tree
/// has never been initialized.
pub(crate) struct Meta<'p> {
    page: &'p Page,
}

impl<'p> Meta<'p> {
    pub(crate) fn new(page: &'p Page) -> Meta<'p> {
        Meta { page }
    }

    pub(crate) fn version(&self) -> u64 {
        LittleEndian::read_u64(&self.page.buf[VERSION_OFFSET..])
    }

    pub(crate) fn next_offset(&self) -> i64 {
        LittleEndian::read_i64(&self.page.buf[NEXT_OFFSET_OFFSET..])
    }

    pub(crate) fn root(&self) -> i64 {
        LittleEndian::read_i64(&self.page.buf[ROOT_OFFSET..])
    }
}

pub(crate) struct MetaMut<'p> {
    page: &'p mut Page,
}

impl<'p> MetaMut<'p> {
    pub(crate) fn new(page: &'p mut Page) -> MetaMut<'p> {
        MetaMut { page }
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        LittleEndian::write_u64(&mut self.page.buf[VERSION_OFFSET..], version);
    }

    pub(crate) fn set_next_offset(&mut self, next_offset: i64) {
        LittleEndian::write_i64(&mut self.page.buf[NEXT_OFFSET_OFFSET..], next_offset);
    }

    pub(crate) fn set_root(&mut self, root: i64) {
        LittleEndian::write_i64(&mut self.page.buf[ROOT_OFFSET..], root);
    }
}

#[cfg(test)]
mod meta_tests {
    use crate::page::{Page, PageType, PAGE_SIZE};

    #[test]
    fn fields_live_at_fixed_offsets() {
        let mut page = Page::new();
        page.init(PageType::Meta);
        {
            let mut meta = page.as_meta_mut().unwrap();
            meta.set_version(1);
            meta.set_next_offset(2 * PAGE_SIZE as i64);
            meta.set_root(PAGE_SIZE as i64);
        }
        let meta = page.as_meta().unwrap();
        assert_eq!(meta.version(), 1);
        assert_eq!(meta.next_offset(), 2 * PAGE_SIZE as i64);
        assert_eq!(meta.root(), PAGE_SIZE as i64);

        // on-disk layout: u64 version at byte 8, i64 next_offset at 16,
        // i64 root at 24, all little-endian
        let raw = page.as_bytes();
        assert_eq!(raw[8], 1);
        assert_eq!(&raw[16..24], &(2 * PAGE_SIZE as i64).to_le_bytes());
        assert_eq!(&raw[24..32], &(PAGE_SIZE as i64).to_le_bytes());
    }
}
