use crate::page::{Page, PageType, DATA_LEN, PAGE_SIZE};
use crate::pager::Pager;
use crate::tree::{Tree, MAX_KEY_LEN};
use crate::{Error, Result};
use std::sync::atomic::Ordering;

/// Offsets below this address the transaction's staging vector instead of
/// the file. Real page offsets start at PAGE_SIZE (page 0 is the meta), so
/// the two ranges never collide.
pub(crate) const TENTATIVE_MAX: i64 = PAGE_SIZE as i64 - 1;

/// Sentinel passed to `write_page` to request a fresh staging slot.
pub(crate) const NEW_PAGE: i64 = TENTATIVE_MAX;

struct PathItem {
    page: Page,
    offset: i64,
    index: isize,
}

/// A copy-on-write transaction. Every page it touches is rewritten into a
/// private staging vector addressed by tentative offsets; commit relocates
/// the staged pages to the file tail and publishes the new root by
/// rewriting the meta page. Until then readers keep seeing the snapshot
/// root taken at `begin_tx`.
pub struct Tx<'t, P: Pager> {
    tree: &'t Tree<P>,
    root: i64,
    pages: Vec<Page>,
    path: Vec<PathItem>,
}

impl<'t, P: Pager> Tx<'t, P> {
    pub(crate) fn new(tree: &'t Tree<P>, root: i64) -> Tx<'t, P> {
        Tx {
            tree,
            root,
            pages: Vec::new(),
            path: Vec::new(),
        }
    }

    fn read_page(&self, offset: i64) -> Result<Page> {
        if offset < TENTATIVE_MAX {
            Ok(self.pages[offset as usize].clone())
        } else {
            let mut page = Page::new();
            self.tree
                .pager
                .read_pages_at(std::slice::from_mut(&mut page), offset)?;
            Ok(page)
        }
    }

    /// Stages a page. A tentative offset overwrites that staging slot; any
    /// real offset (or NEW_PAGE) allocates a fresh slot. Returns the slot's
    /// tentative offset.
    fn write_page(&mut self, page: Page, offset: i64) -> i64 {
        if offset < TENTATIVE_MAX {
            self.pages[offset as usize] = page;
            offset
        } else {
            // a staging index must stay distinguishable from a real offset
            assert!((self.pages.len() as i64) < TENTATIVE_MAX);
            self.pages.push(page);
            (self.pages.len() - 1) as i64
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut offset = self.root;
        loop {
            let page = self.read_page(offset)?;
            match page.page_type() {
                PageType::Node => {
                    let node = page.as_node()?;
                    offset = node.child_at(node.find(key));
                }
                PageType::Leaf => {
                    let leaf = page.as_leaf()?;
                    let (i, found) = leaf.find(key);
                    return Ok(if found {
                        Some(leaf.value_at((i + 1) as usize).to_vec())
                    } else {
                        None
                    });
                }
                found => {
                    return Err(Error::WrongPageType {
                        expected: PageType::Leaf,
                        found,
                    })
                }
            }
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        self.get(key).map(|value| value.is_some())
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.ensure_writable()?;
        if key.len() > MAX_KEY_LEN || key.len() + 4 > DATA_LEN {
            return Err(Error::KeyTooLarge(key.len()));
        }
        if key.len() + value.len() + 4 > DATA_LEN {
            return Err(Error::ValueTooLarge(value.len()));
        }

        let (mut leaf_page, leaf_off) = self.descend(key)?;
        let (i, found) = leaf_page.as_leaf()?.find(key);
        let pos = (i + 1) as usize;

        let overflow = {
            let leaf = leaf_page.as_leaf()?;
            if found {
                leaf.overflow_after_set_value(value, pos)
            } else {
                leaf.n() >= self.tree.order - 1
                    || leaf.overflow_after_insert_key_value(key, value)
            }
        };
        if overflow {
            return self.split_leaf(leaf_page, leaf_off, key, value, pos, found);
        }

        {
            let mut leaf = leaf_page.as_leaf_mut()?;
            let ok = if found {
                leaf.set_value_at(value, pos)
            } else {
                leaf.insert_key_value_at(key, value, pos)
            };
            debug_assert!(ok);
        }
        let offset = self.write_page(leaf_page, leaf_off);
        self.reparent(offset)
    }

    pub fn del(&mut self, _key: &[u8]) -> Result<()> {
        self.tree.ensure_writable()?;
        Err(Error::Unsupported("delete"))
    }

    /// Walks from the snapshot root to the leaf responsible for `key`,
    /// recording every interior node and the chosen child index.
    fn descend(&mut self, key: &[u8]) -> Result<(Page, i64)> {
        self.path.clear();
        let mut offset = self.root;
        loop {
            let page = self.read_page(offset)?;
            match page.page_type() {
                PageType::Node => {
                    let index = page.as_node()?.find(key);
                    let child = page.as_node()?.child_at(index);
                    self.path.push(PathItem {
                        page,
                        offset,
                        index,
                    });
                    offset = child;
                }
                PageType::Leaf => return Ok((page, offset)),
                found => {
                    return Err(Error::WrongPageType {
                        expected: PageType::Leaf,
                        found,
                    })
                }
            }
        }
    }

    /// Re-stages every node left on the path stack so it points at the
    /// fresh copy of its child, then records the topmost copy as the
    /// transaction root.
    fn reparent(&mut self, mut child: i64) -> Result<()> {
        while let Some(item) = self.path.pop() {
            let PathItem {
                mut page,
                offset,
                index,
            } = item;
            page.as_node_mut()?.set_child_at(index, child);
            child = self.write_page(page, offset);
        }
        self.root = child;
        Ok(())
    }

    fn split_leaf(
        &mut self,
        mut left: Page,
        left_off: i64,
        key: &[u8],
        value: &[u8],
        pos: usize,
        found: bool,
    ) -> Result<()> {
        let n = left.n();
        let half = n / 2;
        let mut right = Page::new();
        right.init(PageType::Leaf);
        {
            let mut left_leaf = left.as_leaf_mut()?;
            let mut right_leaf = right.as_leaf_mut()?;
            let ok = if found {
                // rewrite of an existing record that no longer fits
                left_leaf.move_data(&mut right_leaf, 0, half, n)
                    && if pos < half {
                        left_leaf.set_value_at(value, pos)
                    } else {
                        right_leaf.set_value_at(value, pos - half)
                    }
            } else if pos <= half {
                left_leaf.move_data(&mut right_leaf, 0, half, n)
                    && left_leaf.insert_key_value_at(key, value, pos)
            } else {
                left_leaf.move_data(&mut right_leaf, 0, half + 1, n)
                    && right_leaf.insert_key_value_at(key, value, pos - half - 1)
            };
            if !ok {
                return Err(Error::ValueTooLarge(value.len()));
            }
        }
        // owned copy: the right page is about to be consumed by staging
        let sep = right.as_leaf()?.key_at(0).to_vec();
        log::debug!(
            "SPLIT_LEAF [offset={}][n={}][left_n={}][right_n={}]",
            left_off,
            n,
            left.n(),
            right.n()
        );
        let right_off = self.write_page(right, NEW_PAGE);
        let left_off = self.write_page(left, left_off);
        self.propagate_split(left_off, sep, right_off)
    }

    /// Carries a freshly created sibling and its separator up the path
    /// stack, splitting full nodes along the way. An exhausted stack grows
    /// the tree by one level.
    fn propagate_split(&mut self, mut child: i64, mut sep: Vec<u8>, mut new_page: i64) -> Result<()> {
        loop {
            let item = match self.path.pop() {
                Some(item) => item,
                None => {
                    let mut root = Page::new();
                    root.init(PageType::Node);
                    root.as_node_mut()?.init_root(&sep, child, new_page);
                    self.root = self.write_page(root, NEW_PAGE);
                    log::debug!("NEW_ROOT [tentative={}]", self.root);
                    return Ok(());
                }
            };
            let PathItem {
                mut page,
                offset,
                index,
            } = item;
            page.as_node_mut()?.set_child_at(index, child);
            let slot = (index + 1) as usize;

            let full = {
                let node = page.as_node()?;
                node.n() >= self.tree.order - 1 || node.overflow_after_insert_key_child(&sep)
            };
            if !full {
                if !page.as_node_mut()?.insert_key_child_at(&sep, new_page, slot) {
                    return Err(Error::KeyTooLarge(sep.len()));
                }
                let offset = self.write_page(page, offset);
                return self.reparent(offset);
            }

            let (next_child, next_sep, next_page) =
                self.split_node(page, offset, &sep, new_page, slot)?;
            child = next_child;
            sep = next_sep;
            new_page = next_page;
        }
    }

    /// Splits a full node while inserting `(sep, right_child)` at `slot`.
    /// Unlike a leaf split the separator handed to the parent is promoted
    /// out of both halves: depending on where the insert lands it is the
    /// last key of the left half, the inserted key itself, or the first
    /// key of the right half.
    fn split_node(
        &mut self,
        mut left: Page,
        left_off: i64,
        sep: &[u8],
        right_child: i64,
        slot: usize,
    ) -> Result<(i64, Vec<u8>, i64)> {
        use std::cmp::Ordering::{Equal, Greater, Less};

        let n = left.n();
        let half = n / 2;
        let mut right = Page::new();
        right.init(PageType::Node);
        let promoted: Vec<u8>;
        match slot.cmp(&half) {
            Less => {
                if !left
                    .as_node_mut()?
                    .move_data(&mut right.as_node_mut()?, 0, half, n)
                {
                    return Err(Error::KeyTooLarge(sep.len()));
                }
                let carry = left.as_node()?.child_at(half as isize - 1);
                right.as_node_mut()?.set_child_at(-1, carry);
                promoted = left.as_node()?.key_at(half - 1).to_vec();
                left.as_node_mut()?.truncate(half - 1);
                if !left.as_node_mut()?.insert_key_child_at(sep, right_child, slot) {
                    return Err(Error::KeyTooLarge(sep.len()));
                }
            }
            Equal => {
                if !left
                    .as_node_mut()?
                    .move_data(&mut right.as_node_mut()?, 0, half, n)
                {
                    return Err(Error::KeyTooLarge(sep.len()));
                }
                right.as_node_mut()?.set_child_at(-1, right_child);
                promoted = sep.to_vec();
            }
            Greater => {
                if !left
                    .as_node_mut()?
                    .move_data(&mut right.as_node_mut()?, 0, half + 1, n)
                {
                    return Err(Error::KeyTooLarge(sep.len()));
                }
                let carry = left.as_node()?.child_at(half as isize);
                right.as_node_mut()?.set_child_at(-1, carry);
                promoted = left.as_node()?.key_at(half).to_vec();
                left.as_node_mut()?.truncate(half);
                if !right
                    .as_node_mut()?
                    .insert_key_child_at(sep, right_child, slot - half - 1)
                {
                    return Err(Error::KeyTooLarge(sep.len()));
                }
            }
        }
        log::debug!(
            "SPLIT_NODE [offset={}][n={}][slot={}][half={}]",
            left_off,
            n,
            slot,
            half
        );
        let right_off = self.write_page(right, NEW_PAGE);
        let left_off = self.write_page(left, left_off);
        Ok((left_off, promoted, right_off))
    }

    /// Relocates the staged pages to the file tail and publishes the new
    /// root. Holding the tree's write lock from cursor read to meta publish
    /// serializes commits; a failure before the meta rewrite leaves only
    /// orphan pages behind and the old root stays authoritative.
    pub fn commit(mut self) -> Result<()> {
        if self.pages.is_empty() {
            return Ok(());
        }
        self.tree.ensure_writable()?;
        let tree = self.tree;
        let mut meta_guard = tree.meta.write().unwrap();
        let start = meta_guard.as_meta()?.next_offset();

        for page in self.pages.iter_mut() {
            if page.page_type() != PageType::Node {
                continue;
            }
            let n = page.n() as isize;
            let mut node = page.as_node_mut()?;
            for i in -1..n {
                let child = node.child_at(i);
                if child < TENTATIVE_MAX {
                    node.set_child_at(i, child * PAGE_SIZE as i64 + start);
                }
            }
        }
        let mut root = self.root;
        if root < TENTATIVE_MAX {
            root = root * PAGE_SIZE as i64 + start;
        }

        tree.pager.write_pages_at(&self.pages, start)?;

        let mut new_meta = (*meta_guard).clone();
        {
            let mut meta = new_meta.as_meta_mut()?;
            meta.set_root(root);
            meta.set_next_offset(start + (self.pages.len() * PAGE_SIZE) as i64);
        }
        let publish = tree
            .pager
            .write_pages_at(std::slice::from_ref(&new_meta), 0)
            .and_then(|_| tree.pager.sync());
        if let Err(err) = publish {
            // the on-disk meta is now indeterminate; refuse further writes
            tree.poisoned.store(true, Ordering::SeqCst);
            return Err(Error::Commit(format!("meta rewrite failed: {}", err)));
        }
        *meta_guard = new_meta;
        log::debug!(
            "COMMIT [start={}][pages={}][root={}]",
            start,
            self.pages.len(),
            root
        );
        Ok(())
    }

    /// Discards the staging vector. Nothing shared was touched, so the
    /// snapshot root simply stops being referenced.
    pub fn rollback(self) {
        log::debug!("ROLLBACK [staged={}]", self.pages.len());
    }
}

#[cfg(test)]
mod tx_tests {
    use super::*;
    use crate::pager::MemoryPager;
    use crate::tree::Tree;
    use std::io;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn k(x: u64) -> [u8; 8] {
        x.to_le_bytes()
    }

    /// Pager wrapper that injects write failures, for commit-atomicity
    /// coverage. Reads always succeed.
    struct FlakyPager {
        inner: MemoryPager,
        fail_data: AtomicBool,
        fail_meta: AtomicBool,
    }

    impl FlakyPager {
        fn new() -> FlakyPager {
            FlakyPager {
                inner: MemoryPager::new(),
                fail_data: AtomicBool::new(false),
                fail_meta: AtomicBool::new(false),
            }
        }
    }

    impl Pager for FlakyPager {
        fn read_pages_at(&self, pages: &mut [Page], offset: i64) -> Result<()> {
            self.inner.read_pages_at(pages, offset)
        }

        fn write_pages_at(&self, pages: &[Page], offset: i64) -> Result<()> {
            let fail = if offset == 0 {
                self.fail_meta.load(Ordering::SeqCst)
            } else {
                self.fail_data.load(Ordering::SeqCst)
            };
            if fail {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "injected write failure",
                )));
            }
            self.inner.write_pages_at(pages, offset)
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn staged_writes_are_visible_inside_the_tx_only() {
        let tree = Tree::with_order(MemoryPager::new(), 5).unwrap();
        let mut tx = tree.begin_tx().unwrap();
        for x in &[20u64, 40, 10, 30, 15, 35] {
            tx.set(&k(*x), &k(x * 2)).unwrap();
        }
        assert_eq!(tx.get(&k(10)).unwrap(), Some(k(20).to_vec()));
        assert_eq!(tx.get(&k(35)).unwrap(), Some(k(70).to_vec()));
        assert!(tx.has(&k(15)).unwrap());
        // nothing published yet
        assert_eq!(tree.get(&k(10)).unwrap(), None);

        tx.commit().unwrap();
        assert_eq!(tree.get(&k(10)).unwrap(), Some(k(20).to_vec()));
        assert_eq!(tree.get(&k(35)).unwrap(), Some(k(70).to_vec()));
        tree.check_invariants().unwrap();
    }

    #[test]
    fn rollback_discards_staging() {
        let tree = Tree::with_order(MemoryPager::new(), 5).unwrap();
        tree.set(&k(1), b"one").unwrap();

        let mut tx = tree.begin_tx().unwrap();
        tx.set(&k(2), b"two").unwrap();
        tx.set(&k(1), b"uno").unwrap();
        tx.rollback();

        assert_eq!(tree.get(&k(1)).unwrap(), Some(b"one".to_vec()));
        assert_eq!(tree.get(&k(2)).unwrap(), None);
    }

    #[test]
    fn read_only_transactions_commit_without_writing() {
        let pager = Arc::new(FlakyPager::new());
        let tree = Tree::with_order(Arc::clone(&pager), 5).unwrap();
        tree.set(&k(7), b"seven").unwrap();

        // fail every write; a lookup-only tx must not care
        pager.fail_data.store(true, Ordering::SeqCst);
        pager.fail_meta.store(true, Ordering::SeqCst);
        let tx = tree.begin_tx().unwrap();
        assert_eq!(tx.get(&k(7)).unwrap(), Some(b"seven".to_vec()));
        tx.commit().unwrap();
    }

    #[test]
    fn failed_bulk_write_leaves_the_old_root_authoritative() {
        let pager = Arc::new(FlakyPager::new());
        let tree = Tree::with_order(Arc::clone(&pager), 5).unwrap();
        for x in 0u64..20 {
            tree.set(&k(x), &k(x)).unwrap();
        }

        pager.fail_data.store(true, Ordering::SeqCst);
        match tree.set(&k(100), &k(100)) {
            Err(Error::Io(_)) => {}
            other => panic!("expected Io error, got {:?}", other),
        }
        pager.fail_data.store(false, Ordering::SeqCst);

        // the failed commit appended nothing visible: the same tree and a
        // reopened one both serve the pre-commit state
        assert_eq!(tree.get(&k(100)).unwrap(), None);
        assert_eq!(tree.get(&k(19)).unwrap(), Some(k(19).to_vec()));

        let reopened = Tree::with_order(Arc::clone(&pager), 5).unwrap();
        assert_eq!(reopened.get(&k(100)).unwrap(), None);
        for x in 0u64..20 {
            assert_eq!(reopened.get(&k(x)).unwrap(), Some(k(x).to_vec()));
        }
        reopened.check_invariants().unwrap();

        // the tree was not poisoned: later writes go through
        tree.set(&k(100), &k(100)).unwrap();
        assert_eq!(tree.get(&k(100)).unwrap(), Some(k(100).to_vec()));
    }

    #[test]
    fn failed_meta_rewrite_poisons_the_tree() {
        let pager = Arc::new(FlakyPager::new());
        let tree = Tree::with_order(Arc::clone(&pager), 5).unwrap();
        tree.set(&k(1), b"one").unwrap();

        pager.fail_meta.store(true, Ordering::SeqCst);
        match tree.set(&k(2), b"two") {
            Err(Error::Commit(_)) => {}
            other => panic!("expected Commit error, got {:?}", other),
        }
        pager.fail_meta.store(false, Ordering::SeqCst);

        // writes refuse from here on, reads keep serving the cached root
        match tree.set(&k(3), b"three") {
            Err(Error::Commit(_)) => {}
            other => panic!("expected Commit error, got {:?}", other),
        }
        assert_eq!(tree.get(&k(1)).unwrap(), Some(b"one".to_vec()));
    }

    #[test]
    fn del_is_not_supported() {
        let tree = Tree::with_order(MemoryPager::new(), 5).unwrap();
        tree.set(&k(1), b"one").unwrap();
        match tree.del(&k(1)) {
            Err(Error::Unsupported(_)) => {}
            other => panic!("expected Unsupported, got {:?}", other),
        }
        assert!(tree.has(&k(1)).unwrap());
    }

    #[test]
    fn oversized_records_are_rejected_up_front() {
        let tree = Tree::with_order(MemoryPager::new(), 5).unwrap();
        let huge_key = vec![1u8; DATA_LEN];
        match tree.set(&huge_key, b"v") {
            Err(Error::KeyTooLarge(_)) => {}
            other => panic!("expected KeyTooLarge, got {:?}", other),
        }
        let huge_value = vec![1u8; DATA_LEN];
        match tree.set(b"k", &huge_value) {
            Err(Error::ValueTooLarge(_)) => {}
            other => panic!("expected ValueTooLarge, got {:?}", other),
        }
        // the largest accepted record occupies a leaf by itself
        let value = vec![2u8; DATA_LEN - 4 - 1];
        tree.set(b"k", &value).unwrap();
        assert_eq!(tree.get(b"k").unwrap(), Some(value));
    }

    #[test]
    fn commit_rewrites_tentative_offsets_to_page_multiples() {
        let tree = Tree::with_order(MemoryPager::new(), 5).unwrap();
        // enough keys to force a split and a fresh root in one tx
        let mut tx = tree.begin_tx().unwrap();
        for x in 0u64..10 {
            tx.set(&k(x), &k(x)).unwrap();
        }
        tx.commit().unwrap();

        let meta = tree.meta.read().unwrap();
        let meta = meta.as_meta().unwrap();
        assert_eq!(meta.root() % PAGE_SIZE as i64, 0);
        assert!(meta.root() >= PAGE_SIZE as i64);
        assert_eq!(meta.next_offset() % PAGE_SIZE as i64, 0);
        drop(meta);
        tree.check_invariants().unwrap();
    }
}
