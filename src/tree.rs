use crate::page::{Page, PageType, PAGE_SIZE};
use crate::pager::{FilePager, Pager};
use crate::tx::Tx;
use crate::{Error, Result};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Maximum fanout for production trees. Small orders are useful in tests
/// because they force splits early.
pub const DEFAULT_ORDER: usize = 256;

/// Hard bound imposed by the u16 slot directories.
pub const MAX_KEY_LEN: usize = 65535;

/// Handle over one tree file: the pager, a cached copy of the meta page
/// guarded by a reader/writer lock, and the configured fanout. Point
/// operations each run as a short-lived transaction on the caller's
/// thread.
pub struct Tree<P: Pager> {
    pub(crate) pager: P,
    pub(crate) meta: RwLock<Page>,
    pub(crate) order: usize,
    pub(crate) poisoned: AtomicBool,
}

impl Tree<FilePager> {
    /// Opens (or creates) a durable tree file at `path`.
    pub fn open_path<Q: AsRef<Path>>(path: Q) -> Result<Tree<FilePager>> {
        Tree::open(FilePager::open(path)?)
    }
}

impl<P: Pager> Tree<P> {
    pub fn open(pager: P) -> Result<Tree<P>> {
        Tree::with_order(pager, DEFAULT_ORDER)
    }

    /// Opens the tree, formatting the store on first use: page 0 becomes
    /// the meta, page 1 an empty leaf serving as the root.
    pub fn with_order(pager: P, order: usize) -> Result<Tree<P>> {
        assert!(
            order >= 4 && order <= 256,
            "order must be within [4, 256], got {}",
            order
        );
        let mut meta_page = Page::new();
        pager.read_pages_at(std::slice::from_mut(&mut meta_page), 0)?;
        let root = match meta_page.page_type() {
            PageType::None => 0,
            PageType::Meta => meta_page.as_meta()?.root(),
            found => {
                return Err(Error::WrongPageType {
                    expected: PageType::Meta,
                    found,
                })
            }
        };
        if root == 0 {
            meta_page.init(PageType::Meta);
            {
                let mut meta = meta_page.as_meta_mut()?;
                meta.set_version(1);
                meta.set_root(PAGE_SIZE as i64);
                meta.set_next_offset(2 * PAGE_SIZE as i64);
            }
            let mut leaf = Page::new();
            leaf.init(PageType::Leaf);
            pager.write_pages_at(&[meta_page.clone(), leaf], 0)?;
            pager.sync()?;
            log::debug!(
                "TREE_INIT [root={}][next_offset={}]",
                PAGE_SIZE,
                2 * PAGE_SIZE
            );
        }
        Ok(Tree {
            pager,
            meta: RwLock::new(meta_page),
            order,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Snapshots the current root under the read lock. The transaction
    /// then runs against immutable pages without further locking.
    pub fn begin_tx(&self) -> Result<Tx<'_, P>> {
        let root = self.meta.read().unwrap().as_meta()?.root();
        Ok(Tx::new(self, root))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tx = self.begin_tx()?;
        let value = tx.get(key)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        let tx = self.begin_tx()?;
        let present = tx.has(key)?;
        tx.commit()?;
        Ok(present)
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut tx = self.begin_tx()?;
        tx.set(key, value)?;
        tx.commit()
    }

    pub fn del(&self, key: &[u8]) -> Result<()> {
        let mut tx = self.begin_tx()?;
        tx.del(key)?;
        tx.commit()
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(Error::Commit(
                "tree stopped accepting writes after a failed meta rewrite".into(),
            ));
        }
        Ok(())
    }

    fn read_one(&self, offset: i64) -> Result<Page> {
        let mut page = Page::new();
        self.pager
            .read_pages_at(std::slice::from_mut(&mut page), offset)?;
        Ok(page)
    }

    /// Debug rendering: the tree preorder, one line per page, indented by
    /// level. Eight-byte keys print as little-endian integers, anything
    /// else as hex.
    pub fn render(&self) -> Result<String> {
        let root = self.meta.read().unwrap().as_meta()?.root();
        let mut out = String::new();
        self.render_page(&mut out, root, 0)?;
        Ok(out)
    }

    fn render_page(&self, out: &mut String, offset: i64, level: usize) -> Result<()> {
        if offset == 0 {
            return Ok(());
        }
        let page = self.read_one(offset)?;
        for _ in 0..level {
            out.push('\t');
        }
        match page.page_type() {
            PageType::Node => {
                let node = page.as_node()?;
                for i in 0..node.n() {
                    if i > 0 {
                        out.push(' ');
                    }
                    out.push_str(&fmt_key(node.key_at(i)));
                }
                out.push('\n');
                for i in -1..node.n() as isize {
                    self.render_page(out, node.child_at(i), level + 1)?;
                }
            }
            PageType::Leaf => {
                let leaf = page.as_leaf()?;
                for i in 0..leaf.n() {
                    if i > 0 {
                        out.push(' ');
                    }
                    out.push_str(&fmt_key(leaf.key_at(i)));
                }
                out.push('\n');
            }
            found => {
                return Err(Error::WrongPageType {
                    expected: PageType::Leaf,
                    found,
                })
            }
        }
        Ok(())
    }
}

fn fmt_key(key: &[u8]) -> String {
    if key.len() == 8 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(key);
        u64::from_le_bytes(buf).to_string()
    } else {
        key.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl<P: Pager> fmt::Display for Tree<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render() {
            Ok(rendered) => f.write_str(&rendered),
            Err(_) => Err(fmt::Error),
        }
    }
}

#[cfg(test)]
impl<P: Pager> Tree<P> {
    /// Walks the whole tree checking structural invariants and returns the
    /// number of stored records.
    pub(crate) fn check_invariants(&self) -> Result<usize> {
        let root = self.meta.read().unwrap().as_meta()?.root();
        let mut leaf_depth = None;
        self.check_subtree(root, None, None, 0, &mut leaf_depth)
    }

    fn check_subtree(
        &self,
        offset: i64,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> Result<usize> {
        assert!(
            offset >= PAGE_SIZE as i64,
            "page offset {} inside the meta",
            offset
        );
        assert_eq!(offset % PAGE_SIZE as i64, 0, "misaligned page offset");
        let page = self.read_one(offset)?;
        match page.page_type() {
            PageType::Leaf => {
                let leaf = page.as_leaf()?;
                if depth > 0 {
                    assert!(leaf.n() >= 1, "empty non-root leaf");
                }
                assert!(leaf.n() <= self.order - 1);
                match *leaf_depth {
                    None => *leaf_depth = Some(depth),
                    Some(expected) => assert_eq!(expected, depth, "leaves at uneven depth"),
                }
                for i in 0..leaf.n() {
                    let key = leaf.key_at(i);
                    if i > 0 {
                        assert!(leaf.key_at(i - 1) < key, "leaf keys out of order");
                    }
                    if let Some(lo) = lo {
                        assert!(lo <= key, "leaf key below the separator");
                    }
                    if let Some(hi) = hi {
                        assert!(key < hi, "leaf key above the separator");
                    }
                }
                Ok(leaf.n())
            }
            PageType::Node => {
                let node = page.as_node()?;
                assert!(node.n() >= 1 && node.n() <= self.order - 1);
                for i in 0..node.n() {
                    let key = node.key_at(i);
                    if i > 0 {
                        assert!(node.key_at(i - 1) < key, "separators out of order");
                    }
                    if let Some(lo) = lo {
                        assert!(lo <= key);
                    }
                    if let Some(hi) = hi {
                        assert!(key < hi);
                    }
                }
                let mut total = 0;
                for i in -1..node.n() as isize {
                    let child_lo = if i >= 0 {
                        Some(node.key_at(i as usize))
                    } else {
                        lo
                    };
                    let child_hi = if i + 1 < node.n() as isize {
                        Some(node.key_at((i + 1) as usize))
                    } else {
                        hi
                    };
                    total += self.check_subtree(
                        node.child_at(i),
                        child_lo,
                        child_hi,
                        depth + 1,
                        leaf_depth,
                    )?;
                }
                Ok(total)
            }
            found => Err(Error::WrongPageType {
                expected: PageType::Leaf,
                found,
            }),
        }
    }
}
