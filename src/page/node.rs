use super::{Page, DATA_LEN};
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;

const SLOT: usize = 2;
const CHILD: usize = 8;

/// Read view over an interior page: `n` separator keys laid out like the
/// leaf's key side, and `n + 1` child offsets growing down from the high
/// end. Child indices run over `[-1, n-1]`; child -1 (the subtree strictly
/// below the first separator) occupies the last eight bytes of the data
/// region, child 0 the eight before it, and so on. `tail` is always
/// `8 * (n + 1)`.
pub(crate) struct Node<'p> {
    page: &'p Page,
}

fn child_pos(i: isize) -> usize {
    DATA_LEN - CHILD * (i + 2) as usize
}

impl<'p> Node<'p> {
    pub(crate) fn new(page: &'p Page) -> Node<'p> {
        Node { page }
    }

    pub(crate) fn n(&self) -> usize {
        self.page.n()
    }

    fn key_off(&self, i: usize) -> usize {
        LittleEndian::read_u16(&self.page.data()[SLOT * i..]) as usize
    }

    fn key_span(&self, i: usize) -> (usize, usize) {
        debug_assert!(i < self.n());
        let start = self.key_off(i);
        let end = if i + 1 < self.n() {
            self.key_off(i + 1)
        } else {
            self.page.head()
        };
        (start, end)
    }

    pub(crate) fn key_at(&self, i: usize) -> &'p [u8] {
        let (start, end) = self.key_span(i);
        &self.page.data()[start..end]
    }

    pub(crate) fn child_at(&self, i: isize) -> i64 {
        debug_assert!(i >= -1 && i < self.n() as isize);
        LittleEndian::read_i64(&self.page.data()[child_pos(i)..])
    }

    /// Index of the child whose subtree may hold `key`: the last i with
    /// `key_at(i) <= key`, or -1 when the key sorts below every separator.
    pub(crate) fn find(&self, key: &[u8]) -> isize {
        let mut lo = 0usize;
        let mut hi = self.n();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match key.cmp(self.key_at(mid)) {
                Ordering::Less => hi = mid,
                _ => lo = mid + 1,
            }
        }
        lo as isize - 1
    }

    pub(crate) fn overflow_after_insert_key_child(&self, key: &[u8]) -> bool {
        self.page.head() + key.len() + SLOT + CHILD * (self.n() + 2) > DATA_LEN
    }
}

/// Write view over an interior page.
pub(crate) struct NodeMut<'p> {
    page: &'p mut Page,
}

impl<'p> NodeMut<'p> {
    pub(crate) fn new(page: &'p mut Page) -> NodeMut<'p> {
        NodeMut { page }
    }

    fn view(&self) -> Node<'_> {
        Node { page: self.page }
    }

    pub(crate) fn child_at(&self, i: isize) -> i64 {
        self.view().child_at(i)
    }

    /// Seeds a freshly initialized page with a single separator and its
    /// two children.
    pub(crate) fn init_root(&mut self, key: &[u8], child_minus1: i64, child_0: i64) {
        debug_assert!(self.page.n() == 0);
        {
            let data = self.page.data_mut();
            LittleEndian::write_u16(&mut data[0..], SLOT as u16);
            data[SLOT..SLOT + key.len()].copy_from_slice(key);
            LittleEndian::write_i64(&mut data[child_pos(-1)..], child_minus1);
            LittleEndian::write_i64(&mut data[child_pos(0)..], child_0);
        }
        self.page.set_head(SLOT + key.len());
        self.page.set_tail(2 * CHILD);
        self.page.set_n(1);
    }

    pub(crate) fn set_child_at(&mut self, i: isize, offset: i64) {
        debug_assert!(i >= -1 && i < self.page.n() as isize);
        LittleEndian::write_i64(&mut self.page.data_mut()[child_pos(i)..], offset);
    }

    /// Inserts a separator at key slot `i` together with its right child at
    /// child slot `i`. Returns false when key heap and child array would
    /// collide.
    pub(crate) fn insert_key_child_at(&mut self, key: &[u8], child: i64, i: usize) -> bool {
        let n = self.page.n();
        debug_assert!(i <= n);
        if n >= u8::max_value() as usize || self.view().overflow_after_insert_key_child(key) {
            return false;
        }
        let head = self.page.head();
        let klen = key.len();

        // key side, same directory mechanics as the leaf
        let dir_end = SLOT * n;
        let key_at_i = if i < n { self.view().key_off(i) } else { head };
        {
            let data = self.page.data_mut();
            data.copy_within(key_at_i..head, key_at_i + klen + SLOT);
            data.copy_within(dir_end..key_at_i, dir_end + SLOT);
            data[key_at_i + SLOT..key_at_i + SLOT + klen].copy_from_slice(key);
            for j in (i..n).rev() {
                let off = LittleEndian::read_u16(&data[SLOT * j..]) as usize;
                LittleEndian::write_u16(&mut data[SLOT * (j + 1)..], (off + klen + SLOT) as u16);
            }
            for j in 0..i {
                let off = LittleEndian::read_u16(&data[SLOT * j..]) as usize;
                LittleEndian::write_u16(&mut data[SLOT * j..], (off + SLOT) as u16);
            }
            LittleEndian::write_u16(&mut data[SLOT * i..], (key_at_i + SLOT) as u16);

            // children at and after slot i slide one slot down
            let bottom = DATA_LEN - CHILD * (n + 1);
            data.copy_within(bottom..DATA_LEN - CHILD * (i + 1), bottom - CHILD);
            LittleEndian::write_i64(&mut data[DATA_LEN - CHILD * (i + 2)..], child);
        }

        self.page.set_head(head + klen + SLOT);
        self.page.set_tail(CHILD * (n + 2));
        self.page.set_n(n + 1);
        true
    }

    /// Replaces separator `i`; later keys slide by the length difference.
    pub(crate) fn set_key_at(&mut self, key: &[u8], i: usize) -> bool {
        let n = self.page.n();
        debug_assert!(i < n);
        let (start, end) = self.view().key_span(i);
        let old_len = end - start;
        let klen = key.len();
        let head = self.page.head();
        if klen > old_len && head + self.page.tail() + (klen - old_len) > DATA_LEN {
            return false;
        }
        let delta = klen as isize - old_len as isize;
        {
            let data = self.page.data_mut();
            data.copy_within(end..head, (end as isize + delta) as usize);
            data[start..start + klen].copy_from_slice(key);
            for j in i + 1..n {
                let off = LittleEndian::read_u16(&data[SLOT * j..]) as isize;
                LittleEndian::write_u16(&mut data[SLOT * j..], (off + delta) as u16);
            }
        }
        self.page.set_head((head as isize + delta) as usize);
        true
    }

    /// Bulk-moves separators `[from, to)` and their right children into
    /// `dst` at slot `where_`, removing them from self. `dst`'s leftmost
    /// child is left for the caller to fill in.
    pub(crate) fn move_data(
        &mut self,
        dst: &mut NodeMut<'_>,
        where_: usize,
        from: usize,
        to: usize,
    ) -> bool {
        log::debug!(
            "NODE_MOVE_DATA [from={}][to={}][where={}][n={}]",
            from,
            to,
            where_,
            self.page.n()
        );
        for (k, idx) in (from..to).enumerate() {
            let src = self.view();
            let key = src.key_at(idx);
            let child = src.child_at(idx as isize);
            if !dst.insert_key_child_at(key, child, where_ + k) {
                return false;
            }
        }
        self.remove_range(from, to);
        true
    }

    /// Drops trailing separators and their right children, keeping
    /// children `[-1, new_n - 1]`.
    pub(crate) fn truncate(&mut self, new_n: usize) {
        let n = self.page.n();
        self.remove_range(new_n, n);
    }

    fn remove_range(&mut self, from: usize, to: usize) {
        let n = self.page.n();
        debug_assert!(from <= to && to <= n);
        if from == to {
            return;
        }
        let removed = to - from;
        let dshrink = SLOT * removed;
        let head = self.page.head();

        // key side
        let k_lo = self.view().key_off(from);
        let k_hi = if to < n { self.view().key_off(to) } else { head };
        let removed_kbytes = k_hi - k_lo;
        let dir_end = SLOT * n;
        {
            let data = self.page.data_mut();
            data.copy_within(k_hi..head, k_lo);
            for j in to..n {
                let off = LittleEndian::read_u16(&data[SLOT * j..]) as usize;
                LittleEndian::write_u16(
                    &mut data[SLOT * (j - removed)..],
                    (off - removed_kbytes - dshrink) as u16,
                );
            }
            for j in 0..from {
                let off = LittleEndian::read_u16(&data[SLOT * j..]) as usize;
                LittleEndian::write_u16(&mut data[SLOT * j..], (off - dshrink) as u16);
            }
            data.copy_within(dir_end..head - removed_kbytes, dir_end - dshrink);

            // children [from, to) go away; the ones below slide back up
            let bottom = DATA_LEN - CHILD * (n + 1);
            data.copy_within(bottom..DATA_LEN - CHILD * (to + 1), bottom + CHILD * removed);
        }

        self.page.set_head(head - removed_kbytes - dshrink);
        self.page.set_tail(CHILD * (n - removed + 1));
        self.page.set_n(n - removed);
    }
}

#[cfg(test)]
mod tests_node {
    use super::*;
    use crate::page::PageType;

    fn node_page(sep: &[u8]) -> Page {
        let mut page = Page::new();
        page.init(PageType::Node);
        page.as_node_mut().unwrap().init_root(sep, 100, 200);
        page
    }

    #[test]
    fn init_root_seeds_one_separator() {
        let page = node_page(b"m");
        let node = page.as_node().unwrap();
        assert_eq!(node.n(), 1);
        assert_eq!(node.key_at(0), b"m");
        assert_eq!(node.child_at(-1), 100);
        assert_eq!(node.child_at(0), 200);
        assert_eq!(page.tail(), 2 * CHILD);
    }

    #[test]
    fn find_routes_around_separators() {
        let mut page = node_page(b"h");
        assert!(page.as_node_mut().unwrap().insert_key_child_at(b"p", 300, 1));
        let node = page.as_node().unwrap();
        assert_eq!(node.find(b"a"), -1);
        assert_eq!(node.find(b"h"), 0);
        assert_eq!(node.find(b"j"), 0);
        assert_eq!(node.find(b"p"), 1);
        assert_eq!(node.find(b"z"), 1);
    }

    #[test]
    fn insert_key_child_keeps_children_aligned() {
        let mut page = node_page(b"d");
        // separators b < d < f, children strictly between them
        assert!(page.as_node_mut().unwrap().insert_key_child_at(b"f", 300, 1));
        assert!(page.as_node_mut().unwrap().insert_key_child_at(b"b", 400, 0));
        let node = page.as_node().unwrap();
        assert_eq!(node.n(), 3);
        assert_eq!(node.key_at(0), b"b");
        assert_eq!(node.key_at(1), b"d");
        assert_eq!(node.key_at(2), b"f");
        assert_eq!(node.child_at(-1), 100);
        assert_eq!(node.child_at(0), 400);
        assert_eq!(node.child_at(1), 200);
        assert_eq!(node.child_at(2), 300);
        assert_eq!(page.tail(), 4 * CHILD);
    }

    #[test]
    fn set_child_at_overwrites_in_place() {
        let mut page = node_page(b"m");
        page.as_node_mut().unwrap().set_child_at(-1, 111);
        page.as_node_mut().unwrap().set_child_at(0, 222);
        let node = page.as_node().unwrap();
        assert_eq!(node.child_at(-1), 111);
        assert_eq!(node.child_at(0), 222);
        assert_eq!(node.n(), 1);
    }

    #[test]
    fn set_key_at_grows_and_shrinks() {
        let mut page = node_page(b"dd");
        assert!(page.as_node_mut().unwrap().insert_key_child_at(b"pp", 300, 1));
        assert!(page.as_node_mut().unwrap().set_key_at(b"cccc", 0));
        {
            let node = page.as_node().unwrap();
            assert_eq!(node.key_at(0), b"cccc");
            assert_eq!(node.key_at(1), b"pp");
        }
        assert!(page.as_node_mut().unwrap().set_key_at(b"q", 1));
        let node = page.as_node().unwrap();
        assert_eq!(node.key_at(0), b"cccc");
        assert_eq!(node.key_at(1), b"q");
        assert_eq!(node.child_at(-1), 100);
        assert_eq!(node.child_at(0), 200);
        assert_eq!(node.child_at(1), 300);
        assert_eq!(page.head(), 2 * SLOT + 5);
    }

    #[test]
    fn move_data_carries_keys_and_right_children() {
        let mut page = node_page(b"b");
        for (i, (key, child)) in [(b"d", 300i64), (b"f", 400), (b"h", 500)].iter().enumerate() {
            assert!(page
                .as_node_mut()
                .unwrap()
                .insert_key_child_at(&key[..], *child, i + 1));
        }
        let mut right = Page::new();
        right.init(PageType::Node);
        assert!(page
            .as_node_mut()
            .unwrap()
            .move_data(&mut right.as_node_mut().unwrap(), 0, 2, 4));
        right.as_node_mut().unwrap().set_child_at(-1, 999);

        let left = page.as_node().unwrap();
        assert_eq!(left.n(), 2);
        assert_eq!(left.key_at(0), b"b");
        assert_eq!(left.key_at(1), b"d");
        assert_eq!(left.child_at(-1), 100);
        assert_eq!(left.child_at(0), 200);
        assert_eq!(left.child_at(1), 300);

        let right = right.as_node().unwrap();
        assert_eq!(right.n(), 2);
        assert_eq!(right.key_at(0), b"f");
        assert_eq!(right.key_at(1), b"h");
        assert_eq!(right.child_at(-1), 999);
        assert_eq!(right.child_at(0), 400);
        assert_eq!(right.child_at(1), 500);
    }

    #[test]
    fn truncate_drops_trailing_separators() {
        let mut page = node_page(b"b");
        assert!(page.as_node_mut().unwrap().insert_key_child_at(b"d", 300, 1));
        assert!(page.as_node_mut().unwrap().insert_key_child_at(b"f", 400, 2));
        page.as_node_mut().unwrap().truncate(1);
        let node = page.as_node().unwrap();
        assert_eq!(node.n(), 1);
        assert_eq!(node.key_at(0), b"b");
        assert_eq!(node.child_at(-1), 100);
        assert_eq!(node.child_at(0), 200);
        assert_eq!(page.tail(), 2 * CHILD);
        assert_eq!(page.head(), SLOT + 1);
    }

    #[test]
    fn overflow_predicate_tracks_child_array() {
        let mut page = node_page(&[0]);
        let mut next = 1u64;
        loop {
            let key = next.to_le_bytes();
            if page.as_node().unwrap().overflow_after_insert_key_child(&key) {
                let n = page.n();
                assert!(!page
                    .as_node_mut()
                    .unwrap()
                    .insert_key_child_at(&key, next as i64, n));
                break;
            }
            let n = page.n();
            assert!(page
                .as_node_mut()
                .unwrap()
                .insert_key_child_at(&key, next as i64, n));
            next += 1;
        }
        assert!(page.head() + page.tail() <= DATA_LEN);
    }
}
