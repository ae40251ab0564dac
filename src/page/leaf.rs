use super::{Page, DATA_LEN};
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;

const SLOT: usize = 2;

/// Read view over a leaf page.
///
/// The data region packs two directories growing toward the middle. From
/// the low end: `n` u16 key offsets, then the key heap. From the high end:
/// `n` u16 value offsets (entry 0 occupies the last two bytes), then the
/// value heap growing downward. `head` counts bytes used at the low end,
/// `tail` at the high end; the free region between them stays contiguous.
///
/// `key_off[i]` is the absolute start of key i within the data region; key
/// i ends where key i+1 begins (the last one ends at `head`). `value_off[i]`
/// is the absolute exclusive end of value i; value i starts where value i+1
/// ends (the last one starts at `DATA_LEN - tail`).
pub(crate) struct Leaf<'p> {
    page: &'p Page,
}

impl<'p> Leaf<'p> {
    pub(crate) fn new(page: &'p Page) -> Leaf<'p> {
        Leaf { page }
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

    fn value_off(&self, i: usize) -> usize {
        LittleEndian::read_u16(&self.page.data()[DATA_LEN - SLOT * (i + 1)..]) as usize
    }

    fn value_span(&self, i: usize) -> (usize, usize) {
        debug_assert!(i < self.n());
        let end = self.value_off(i);
        let start = if i + 1 < self.n() {
            self.value_off(i + 1)
        } else {
            DATA_LEN - self.page.tail()
        };
        (start, end)
    }

    pub(crate) fn value_at(&self, i: usize) -> &'p [u8] {
        let (start, end) = self.value_span(i);
        &self.page.data()[start..end]
    }

    /// Binary search. A hit at position p comes back as `(p - 1, true)`,
    /// a miss with insertion position p as `(p - 1, false)`; the returned
    /// index is always in `[-1, n-1]`.
    pub(crate) fn find(&self, key: &[u8]) -> (isize, bool) {
        let mut lo = 0usize;
        let mut hi = self.n();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match key.cmp(self.key_at(mid)) {
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => return (mid as isize - 1, true),
                Ordering::Less => hi = mid,
            }
        }
        (lo as isize - 1, false)
    }

    pub(crate) fn overflow_after_insert_key_value(&self, key: &[u8], value: &[u8]) -> bool {
        self.page.head() + self.page.tail() + key.len() + value.len() + 2 * SLOT > DATA_LEN
    }

    pub(crate) fn overflow_after_set_value(&self, value: &[u8], i: usize) -> bool {
        let (start, end) = self.value_span(i);
        let old_len = end - start;
        value.len() > old_len
            && self.page.head() + self.page.tail() + (value.len() - old_len) > DATA_LEN
    }
}

/// Write view over a leaf page.
pub(crate) struct LeafMut<'p> {
    page: &'p mut Page,
}

impl<'p> LeafMut<'p> {
    pub(crate) fn new(page: &'p mut Page) -> LeafMut<'p> {
        LeafMut { page }
    }

    fn view(&self) -> Leaf<'_> {
        Leaf { page: self.page }
    }

    /// Splices (key, value) into sorted slot `i`. Returns false when the
    /// record plus its two directory entries does not fit.
    pub(crate) fn insert_key_value_at(&mut self, key: &[u8], value: &[u8], i: usize) -> bool {
        let n = self.page.n();
        debug_assert!(i <= n);
        if n >= u8::max_value() as usize
            || self.view().overflow_after_insert_key_value(key, value)
        {
            return false;
        }
        let head = self.page.head();
        let tail = self.page.tail();
        let klen = key.len();
        let vlen = value.len();

        // key side: keys at and after the slot move right by the key plus
        // one directory entry, earlier keys move right for the entry alone
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
        }

        // value side: the mirror image at the high end, growing downward
        let heap_lo = DATA_LEN - tail;
        let dir_lo = DATA_LEN - SLOT * n;
        let split = if i < n { self.view().value_off(i) } else { heap_lo };
        {
            let data = self.page.data_mut();
            data.copy_within(heap_lo..split, heap_lo - vlen - SLOT);
            data.copy_within(split..dir_lo, split - SLOT);
            data[split - SLOT - vlen..split - SLOT].copy_from_slice(value);
            for j in (i..n).rev() {
                let off = LittleEndian::read_u16(&data[DATA_LEN - SLOT * (j + 1)..]) as usize;
                LittleEndian::write_u16(
                    &mut data[DATA_LEN - SLOT * (j + 2)..],
                    (off - vlen - SLOT) as u16,
                );
            }
            for j in 0..i {
                let off = LittleEndian::read_u16(&data[DATA_LEN - SLOT * (j + 1)..]) as usize;
                LittleEndian::write_u16(&mut data[DATA_LEN - SLOT * (j + 1)..], (off - SLOT) as u16);
            }
            LittleEndian::write_u16(&mut data[DATA_LEN - SLOT * (i + 1)..], (split - SLOT) as u16);
        }

        self.page.set_head(head + klen + SLOT);
        self.page.set_tail(tail + vlen + SLOT);
        self.page.set_n(n + 1);
        true
    }

    /// Replaces value `i` in place; the value's end offset never moves,
    /// values below it slide. Returns false when the growth does not fit.
    pub(crate) fn set_value_at(&mut self, value: &[u8], i: usize) -> bool {
        let n = self.page.n();
        debug_assert!(i < n);
        let (start, end) = self.view().value_span(i);
        let old_len = end - start;
        let new_len = value.len();
        let head = self.page.head();
        let tail = self.page.tail();
        if new_len > old_len && head + tail + (new_len - old_len) > DATA_LEN {
            return false;
        }
        let heap_lo = DATA_LEN - tail;
        let delta = new_len as isize - old_len as isize;
        {
            let data = self.page.data_mut();
            data.copy_within(heap_lo..start, (heap_lo as isize - delta) as usize);
            data[end - new_len..end].copy_from_slice(value);
            for j in i + 1..n {
                let off = LittleEndian::read_u16(&data[DATA_LEN - SLOT * (j + 1)..]) as isize;
                LittleEndian::write_u16(
                    &mut data[DATA_LEN - SLOT * (j + 1)..],
                    (off - delta) as u16,
                );
            }
        }
        self.page.set_tail((tail as isize + delta) as usize);
        true
    }

    /// Bulk-removes entries `[from, to)` from self and splices them in at
    /// position `where_` of `dst`. The caller guarantees the run lands at a
    /// boundary of `dst` that keeps its keys strictly ascending.
    pub(crate) fn move_data(
        &mut self,
        dst: &mut LeafMut<'_>,
        where_: usize,
        from: usize,
        to: usize,
    ) -> bool {
        log::debug!(
            "LEAF_MOVE_DATA [from={}][to={}][where={}][n={}]",
            from,
            to,
            where_,
            self.page.n()
        );
        for (k, idx) in (from..to).enumerate() {
            let src = self.view();
            let key = src.key_at(idx);
            let value = src.value_at(idx);
            if !dst.insert_key_value_at(key, value, where_ + k) {
                return false;
            }
        }
        self.remove_range(from, to);
        true
    }

    /// Drops entries `[from, to)`, compacting both heaps and directories.
    fn remove_range(&mut self, from: usize, to: usize) {
        let n = self.page.n();
        debug_assert!(from <= to && to <= n);
        if from == to {
            return;
        }
        let removed = to - from;
        let dshrink = SLOT * removed;
        let head = self.page.head();
        let tail = self.page.tail();

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
            // the key heap slides down over the vacated directory slots
            data.copy_within(dir_end..head - removed_kbytes, dir_end - dshrink);
        }

        // value side
        let heap_lo = DATA_LEN - tail;
        let v_hi = self.view().value_off(from);
        let v_lo = if to < n {
            self.view().value_off(to)
        } else {
            heap_lo
        };
        let removed_vbytes = v_hi - v_lo;
        let dir_lo = DATA_LEN - SLOT * n;
        {
            let data = self.page.data_mut();
            data.copy_within(heap_lo..v_lo, heap_lo + removed_vbytes);
            for j in to..n {
                let off = LittleEndian::read_u16(&data[DATA_LEN - SLOT * (j + 1)..]) as usize;
                LittleEndian::write_u16(
                    &mut data[DATA_LEN - SLOT * (j + 1 - removed)..],
                    (off + removed_vbytes + dshrink) as u16,
                );
            }
            for j in 0..from {
                let off = LittleEndian::read_u16(&data[DATA_LEN - SLOT * (j + 1)..]) as usize;
                LittleEndian::write_u16(
                    &mut data[DATA_LEN - SLOT * (j + 1)..],
                    (off + dshrink) as u16,
                );
            }
            // the value heap slides up over the vacated directory slots
            data.copy_within(heap_lo + removed_vbytes..dir_lo, heap_lo + removed_vbytes + dshrink);
        }

        self.page.set_head(head - removed_kbytes - dshrink);
        self.page.set_tail(tail - removed_vbytes - dshrink);
        self.page.set_n(n - removed);
    }
}
