use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

mod leaf;
mod meta;
mod node;

pub(crate) use leaf::{Leaf, LeafMut};
pub(crate) use meta::{Meta, MetaMut};
pub(crate) use node::{Node, NodeMut};

/// Unit of I/O and allocation.
pub const PAGE_SIZE: usize = 4096;

pub(crate) const PAGE_HEADER_SIZE: usize = 8;
pub(crate) const DATA_LEN: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

const TYPE_OFFSET: usize = 0;
const N_OFFSET: usize = 1;
const HEAD_OFFSET: usize = 2;
const TAIL_OFFSET: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    None,
    Meta,
    Node,
    Leaf,
}

impl PageType {
    fn from_u8(raw: u8) -> PageType {
        match raw {
            1 => PageType::Meta,
            2 => PageType::Node,
            3 => PageType::Leaf,
            _ => PageType::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PageType::None => 0,
            PageType::Meta => 1,
            PageType::Node => 2,
            PageType::Leaf => 3,
        }
    }
}

/// A fixed-size block. The first eight bytes are the header
/// `{type, n, head, tail, reserved}`; the rest is the data region
/// interpreted according to the type.
#[derive(Clone)]
pub struct Page {
    buf: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new() -> Page {
        Page {
            buf: [0u8; PAGE_SIZE],
        }
    }

    /// Zeroes the block and stamps the header type.
    pub fn init(&mut self, typ: PageType) {
        self.buf = [0u8; PAGE_SIZE];
        self.buf[TYPE_OFFSET] = typ.as_u8();
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_u8(self.buf[TYPE_OFFSET])
    }

    pub(crate) fn n(&self) -> usize {
        self.buf[N_OFFSET] as usize
    }

    pub(crate) fn set_n(&mut self, n: usize) {
        debug_assert!(n <= u8::max_value() as usize);
        self.buf[N_OFFSET] = n as u8;
    }

    pub(crate) fn head(&self) -> usize {
        LittleEndian::read_u16(&self.buf[HEAD_OFFSET..]) as usize
    }

    pub(crate) fn set_head(&mut self, head: usize) {
        debug_assert!(head <= DATA_LEN);
        LittleEndian::write_u16(&mut self.buf[HEAD_OFFSET..], head as u16);
    }

    pub(crate) fn tail(&self) -> usize {
        LittleEndian::read_u16(&self.buf[TAIL_OFFSET..]) as usize
    }

    pub(crate) fn set_tail(&mut self, tail: usize) {
        debug_assert!(tail <= DATA_LEN);
        LittleEndian::write_u16(&mut self.buf[TAIL_OFFSET..], tail as u16);
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.buf[PAGE_HEADER_SIZE..]
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PAGE_HEADER_SIZE..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn expect_type(&self, expected: PageType) -> Result<()> {
        let found = self.page_type();
        if found != expected {
            return Err(Error::WrongPageType { expected, found });
        }
        Ok(())
    }

    pub(crate) fn as_meta(&self) -> Result<Meta<'_>> {
        self.expect_type(PageType::Meta)?;
        Ok(Meta::new(self))
    }

    pub(crate) fn as_meta_mut(&mut self) -> Result<MetaMut<'_>> {
        self.expect_type(PageType::Meta)?;
        Ok(MetaMut::new(self))
    }

    pub(crate) fn as_node(&self) -> Result<Node<'_>> {
        self.expect_type(PageType::Node)?;
        Ok(Node::new(self))
    }

    pub(crate) fn as_node_mut(&mut self) -> Result<NodeMut<'_>> {
        self.expect_type(PageType::Node)?;
        Ok(NodeMut::new(self))
    }

    pub(crate) fn as_leaf(&self) -> Result<Leaf<'_>> {
        self.expect_type(PageType::Leaf)?;
        Ok(Leaf::new(self))
    }

    pub(crate) fn as_leaf_mut(&mut self) -> Result<LeafMut<'_>> {
        self.expect_type(PageType::Leaf)?;
        Ok(LeafMut::new(self))
    }
}

impl Default for Page {
    fn default() -> Page {
        Page::new()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("type", &self.page_type())
            .field("n", &self.n())
            .field("head", &self.head())
            .field("tail", &self.tail())
            .finish()
    }
}
