use crate::page::PageType;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("page has type {found:?}, but tried to use it as {expected:?}")]
    WrongPageType { expected: PageType, found: PageType },

    #[error("offset {0} is not a positive multiple of the page size")]
    InvalidOffset(i64),

    #[error("key of {0} bytes exceeds the maximum key length")]
    KeyTooLarge(usize),

    #[error("value of {0} bytes does not fit in a page")]
    ValueTooLarge(usize),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("{0} is not supported")]
    Unsupported(&'static str),
}
