mod error;
mod page;
mod pager;
mod tree;
mod tx;

pub use error::{Error, Result};
pub use page::{Page, PageType, PAGE_SIZE};
pub use pager::{FilePager, MemoryPager, Pager};
pub use tree::{Tree, DEFAULT_ORDER, MAX_KEY_LEN};
pub use tx::Tx;
