use std::fmt;
use std::io;

use thiserror::Error;

/// Identifier of a tablespace: a persistent address space of fixed-size pages.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SpaceId(pub u32);

/// Page index within a tablespace.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageNo(pub u32);

/// Transaction identifier carried on index leaves.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxId(pub u64);

/// Fully qualified page address.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageKey {
    pub space: SpaceId,
    pub page: PageNo,
}

impl PageKey {
    pub fn new(space: SpaceId, page: PageNo) -> Self {
        Self { space, page }
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space, self.page)
    }
}

/// The system tablespace. The change buffer lives entirely inside it.
pub const SYSTEM_SPACE: SpaceId = SpaceId(0);

/// Page 0 of every space holds the space allocation header.
pub const SPACE_HEADER_PAGE_NO: PageNo = PageNo(0);

/// Fixed page of the system space holding the change-buffer free-list base
/// node and the segment page count.
pub const CHANGEBUF_HEADER_PAGE_NO: PageNo = PageNo(2);

/// Fixed root page of the change-buffer tree.
pub const CHANGEBUF_ROOT_PAGE_NO: PageNo = PageNo(3);

/// Window of pages described by one bitmap page.
pub const PAGES_PER_BITMAP: u32 = 64;

/// Sentinel page number meaning "no page" in sibling and free-list links.
pub const PAGE_NIL: u32 = u32::MAX;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("no space left in tablespace")]
    NoSpace,
    #[error("not found")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, Error>;
