//! The change-buffer free list.
//!
//! Tree growth never calls file-space allocation directly: splits pop pages
//! off this list, and the list is topped up (or drained) against the space
//! manager in separate mini-transactions that respect the file-space-first
//! latching order. The list is doubly linked through the page headers and
//! rooted in the change-buffer header page, next to the persisted segment
//! page count.

use tracing::debug;

use super::{bitmap, ChangeBuffer};
use crate::mtr::Mtr;
use crate::page::{self, PageKind, PAGE_HDR_LEN};
use crate::types::{
    Error, PageNo, Result, CHANGEBUF_HEADER_PAGE_NO, PAGE_NIL, SPACE_HEADER_PAGE_NO, SYSTEM_SPACE,
};

const HDR_SEG_PAGES: core::ops::Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 4;
const HDR_FREE_HEAD: core::ops::Range<usize> = PAGE_HDR_LEN + 4..PAGE_HDR_LEN + 8;
const HDR_FREE_TAIL: core::ops::Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 12;
const HDR_FREE_LEN: core::ops::Range<usize> = PAGE_HDR_LEN + 12..PAGE_HDR_LEN + 16;

pub(crate) fn format_header(buf: &mut [u8]) {
    // Header and root make up the fresh segment.
    buf[HDR_SEG_PAGES].copy_from_slice(&2u32.to_be_bytes());
    buf[HDR_FREE_HEAD].copy_from_slice(&PAGE_NIL.to_be_bytes());
    buf[HDR_FREE_TAIL].copy_from_slice(&PAGE_NIL.to_be_bytes());
    buf[HDR_FREE_LEN].copy_from_slice(&0u32.to_be_bytes());
}

pub(crate) fn seg_pages(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf[HDR_SEG_PAGES].try_into().unwrap())
}

pub(crate) fn free_len(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf[HDR_FREE_LEN].try_into().unwrap())
}

fn read_link(buf: &[u8], at: core::ops::Range<usize>) -> Option<PageNo> {
    match u32::from_be_bytes(buf[at].try_into().unwrap()) {
        PAGE_NIL => None,
        n => Some(PageNo(n)),
    }
}

fn write_link(buf: &mut [u8], at: core::ops::Range<usize>, link: Option<PageNo>) {
    let raw = link.map_or(PAGE_NIL, |p| p.0);
    buf[at].copy_from_slice(&raw.to_be_bytes());
}

fn write_u32(buf: &mut [u8], at: core::ops::Range<usize>, val: u32) {
    buf[at].copy_from_slice(&val.to_be_bytes());
}

impl ChangeBuffer {
    /// Enough free pages that a pessimistic insert cannot strand the tree:
    /// a worst-case split chain plus headroom for deletes that grow the
    /// upper levels.
    pub(crate) fn enough_free_for_insert(state: &super::State) -> bool {
        state.free_list_len >= state.size / 2 + 3 * state.height as usize
    }

    /// So many free pages that some should go back to file-space management.
    pub(crate) fn too_much_free(state: &super::State) -> bool {
        state.free_list_len >= 3 + state.size / 2 + 3 * state.height as usize
    }

    /// Allocates one page from the space manager and appends it to the free
    /// list tail, marking it as change-buffer territory in the bitmap.
    pub(crate) fn add_free_page(&self) -> Result<()> {
        let mut mtr = Mtr::start(&self.kernel);
        // File-space first, then the change-buffer header: latching order.
        let new_page = crate::space::alloc_page(&self.kernel, &mut mtr, SYSTEM_SPACE)?;
        let hh = mtr.page_x(SYSTEM_SPACE, CHANGEBUF_HEADER_PAGE_NO)?;

        let mut state = self.state.lock();
        let old_tail = read_link(mtr.read(hh), HDR_FREE_TAIL);

        let ph = mtr.page_x(SYSTEM_SPACE, new_page)?;
        page::init(mtr.write(ph), SYSTEM_SPACE, new_page, PageKind::FreeList, 0);
        page::set_prev(mtr.write(ph), old_tail);

        match old_tail {
            Some(tail) => {
                let th = mtr.page_x(SYSTEM_SPACE, tail)?;
                page::set_next(mtr.write(th), Some(new_page));
            }
            None => {
                let hdr = mtr.write(hh);
                write_link(hdr, HDR_FREE_HEAD, Some(new_page));
            }
        }
        {
            let hdr = mtr.write(hh);
            write_link(hdr, HDR_FREE_TAIL, Some(new_page));
            let seg = u32::from_be_bytes(hdr[HDR_SEG_PAGES].try_into().unwrap());
            write_u32(hdr, HDR_SEG_PAGES, seg + 1);
            let len = u32::from_be_bytes(hdr[HDR_FREE_LEN].try_into().unwrap());
            write_u32(hdr, HDR_FREE_LEN, len + 1);
        }

        let bh = bitmap::latch_bitmap_page(&mut mtr, SYSTEM_SPACE, new_page)?;
        bitmap::set_changebuf(&mut mtr, bh, new_page, true);

        mtr.commit()?;
        state.seg_size += 1;
        state.free_list_len += 1;
        debug!(page = %new_page, free_list_len = state.free_list_len, "changebuf.free_list.page_added");
        Ok(())
    }

    /// Unlinks the free-list tail and returns it to the space manager.
    /// No-op unless the list is oversized.
    pub(crate) fn remove_free_page(&self) -> Result<()> {
        let mut mtr = Mtr::start(&self.kernel);
        // Space allocation header first, as for growth.
        mtr.page_x(SYSTEM_SPACE, SPACE_HEADER_PAGE_NO)?;
        let hh = mtr.page_x(SYSTEM_SPACE, CHANGEBUF_HEADER_PAGE_NO)?;
        let _pess = self.pessimistic_insert_mutex.lock();

        let mut state = self.state.lock();
        if !Self::too_much_free(&state) {
            return Ok(());
        }
        let tail = read_link(mtr.read(hh), HDR_FREE_TAIL)
            .ok_or(Error::Corruption("free list counted long but has no tail"))?;

        let th = mtr.page_x(SYSTEM_SPACE, tail)?;
        let prev = page::prev(mtr.read(th));
        match prev {
            Some(p) => {
                let ph = mtr.page_x(SYSTEM_SPACE, p)?;
                page::set_next(mtr.write(ph), None);
            }
            None => {
                write_link(mtr.write(hh), HDR_FREE_HEAD, None);
            }
        }
        {
            let hdr = mtr.write(hh);
            write_link(hdr, HDR_FREE_TAIL, prev);
            let seg = u32::from_be_bytes(hdr[HDR_SEG_PAGES].try_into().unwrap());
            write_u32(hdr, HDR_SEG_PAGES, seg - 1);
            let len = u32::from_be_bytes(hdr[HDR_FREE_LEN].try_into().unwrap());
            write_u32(hdr, HDR_FREE_LEN, len - 1);
        }

        crate::space::free_page(&mut mtr, SYSTEM_SPACE, tail)?;

        let bh = bitmap::latch_bitmap_page(&mut mtr, SYSTEM_SPACE, tail)?;
        bitmap::set_changebuf(&mut mtr, bh, tail, false);

        mtr.commit()?;
        state.seg_size -= 1;
        state.free_list_len -= 1;
        debug!(page = %tail, free_list_len = state.free_list_len, "changebuf.free_list.page_removed");
        Ok(())
    }

    /// Hands free-list pages back to file-space management, a few at a
    /// time so the caller is not delayed unduly. Must be called with no
    /// change-buffer latch held.
    pub fn free_excess_pages(&self) -> Result<()> {
        for _ in 0..4 {
            {
                let state = self.state.lock();
                if !Self::too_much_free(&state) {
                    return Ok(());
                }
            }
            self.remove_free_page()?;
        }
        Ok(())
    }

    /// Detaches the free-list head for consumption by a tree split. The
    /// caller holds the header page exclusively; the page keeps its
    /// change-buffer bitmap bit.
    pub(crate) fn take_page_for_split(&self, mtr: &mut Mtr) -> Result<PageNo> {
        let hh = mtr.page_x(SYSTEM_SPACE, CHANGEBUF_HEADER_PAGE_NO)?;
        let head = read_link(mtr.read(hh), HDR_FREE_HEAD).ok_or(Error::NoSpace)?;

        let ph = mtr.page_x(SYSTEM_SPACE, head)?;
        let next = page::next(mtr.read(ph));
        match next {
            Some(n) => {
                let nh = mtr.page_x(SYSTEM_SPACE, n)?;
                page::set_prev(mtr.write(nh), None);
            }
            None => {
                write_link(mtr.write(hh), HDR_FREE_TAIL, None);
            }
        }
        {
            let hdr = mtr.write(hh);
            write_link(hdr, HDR_FREE_HEAD, next);
            let len = u32::from_be_bytes(hdr[HDR_FREE_LEN].try_into().unwrap());
            write_u32(hdr, HDR_FREE_LEN, len - 1);
        }
        Ok(head)
    }

    /// Returns a page shed by the tree (an emptied leaf or a collapsed
    /// level) back to the free-list head.
    pub(crate) fn put_back_page(&self, mtr: &mut Mtr, page_no: PageNo) -> Result<()> {
        let hh = mtr.page_x(SYSTEM_SPACE, CHANGEBUF_HEADER_PAGE_NO)?;
        let old_head = read_link(mtr.read(hh), HDR_FREE_HEAD);

        let ph = mtr.page_x(SYSTEM_SPACE, page_no)?;
        page::init(mtr.write(ph), SYSTEM_SPACE, page_no, PageKind::FreeList, 0);
        page::set_next(mtr.write(ph), old_head);

        match old_head {
            Some(h) => {
                let oh = mtr.page_x(SYSTEM_SPACE, h)?;
                page::set_prev(mtr.write(oh), Some(page_no));
            }
            None => {
                write_link(mtr.write(hh), HDR_FREE_TAIL, Some(page_no));
            }
        }
        {
            let hdr = mtr.write(hh);
            write_link(hdr, HDR_FREE_HEAD, Some(page_no));
            let len = u32::from_be_bytes(hdr[HDR_FREE_LEN].try_into().unwrap());
            write_u32(hdr, HDR_FREE_LEN, len + 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ChangeBuffer, State};

    fn state(size: usize, free: usize, height: u32) -> State {
        State {
            seg_size: size + free + 1,
            free_list_len: free,
            height,
            size,
            empty: false,
            ..State::default()
        }
    }

    #[test]
    fn insert_threshold_needs_split_headroom() {
        // A one-page tree still wants three free pages before a
        // pessimistic insert may start.
        assert!(!ChangeBuffer::enough_free_for_insert(&state(1, 2, 1)));
        assert!(ChangeBuffer::enough_free_for_insert(&state(1, 3, 1)));
        // Deeper trees want more.
        assert!(!ChangeBuffer::enough_free_for_insert(&state(10, 10, 2)));
        assert!(ChangeBuffer::enough_free_for_insert(&state(10, 11, 2)));
    }

    #[test]
    fn shrink_threshold_sits_above_insert_threshold() {
        for (size, height) in [(1usize, 1u32), (8, 2), (40, 3)] {
            let needed = size / 2 + 3 * height as usize;
            assert!(ChangeBuffer::enough_free_for_insert(&state(size, needed, height)));
            assert!(!ChangeBuffer::too_much_free(&state(size, needed, height)));
            assert!(ChangeBuffer::too_much_free(&state(size, needed + 3, height)));
        }
    }
}

