//! Change-buffer bitmap pages.
//!
//! Every tablespace carries, at fixed intervals, one bitmap page describing a
//! window of pages: a two-bit quantized free-space estimate, a "has buffered
//! changes" flag and a "belongs to the change buffer" flag, four bits per
//! described page. The free estimate may understate the real free space but
//! must never overstate it.

use crate::mtr::{Kernel, Mtr, PageHandle};
use crate::page::{self, PageKind, PAGE_CAPACITY, PAGE_HDR_LEN};
use crate::types::{
    PageKey, PageNo, Result, SpaceId, CHANGEBUF_HEADER_PAGE_NO, CHANGEBUF_ROOT_PAGE_NO,
    PAGES_PER_BITMAP, SPACE_HEADER_PAGE_NO, SYSTEM_SPACE,
};

/// Bits describing a single page.
pub const BITS_PER_PAGE: u32 = 4;

const BIT_FREE: u32 = 0;
const BIT_BUFFERED: u32 = 2;
const BIT_CHANGEBUF: u32 = 3;

/// Quantization step of the free-space estimate.
pub const FREE_QUANTUM: usize = PAGE_CAPACITY / 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageBits {
    /// Quantized free-space estimate, `0..=3`.
    pub free: u8,
    /// True when buffered changes exist for the page.
    pub buffered: bool,
    /// True when the page is a change-buffer tree or free-list page.
    pub changebuf: bool,
}

/// Bitmap page describing `page` within its space.
pub fn bitmap_page_no(page: PageNo) -> PageNo {
    PageNo((page.0 / PAGES_PER_BITMAP) * PAGES_PER_BITMAP + 1)
}

pub fn is_bitmap_page(page: PageNo) -> bool {
    page.0 % PAGES_PER_BITMAP == 1
}

/// Pages at well-known addresses that merge and buffering skip outright.
pub fn fixed_addr_page(space: SpaceId, page: PageNo) -> bool {
    if page == SPACE_HEADER_PAGE_NO || is_bitmap_page(page) {
        return true;
    }
    space == SYSTEM_SPACE && (page == CHANGEBUF_HEADER_PAGE_NO || page == CHANGEBUF_ROOT_PAGE_NO)
}

pub fn free_bits_for(free_bytes: usize) -> u8 {
    (free_bytes / FREE_QUANTUM).min(3) as u8
}

/// Conservative inverse of the quantization: a lower bound on the free
/// bytes the bits promise.
pub fn free_bytes_lower_bound(bits: u8) -> usize {
    bits as usize * FREE_QUANTUM
}

/// Formats a bitmap page. The page is logged as a dedicated bitmap-init
/// redo record, so the init must be the page's only change in this
/// mini-transaction.
pub fn bitmap_page_init(mtr: &mut Mtr, handle: PageHandle, space: SpaceId, page_no: PageNo) {
    page::init(mtr.write(handle), space, page_no, PageKind::Bitmap, 0);
    mtr.note_bitmap_init(handle);
}

/// Rebuilds a bitmap page image during redo replay.
pub fn replayed_bitmap_image(space: SpaceId, page_no: PageNo) -> Vec<u8> {
    let mut buf = vec![0u8; page::PAGE_SIZE];
    page::init(&mut buf, space, page_no, PageKind::Bitmap, 0);
    buf
}

fn bit_position(page: PageNo, bit: u32) -> (usize, u32) {
    debug_assert!(bit < BITS_PER_PAGE);
    let pos = (page.0 % PAGES_PER_BITMAP) * BITS_PER_PAGE + bit;
    (PAGE_HDR_LEN + (pos / 8) as usize, pos % 8)
}

fn get_bit(buf: &[u8], page: PageNo, bit: u32) -> bool {
    let (byte, off) = bit_position(page, bit);
    buf[byte] >> off & 1 == 1
}

fn set_bit(buf: &mut [u8], page: PageNo, bit: u32, val: bool) {
    let (byte, off) = bit_position(page, bit);
    if val {
        buf[byte] |= 1 << off;
    } else {
        buf[byte] &= !(1 << off);
    }
}

/// Reads all bits describing `page` from a latched bitmap page.
pub fn get_bits(buf: &[u8], page: PageNo) -> PageBits {
    let hi = get_bit(buf, page, BIT_FREE) as u8;
    let lo = get_bit(buf, page, BIT_FREE + 1) as u8;
    PageBits {
        free: hi * 2 + lo,
        buffered: get_bit(buf, page, BIT_BUFFERED),
        changebuf: get_bit(buf, page, BIT_CHANGEBUF),
    }
}

pub fn set_free(mtr: &mut Mtr, handle: PageHandle, page: PageNo, val: u8) {
    debug_assert!(val <= 3);
    let buf = mtr.write(handle);
    set_bit(buf, page, BIT_FREE, val / 2 == 1);
    set_bit(buf, page, BIT_FREE + 1, val % 2 == 1);
}

pub fn set_buffered(mtr: &mut Mtr, handle: PageHandle, page: PageNo, val: bool) {
    set_bit(mtr.write(handle), page, BIT_BUFFERED, val);
}

pub fn set_changebuf(mtr: &mut Mtr, handle: PageHandle, page: PageNo, val: bool) {
    set_bit(mtr.write(handle), page, BIT_CHANGEBUF, val);
}

/// X-latches the bitmap page describing `page` inside the caller's
/// mini-transaction.
pub fn latch_bitmap_page(mtr: &mut Mtr, space: SpaceId, page: PageNo) -> Result<PageHandle> {
    mtr.page_x(space, bitmap_page_no(page))
}

/// Reads the bits for one page under a short shared latch.
pub fn probe(kernel: &Kernel, space: SpaceId, page: PageNo) -> Result<PageBits> {
    let mut mtr = Mtr::start(kernel);
    let h = mtr.page_s(space, bitmap_page_no(page))?;
    let bits = get_bits(mtr.read(h), page);
    drop(mtr);
    Ok(bits)
}

/// Whether the page belongs to the change-buffer page hierarchy. Buffering
/// refuses any target for which this holds.
pub fn is_changebuf_page(kernel: &Kernel, space: SpaceId, page: PageNo) -> Result<bool> {
    if fixed_addr_page(space, page) {
        return Ok(true);
    }
    if space != SYSTEM_SPACE {
        return Ok(false);
    }
    Ok(probe(kernel, space, page)?.changebuf)
}

/// Lazily refreshes the free estimate of a leaf in its own mini-transaction.
/// Safe whenever the new value does not overstate the page's free space:
/// decrementing or refreshing after growth both qualify.
pub fn set_free_bits(kernel: &Kernel, key: PageKey, val: u8) -> Result<()> {
    let mut mtr = Mtr::start(kernel);
    let h = latch_bitmap_page(&mut mtr, key.space, key.page)?;
    set_free(&mut mtr, h, key.page, val);
    mtr.commit()
}

/// Drops the free estimate to zero ahead of an operation that will shrink
/// the page's free space.
pub fn reset_free_bits(kernel: &Kernel, key: PageKey) -> Result<()> {
    set_free_bits(kernel, key, 0)
}

/// Refreshes the free estimate inside the mini-transaction that changed the
/// page, writing only when the quantized value moved.
pub fn update_free_bits(
    mtr: &mut Mtr,
    bitmap: PageHandle,
    page: PageNo,
    actual_free: usize,
) {
    let new_bits = free_bits_for(actual_free);
    let old_bits = get_bits(mtr.read(bitmap), page).free;
    if new_bits != old_bits {
        set_free(mtr, bitmap, page, new_bits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PAGE_SIZE;
    use crate::types::{PageNo, SpaceId};

    #[test]
    fn bitmap_page_mapping() {
        assert_eq!(bitmap_page_no(PageNo(0)), PageNo(1));
        assert_eq!(bitmap_page_no(PageNo(63)), PageNo(1));
        assert_eq!(bitmap_page_no(PageNo(64)), PageNo(65));
        assert_eq!(bitmap_page_no(PageNo(130)), PageNo(129));
        assert!(is_bitmap_page(PageNo(1)));
        assert!(is_bitmap_page(PageNo(65)));
        assert!(!is_bitmap_page(PageNo(64)));
    }

    #[test]
    fn quantization_never_overstates() {
        for free in (0..PAGE_CAPACITY).step_by(97) {
            let bits = free_bits_for(free);
            assert!(free_bytes_lower_bound(bits) <= free);
        }
        assert_eq!(free_bits_for(0), 0);
        assert_eq!(free_bits_for(FREE_QUANTUM - 1), 0);
        assert_eq!(free_bits_for(FREE_QUANTUM), 1);
        assert_eq!(free_bits_for(PAGE_CAPACITY), 3);
    }

    #[test]
    fn bits_pack_independently() {
        let mut buf = vec![0u8; PAGE_SIZE];
        page::init(&mut buf, SpaceId(3), PageNo(1), PageKind::Bitmap, 0);
        // Two adjacent described pages must not clobber each other.
        set_bit(&mut buf, PageNo(4), BIT_BUFFERED, true);
        set_bit(&mut buf, PageNo(5), BIT_CHANGEBUF, true);
        set_bit(&mut buf, PageNo(4), BIT_FREE, true);
        set_bit(&mut buf, PageNo(4), BIT_FREE + 1, true);

        let four = get_bits(&buf, PageNo(4));
        assert_eq!(four.free, 3);
        assert!(four.buffered);
        assert!(!four.changebuf);

        let five = get_bits(&buf, PageNo(5));
        assert_eq!(five.free, 0);
        assert!(!five.buffered);
        assert!(five.changebuf);
    }

    #[test]
    fn fixed_addresses() {
        assert!(fixed_addr_page(SpaceId(9), PageNo(0)));
        assert!(fixed_addr_page(SpaceId(9), PageNo(1)));
        assert!(fixed_addr_page(SYSTEM_SPACE, CHANGEBUF_ROOT_PAGE_NO));
        assert!(fixed_addr_page(SYSTEM_SPACE, CHANGEBUF_HEADER_PAGE_NO));
        assert!(!fixed_addr_page(SpaceId(9), CHANGEBUF_ROOT_PAGE_NO));
        assert!(!fixed_addr_page(SpaceId(9), PageNo(17)));
    }
}
