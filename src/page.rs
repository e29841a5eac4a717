//! On-disk page format shared by every component of the kernel.
//!
//! A page is a fixed-size frame with a 40-byte header, a record heap growing
//! upward from the header and a slot directory growing downward from the page
//! end. Records are opaque byte strings kept in sorted order by the directory;
//! each record carries a one-byte info field holding the delete-mark flag.

use std::convert::TryFrom;

use crate::types::{Error, PageNo, Result, SpaceId, PAGE_NIL};

pub const PAGE_SIZE: usize = 16384;
pub const PAGE_HDR_LEN: usize = 40;
pub const PAGE_MAGIC: [u8; 2] = *b"AU";

/// Per-record header: info byte plus a big-endian length.
pub const REC_HDR: usize = 3;
/// One directory slot.
pub const SLOT_SIZE: usize = 2;

/// Usable payload area of an empty page (heap plus directory).
pub const PAGE_CAPACITY: usize = PAGE_SIZE - PAGE_HDR_LEN;

const INFO_DELETE_MARK: u8 = 0x01;
const FLAG_COMPACT: u8 = 0x01;

pub mod header {
    //! Byte offsets of the fixed header fields.
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..2;
    pub const KIND: usize = 2;
    pub const LEVEL: usize = 3;
    pub const FLAGS: usize = 4;
    pub const RESERVED: usize = 5;
    pub const SPACE_ID: Range<usize> = 6..10;
    pub const PAGE_NO: Range<usize> = 10..14;
    pub const PREV: Range<usize> = 14..18;
    pub const NEXT: Range<usize> = 18..22;
    pub const N_RECS: Range<usize> = 22..24;
    pub const HEAP_TOP: Range<usize> = 24..26;
    pub const GARBAGE: Range<usize> = 26..28;
    pub const MAX_TRX_ID: Range<usize> = 28..36;
    pub const CRC32: Range<usize> = 36..40;
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    SpaceHeader = 1,
    Bitmap = 2,
    IndexLeaf = 3,
    IndexInternal = 4,
    ChangeBufHeader = 5,
    FreeList = 6,
    Free = 7,
}

impl PageKind {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageKind::SpaceHeader),
            2 => Ok(PageKind::Bitmap),
            3 => Ok(PageKind::IndexLeaf),
            4 => Ok(PageKind::IndexInternal),
            5 => Ok(PageKind::ChangeBufHeader),
            6 => Ok(PageKind::FreeList),
            7 => Ok(PageKind::Free),
            _ => Err(Error::Corruption("unknown page kind")),
        }
    }
}

fn read_u16(buf: &[u8], at: core::ops::Range<usize>) -> u16 {
    u16::from_be_bytes(buf[at].try_into().unwrap())
}

fn read_u32(buf: &[u8], at: core::ops::Range<usize>) -> u32 {
    u32::from_be_bytes(buf[at].try_into().unwrap())
}

/// Formats `buf` as an empty page of the given kind.
pub fn init(buf: &mut [u8], space: SpaceId, page_no: PageNo, kind: PageKind, level: u8) {
    debug_assert_eq!(buf.len(), PAGE_SIZE);
    buf.fill(0);
    buf[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
    buf[header::KIND] = kind.as_u8();
    buf[header::LEVEL] = level;
    buf[header::SPACE_ID].copy_from_slice(&space.0.to_be_bytes());
    buf[header::PAGE_NO].copy_from_slice(&page_no.0.to_be_bytes());
    buf[header::PREV].copy_from_slice(&PAGE_NIL.to_be_bytes());
    buf[header::NEXT].copy_from_slice(&PAGE_NIL.to_be_bytes());
    buf[header::HEAP_TOP].copy_from_slice(&(PAGE_HDR_LEN as u16).to_be_bytes());
}

pub fn kind(buf: &[u8]) -> Result<PageKind> {
    if buf[header::MAGIC] != PAGE_MAGIC {
        return Err(Error::Corruption("invalid page magic"));
    }
    PageKind::try_from(buf[header::KIND])
}

pub fn set_kind(buf: &mut [u8], kind: PageKind) {
    buf[header::KIND] = kind.as_u8();
}

pub fn level(buf: &[u8]) -> u8 {
    buf[header::LEVEL]
}

pub fn set_level(buf: &mut [u8], level: u8) {
    buf[header::LEVEL] = level;
}

pub fn compact_flag(buf: &[u8]) -> bool {
    buf[header::FLAGS] & FLAG_COMPACT != 0
}

pub fn set_compact_flag(buf: &mut [u8], compact: bool) {
    if compact {
        buf[header::FLAGS] |= FLAG_COMPACT;
    } else {
        buf[header::FLAGS] &= !FLAG_COMPACT;
    }
}

pub fn space_id(buf: &[u8]) -> SpaceId {
    SpaceId(read_u32(buf, header::SPACE_ID))
}

pub fn page_no(buf: &[u8]) -> PageNo {
    PageNo(read_u32(buf, header::PAGE_NO))
}

pub fn prev(buf: &[u8]) -> Option<PageNo> {
    match read_u32(buf, header::PREV) {
        PAGE_NIL => None,
        n => Some(PageNo(n)),
    }
}

pub fn next(buf: &[u8]) -> Option<PageNo> {
    match read_u32(buf, header::NEXT) {
        PAGE_NIL => None,
        n => Some(PageNo(n)),
    }
}

pub fn set_prev(buf: &mut [u8], prev: Option<PageNo>) {
    let raw = prev.map_or(PAGE_NIL, |p| p.0);
    buf[header::PREV].copy_from_slice(&raw.to_be_bytes());
}

pub fn set_next(buf: &mut [u8], next: Option<PageNo>) {
    let raw = next.map_or(PAGE_NIL, |p| p.0);
    buf[header::NEXT].copy_from_slice(&raw.to_be_bytes());
}

pub fn n_recs(buf: &[u8]) -> usize {
    read_u16(buf, header::N_RECS) as usize
}

pub fn heap_top(buf: &[u8]) -> usize {
    read_u16(buf, header::HEAP_TOP) as usize
}

pub fn garbage(buf: &[u8]) -> usize {
    read_u16(buf, header::GARBAGE) as usize
}

pub fn max_trx_id(buf: &[u8]) -> u64 {
    u64::from_be_bytes(buf[header::MAX_TRX_ID].try_into().unwrap())
}

pub fn set_max_trx_id(buf: &mut [u8], id: u64) {
    buf[header::MAX_TRX_ID].copy_from_slice(&id.to_be_bytes());
}

fn set_n_recs(buf: &mut [u8], n: usize) {
    buf[header::N_RECS].copy_from_slice(&(n as u16).to_be_bytes());
}

fn set_heap_top(buf: &mut [u8], top: usize) {
    buf[header::HEAP_TOP].copy_from_slice(&(top as u16).to_be_bytes());
}

fn set_garbage(buf: &mut [u8], bytes: usize) {
    buf[header::GARBAGE].copy_from_slice(&(bytes as u16).to_be_bytes());
}

fn slot_pos(idx: usize) -> usize {
    PAGE_SIZE - SLOT_SIZE * (idx + 1)
}

fn record_offset(buf: &[u8], idx: usize) -> usize {
    let pos = slot_pos(idx);
    read_u16(buf, pos..pos + 2) as usize
}

fn set_record_offset(buf: &mut [u8], idx: usize, off: usize) {
    let pos = slot_pos(idx);
    buf[pos..pos + 2].copy_from_slice(&(off as u16).to_be_bytes());
}

/// Payload bytes of the record in directory slot `idx`.
pub fn record_payload(buf: &[u8], idx: usize) -> &[u8] {
    let off = record_offset(buf, idx);
    let len = read_u16(buf, off + 1..off + 3) as usize;
    &buf[off + REC_HDR..off + REC_HDR + len]
}

pub fn record_delete_marked(buf: &[u8], idx: usize) -> bool {
    let off = record_offset(buf, idx);
    buf[off] & INFO_DELETE_MARK != 0
}

pub fn set_delete_mark(buf: &mut [u8], idx: usize, marked: bool) {
    let off = record_offset(buf, idx);
    if marked {
        buf[off] |= INFO_DELETE_MARK;
    } else {
        buf[off] &= !INFO_DELETE_MARK;
    }
}

/// Index of the first record whose payload is `>= key`.
pub fn lower_bound(buf: &[u8], key: &[u8]) -> usize {
    let mut lo = 0usize;
    let mut hi = n_recs(buf);
    while lo < hi {
        let mid = (lo + hi) / 2;
        if record_payload(buf, mid) < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Binary search for an exact payload match.
pub fn search(buf: &[u8], key: &[u8]) -> std::result::Result<usize, usize> {
    let idx = lower_bound(buf, key);
    if idx < n_recs(buf) && record_payload(buf, idx) == key {
        Ok(idx)
    } else {
        Err(idx)
    }
}

/// Bytes not claimed by the heap or the directory.
pub fn free_space(buf: &[u8]) -> usize {
    let dir_start = PAGE_SIZE - SLOT_SIZE * n_recs(buf);
    dir_start.saturating_sub(heap_top(buf))
}

/// Largest record payload that fits without reorganizing.
pub fn max_insert_size(buf: &[u8]) -> usize {
    free_space(buf).saturating_sub(REC_HDR + SLOT_SIZE)
}

/// Largest record payload that fits once the heap garbage is compacted.
pub fn max_insert_size_after_reorganize(buf: &[u8]) -> usize {
    (free_space(buf) + garbage(buf)).saturating_sub(REC_HDR + SLOT_SIZE)
}

pub fn fits(buf: &[u8], payload_len: usize) -> bool {
    record_footprint(payload_len) <= free_space(buf)
}

/// Bytes a record of `payload_len` occupies on a page, directory slot
/// included. Buffered-volume accounting and the page itself must agree on
/// this number.
pub const fn record_footprint(payload_len: usize) -> usize {
    REC_HDR + payload_len + SLOT_SIZE
}

/// Inserts `payload` at directory position `idx`, which the caller obtained
/// from [`lower_bound`]. Fails when the record does not fit.
pub fn insert(buf: &mut [u8], idx: usize, payload: &[u8]) -> Result<()> {
    let n = n_recs(buf);
    debug_assert!(idx <= n);
    if payload.len() > u16::MAX as usize || !fits(buf, payload.len()) {
        return Err(Error::Invalid("record does not fit in page"));
    }
    let top = heap_top(buf);
    buf[top] = 0;
    buf[top + 1..top + 3].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    buf[top + REC_HDR..top + REC_HDR + payload.len()].copy_from_slice(payload);

    // Shift slots idx..n one position toward the page start.
    if idx < n {
        let src_lo = slot_pos(n - 1);
        let src_hi = slot_pos(idx) + SLOT_SIZE;
        buf.copy_within(src_lo..src_hi, src_lo - SLOT_SIZE);
    }
    set_record_offset(buf, idx, top);
    set_heap_top(buf, top + REC_HDR + payload.len());
    set_n_recs(buf, n + 1);
    Ok(())
}

/// Removes the record in slot `idx`. The heap bytes become garbage until the
/// next reorganize.
pub fn delete(buf: &mut [u8], idx: usize) {
    let n = n_recs(buf);
    debug_assert!(idx < n);
    let off = record_offset(buf, idx);
    let len = read_u16(buf, off + 1..off + 3) as usize;
    if idx + 1 < n {
        let src_lo = slot_pos(n - 1);
        let src_hi = slot_pos(idx + 1) + SLOT_SIZE;
        buf.copy_within(src_lo..src_hi, src_lo + SLOT_SIZE);
    }
    set_garbage(buf, garbage(buf) + REC_HDR + len);
    set_n_recs(buf, n - 1);
}

/// Rebuilds the heap without garbage, preserving record order and info bits.
pub fn reorganize(buf: &mut [u8]) {
    let n = n_recs(buf);
    let mut records: Vec<(u8, Vec<u8>)> = Vec::with_capacity(n);
    for idx in 0..n {
        let off = record_offset(buf, idx);
        records.push((buf[off], record_payload(buf, idx).to_vec()));
    }
    let mut top = PAGE_HDR_LEN;
    for (idx, (info, payload)) in records.iter().enumerate() {
        buf[top] = *info;
        buf[top + 1..top + 3].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        buf[top + REC_HDR..top + REC_HDR + payload.len()].copy_from_slice(payload);
        set_record_offset(buf, idx, top);
        top += REC_HDR + payload.len();
    }
    set_heap_top(buf, top);
    set_garbage(buf, 0);
}

/// Checksum over the page image with the checksum field itself zeroed.
pub fn compute_checksum(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..header::CRC32.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&buf[header::CRC32.end..]);
    hasher.finalize()
}

pub fn stamp_checksum(buf: &mut [u8]) {
    let crc = compute_checksum(buf);
    buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
}

pub fn verify_checksum(buf: &[u8]) -> Result<()> {
    let stored = read_u32(buf, header::CRC32);
    if stored != compute_checksum(buf) {
        return Err(Error::Corruption("page checksum mismatch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PageNo, SpaceId};

    fn fresh_page() -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        init(&mut buf, SpaceId(7), PageNo(42), PageKind::IndexLeaf, 0);
        buf
    }

    #[test]
    fn init_writes_header() {
        let buf = fresh_page();
        assert_eq!(kind(&buf).unwrap(), PageKind::IndexLeaf);
        assert_eq!(space_id(&buf), SpaceId(7));
        assert_eq!(page_no(&buf), PageNo(42));
        assert_eq!(n_recs(&buf), 0);
        assert_eq!(prev(&buf), None);
        assert_eq!(next(&buf), None);
        assert_eq!(free_space(&buf), PAGE_CAPACITY);
    }

    #[test]
    fn insert_keeps_sorted_order() {
        let mut buf = fresh_page();
        for key in [b"delta".as_ref(), b"alpha", b"charlie", b"bravo"] {
            let idx = lower_bound(&buf, key);
            insert(&mut buf, idx, key).unwrap();
        }
        let collected: Vec<&[u8]> = (0..n_recs(&buf)).map(|i| record_payload(&buf, i)).collect();
        assert_eq!(collected, vec![b"alpha".as_ref(), b"bravo", b"charlie", b"delta"]);
    }

    #[test]
    fn delete_turns_heap_into_garbage() {
        let mut buf = fresh_page();
        insert(&mut buf, 0, b"aa").unwrap();
        let idx = lower_bound(&buf, b"bb");
        insert(&mut buf, idx, b"bb").unwrap();
        let before = free_space(&buf);
        delete(&mut buf, 0);
        assert_eq!(n_recs(&buf), 1);
        assert_eq!(record_payload(&buf, 0), b"bb");
        assert_eq!(garbage(&buf), REC_HDR + 2);
        // The slot is reclaimed immediately, the heap bytes are not.
        assert_eq!(free_space(&buf), before + SLOT_SIZE);
        reorganize(&mut buf);
        assert_eq!(garbage(&buf), 0);
        assert_eq!(record_payload(&buf, 0), b"bb");
    }

    #[test]
    fn delete_mark_round_trip() {
        let mut buf = fresh_page();
        insert(&mut buf, 0, b"rec").unwrap();
        assert!(!record_delete_marked(&buf, 0));
        set_delete_mark(&mut buf, 0, true);
        assert!(record_delete_marked(&buf, 0));
        reorganize(&mut buf);
        assert!(record_delete_marked(&buf, 0));
        set_delete_mark(&mut buf, 0, false);
        assert!(!record_delete_marked(&buf, 0));
    }

    #[test]
    fn fill_until_rejected() {
        let mut buf = fresh_page();
        let payload = [0xABu8; 100];
        let mut inserted = 0usize;
        loop {
            let mut rec = payload.to_vec();
            rec[..8].copy_from_slice(&(inserted as u64).to_be_bytes());
            let idx = lower_bound(&buf, &rec);
            match insert(&mut buf, idx, &rec) {
                Ok(()) => inserted += 1,
                Err(_) => break,
            }
        }
        assert_eq!(inserted, PAGE_CAPACITY / record_footprint(100));
        assert!(max_insert_size(&buf) < 100);
    }

    #[test]
    fn checksum_detects_flips() {
        let mut buf = fresh_page();
        insert(&mut buf, 0, b"payload").unwrap();
        stamp_checksum(&mut buf);
        verify_checksum(&buf).unwrap();
        buf[PAGE_HDR_LEN] ^= 0xFF;
        assert!(verify_checksum(&buf).is_err());
    }
}
