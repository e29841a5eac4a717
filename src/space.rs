//! Tablespace management.
//!
//! Every tablespace is one file in the engine directory. Page 0 of a space is
//! the allocation header: a next-unallocated watermark and a chain of freed
//! pages linked through their page headers. Bitmap pages are materialized by
//! the allocator itself whenever the watermark crosses a bitmap slot, so a
//! described page always has its bitmap page in place before first use.
//!
//! Spaces carry an in-memory version that is bumped on drop; readers that
//! captured page numbers earlier (the contractor) compare versions to skip
//! stale work. `inc_pending_ops` pins a space against drop for the duration
//! of a merge.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::changebuf::bitmap;
use crate::mtr::{Kernel, Mtr};
use crate::page::{self, PageKind, PAGE_HDR_LEN, PAGE_SIZE};
use crate::types::{
    Error, PageNo, Result, SpaceId, PAGES_PER_BITMAP, PAGE_NIL, SPACE_HEADER_PAGE_NO,
};

const HDR_N_ALLOCATED: core::ops::Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 4;
const HDR_FREE_HEAD: core::ops::Range<usize> = PAGE_HDR_LEN + 4..PAGE_HDR_LEN + 8;

pub struct SpaceManager {
    dir: PathBuf,
    page_cap: u32,
    inner: Mutex<Inner>,
    /// Lowest space id not yet handed out. Kept above every id the change
    /// buffer still holds records for, so a dropped id is not recycled
    /// while its records linger.
    next_space_id: AtomicU32,
}

struct Inner {
    spaces: FxHashMap<SpaceId, SpaceEntry>,
    next_version: u64,
}

struct SpaceEntry {
    file: File,
    version: u64,
    pending_ops: u32,
    dropped: bool,
}

fn space_file_name(space: SpaceId) -> String {
    format!("space_{}.adb", space.0)
}

impl SpaceManager {
    /// Opens the engine directory, picking up every existing space file.
    pub fn open(dir: impl AsRef<Path>, page_cap: u32) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut spaces = FxHashMap::default();
        let mut next_version = 1u64;
        for dirent in fs::read_dir(&dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name
                .strip_prefix("space_")
                .and_then(|rest| rest.strip_suffix(".adb"))
                .and_then(|id| id.parse::<u32>().ok())
            else {
                continue;
            };
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(dirent.path())?;
            spaces.insert(
                SpaceId(id),
                SpaceEntry {
                    file,
                    version: next_version,
                    pending_ops: 0,
                    dropped: false,
                },
            );
            next_version += 1;
        }
        let next_space_id = spaces.keys().map(|s| s.0 + 1).max().unwrap_or(1);
        Ok(Self {
            dir,
            page_cap,
            inner: Mutex::new(Inner {
                spaces,
                next_version,
            }),
            next_space_id: AtomicU32::new(next_space_id),
        })
    }

    pub fn page_cap(&self) -> u32 {
        self.page_cap
    }

    /// Hands out a fresh space id.
    pub fn alloc_space_id(&self) -> SpaceId {
        SpaceId(self.next_space_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Ensures no id up to and including `space` is handed out again.
    pub fn reserve_space_ids_through(&self, space: SpaceId) {
        self.next_space_id.fetch_max(space.0 + 1, Ordering::Relaxed);
    }

    /// Creates a space file with its allocation header and first bitmap page.
    pub fn create_space(&self, space: SpaceId) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.spaces.contains_key(&space) {
            return Err(Error::Invalid("space already exists"));
        }
        let path = self.dir.join(space_file_name(space));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut header = vec![0u8; PAGE_SIZE];
        page::init(&mut header, space, SPACE_HEADER_PAGE_NO, PageKind::SpaceHeader, 0);
        header[HDR_N_ALLOCATED].copy_from_slice(&2u32.to_be_bytes());
        header[HDR_FREE_HEAD].copy_from_slice(&PAGE_NIL.to_be_bytes());
        page::stamp_checksum(&mut header);
        file.write_all(&header)?;

        let mut first_bitmap = vec![0u8; PAGE_SIZE];
        page::init(&mut first_bitmap, space, PageNo(1), PageKind::Bitmap, 0);
        page::stamp_checksum(&mut first_bitmap);
        file.write_all(&first_bitmap)?;
        file.sync_data()?;

        let version = inner.next_version;
        inner.next_version += 1;
        inner.spaces.insert(
            space,
            SpaceEntry {
                file,
                version,
                pending_ops: 0,
                dropped: false,
            },
        );
        self.reserve_space_ids_through(space);
        Ok(())
    }

    pub fn space_exists(&self, space: SpaceId) -> bool {
        let inner = self.inner.lock();
        inner
            .spaces
            .get(&space)
            .map(|e| !e.dropped)
            .unwrap_or(false)
    }

    /// Version counter consulted to detect a drop between scheduling a merge
    /// read and performing it.
    pub fn space_version(&self, space: SpaceId) -> Option<u64> {
        let inner = self.inner.lock();
        inner
            .spaces
            .get(&space)
            .filter(|e| !e.dropped)
            .map(|e| e.version)
    }

    /// Pins the space against drop. Returns true when the space is already
    /// being deleted, in which case no pin was taken.
    pub fn inc_pending_ops(&self, space: SpaceId) -> bool {
        let mut inner = self.inner.lock();
        match inner.spaces.get_mut(&space) {
            Some(entry) if !entry.dropped => {
                entry.pending_ops += 1;
                false
            }
            _ => true,
        }
    }

    pub fn dec_pending_ops(&self, space: SpaceId) {
        let mut inner = self.inner.lock();
        let finalize = match inner.spaces.get_mut(&space) {
            Some(entry) => {
                debug_assert!(entry.pending_ops > 0);
                entry.pending_ops = entry.pending_ops.saturating_sub(1);
                entry.dropped && entry.pending_ops == 0
            }
            None => false,
        };
        if finalize {
            self.remove_space_locked(&mut inner, space);
        }
    }

    /// Marks a space dropped and removes its file once no operation pins it.
    pub fn drop_space(&self, space: SpaceId) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.spaces.get_mut(&space) else {
            return Err(Error::NotFound);
        };
        entry.dropped = true;
        if entry.pending_ops == 0 {
            self.remove_space_locked(&mut inner, space);
        }
        inner.next_version += 1;
        Ok(())
    }

    fn remove_space_locked(&self, inner: &mut Inner, space: SpaceId) {
        inner.spaces.remove(&space);
        let _ = fs::remove_file(self.dir.join(space_file_name(space)));
    }

    /// Reads a page image; pages past the flushed end of file come back
    /// zeroed (never yet written).
    pub fn read_page(&self, space: SpaceId, page_no: PageNo) -> Result<Box<[u8]>> {
        let mut inner = self.inner.lock();
        let entry = inner
            .spaces
            .get_mut(&space)
            .filter(|e| !e.dropped)
            .ok_or(Error::NotFound)?;
        let mut buf = vec![0u8; PAGE_SIZE];
        let offset = page_no.0 as u64 * PAGE_SIZE as u64;
        let len = entry.file.metadata()?.len();
        if offset < len {
            entry.file.seek(SeekFrom::Start(offset))?;
            let mut read = 0usize;
            while read < PAGE_SIZE {
                let n = entry.file.read(&mut buf[read..])?;
                if n == 0 {
                    break;
                }
                read += n;
            }
        }
        if buf.iter().any(|&b| b != 0) {
            page::verify_checksum(&buf)?;
            if page::page_no(&buf) != page_no || page::space_id(&buf) != space {
                return Err(Error::Corruption("page address mismatch"));
            }
        }
        Ok(buf.into_boxed_slice())
    }

    /// Writes a page image with a fresh checksum. Extends the file as needed.
    pub fn write_page(&self, space: SpaceId, page_no: PageNo, data: &[u8]) -> Result<()> {
        let mut image = data.to_vec();
        page::stamp_checksum(&mut image);
        let mut inner = self.inner.lock();
        let entry = inner
            .spaces
            .get_mut(&space)
            .filter(|e| !e.dropped)
            .ok_or(Error::NotFound)?;
        entry
            .file
            .seek(SeekFrom::Start(page_no.0 as u64 * PAGE_SIZE as u64))?;
        entry.file.write_all(&image)?;
        Ok(())
    }

    /// Syncs every live space file. Part of the checkpoint protocol.
    pub fn sync_all(&self) -> Result<()> {
        let inner = self.inner.lock();
        for entry in inner.spaces.values() {
            entry.file.sync_data()?;
        }
        Ok(())
    }
}

/// Allocates one page in `space` under the caller's mini-transaction,
/// reusing a freed page when one is chained in the header. Slots reserved
/// for bitmap pages are formatted in passing and never handed out.
pub fn alloc_page(kernel: &Kernel, mtr: &mut Mtr, space: SpaceId) -> Result<PageNo> {
    let header = mtr.page_x(space, SPACE_HEADER_PAGE_NO)?;

    let free_head = u32::from_be_bytes(mtr.read(header)[HDR_FREE_HEAD].try_into().unwrap());
    if free_head != PAGE_NIL {
        let freed = mtr.page_x(space, PageNo(free_head))?;
        let next = page::next(mtr.read(freed)).map_or(PAGE_NIL, |p| p.0);
        mtr.write(header)[HDR_FREE_HEAD].copy_from_slice(&next.to_be_bytes());
        return Ok(PageNo(free_head));
    }

    loop {
        let n = u32::from_be_bytes(mtr.read(header)[HDR_N_ALLOCATED].try_into().unwrap());
        if n >= kernel.spaces.page_cap() {
            return Err(Error::NoSpace);
        }
        mtr.write(header)[HDR_N_ALLOCATED].copy_from_slice(&(n + 1).to_be_bytes());
        if n % PAGES_PER_BITMAP == 1 {
            // The watermark reached the next bitmap slot: format it and keep
            // going. Bitmap pages belong to the space, not to any caller.
            let bh = mtr.page_x(space, PageNo(n))?;
            bitmap::bitmap_page_init(mtr, bh, space, PageNo(n));
            continue;
        }
        return Ok(PageNo(n));
    }
}

/// Returns a page to the space's free chain.
pub fn free_page(mtr: &mut Mtr, space: SpaceId, page_no: PageNo) -> Result<()> {
    let header = mtr.page_x(space, SPACE_HEADER_PAGE_NO)?;
    let old_head = u32::from_be_bytes(mtr.read(header)[HDR_FREE_HEAD].try_into().unwrap());

    let freed = mtr.page_x(space, page_no)?;
    let data = mtr.write(freed);
    page::set_kind(data, PageKind::Free);
    page::set_next(
        data,
        if old_head == PAGE_NIL {
            None
        } else {
            Some(PageNo(old_head))
        },
    );
    mtr.write(header)[HDR_FREE_HEAD].copy_from_slice(&page_no.0.to_be_bytes());
    Ok(())
}
