//! Mini-transactions.
//!
//! A mini-transaction x-latches page frames, keeps the latches until commit
//! and logs a full after-image of every modified page followed by a commit
//! frame. Dropping an uncommitted mini-transaction restores the pre-images,
//! so readers never observe a half-applied page group.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock,
};

use crate::pool::{Frame, PagePool};
use crate::space::SpaceManager;
use crate::types::{Error, PageKey, PageNo, Result, SpaceId};
use crate::wal::Wal;

/// The concrete collaborators every latched code path works against. No
/// trait objects: calls from inside latched regions resolve statically.
pub struct Kernel {
    pub spaces: SpaceManager,
    pub pool: PagePool,
    pub wal: Mutex<Wal>,
    next_mtr_id: AtomicU64,
}

impl Kernel {
    pub fn new(spaces: SpaceManager, pool: PagePool, wal: Wal) -> Self {
        Self {
            spaces,
            pool,
            wal: Mutex::new(wal),
            next_mtr_id: AtomicU64::new(1),
        }
    }

    fn next_mtr_id(&self) -> u64 {
        self.next_mtr_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Index of a latched page within one mini-transaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageHandle(usize);

enum PageGuard {
    X(ArcRwLockWriteGuard<RawRwLock, Frame>),
    S(ArcRwLockReadGuard<RawRwLock, Frame>),
}

struct MtrPage {
    key: PageKey,
    guard: PageGuard,
    preimage: Option<Box<[u8]>>,
    modified: bool,
    bitmap_init: bool,
}

pub struct Mtr<'k> {
    kernel: &'k Kernel,
    id: u64,
    pages: Vec<MtrPage>,
    committed: bool,
}

impl<'k> Mtr<'k> {
    pub fn start(kernel: &'k Kernel) -> Self {
        Self {
            kernel,
            id: kernel.next_mtr_id(),
            pages: Vec::new(),
            committed: false,
        }
    }

    fn find(&self, key: PageKey) -> Option<usize> {
        self.pages.iter().position(|p| p.key == key)
    }

    /// X-latches a page, fetching its frame on a pool miss. Re-latching a
    /// page already held exclusively returns the existing handle.
    pub fn page_x(&mut self, space: SpaceId, page: PageNo) -> Result<PageHandle> {
        let key = PageKey::new(space, page);
        if let Some(idx) = self.find(key) {
            return match self.pages[idx].guard {
                PageGuard::X(_) => Ok(PageHandle(idx)),
                PageGuard::S(_) => Err(Error::Invalid("latch upgrade inside mini-transaction")),
            };
        }
        let frame = self.kernel.pool.get(&self.kernel.spaces, key)?;
        let guard = frame.write_arc();
        self.pages.push(MtrPage {
            key,
            guard: PageGuard::X(guard),
            preimage: None,
            modified: false,
            bitmap_init: false,
        });
        Ok(PageHandle(self.pages.len() - 1))
    }

    /// X-latches a page without blocking. `None` means someone else holds
    /// the latch; used where blocking would run against the latching order.
    pub fn try_page_x(&mut self, space: SpaceId, page: PageNo) -> Result<Option<PageHandle>> {
        let key = PageKey::new(space, page);
        if let Some(idx) = self.find(key) {
            return match self.pages[idx].guard {
                PageGuard::X(_) => Ok(Some(PageHandle(idx))),
                PageGuard::S(_) => Err(Error::Invalid("latch upgrade inside mini-transaction")),
            };
        }
        let frame = self.kernel.pool.get(&self.kernel.spaces, key)?;
        let Some(guard) = frame.try_write_arc() else {
            return Ok(None);
        };
        self.pages.push(MtrPage {
            key,
            guard: PageGuard::X(guard),
            preimage: None,
            modified: false,
            bitmap_init: false,
        });
        Ok(Some(PageHandle(self.pages.len() - 1)))
    }

    /// S-latches a page for reading.
    pub fn page_s(&mut self, space: SpaceId, page: PageNo) -> Result<PageHandle> {
        let key = PageKey::new(space, page);
        if let Some(idx) = self.find(key) {
            return Ok(PageHandle(idx));
        }
        let frame = self.kernel.pool.get(&self.kernel.spaces, key)?;
        let guard = frame.read_arc();
        self.pages.push(MtrPage {
            key,
            guard: PageGuard::S(guard),
            preimage: None,
            modified: false,
            bitmap_init: false,
        });
        Ok(PageHandle(self.pages.len() - 1))
    }

    pub fn key_of(&self, handle: PageHandle) -> PageKey {
        self.pages[handle.0].key
    }

    pub fn read(&self, handle: PageHandle) -> &[u8] {
        match &self.pages[handle.0].guard {
            PageGuard::X(g) => &g.data,
            PageGuard::S(g) => &g.data,
        }
    }

    /// Mutable page access. The first write to a page snapshots its
    /// pre-image for rollback and schedules the page for redo logging.
    pub fn write(&mut self, handle: PageHandle) -> &mut [u8] {
        let entry = &mut self.pages[handle.0];
        match &mut entry.guard {
            PageGuard::X(g) => {
                if entry.preimage.is_none() {
                    entry.preimage = Some(g.data.clone());
                }
                entry.modified = true;
                &mut g.data
            }
            PageGuard::S(_) => unreachable!("write access through a shared latch"),
        }
    }

    /// Marks the page as re-initialized bitmap metadata: commit emits the
    /// dedicated bitmap-init redo record instead of a page image. The init
    /// must be the only change to that page inside this mini-transaction.
    pub fn note_bitmap_init(&mut self, handle: PageHandle) {
        self.pages[handle.0].bitmap_init = true;
    }

    pub fn is_modified(&self) -> bool {
        self.pages.iter().any(|p| p.modified)
    }

    /// Commits the mini-transaction: redo frames plus a commit frame reach
    /// the WAL before any latch is released.
    pub fn commit(mut self) -> Result<()> {
        if self.is_modified() {
            let mut wal = self.kernel.wal.lock();
            for entry in &self.pages {
                if !entry.modified {
                    continue;
                }
                if entry.bitmap_init {
                    wal.append_bitmap_init_frame(entry.key, self.id)?;
                } else {
                    let data = match &entry.guard {
                        PageGuard::X(g) => &g.data,
                        PageGuard::S(_) => unreachable!("modified page behind shared latch"),
                    };
                    wal.append_page_frame(entry.key, self.id, data)?;
                }
            }
            wal.append_commit_frame(self.id)?;
            wal.sync()?;
            drop(wal);
            for entry in &mut self.pages {
                if entry.modified {
                    if let PageGuard::X(g) = &mut entry.guard {
                        g.dirty = true;
                    }
                }
            }
        }
        self.committed = true;
        self.pages.clear();
        Ok(())
    }
}

impl Drop for Mtr<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Roll back: restore the pre-image of every modified page before the
        // latches go away.
        for entry in &mut self.pages {
            if let (Some(pre), PageGuard::X(g)) = (&entry.preimage, &mut entry.guard) {
                g.data.copy_from_slice(pre);
            }
        }
    }
}
