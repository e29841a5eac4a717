//! Engine facade: opens a directory, recovers the WAL, and wires the
//! change buffer into the page read path.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::changebuf::{
    self,
    bitmap,
    codec::{BufferedOp, Tuple},
    ChangeBufStatus, ChangeBuffer, ContractorHandle, EntryContext, Options, Outcome,
};
use crate::mtr::{Kernel, Mtr};
use crate::page::{self, PageKind, PAGE_CAPACITY};
use crate::pool::{FrameRef, PagePool};
use crate::space::{self, SpaceManager};
use crate::types::{
    Error, PageKey, PageNo, Result, SpaceId, TxId, CHANGEBUF_HEADER_PAGE_NO, SYSTEM_SPACE,
};
use crate::wal::{Wal, WalRecord};

pub struct Engine {
    kernel: Arc<Kernel>,
    changebuf: Arc<ChangeBuffer>,
    contractor: Mutex<Option<ContractorHandle>>,
}

impl Engine {
    /// Opens (or creates) an engine directory: replays the redo log into
    /// the space files, seeds the change buffer on first boot, and rebuilds
    /// its in-memory state.
    pub fn open(dir: impl AsRef<Path>, opts: Options) -> Result<Self> {
        let dir = dir.as_ref();
        let spaces = SpaceManager::open(dir, opts.space_page_cap)?;
        let mut wal = Wal::open(dir.join("engine.wal"))?;

        let replayed = wal.replay(|record| {
            let write = |key: PageKey, data: &[u8]| match spaces.write_page(key.space, key.page, data)
            {
                // Frames for a space dropped before the crash have nowhere
                // to land; the space's pages do not matter anymore.
                Err(Error::NotFound) => Ok(()),
                other => other,
            };
            match record {
                WalRecord::Page { key, data } => write(key, &data),
                WalRecord::BitmapInit { key } => {
                    write(key, &bitmap::replayed_bitmap_image(key.space, key.page))
                }
            }
        })?;
        spaces.sync_all()?;
        wal.reset()?;

        if !spaces.space_exists(SYSTEM_SPACE) {
            spaces.create_space(SYSTEM_SPACE)?;
        }
        // An all-zero header page means the change buffer was never seeded
        // (first boot, or a crash before the seeding commit reached the log).
        let needs_seed = spaces
            .read_page(SYSTEM_SPACE, CHANGEBUF_HEADER_PAGE_NO)?
            .iter()
            .all(|&b| b == 0);

        let kernel = Arc::new(Kernel::new(spaces, PagePool::new(opts.cache_pages), wal));
        if needs_seed {
            changebuf::bootstrap(&kernel)?;
        }
        let changebuf = Arc::new(ChangeBuffer::boot(Arc::clone(&kernel), opts)?);
        if let Some(max) = changebuf.max_space_id()? {
            kernel.spaces.reserve_space_ids_through(max);
        }
        info!(replayed, seeded = needs_seed, "engine.open");
        Ok(Self {
            kernel,
            changebuf,
            contractor: Mutex::new(None),
        })
    }

    pub fn changebuf(&self) -> &ChangeBuffer {
        &self.changebuf
    }

    pub fn status(&self) -> ChangeBufStatus {
        self.changebuf.status()
    }

    /// Flushes every dirty frame and truncates the redo log.
    pub fn checkpoint(&self) -> Result<()> {
        self.kernel.pool.flush_all(&self.kernel.spaces)?;
        self.kernel.spaces.sync_all()?;
        self.kernel.wal.lock().reset()
    }

    pub fn create_space(&self, space: SpaceId) -> Result<()> {
        self.kernel.spaces.create_space(space)
    }

    /// A fresh space id, always above every id the change buffer may still
    /// hold records for.
    pub fn alloc_space_id(&self) -> SpaceId {
        self.kernel.spaces.alloc_space_id()
    }

    /// Drops a tablespace: buffered records for it are purged first, then
    /// its frames and its file go away.
    pub fn drop_space(&self, space: SpaceId) -> Result<usize> {
        let purged = self
            .changebuf
            .discard_space(EntryContext::outside(), space)?;
        self.kernel.pool.discard_space(space);
        self.kernel.spaces.drop_space(space)?;
        Ok(purged)
    }

    /// Allocates and formats one secondary-index leaf, seeding its
    /// free-space estimate in the same mini-transaction.
    pub fn alloc_leaf_page(&self, space: SpaceId, compact: bool) -> Result<PageNo> {
        let mut mtr = Mtr::start(&self.kernel);
        let page_no = space::alloc_page(&self.kernel, &mut mtr, space)?;
        let h = mtr.page_x(space, page_no)?;
        page::init(mtr.write(h), space, page_no, PageKind::IndexLeaf, 0);
        page::set_compact_flag(mtr.write(h), compact);
        let bh = bitmap::latch_bitmap_page(&mut mtr, space, page_no)?;
        bitmap::set_free(&mut mtr, bh, page_no, bitmap::free_bits_for(PAGE_CAPACITY));
        mtr.commit()?;
        Ok(page_no)
    }

    /// Reads a secondary-index leaf the way the buffer-pool read completion
    /// does: buffered changes are merged in before the frame is handed out.
    pub fn get_user_page(&self, space: SpaceId, page_no: PageNo) -> Result<FrameRef> {
        let key = PageKey::new(space, page_no);
        let frame = self.kernel.pool.get(&self.kernel.spaces, key)?;
        self.kernel.pool.set_io_fixed(&frame, true);
        let result = self
            .changebuf
            .merge_for_page(EntryContext::outside(), Some(&frame), key, true);
        self.kernel.pool.set_io_fixed(&frame, false);
        result?;
        Ok(frame)
    }

    /// Fetches a page frame without running a merge. The raw read path;
    /// callers wanting merge-on-read semantics use [`Engine::get_user_page`].
    pub fn page_frame(&self, space: SpaceId, page_no: PageNo) -> Result<FrameRef> {
        self.kernel
            .pool
            .get(&self.kernel.spaces, PageKey::new(space, page_no))
    }

    /// Tries to defer a secondary-index insert for a compact-format leaf.
    pub fn try_buffer_insert(&self, target: PageKey, entry: &Tuple, txid: TxId) -> Result<Outcome> {
        self.changebuf.try_buffer(
            EntryContext::outside(),
            BufferedOp::Insert,
            target,
            entry,
            true,
            txid,
        )
    }

    /// Applies an entry directly to its leaf, as the outer index code does
    /// whenever buffering was refused.
    pub fn apply_insert(&self, target: PageKey, entry: &Tuple, txid: TxId) -> Result<()> {
        // Bring the page in; this also drains any buffered records for it.
        drop(self.get_user_page(target.space, target.page)?);

        let mut mtr = Mtr::start(&self.kernel);
        let h = mtr.page_x(target.space, target.page)?;
        let payload = entry.payload();
        let idx = page::lower_bound(mtr.read(h), &payload);
        if !page::fits(mtr.read(h), payload.len()) {
            if payload.len() > page::max_insert_size_after_reorganize(mtr.read(h)) {
                return Err(Error::Invalid("leaf page is full"));
            }
            page::reorganize(mtr.write(h));
        }
        page::insert(mtr.write(h), idx, &payload)?;
        if txid.0 > page::max_trx_id(mtr.read(h)) {
            page::set_max_trx_id(mtr.write(h), txid.0);
        }
        // The insert shrank the free space: the estimate must move in the
        // same mini-transaction.
        let free = page::free_space(mtr.read(h)) + page::garbage(mtr.read(h));
        let bh = bitmap::latch_bitmap_page(&mut mtr, target.space, target.page)?;
        bitmap::update_free_bits(&mut mtr, bh, target.page, free);
        mtr.commit()
    }

    /// The full secondary-index insert path: defer when possible, apply
    /// directly otherwise. Returns what `try_buffer` decided.
    pub fn insert_secondary(&self, target: PageKey, entry: &Tuple, txid: TxId) -> Result<Outcome> {
        let outcome = self.try_buffer_insert(target, entry, txid)?;
        if outcome != Outcome::Deferred {
            self.apply_insert(target, entry, txid)?;
        }
        Ok(outcome)
    }

    /// Live records of a leaf, without triggering a merge.
    pub fn leaf_records(&self, space: SpaceId, page_no: PageNo) -> Result<Vec<Vec<u8>>> {
        let frame = self
            .kernel
            .pool
            .get(&self.kernel.spaces, PageKey::new(space, page_no))?;
        let guard = frame.read();
        Ok((0..page::n_recs(&guard.data))
            .filter(|&i| !page::record_delete_marked(&guard.data, i))
            .map(|i| page::record_payload(&guard.data, i).to_vec())
            .collect())
    }

    pub fn bitmap_probe(&self, space: SpaceId, page_no: PageNo) -> Result<bitmap::PageBits> {
        bitmap::probe(&self.kernel, space, page_no)
    }

    /// Lazily refreshes a leaf's free estimate after an operation that grew
    /// its free space (a reorganize, a purge), in a separate
    /// mini-transaction. Safe because a late estimate only understates.
    pub fn refresh_free_bits(&self, space: SpaceId, page_no: PageNo) -> Result<()> {
        let free = self.leaf_free_bytes(space, page_no)?;
        bitmap::set_free_bits(
            &self.kernel,
            PageKey::new(space, page_no),
            bitmap::free_bits_for(free),
        )
    }

    /// Drops a leaf's free estimate to zero ahead of an operation whose
    /// effect on free space cannot be bounded in the same mini-transaction.
    pub fn reset_free_bits(&self, space: SpaceId, page_no: PageNo) -> Result<()> {
        bitmap::reset_free_bits(&self.kernel, PageKey::new(space, page_no))
    }

    /// Reclaimable free bytes of a leaf (heap free space plus garbage).
    /// This is the quantity the bitmap free estimate bounds from below.
    pub fn leaf_free_bytes(&self, space: SpaceId, page_no: PageNo) -> Result<usize> {
        let frame = self
            .kernel
            .pool
            .get(&self.kernel.spaces, PageKey::new(space, page_no))?;
        let guard = frame.read();
        Ok(page::free_space(&guard.data) + page::garbage(&guard.data))
    }

    pub fn page_resident(&self, space: SpaceId, page_no: PageNo) -> bool {
        self.kernel.pool.resident(PageKey::new(space, page_no))
    }

    /// Forces a page out of the pool so later modifications can be
    /// deferred again.
    pub fn evict_page(&self, space: SpaceId, page_no: PageNo) -> Result<bool> {
        self.kernel
            .pool
            .evict(&self.kernel.spaces, PageKey::new(space, page_no))
    }

    /// Marks or clears an explicit row lock on a page (lock-manager stand-in).
    pub fn set_row_locked(&self, space: SpaceId, page_no: PageNo, locked: bool) {
        self.kernel
            .pool
            .set_row_locked(PageKey::new(space, page_no), locked);
    }

    pub fn contract(&self, sync: bool) -> Result<(usize, usize)> {
        self.changebuf.contract(EntryContext::outside(), sync)
    }

    pub fn start_contractor(&self, interval: Duration) {
        let mut slot = self.contractor.lock();
        if slot.is_none() {
            *slot = Some(ContractorHandle::spawn(
                Arc::clone(&self.changebuf),
                interval,
            ));
        }
    }

    pub fn stop_contractor(&self) {
        if let Some(handle) = self.contractor.lock().take() {
            handle.stop();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_contractor();
    }
}
