//! The change buffer: crash-safe deferral of secondary-index leaf
//! modifications.
//!
//! When a modification targets a leaf that is not resident in the buffer
//! pool, it is encoded as a record of a persistent auxiliary B-tree instead
//! of being applied. The record is merged into the leaf when some read
//! brings the leaf into memory, then removed. Per-target free-space
//! estimates live in bitmap pages so the decision "will it still fit"
//! never touches the target page itself.
//!
//! Latching order, strictly increasing while held:
//!   1. space allocation headers (file-space management)
//!   2. the change-buffer header page
//!      (the pessimistic-insert mutex slots in right after it)
//!   3. the global state mutex
//!   4. the tree index latch
//!   5. user target pages, then tree pages
//!   6. bitmap pages

pub mod bitmap;
pub mod codec;

mod contract;
mod discard;
mod free_list;
mod insert;
mod merge;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::warn;

use crate::btree::Tree;
use crate::mtr::{Kernel, Mtr, PageHandle};
use crate::page::{self, PageKind};
use crate::types::{
    PageKey, PageNo, Result, SpaceId, CHANGEBUF_HEADER_PAGE_NO, CHANGEBUF_ROOT_PAGE_NO,
    SYSTEM_SPACE,
};

pub use contract::ContractorHandle;
pub use insert::Outcome;
pub use merge::MergeOutcome;

/// Which modifications the change buffer accepts.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum BufferMode {
    /// Never defer; callers apply directly.
    Disabled,
    /// Defer inserts.
    #[default]
    Insert,
    /// Count the operations that would have been deferred, defer nothing.
    Count,
}

#[derive(Clone, Debug)]
pub struct Options {
    /// Buffer-pool capacity in frames.
    pub cache_pages: usize,
    /// Soft ceiling on the tree size in pages; zero derives half the pool.
    pub max_size_pages: usize,
    /// Width (in pages) of the region one merge batch covers.
    pub merge_area: u32,
    /// A neighbor page joins a batch when its buffered volume crosses
    /// capacity divided by this.
    pub merge_threshold: u32,
    /// Pages over the ceiling before inserts contract synchronously.
    pub sync_margin: usize,
    /// Pages over the ceiling before inserts are refused outright.
    pub hard_margin: usize,
    pub mode: BufferMode,
    /// Per-space allocation cap, in pages.
    pub space_page_cap: u32,
    /// Test-only fault injection: stop a merge after the delete-mark
    /// commits, before the physical delete.
    pub crash_before_physical_delete: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache_pages: 128,
            max_size_pages: 0,
            merge_area: 8,
            merge_threshold: 4,
            sync_margin: 5,
            hard_margin: 10,
            mode: BufferMode::Insert,
            space_page_cap: 1 << 20,
            crash_before_physical_delete: false,
        }
    }
}

/// Marks whether the current call stack is already inside a change-buffer
/// routine. Batch reads refuse to recurse when it says so; entry points
/// assert it does not.
#[derive(Copy, Clone, Debug, Default)]
pub struct EntryContext {
    inside: bool,
}

impl EntryContext {
    /// The context external callers hold.
    pub fn outside() -> Self {
        Self { inside: false }
    }

    /// The context of code already running inside a change-buffer routine,
    /// such as a dedicated io handler servicing change-buffer pages. Batch
    /// reads handed this context refuse to recurse.
    pub fn inside() -> Self {
        Self { inside: true }
    }

    pub fn is_inside(self) -> bool {
        self.inside
    }
}

/// How one scan pass over the auxiliary tree ended. Merge and discard share
/// the same record-removal loop shape.
pub(crate) enum Scan {
    /// No more records for the key range.
    Finished,
    /// The cursor ran off its page after deletions; reposition and go on.
    Restart,
    /// Fault injection asked for a crash after the delete-mark committed.
    Crash,
    /// Optimistic delete refused; the record is delete-marked and committed,
    /// a pessimistic delete must follow.
    Pessimistic(Vec<u8>),
}

/// In-memory mirror of the persisted size bookkeeping plus counters,
/// guarded by the global mutex.
#[derive(Debug, Default)]
pub(crate) struct State {
    /// Pages owned by the segment: header, tree and free list together.
    pub seg_size: usize,
    pub free_list_len: usize,
    pub height: u32,
    /// Tree pages: `seg_size - free_list_len - 1`.
    pub size: usize,
    /// Sticky "no records" flag.
    pub empty: bool,
    pub n_inserts: u64,
    pub n_merges: u64,
    pub n_merged_recs: u64,
    pub n_counted: u64,
}

/// Serializable status report.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeBufStatus {
    pub size: usize,
    pub free_list_len: usize,
    pub seg_size: usize,
    pub height: u32,
    pub empty: bool,
    pub n_inserts: u64,
    pub n_merges: u64,
    pub n_merged_recs: u64,
    /// Operations tallied (not buffered) under [`BufferMode::Count`].
    pub n_counted: u64,
}

pub struct ChangeBuffer {
    pub(crate) kernel: Arc<Kernel>,
    pub(crate) opts: Options,
    pub(crate) max_size: usize,
    pub(crate) tree: Tree,
    pub(crate) state: Mutex<State>,
    /// Serializes pessimistic inserters against each other and against
    /// free-list shrinking.
    pub(crate) pessimistic_insert_mutex: Mutex<()>,
    /// Serializes multi-page free-bit updates that would otherwise latch
    /// two bitmap pages in random order.
    pub(crate) bitmap_mutex: Mutex<()>,
    /// The tree index latch: shared for leaf-only work, exclusive for
    /// structure changes.
    pub(crate) tree_latch: RwLock<()>,
}

/// Seeds the change-buffer pages in a fresh system space: the header page
/// with an empty free list and a segment of two pages, and the empty root.
pub fn bootstrap(kernel: &Kernel) -> Result<()> {
    let mut mtr = Mtr::start(kernel);
    let header_no = crate::space::alloc_page(kernel, &mut mtr, SYSTEM_SPACE)?;
    let root_no = crate::space::alloc_page(kernel, &mut mtr, SYSTEM_SPACE)?;
    debug_assert_eq!(header_no, CHANGEBUF_HEADER_PAGE_NO);
    debug_assert_eq!(root_no, CHANGEBUF_ROOT_PAGE_NO);

    let hh = mtr.page_x(SYSTEM_SPACE, header_no)?;
    page::init(
        mtr.write(hh),
        SYSTEM_SPACE,
        header_no,
        PageKind::ChangeBufHeader,
        0,
    );
    free_list::format_header(mtr.write(hh));

    let rh = mtr.page_x(SYSTEM_SPACE, root_no)?;
    page::init(mtr.write(rh), SYSTEM_SPACE, root_no, PageKind::IndexLeaf, 0);
    mtr.commit()
}

impl ChangeBuffer {
    /// Reconstructs the in-memory state from the persisted pages. Runs on
    /// every engine open; the pages must already exist.
    pub fn boot(kernel: Arc<Kernel>, opts: Options) -> Result<Self> {
        let max_size = if opts.max_size_pages > 0 {
            opts.max_size_pages
        } else {
            opts.cache_pages / 2
        };
        let tree = Tree {
            space: SYSTEM_SPACE,
            root: CHANGEBUF_ROOT_PAGE_NO,
        };
        let cb = Self {
            kernel,
            opts,
            max_size,
            tree,
            state: Mutex::new(State::default()),
            pessimistic_insert_mutex: Mutex::new(()),
            bitmap_mutex: Mutex::new(()),
            tree_latch: RwLock::new(()),
        };
        {
            let mut mtr = Mtr::start(&cb.kernel);
            let hh = mtr.page_x(SYSTEM_SPACE, CHANGEBUF_HEADER_PAGE_NO)?;
            let rh = mtr.page_x(SYSTEM_SPACE, CHANGEBUF_ROOT_PAGE_NO)?;
            let mut state = cb.state.lock();
            cb.size_update(&mut state, &mtr, rh, hh);
            drop(state);
            drop(mtr);
        }
        Ok(cb)
    }

    /// Recomputes every derived size field from the latched root and header
    /// pages. Call with the global mutex held after any structure change.
    pub(crate) fn size_update(
        &self,
        state: &mut State,
        mtr: &Mtr,
        root: PageHandle,
        header: PageHandle,
    ) {
        state.seg_size = free_list::seg_pages(mtr.read(header)) as usize;
        state.free_list_len = free_list::free_len(mtr.read(header)) as usize;
        state.height = page::level(mtr.read(root)) as u32 + 1;
        // The one page unaccounted for is the header itself.
        state.size = state.seg_size - state.free_list_len - 1;
        state.empty = page::n_recs(mtr.read(root)) == 0;
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Inspects the tree root for emptiness, cross-checking the sticky
    /// in-memory flag. A stale flag is reported, not fatal: the contractor
    /// repairs it the next time it runs.
    pub fn is_empty(&self) -> Result<bool> {
        let state = self.state.lock();
        let mut mtr = Mtr::start(&self.kernel);
        let _tree_latch = self.tree_latch.read();
        let rh = mtr.page_x(SYSTEM_SPACE, self.tree.root)?;
        let actually_empty = page::n_recs(mtr.read(rh)) == 0;
        if actually_empty && !state.empty {
            warn!("changebuf.state.stale_empty_flag: tree is empty but the in-memory flag lags");
        } else {
            debug_assert!(!(state.empty && !actually_empty));
        }
        drop(state);
        drop(mtr);
        Ok(actually_empty)
    }

    /// Highest space id with buffered records, read from the rightmost
    /// record of the tree. Space-id assignment must stay above it so a
    /// dropped id is not reused while its records linger.
    pub fn max_space_id(&self) -> Result<Option<SpaceId>> {
        let _tg = self.tree_latch.read();
        match self.tree.rightmost_record(&self.kernel)? {
            Some(rec) => Ok(Some(codec::rec_target(&rec)?.space)),
            None => Ok(None),
        }
    }

    pub fn status(&self) -> ChangeBufStatus {
        let state = self.state.lock();
        ChangeBufStatus {
            size: state.size,
            free_list_len: state.free_list_len,
            seg_size: state.seg_size,
            height: state.height,
            empty: state.empty,
            n_inserts: state.n_inserts,
            n_merges: state.n_merges,
            n_merged_recs: state.n_merged_recs,
            n_counted: state.n_counted,
        }
    }

    /// Structural validation of the auxiliary tree.
    pub fn validate_tree(&self) -> Result<()> {
        let _tree_latch = self.tree_latch.read();
        self.tree.validate(&self.kernel)
    }

    /// Counts buffered records, optionally restricted to one space or one
    /// target page. Diagnostic surface for invariant checks.
    pub fn buffered_record_count(
        &self,
        space: Option<SpaceId>,
        page_no: Option<PageNo>,
    ) -> Result<usize> {
        let _tree_latch = self.tree_latch.read();
        let descent = self.tree.descend(&self.kernel, &[])?;
        let mut count = 0usize;
        let mut leaf = Some(descent.leaf);
        while let Some(current) = leaf {
            let mut mtr = Mtr::start(&self.kernel);
            let h = mtr.page_s(SYSTEM_SPACE, current)?;
            let data = mtr.read(h);
            for i in 0..page::n_recs(data) {
                let target = codec::rec_target(page::record_payload(data, i))?;
                if space.map_or(true, |s| target.space == s)
                    && page_no.map_or(true, |p| target.page == p)
                {
                    count += 1;
                }
            }
            leaf = page::next(data);
            drop(mtr);
        }
        Ok(count)
    }

    /// Refreshes the free estimates for two leaves touched by one page
    /// split. Serialized globally because it latches two bitmap pages whose
    /// order is not otherwise constrained.
    pub fn update_free_bits_for_two_pages(
        &self,
        left: PageKey,
        left_free: usize,
        right: PageKey,
        right_free: usize,
    ) -> Result<()> {
        let _guard = self.bitmap_mutex.lock();
        let mut mtr = Mtr::start(&self.kernel);
        let lh = bitmap::latch_bitmap_page(&mut mtr, left.space, left.page)?;
        bitmap::update_free_bits(&mut mtr, lh, left.page, left_free);
        let rh = bitmap::latch_bitmap_page(&mut mtr, right.space, right.page)?;
        bitmap::update_free_bits(&mut mtr, rh, right.page, right_free);
        mtr.commit()
    }
}
