//! Deferring modifications into the change-buffer tree.

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use self::Outcome::*;
use super::{bitmap, codec, ChangeBuffer, EntryContext};
use crate::mtr::{Mtr, PageHandle};
use crate::page::{self, PAGE_CAPACITY};
use crate::types::{
    Error, PageKey, Result, TxId, CHANGEBUF_HEADER_PAGE_NO, SYSTEM_SPACE,
};

/// Result of a deferral attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The modification was buffered; the caller is done.
    Deferred,
    /// The entry can never be buffered (larger than half a target page);
    /// the caller must apply it directly and not retry.
    RejectedTooBig,
    /// Transient refusal (tree oversized, space missing, target resident,
    /// row locks, allocation failure); the caller applies directly.
    RejectedTryAgain,
    /// The target page would overflow; merges were scheduled around it.
    RejectedBitmapFull,
}

/// Buffered volume reported when the walk cannot see all records of the
/// target without breaking the latching order.
const VOLUME_UNKNOWN: usize = PAGE_CAPACITY;

enum Attempt {
    Done(Outcome),
    RetryPessimistic,
}

/// Held for the scope of one attempt; which side depends on the mode.
#[allow(dead_code)]
enum TreeLatch<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

impl ChangeBuffer {
    /// Tries to defer one modification of a secondary-index leaf. The
    /// caller guarantees the index is non-unique, non-clustered and the
    /// target is a leaf; `compact` names the target page's record format.
    pub fn try_buffer(
        &self,
        ctx: EntryContext,
        op: codec::BufferedOp,
        target: PageKey,
        entry: &codec::Tuple,
        compact: bool,
        txid: TxId,
    ) -> Result<Outcome> {
        debug_assert!(!ctx.is_inside());
        match self.opts.mode {
            super::BufferMode::Disabled => return Ok(RejectedTryAgain),
            super::BufferMode::Count => {
                self.state.lock().n_counted += 1;
                return Ok(RejectedTryAgain);
            }
            super::BufferMode::Insert => {}
        }
        if !self.kernel.spaces.space_exists(target.space) {
            return Ok(RejectedTryAgain);
        }
        if bitmap::fixed_addr_page(target.space, target.page) {
            return Ok(RejectedTryAgain);
        }
        codec::validate_for_buffering(entry)?;

        let oversized = {
            let state = self.state.lock();
            state.size >= self.max_size + self.opts.hard_margin
        };
        if oversized {
            // The tree ran away; shrink it now and let the caller apply
            // the entry directly.
            debug!(%target, "changebuf.insert.tree_oversized");
            self.contract(ctx, true)?;
            return Ok(RejectedTryAgain);
        }

        let rec = codec::encode(op, target, entry, compact)?;
        let volume = codec::encoded_volume(&rec)?;
        if volume > PAGE_CAPACITY / 2 {
            return Ok(RejectedTooBig);
        }

        let mut pessimistic = false;
        loop {
            match self.insert_attempt(&rec, volume, target, txid, pessimistic)? {
                Attempt::Done(outcome) => {
                    if outcome == Deferred {
                        debug!(%target, pessimistic, volume, "changebuf.insert.deferred");
                        if pessimistic {
                            self.contract_after_insert(ctx, volume)?;
                        }
                    }
                    return Ok(outcome);
                }
                Attempt::RetryPessimistic => {
                    debug_assert!(!pessimistic);
                    pessimistic = true;
                }
            }
        }
    }

    fn insert_attempt(
        &self,
        rec: &[u8],
        volume: usize,
        target: PageKey,
        txid: TxId,
        pessimistic: bool,
    ) -> Result<Attempt> {
        let mut mtr;
        let mut pess_guard = None;
        // Pessimistic mode keeps the global mutex for the whole attempt, the
        // way the size bookkeeping demands; it is acquired after the header
        // page and the pessimistic-insert mutex, before any tree latch.
        let mut state_guard = None;
        if pessimistic {
            // Growth authorization: header page first, then the
            // pessimistic-insert mutex, then the free-list guarantee. The
            // top-up releases everything and starts over, because adding a
            // free page reaches into file-space management.
            loop {
                mtr = Mtr::start(&self.kernel);
                mtr.page_x(SYSTEM_SPACE, CHANGEBUF_HEADER_PAGE_NO)?;
                let guard = self.pessimistic_insert_mutex.lock();
                let state = self.state.lock();
                if Self::enough_free_for_insert(&state) {
                    pess_guard = Some(guard);
                    state_guard = Some(state);
                    break;
                }
                drop(state);
                drop(guard);
                drop(mtr);
                match self.add_free_page() {
                    Ok(()) => {}
                    Err(Error::NoSpace) => return Ok(Attempt::Done(RejectedTryAgain)),
                    Err(err) => return Err(err),
                }
            }
        } else {
            mtr = Mtr::start(&self.kernel);
        }

        let _tree_latch = if pessimistic {
            TreeLatch::Exclusive(self.tree_latch.write())
        } else {
            TreeLatch::Shared(self.tree_latch.read())
        };

        let descent = self.tree.descend(&self.kernel, rec)?;
        if pessimistic {
            // Pin the root before touching leaves so a split can reach it
            // without re-latching out of order.
            mtr.page_x(SYSTEM_SPACE, self.tree.root)?;
        }
        let leaf = mtr.page_x(SYSTEM_SPACE, descent.leaf)?;
        let idx = page::lower_bound(mtr.read(leaf), rec);

        let buffered = self.volume_buffered(&mut mtr, leaf, idx, target)?;

        let bh = bitmap::latch_bitmap_page(&mut mtr, target.space, target.page)?;
        let bits = bitmap::get_bits(mtr.read(bh), target.page);
        if bits.changebuf
            || self.kernel.pool.resident(target)
            || self.kernel.pool.row_locks_exist(target)
        {
            return Ok(Attempt::Done(RejectedTryAgain));
        }

        let projected = bitmap::free_bytes_lower_bound(bits.free).saturating_sub(buffered);
        if volume > projected {
            // It may not fit. Schedule merges for the region so the target
            // gets read in and drained.
            let n = page::n_recs(mtr.read(leaf));
            let (mut targets, _) = if n > 0 {
                self.collect_merge_batch(&mtr, leaf, idx.min(n - 1), false, Some(target))?
            } else {
                (Vec::new(), 0)
            };
            if !targets.iter().any(|t| t.key == target) {
                targets.push(super::contract::MergeTarget {
                    key: target,
                    version: self.kernel.spaces.space_version(target.space),
                });
            }
            drop(mtr);
            drop(_tree_latch);
            drop(state_guard);
            drop(pess_guard);
            debug!(%target, projected, volume, "changebuf.insert.bitmap_full");
            self.read_merge_targets(EntryContext::outside(), &targets, false)?;
            return Ok(Attempt::Done(RejectedBitmapFull));
        }

        if !bits.buffered {
            bitmap::set_buffered(&mut mtr, bh, target.page, true);
        }

        // Raise the leaf's max trx id before the structural insert so a
        // split propagates it to whichever side ends up holding the record.
        let cur = page::max_trx_id(mtr.read(leaf));
        if txid.0 > cur {
            page::set_max_trx_id(mtr.write(leaf), txid.0);
        }

        if !self.tree.try_insert_at(&mut mtr, leaf, idx, rec) {
            if !pessimistic {
                // The leaf is full. Dropping the mini-transaction rolls the
                // buffered bit back, keeping the operation atomic.
                return Ok(Attempt::RetryPessimistic);
            }
            let mut alloc = |mtr: &mut Mtr| self.take_page_for_split(mtr);
            self.tree.split_insert(&mut mtr, &descent, rec, &mut alloc)?;
        }

        if pessimistic {
            let root = mtr.page_x(SYSTEM_SPACE, self.tree.root)?;
            let header = mtr.page_x(SYSTEM_SPACE, CHANGEBUF_HEADER_PAGE_NO)?;
            let state = state_guard.as_mut().expect("pessimistic mode holds the mutex");
            self.size_update(state, &mtr, root, header);
            state.n_inserts += 1;
            mtr.commit()?;
        } else {
            mtr.commit()?;
            // The global mutex sits below the tree latch in the order, so
            // the latch goes first; a writer holding the mutex may be
            // waiting for our read latch to drain.
            drop(_tree_latch);
            let mut state = self.state.lock();
            state.empty = false;
            state.n_inserts += 1;
        }
        Ok(Attempt::Done(Deferred))
    }

    /// Sums the on-target footprint of every record already buffered for
    /// `target`, walking outward from the cursor position. Crossing a leaf
    /// boundary is only allowed where it does not fight the left-to-right
    /// latch order; when the walk would have to, the volume is reported as
    /// a full page so the caller stays conservative.
    fn volume_buffered(
        &self,
        mtr: &mut Mtr,
        leaf: PageHandle,
        idx: usize,
        target: PageKey,
    ) -> Result<usize> {
        let mut volume = 0usize;

        // Backward over the cursor page.
        let mut i = idx;
        let mut reached_page_start = true;
        while i > 0 {
            let rec = page::record_payload(mtr.read(leaf), i - 1);
            if codec::rec_target(rec)? != target {
                reached_page_start = false;
                break;
            }
            volume += codec::encoded_volume(rec)?;
            i -= 1;
        }
        if reached_page_start {
            if let Some(prev_no) = page::prev(mtr.read(leaf)) {
                // Latching leftward runs against the ordering; only a
                // non-blocking attempt is safe.
                let Some(ph) = mtr.try_page_x(SYSTEM_SPACE, prev_no)? else {
                    return Ok(VOLUME_UNKNOWN);
                };
                let mut j = page::n_recs(mtr.read(ph));
                let mut mismatch = false;
                while j > 0 {
                    let rec = page::record_payload(mtr.read(ph), j - 1);
                    if codec::rec_target(rec)? != target {
                        mismatch = true;
                        break;
                    }
                    volume += codec::encoded_volume(rec)?;
                    j -= 1;
                }
                if !mismatch {
                    // Records might continue further left; give up.
                    return Ok(VOLUME_UNKNOWN);
                }
            }
        }

        // Forward over the cursor page.
        let n = page::n_recs(mtr.read(leaf));
        let mut k = idx;
        let mut reached_page_end = true;
        while k < n {
            let rec = page::record_payload(mtr.read(leaf), k);
            if codec::rec_target(rec)? != target {
                reached_page_end = false;
                break;
            }
            volume += codec::encoded_volume(rec)?;
            k += 1;
        }
        if reached_page_end {
            if let Some(next_no) = page::next(mtr.read(leaf)) {
                let nh = mtr.page_x(SYSTEM_SPACE, next_no)?;
                let m_total = page::n_recs(mtr.read(nh));
                let mut m = 0;
                let mut mismatch = false;
                while m < m_total {
                    let rec = page::record_payload(mtr.read(nh), m);
                    if codec::rec_target(rec)? != target {
                        mismatch = true;
                        break;
                    }
                    volume += codec::encoded_volume(rec)?;
                    m += 1;
                }
                if !mismatch {
                    return Ok(VOLUME_UNKNOWN);
                }
            }
        }
        Ok(volume)
    }
}
