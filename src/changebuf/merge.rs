//! Applying buffered modifications to a target page.
//!
//! `merge_for_page` runs after the target has been read into the pool and
//! before its io-fix is released. Every buffered record is applied and then
//! physically removed; when the removal needs a pessimistic tree operation,
//! the record is first delete-marked in its own committed mini-transaction.
//! That split is what makes merges idempotent across a crash: recovery sees
//! the mark, skips re-applying, and only retries the physical delete.

use tracing::{debug, error, info, warn};

use super::{bitmap, codec, ChangeBuffer, EntryContext, Scan};
use crate::mtr::{Mtr, PageHandle};
use crate::page::{self, PageKind};
use crate::pool::FrameRef;
use crate::space::SpaceManager;
use crate::types::{
    Error, PageKey, Result, SpaceId, CHANGEBUF_HEADER_PAGE_NO, SYSTEM_SPACE,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MergeOutcome {
    /// Buffered records were applied (or purged) and removed.
    Merged { records: usize },
    /// Nothing to do: fixed-address page, or no buffered bit set.
    Skipped,
    /// Fault injection stopped the merge right after a delete-mark
    /// committed, before the physical delete.
    CrashPoint,
}

enum Apply {
    Done,
    /// The entry does not fit even after a reorganize.
    NoFit,
    /// The record's format era does not match the page.
    FormatMismatch,
}

/// Keeps a tablespace pinned against drop for the duration of a merge.
struct SpacePin<'a> {
    spaces: &'a SpaceManager,
    space: SpaceId,
}

impl Drop for SpacePin<'_> {
    fn drop(&mut self) {
        self.spaces.dec_pending_ops(self.space);
    }
}

impl ChangeBuffer {
    /// Applies every buffered modification for `target` to `block` and
    /// removes the records. With `block == None` the records are purged
    /// without being applied (dropped or unreadable target). With
    /// `update_bitmap == false` the bitmap is left alone, for spaces whose
    /// bitmap pages are going away.
    pub fn merge_for_page(
        &self,
        ctx: EntryContext,
        block: Option<&FrameRef>,
        target: PageKey,
        update_bitmap: bool,
    ) -> Result<MergeOutcome> {
        debug_assert!(!ctx.is_inside());
        if bitmap::fixed_addr_page(target.space, target.page) {
            return Ok(MergeOutcome::Skipped);
        }

        let mut block = block;
        let mut update_bitmap = update_bitmap;
        let mut _pin = None;
        if update_bitmap {
            if self.kernel.spaces.inc_pending_ops(target.space) {
                // The space is being deleted: do not touch its bitmap, just
                // purge the records.
                block = None;
                update_bitmap = false;
            } else {
                _pin = Some(SpacePin {
                    spaces: &self.kernel.spaces,
                    space: target.space,
                });
                let buffered = {
                    let mut mtr = Mtr::start(&self.kernel);
                    let bh = bitmap::latch_bitmap_page(&mut mtr, target.space, target.page)?;
                    bitmap::get_bits(mtr.read(bh), target.page).buffered
                };
                if !buffered {
                    return Ok(MergeOutcome::Skipped);
                }
            }
        }

        // Sanity-check the target before trusting the bitmap: a page that is
        // not an index leaf means tablespace damage. The records are then
        // discarded rather than applied, which contains the problem to this
        // one page.
        let mut corruption = false;
        if let Some(frame) = block {
            let guard = frame.read();
            let is_leaf = page::kind(&guard.data)
                .map(|k| k == PageKind::IndexLeaf)
                .unwrap_or(false);
            if !is_leaf || page::level(&guard.data) != 0 {
                corruption = true;
                error!(
                    %target,
                    "changebuf.merge.target_corrupted: buffered bit set but the page is not an index leaf"
                );
            }
        }

        let search_key = codec::search_prefix(target.space, target.page);
        let mut applied = 0usize;
        let mut incomplete = false;

        'outer: loop {
            let mut mtr = Mtr::start(&self.kernel);
            let tree_guard = self.tree_latch.read();
            // Latch the user page before any tree page, every iteration,
            // like the original's known-nowait re-fix of the io-fixed block.
            let block_h = match block {
                Some(_) if !corruption => Some(mtr.page_x(target.space, target.page)?),
                _ => None,
            };

            let descent = self.tree.descend(&self.kernel, &search_key)?;
            let mut lh = mtr.page_x(SYSTEM_SPACE, descent.leaf)?;
            let mut idx = page::lower_bound(mtr.read(lh), &search_key);
            if idx == page::n_recs(mtr.read(lh)) {
                match page::next(mtr.read(lh)) {
                    Some(next) => {
                        lh = mtr.page_x(SYSTEM_SPACE, next)?;
                        idx = 0;
                    }
                    None => break 'outer,
                }
            }

            let scan = loop {
                if idx >= page::n_recs(mtr.read(lh)) {
                    // Deletions ran the cursor off the page; reposition.
                    mtr.commit()?;
                    break Scan::Restart;
                }
                let rec = page::record_payload(mtr.read(lh), idx).to_vec();
                if codec::rec_target(&rec)? != target {
                    mtr.commit()?;
                    break Scan::Finished;
                }

                let marked = page::record_delete_marked(mtr.read(lh), idx);
                if !marked {
                    if corruption {
                        warn!(%target, "changebuf.merge.discarding_record");
                    } else if let Some(bh) = block_h {
                        match self.apply_to_leaf(&mut mtr, bh, &rec)? {
                            Apply::Done => {
                                // Carry the auxiliary page's max trx id onto
                                // the target within the same mini-transaction.
                                let aux_trx = page::max_trx_id(mtr.read(lh));
                                if aux_trx > page::max_trx_id(mtr.read(bh)) {
                                    page::set_max_trx_id(mtr.write(bh), aux_trx);
                                }
                            }
                            Apply::NoFit => {
                                // Leave the record and the buffered bit in
                                // place so the next read retries the merge.
                                error!(
                                    %target,
                                    "changebuf.merge.apply_failed: entry does not fit after reorganize"
                                );
                                incomplete = true;
                                mtr.commit()?;
                                break Scan::Finished;
                            }
                            Apply::FormatMismatch => {
                                corruption = true;
                                error!(
                                    %target,
                                    "changebuf.merge.target_corrupted: record format era does not match the page"
                                );
                                // Discarded below like the other records.
                            }
                        }
                    }
                }

                if self.opts.crash_before_physical_delete {
                    // Fault injection: persist the delete-mark, then die
                    // before the physical delete.
                    page::set_delete_mark(mtr.write(lh), idx, true);
                    mtr.commit()?;
                    break Scan::Crash;
                }

                if self.tree.delete_optimistic(&mut mtr, lh, idx) {
                    applied += 1;
                    continue;
                }
                // Delete-mark first so a crash between here and the
                // pessimistic delete cannot re-apply the record.
                page::set_delete_mark(mtr.write(lh), idx, true);
                mtr.commit()?;
                break Scan::Pessimistic(rec);
            };

            match scan {
                Scan::Finished => break 'outer,
                Scan::Restart => continue 'outer,
                Scan::Crash => return Ok(MergeOutcome::CrashPoint),
                Scan::Pessimistic(rec) => {
                    drop(tree_guard);
                    self.delete_rec_pessimistic(&rec, target)?;
                    applied += 1;
                    continue 'outer;
                }
            }
        }

        if update_bitmap {
            let mut mtr = Mtr::start(&self.kernel);
            let block_h = match block {
                Some(_) => Some(mtr.page_x(target.space, target.page)?),
                None => None,
            };
            let bh = bitmap::latch_bitmap_page(&mut mtr, target.space, target.page)?;
            if !incomplete {
                bitmap::set_buffered(&mut mtr, bh, target.page, false);
            }
            if let Some(h) = block_h {
                let free = page::free_space(mtr.read(h)) + page::garbage(mtr.read(h));
                bitmap::update_free_bits(&mut mtr, bh, target.page, free);
            }
            mtr.commit()?;
        }

        {
            let mut state = self.state.lock();
            state.n_merges += 1;
            state.n_merged_recs += applied as u64;
        }
        info!(%target, records = applied, "changebuf.merge.completed");
        Ok(MergeOutcome::Merged { records: applied })
    }

    /// Installs one buffered entry on the target leaf.
    fn apply_to_leaf(&self, mtr: &mut Mtr, block: PageHandle, rec: &[u8]) -> Result<Apply> {
        let compact = codec::rec_compact(rec)?;
        if page::compact_flag(mtr.read(block)) != compact {
            return Ok(Apply::FormatMismatch);
        }
        let payload = codec::rec_entry_payload(rec)?.to_vec();
        match page::search(mtr.read(block), &payload) {
            Ok(pos) => {
                // An identical entry already sits there, delete-marked by an
                // earlier removal: records compare as raw bytes, so the
                // rewrite is always size-preserving. Resurrect it in place.
                if page::record_delete_marked(mtr.read(block), pos) {
                    page::set_delete_mark(mtr.write(block), pos, false);
                    debug!("changebuf.merge.resurrected_entry");
                }
                Ok(Apply::Done)
            }
            Err(pos) => {
                if page::fits(mtr.read(block), payload.len()) {
                    page::insert(mtr.write(block), pos, &payload)?;
                    return Ok(Apply::Done);
                }
                if payload.len() <= page::max_insert_size_after_reorganize(mtr.read(block)) {
                    page::reorganize(mtr.write(block));
                    // Reorganizing preserves order; the slot is unchanged.
                    page::insert(mtr.write(block), pos, &payload)?;
                    return Ok(Apply::Done);
                }
                Ok(Apply::NoFit)
            }
        }
    }

    /// Physically removes a delete-marked record whose optimistic delete
    /// failed, restoring the cursor by exact record bytes under the tree
    /// latch held exclusively.
    pub(crate) fn delete_rec_pessimistic(&self, rec: &[u8], target: PageKey) -> Result<()> {
        let mut mtr = Mtr::start(&self.kernel);
        // The header page authorizes free-list returns; latch it ahead of
        // the global mutex, the tree latch and every tree page.
        mtr.page_x(SYSTEM_SPACE, CHANGEBUF_HEADER_PAGE_NO)?;
        let mut state = self.state.lock();
        let _tree_latch = self.tree_latch.write();

        let mut free = |mtr: &mut Mtr, p| self.put_back_page(mtr, p);
        let restored = self
            .tree
            .delete_pessimistic(&self.kernel, &mut mtr, rec, &mut free)?;
        if !restored {
            drop(mtr);
            drop(state);
            if !self.kernel.spaces.space_exists(target.space) {
                // The tablespace was dropped; discard already removed the
                // record. Not a problem.
                debug!(%target, "changebuf.merge.record_gone_with_space");
                return Ok(());
            }
            error!(
                %target,
                "changebuf.merge.cursor_lost: delete-marked record vanished while the space is alive"
            );
            self.tree.validate(&self.kernel)?;
            debug_assert!(false, "change-buffer cursor restoration failed");
            return Err(Error::Corruption("change-buffer cursor restoration failed"));
        }

        let root = mtr.page_x(SYSTEM_SPACE, self.tree.root)?;
        let header = mtr.page_x(SYSTEM_SPACE, CHANGEBUF_HEADER_PAGE_NO)?;
        self.size_update(&mut state, &mtr, root, header);
        mtr.commit()
    }
}
