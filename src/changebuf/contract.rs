//! Shrinking the change buffer by scheduling target-page reads.
//!
//! The contractor opens the tree at a random position, groups the nearby
//! records by target region and hands the resulting page list to the merge
//! read path. Reads are serviced inline; the `sync` flag records whether the
//! caller chose to wait (it always effectively does) and is carried into the
//! trace events for parity with asynchronous builds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::{codec, ChangeBuffer, EntryContext};
use crate::mtr::{Mtr, PageHandle};
use crate::page::{self, PAGE_CAPACITY};
use crate::types::{PageKey, Result, SYSTEM_SPACE};

/// One page scheduled for a merge read, with the space version seen at
/// scheduling time so a drop in between invalidates the read.
#[derive(Clone, Debug)]
pub(crate) struct MergeTarget {
    pub(crate) key: PageKey,
    pub(crate) version: Option<u64>,
}

impl ChangeBuffer {
    /// One contraction round: pick a random region of the tree, schedule
    /// merge reads for it. Returns a lower bound for the merged bytes and
    /// the number of pages processed; `(0, 0)` when the buffer is empty.
    pub fn contract(&self, ctx: EntryContext, sync: bool) -> Result<(usize, usize)> {
        debug_assert!(!ctx.is_inside());
        let (targets, volume) = {
            // The global mutex is held across the random open, released as
            // soon as the emptiness verdict is in.
            let mut state = self.state.lock();
            if state.empty {
                return Ok((0, 0));
            }
            let mut mtr = Mtr::start(&self.kernel);
            let _tree_latch = self.tree_latch.read();
            let (leaf_no, slot) = self.tree.open_at_rnd_pos(&self.kernel, &mut rand::thread_rng())?;
            let lh = mtr.page_x(SYSTEM_SPACE, leaf_no)?;
            if page::n_recs(mtr.read(lh)) == 0 {
                // The last record went away through an optimistic delete,
                // which cannot update the sticky flag itself. Repair it here
                // so shutdown-style contraction loops terminate.
                state.empty = true;
                return Ok((0, 0));
            }
            drop(state);
            self.collect_merge_batch(&mtr, lh, slot, true, None)?
        };

        let pages = self.read_merge_targets(ctx, &targets, sync)?;
        debug!(sync, pages, volume, "changebuf.contract.batch");
        Ok((volume + 1, pages))
    }

    /// Contracts until at least `min_pages` target pages were processed or
    /// the buffer drained.
    pub fn contract_for_n_pages(
        &self,
        ctx: EntryContext,
        sync: bool,
        min_pages: usize,
    ) -> Result<usize> {
        let mut bytes = 0usize;
        let mut pages = 0usize;
        while pages < min_pages {
            let (b, p) = self.contract(ctx, sync)?;
            if b == 0 {
                break;
            }
            bytes += b;
            pages += p;
        }
        Ok(bytes)
    }

    /// Post-insert contraction policy: anything over the ceiling contracts,
    /// and past the sync margin the insert pays for it in line. Contracts
    /// at least as many bytes as the insert added.
    pub(crate) fn contract_after_insert(&self, ctx: EntryContext, entry_size: usize) -> Result<()> {
        let (size, do_sync) = {
            let state = self.state.lock();
            (
                state.size,
                state.size >= self.max_size + self.opts.sync_margin,
            )
        };
        if size < self.max_size {
            return Ok(());
        }
        let mut merged = 0usize;
        while merged < entry_size {
            let (bytes, _) = self.contract(ctx, do_sync)?;
            if bytes == 0 {
                break;
            }
            merged += bytes;
        }
        Ok(())
    }

    /// Groups the records around `slot` of one tree leaf into merge targets.
    /// A group joins the batch when the round is a forced contraction, when
    /// it holds the anchor (the cursor's own target, or the would-be insert
    /// target), or when its buffered volume says the target page is near
    /// full anyway.
    pub(crate) fn collect_merge_batch(
        &self,
        mtr: &Mtr,
        leaf: PageHandle,
        slot: usize,
        contract: bool,
        anchor: Option<PageKey>,
    ) -> Result<(Vec<MergeTarget>, usize)> {
        let n = page::n_recs(mtr.read(leaf));
        if n == 0 {
            return Ok((Vec::new(), 0));
        }
        let limit = (self.opts.merge_area as usize)
            .min(self.kernel.pool.capacity() / 4)
            .max(1);
        let area = self.opts.merge_area;
        let pos0 = slot.min(n - 1);
        let first = codec::rec_target(page::record_payload(mtr.read(leaf), pos0))?;
        let region_of = |t: PageKey| (t.space, t.page.0 / area);

        // Walk back to the start of the region (or the page start, or the
        // batch limit), so the forward pass sees whole groups.
        let mut start = pos0;
        {
            let mut distinct = 0usize;
            let mut prev: Option<PageKey> = None;
            let mut i = pos0;
            loop {
                let t = codec::rec_target(page::record_payload(mtr.read(leaf), i))?;
                if region_of(t) != region_of(first) {
                    start = i + 1;
                    break;
                }
                if prev != Some(t) {
                    distinct += 1;
                }
                prev = Some(t);
                start = i;
                if i == 0 || distinct >= limit {
                    break;
                }
                i -= 1;
            }
        }

        let threshold = PAGE_CAPACITY / self.opts.merge_threshold as usize;
        let mut targets: Vec<MergeTarget> = Vec::new();
        let mut sum_volume = 0usize;
        let mut group_volume = 0usize;
        let mut prev: Option<PageKey> = None;
        let mut k = start;
        loop {
            let cur = if k < n {
                Some(codec::rec_target(page::record_payload(mtr.read(leaf), k))?)
            } else {
                None
            };
            let out_of_region = match cur {
                None => true,
                Some(t) => region_of(t) != region_of(first),
            };
            if cur != prev {
                if let Some(done) = prev {
                    let include = contract
                        || done == first
                        || Some(done) == anchor
                        || group_volume > threshold;
                    if include && targets.len() < limit {
                        targets.push(MergeTarget {
                            key: done,
                            version: self.kernel.spaces.space_version(done.space),
                        });
                        sum_volume += group_volume;
                    }
                }
                group_volume = 0;
            }
            if out_of_region || targets.len() >= limit {
                break;
            }
            group_volume += codec::encoded_volume(page::record_payload(mtr.read(leaf), k))?;
            prev = cur;
            k += 1;
        }
        Ok((targets, sum_volume))
    }

    /// Reads the scheduled targets and merges each, the way the read
    /// completion path would. Refuses to run when the caller is already
    /// inside a change-buffer routine: that is the read-ahead recursion the
    /// latching order forbids.
    pub(crate) fn read_merge_targets(
        &self,
        ctx: EntryContext,
        targets: &[MergeTarget],
        sync: bool,
    ) -> Result<usize> {
        if ctx.is_inside() {
            debug!("changebuf.read.refused_recursion");
            return Ok(0);
        }
        let mut pages = 0usize;
        for target in targets {
            let current = self.kernel.spaces.space_version(target.key.space);
            match (current, target.version) {
                (None, _) => {
                    // The space is gone; purge the records without applying.
                    self.merge_for_page(ctx, None, target.key, false)?;
                    pages += 1;
                }
                (Some(now), Some(then)) if now == then => {
                    let frame = self.kernel.pool.get(&self.kernel.spaces, target.key)?;
                    self.kernel.pool.set_io_fixed(&frame, true);
                    let result = self.merge_for_page(ctx, Some(&frame), target.key, true);
                    self.kernel.pool.set_io_fixed(&frame, false);
                    result?;
                    pages += 1;
                }
                _ => {
                    debug!(target = %target.key, sync, "changebuf.read.skipped_stale_space");
                }
            }
        }
        Ok(pages)
    }
}

/// Background driver keeping the tree near its size ceiling.
pub struct ContractorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ContractorHandle {
    pub fn spawn(cb: Arc<ChangeBuffer>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("changebuf-contractor".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    let over = {
                        let state = cb.state.lock();
                        !state.empty && state.size > cb.max_size
                    };
                    if over {
                        if let Err(err) = cb.contract(EntryContext::outside(), false) {
                            warn!(%err, "changebuf.contract.worker_error");
                        }
                    }
                    thread::park_timeout(interval);
                }
            })
            .expect("spawn changebuf contractor");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }
}

impl Drop for ContractorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
