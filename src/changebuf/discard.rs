//! Purging buffered records for a dropped tablespace.

use tracing::info;

use super::{codec, ChangeBuffer, EntryContext, Scan};
use crate::mtr::Mtr;
use crate::page;
use crate::types::{PageNo, Result, SpaceId, SYSTEM_SPACE};

impl ChangeBuffer {
    /// Deletes every buffered record whose target lives in `space`, without
    /// applying anything and without touching the space's bitmaps (the
    /// tablespace is going away). Used by DISCARD/DROP of a tablespace.
    pub fn discard_space(&self, ctx: EntryContext, space: SpaceId) -> Result<usize> {
        debug_assert!(!ctx.is_inside());
        // Page zero sorts before every possible target in the space.
        let search_key = codec::search_prefix(space, PageNo(0));
        let mut purged = 0usize;

        'outer: loop {
            let mut mtr = Mtr::start(&self.kernel);
            let tree_guard = self.tree_latch.read();

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
                    mtr.commit()?;
                    break Scan::Restart;
                }
                let rec = page::record_payload(mtr.read(lh), idx).to_vec();
                if codec::rec_target(&rec)?.space != space {
                    mtr.commit()?;
                    break Scan::Finished;
                }
                if self.tree.delete_optimistic(&mut mtr, lh, idx) {
                    purged += 1;
                    continue;
                }
                page::set_delete_mark(mtr.write(lh), idx, true);
                mtr.commit()?;
                break Scan::Pessimistic(rec);
            };

            match scan {
                Scan::Finished => break 'outer,
                Scan::Restart => continue 'outer,
                Scan::Pessimistic(rec) => {
                    drop(tree_guard);
                    let target = codec::rec_target(&rec)?;
                    self.delete_rec_pessimistic(&rec, target)?;
                    purged += 1;
                    continue 'outer;
                }
                Scan::Crash => unreachable!("no fault injection in discard"),
            }
        }

        {
            let mut state = self.state.lock();
            state.n_merges += 1;
            state.n_merged_recs += purged as u64;
        }
        info!(%space, records = purged, "changebuf.discard.completed");
        Ok(purged)
    }
}
