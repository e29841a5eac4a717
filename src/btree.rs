//! Persistent B-tree of byte-string records used by the change buffer.
//!
//! The root page number is fixed; growth keeps the root in place by raising
//! it (its content moves to a fresh child). Page allocation is delegated to
//! caller-supplied hooks so the change buffer can feed splits from its own
//! free list instead of the space manager; the tree never calls file-space
//! code while change-buffer latches are held.
//!
//! Internal records are `[child page, 4 bytes BE][separator bytes]`, ordered
//! by separator; a separator is a lower bound for every key in its subtree.
//! Leaves are sibling-linked, internals are not.

use rand::Rng;

use crate::mtr::{Kernel, Mtr, PageHandle};
use crate::page::{self, PageKind};
use crate::types::{Error, PageNo, Result, SpaceId};

#[derive(Copy, Clone, Debug)]
pub struct Tree {
    pub space: SpaceId,
    pub root: PageNo,
}

/// Route taken by a descent: `(node, child slot)` pairs from the root down,
/// excluding the leaf itself.
pub struct Descent {
    pub path: Vec<(PageNo, usize)>,
    pub leaf: PageNo,
}

fn sep_of(payload: &[u8]) -> &[u8] {
    &payload[4..]
}

fn child_of(payload: &[u8]) -> PageNo {
    PageNo(u32::from_be_bytes(payload[..4].try_into().unwrap()))
}

fn internal_rec(child: PageNo, sep: &[u8]) -> Vec<u8> {
    let mut rec = Vec::with_capacity(4 + sep.len());
    rec.extend_from_slice(&child.0.to_be_bytes());
    rec.extend_from_slice(sep);
    rec
}

/// First slot whose separator is `> key`.
fn internal_upper_bound(buf: &[u8], key: &[u8]) -> usize {
    let mut lo = 0usize;
    let mut hi = page::n_recs(buf);
    while lo < hi {
        let mid = (lo + hi) / 2;
        if sep_of(page::record_payload(buf, mid)) <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Slot of the child a key routes to.
fn internal_child_slot(buf: &[u8], key: &[u8]) -> usize {
    internal_upper_bound(buf, key).saturating_sub(1)
}

/// Reads a page through a short-lived shared latch. Only valid for pages the
/// surrounding mini-transaction has not latched; descents therefore run
/// before any tree page is latched, under the tree index latch.
fn with_page<R>(
    kernel: &Kernel,
    space: SpaceId,
    page_no: PageNo,
    f: impl FnOnce(&[u8]) -> R,
) -> Result<R> {
    let frame = kernel
        .pool
        .get(&kernel.spaces, crate::types::PageKey::new(space, page_no))?;
    let guard = frame.read();
    Ok(f(&guard.data))
}

impl Tree {
    /// Walks from the root to the leaf a key belongs to, recording the route.
    pub fn descend(&self, kernel: &Kernel, key: &[u8]) -> Result<Descent> {
        let mut node = self.root;
        let mut path = Vec::new();
        loop {
            let step = with_page(kernel, self.space, node, |buf| {
                if page::level(buf) == 0 {
                    None
                } else {
                    let slot = internal_child_slot(buf, key);
                    Some((slot, child_of(page::record_payload(buf, slot))))
                }
            })?;
            match step {
                None => return Ok(Descent { path, leaf: node }),
                Some((slot, child)) => {
                    path.push((node, slot));
                    node = child;
                }
            }
        }
    }

    /// Descends to a random leaf, picking a uniformly random child at every
    /// internal node, and a random slot within the leaf.
    pub fn open_at_rnd_pos(&self, kernel: &Kernel, rng: &mut impl Rng) -> Result<(PageNo, usize)> {
        let mut node = self.root;
        loop {
            let step = with_page(kernel, self.space, node, |buf| {
                let n = page::n_recs(buf);
                if page::level(buf) == 0 {
                    Err(if n == 0 { 0 } else { rng.gen_range(0..n) })
                } else {
                    Ok(child_of(page::record_payload(buf, rng.gen_range(0..n))))
                }
            })?;
            match step {
                Ok(child) => node = child,
                Err(slot) => return Ok((node, slot)),
            }
        }
    }

    /// Tree height: one for a lone root leaf.
    pub fn height(&self, kernel: &Kernel) -> Result<u32> {
        with_page(kernel, self.space, self.root, |buf| page::level(buf) as u32 + 1)
    }

    /// Payload of the largest record in the tree.
    pub fn rightmost_record(&self, kernel: &Kernel) -> Result<Option<Vec<u8>>> {
        let mut node = self.root;
        loop {
            let step = with_page(kernel, self.space, node, |buf| {
                let n = page::n_recs(buf);
                if n == 0 {
                    return None;
                }
                let payload = page::record_payload(buf, n - 1);
                if page::level(buf) == 0 {
                    Some(Err(payload.to_vec()))
                } else {
                    Some(Ok(child_of(payload)))
                }
            })?;
            match step {
                None => return Ok(None),
                Some(Ok(child)) => node = child,
                Some(Err(rec)) => return Ok(Some(rec)),
            }
        }
    }

    /// Inserts `rec` at a known leaf position when it fits, reorganizing the
    /// page first if the heap is fragmented. Returns false when a split
    /// would be needed.
    pub fn try_insert_at(&self, mtr: &mut Mtr, leaf: PageHandle, idx: usize, rec: &[u8]) -> bool {
        if page::fits(mtr.read(leaf), rec.len()) {
            page::insert(mtr.write(leaf), idx, rec).expect("checked fit");
            return true;
        }
        if rec.len() <= page::max_insert_size_after_reorganize(mtr.read(leaf)) {
            page::reorganize(mtr.write(leaf));
            page::insert(mtr.write(leaf), idx, rec).expect("fit after reorganize");
            return true;
        }
        false
    }

    /// Pessimistic insert: splits along the recorded descent, feeding page
    /// consumption through `alloc`. The caller holds the tree latch
    /// exclusively and has pre-latched whatever `alloc` needs.
    pub fn split_insert(
        &self,
        mtr: &mut Mtr,
        descent: &Descent,
        rec: &[u8],
        alloc: &mut impl FnMut(&mut Mtr) -> Result<PageNo>,
    ) -> Result<()> {
        let mut path = descent.path.clone();
        let mut node = descent.leaf;
        let mut rec = rec.to_vec();
        let mut is_leaf = true;

        loop {
            let h = mtr.page_x(self.space, node)?;
            let idx = if is_leaf {
                page::lower_bound(mtr.read(h), &rec)
            } else {
                internal_upper_bound(mtr.read(h), sep_of(&rec))
            };
            if self.try_insert_at(mtr, h, idx, &rec) {
                return Ok(());
            }

            if node == self.root {
                // Raise: the root page number is fixed, so its content moves
                // into a fresh child and the root becomes one level taller.
                let child_no = alloc(mtr)?;
                let ch = mtr.page_x(self.space, child_no)?;
                let level = page::level(mtr.read(h));
                let max_trx = page::max_trx_id(mtr.read(h));
                let records = copy_out_records(mtr.read(h));
                let kind = if level == 0 {
                    PageKind::IndexLeaf
                } else {
                    PageKind::IndexInternal
                };
                page::init(mtr.write(ch), self.space, child_no, kind, level);
                put_records(mtr.write(ch), &records);
                page::set_max_trx_id(mtr.write(ch), max_trx);

                let first_sep = if level == 0 {
                    records[0].1.clone()
                } else {
                    sep_of(&records[0].1).to_vec()
                };
                page::init(
                    mtr.write(h),
                    self.space,
                    node,
                    PageKind::IndexInternal,
                    level + 1,
                );
                let root_rec = internal_rec(child_no, &first_sep);
                page::insert(mtr.write(h), 0, &root_rec)?;

                path.push((node, 0));
                node = child_no;
                continue;
            }

            // Ordinary split: upper half moves to a fresh right sibling.
            let new_no = alloc(mtr)?;
            let nh = mtr.page_x(self.space, new_no)?;
            let level = page::level(mtr.read(h));
            let n = page::n_recs(mtr.read(h));
            let half = n / 2;
            let moved = copy_out_records_from(mtr.read(h), half);
            let kind = if is_leaf {
                PageKind::IndexLeaf
            } else {
                PageKind::IndexInternal
            };
            page::init(mtr.write(nh), self.space, new_no, kind, level);
            put_records(mtr.write(nh), &moved);
            for i in (half..n).rev() {
                page::delete(mtr.write(h), i);
            }
            page::reorganize(mtr.write(h));

            if is_leaf {
                let old_next = page::next(mtr.read(h));
                page::set_prev(mtr.write(nh), Some(node));
                page::set_next(mtr.write(nh), old_next);
                page::set_next(mtr.write(h), Some(new_no));
                let h_max_trx_id = page::max_trx_id(mtr.read(h));
                page::set_max_trx_id(mtr.write(nh), h_max_trx_id);
                if let Some(next_no) = old_next {
                    let nnh = mtr.page_x(self.space, next_no)?;
                    page::set_prev(mtr.write(nnh), Some(new_no));
                }
            }

            // Place the record on whichever side now owns its key range.
            let goes_right = if moved.is_empty() {
                false
            } else if is_leaf {
                rec.as_slice() >= moved[0].1.as_slice()
            } else {
                sep_of(&rec) >= sep_of(&moved[0].1)
            };
            let (th, tidx) = if goes_right {
                let idx = if is_leaf {
                    page::lower_bound(mtr.read(nh), &rec)
                } else {
                    internal_upper_bound(mtr.read(nh), sep_of(&rec))
                };
                (nh, idx)
            } else {
                let idx = if is_leaf {
                    page::lower_bound(mtr.read(h), &rec)
                } else {
                    internal_upper_bound(mtr.read(h), sep_of(&rec))
                };
                (h, idx)
            };
            if !self.try_insert_at(mtr, th, tidx, &rec) {
                return Err(Error::Corruption("record does not fit after page split"));
            }

            // Promote the right page's minimum to the parent.
            let promoted_sep = {
                let buf = mtr.read(nh);
                let first = page::record_payload(buf, 0);
                if is_leaf {
                    first.to_vec()
                } else {
                    sep_of(first).to_vec()
                }
            };
            rec = internal_rec(new_no, &promoted_sep);
            is_leaf = false;
            let (parent, _) = path
                .pop()
                .ok_or(Error::Corruption("split reached above the root"))?;
            node = parent;
        }
    }

    /// Deletes the record in `idx` of a latched leaf if no structural change
    /// is needed: the leaf must be the root or keep at least one record.
    pub fn delete_optimistic(&self, mtr: &mut Mtr, leaf: PageHandle, idx: usize) -> bool {
        let is_root = mtr.key_of(leaf).page == self.root;
        if !is_root && page::n_recs(mtr.read(leaf)) <= 1 {
            return false;
        }
        page::delete(mtr.write(leaf), idx);
        true
    }

    /// Pessimistic delete by exact record bytes. Empty leaves are unlinked
    /// and handed to `free`; a root with a single child collapses so the
    /// height shrinks in place. Returns false when the record is gone
    /// (the cursor could not be restored).
    pub fn delete_pessimistic(
        &self,
        kernel: &Kernel,
        mtr: &mut Mtr,
        rec: &[u8],
        free: &mut impl FnMut(&mut Mtr, PageNo) -> Result<()>,
    ) -> Result<bool> {
        let descent = self.descend(kernel, rec)?;
        let h = mtr.page_x(self.space, descent.leaf)?;
        let idx = match page::search(mtr.read(h), rec) {
            Ok(idx) => idx,
            Err(_) => return Ok(false),
        };
        page::delete(mtr.write(h), idx);

        let mut node = descent.leaf;
        let mut path = descent.path.clone();
        loop {
            if node == self.root {
                break;
            }
            let h = mtr.page_x(self.space, node)?;
            if page::n_recs(mtr.read(h)) != 0 {
                break;
            }
            // Unlink from the sibling chain (leaves only).
            if page::level(mtr.read(h)) == 0 {
                let prev = page::prev(mtr.read(h));
                let next = page::next(mtr.read(h));
                if let Some(p) = prev {
                    let ph = mtr.page_x(self.space, p)?;
                    page::set_next(mtr.write(ph), next);
                }
                if let Some(nx) = next {
                    let nh = mtr.page_x(self.space, nx)?;
                    page::set_prev(mtr.write(nh), prev);
                }
            }
            let (parent, _) = path
                .pop()
                .ok_or(Error::Corruption("orphan page during delete"))?;
            let ph = mtr.page_x(self.space, parent)?;
            let slot = find_child_slot(mtr.read(ph), node)
                .ok_or(Error::Corruption("child missing from parent page"))?;
            page::delete(mtr.write(ph), slot);
            free(mtr, node)?;
            node = parent;
        }

        // Collapse a trivial root chain so the height stays honest.
        loop {
            let rh = mtr.page_x(self.space, self.root)?;
            if page::level(mtr.read(rh)) == 0 || page::n_recs(mtr.read(rh)) != 1 {
                break;
            }
            let only_child = child_of(page::record_payload(mtr.read(rh), 0));
            let ch = mtr.page_x(self.space, only_child)?;
            let level = page::level(mtr.read(ch));
            let records = copy_out_records(mtr.read(ch));
            let kind = if level == 0 {
                PageKind::IndexLeaf
            } else {
                PageKind::IndexInternal
            };
            let max_trx = page::max_trx_id(mtr.read(ch));
            page::init(mtr.write(rh), self.space, self.root, kind, level);
            put_records(mtr.write(rh), &records);
            page::set_max_trx_id(mtr.write(rh), max_trx);
            free(mtr, only_child)?;
        }
        Ok(true)
    }

    /// Structural check: separator ordering, child levels, leaf chain.
    pub fn validate(&self, kernel: &Kernel) -> Result<()> {
        let mut leaves = Vec::new();
        self.validate_node(kernel, self.root, None, &mut leaves)?;
        // The sibling chain must list the leaves in left-to-right order.
        for window in leaves.windows(2) {
            let (left, right) = (window[0], window[1]);
            let ok = with_page(kernel, self.space, left, |buf| page::next(buf) == Some(right))?
                && with_page(kernel, self.space, right, |buf| page::prev(buf) == Some(left))?;
            if !ok {
                return Err(Error::Corruption("leaf sibling chain broken"));
            }
        }
        if let (Some(first), Some(last)) = (leaves.first(), leaves.last()) {
            let head_ok = with_page(kernel, self.space, *first, |buf| page::prev(buf).is_none())?;
            let tail_ok = with_page(kernel, self.space, *last, |buf| page::next(buf).is_none())?;
            if !head_ok || !tail_ok {
                return Err(Error::Corruption("leaf sibling chain has stray ends"));
            }
        }
        Ok(())
    }

    fn validate_node(
        &self,
        kernel: &Kernel,
        node: PageNo,
        lower: Option<Vec<u8>>,
        leaves: &mut Vec<PageNo>,
    ) -> Result<()> {
        let (level, records) = with_page(kernel, self.space, node, |buf| {
            (page::level(buf), copy_out_records(buf))
        })?;
        let keys: Vec<&[u8]> = records
            .iter()
            .map(|(_, payload)| {
                if level == 0 {
                    payload.as_slice()
                } else {
                    sep_of(payload)
                }
            })
            .collect();
        for window in keys.windows(2) {
            if window[0] > window[1] {
                return Err(Error::Corruption("keys out of order in tree page"));
            }
        }
        if let (Some(lower), Some(first)) = (lower.as_ref(), keys.first()) {
            if lower.as_slice() > *first {
                return Err(Error::Corruption("separator exceeds subtree minimum"));
            }
        }
        if level == 0 {
            leaves.push(node);
            return Ok(());
        }
        for (_, payload) in &records {
            let child = child_of(payload);
            let child_level = with_page(kernel, self.space, child, page::level)?;
            if child_level + 1 != level {
                return Err(Error::Corruption("child level mismatch"));
            }
            self.validate_node(kernel, child, Some(sep_of(payload).to_vec()), leaves)?;
        }
        Ok(())
    }
}

fn copy_out_records(buf: &[u8]) -> Vec<(bool, Vec<u8>)> {
    copy_out_records_from(buf, 0)
}

fn copy_out_records_from(buf: &[u8], from: usize) -> Vec<(bool, Vec<u8>)> {
    (from..page::n_recs(buf))
        .map(|i| {
            (
                page::record_delete_marked(buf, i),
                page::record_payload(buf, i).to_vec(),
            )
        })
        .collect()
}

fn put_records(buf: &mut [u8], records: &[(bool, Vec<u8>)]) {
    for (i, (marked, payload)) in records.iter().enumerate() {
        page::insert(buf, i, payload).expect("record relocation must fit");
        if *marked {
            page::set_delete_mark(buf, i, true);
        }
    }
}

fn find_child_slot(buf: &[u8], child: PageNo) -> Option<usize> {
    (0..page::n_recs(buf)).find(|&i| child_of(page::record_payload(buf, i)) == child)
}
