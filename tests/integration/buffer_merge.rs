mod util;

use antumbra::changebuf::bitmap::free_bits_for;
use antumbra::page::PAGE_CAPACITY;
use antumbra::{Options, Outcome, PageKey, SpaceId, TxId};
use util::{assert_size_invariant, entry_of, open_engine};

#[test]
fn buffer_then_merge() {
    let (_dir, engine) = open_engine(Options::default());
    let space = SpaceId(7);
    engine.create_space(space).unwrap();
    let leaf = engine.alloc_leaf_page(space, true).unwrap();
    let target = PageKey::new(space, leaf);
    assert!(engine.evict_page(space, leaf).unwrap());

    let entry = entry_of(300, 1);
    assert_eq!(
        engine.try_buffer_insert(target, &entry, TxId(10)).unwrap(),
        Outcome::Deferred
    );

    let bits = engine.bitmap_probe(space, leaf).unwrap();
    assert!(bits.buffered);
    assert_eq!(bits.free, 3, "300 bytes do not cross a quantization boundary");
    assert_eq!(
        engine
            .changebuf()
            .buffered_record_count(Some(space), Some(leaf))
            .unwrap(),
        1
    );
    assert!(!engine.page_resident(space, leaf));

    // Any read of the leaf triggers the merge before the frame is usable.
    drop(engine.get_user_page(space, leaf).unwrap());
    assert_eq!(engine.leaf_records(space, leaf).unwrap(), vec![entry.payload()]);
    let bits = engine.bitmap_probe(space, leaf).unwrap();
    assert!(!bits.buffered);
    assert_eq!(
        engine
            .changebuf()
            .buffered_record_count(Some(space), Some(leaf))
            .unwrap(),
        0
    );

    // Merging again is a no-op: the buffered bit is off.
    drop(engine.get_user_page(space, leaf).unwrap());
    assert_eq!(engine.leaf_records(space, leaf).unwrap().len(), 1);

    let status = engine.status();
    assert_eq!(status.n_inserts, 1);
    assert!(status.n_merges >= 1);
    assert_eq!(status.n_merged_recs, 1);
    assert_size_invariant(&status);
}

#[test]
fn full_target_page_rejects_and_schedules_merge() {
    let (_dir, engine) = open_engine(Options::default());
    let space = SpaceId(7);
    engine.create_space(space).unwrap();
    let leaf = engine.alloc_leaf_page(space, true).unwrap();
    let target = PageKey::new(space, leaf);

    // Fill the page directly until less than one quantum is free.
    for i in 0..7u64 {
        engine.apply_insert(target, &entry_of(2000, i), TxId(1)).unwrap();
    }
    let bits = engine.bitmap_probe(space, leaf).unwrap();
    assert_eq!(bits.free, 0);
    assert!(engine.evict_page(space, leaf).unwrap());

    let outcome = engine
        .try_buffer_insert(target, &entry_of(300, 100), TxId(2))
        .unwrap();
    assert_eq!(outcome, Outcome::RejectedBitmapFull);
    // The rejection scheduled a merge read around the target: the page is
    // back in the pool and nothing stayed buffered for it.
    assert!(engine.page_resident(space, leaf));
    assert!(!engine.bitmap_probe(space, leaf).unwrap().buffered);
    assert_eq!(
        engine
            .changebuf()
            .buffered_record_count(Some(space), Some(leaf))
            .unwrap(),
        0
    );
}

#[test]
fn oversized_entries_must_bypass_the_buffer() {
    let (_dir, engine) = open_engine(Options::default());
    let space = SpaceId(3);
    engine.create_space(space).unwrap();
    let leaf = engine.alloc_leaf_page(space, true).unwrap();
    let target = PageKey::new(space, leaf);
    assert!(engine.evict_page(space, leaf).unwrap());

    // Footprint of entry_of(len) is len + 8; half a page plus one byte is
    // the first size that must be refused.
    let too_big = entry_of(PAGE_CAPACITY / 2 + 1 - 8, 1);
    assert_eq!(
        engine.try_buffer_insert(target, &too_big, TxId(1)).unwrap(),
        Outcome::RejectedTooBig
    );
    // A too-big rejection schedules nothing.
    assert!(!engine.page_resident(space, leaf));

    let just_fits = entry_of(PAGE_CAPACITY / 2 - 8, 2);
    assert_eq!(
        engine.try_buffer_insert(target, &just_fits, TxId(1)).unwrap(),
        Outcome::Deferred
    );
}

#[test]
fn buffered_sequence_matches_direct_application() {
    let (_dir, engine) = open_engine(Options::default());
    let space = SpaceId(12);
    engine.create_space(space).unwrap();
    let buffered_leaf = engine.alloc_leaf_page(space, true).unwrap();
    let direct_leaf = engine.alloc_leaf_page(space, true).unwrap();
    assert!(engine.evict_page(space, buffered_leaf).unwrap());

    let entries: Vec<_> = (0..6u64).map(|i| entry_of(100 + 60 * i as usize, i)).collect();
    for entry in &entries {
        assert_eq!(
            engine
                .try_buffer_insert(PageKey::new(space, buffered_leaf), entry, TxId(5))
                .unwrap(),
            Outcome::Deferred
        );
    }
    for entry in &entries {
        // The direct leaf is resident, so the full insert path refuses to
        // defer and applies in place.
        let outcome = engine
            .insert_secondary(PageKey::new(space, direct_leaf), entry, TxId(5))
            .unwrap();
        assert_ne!(outcome, Outcome::Deferred);
    }

    drop(engine.get_user_page(space, buffered_leaf).unwrap());
    assert_eq!(
        engine.leaf_records(space, buffered_leaf).unwrap(),
        engine.leaf_records(space, direct_leaf).unwrap()
    );
    engine.changebuf().validate_tree().unwrap();
}

#[test]
fn split_refresh_updates_both_bitmap_entries() {
    // The outer page-split code refreshes both halves through the
    // serialized two-page helper.
    let (_dir, engine) = open_engine(Options::default());
    let space = SpaceId(13);
    engine.create_space(space).unwrap();
    let left = engine.alloc_leaf_page(space, true).unwrap();
    let right = engine.alloc_leaf_page(space, true).unwrap();
    for i in 0..5u64 {
        engine
            .apply_insert(PageKey::new(space, left), &entry_of(2500, i), TxId(1))
            .unwrap();
    }

    let left_free = engine.leaf_free_bytes(space, left).unwrap();
    let right_free = engine.leaf_free_bytes(space, right).unwrap();
    engine
        .changebuf()
        .update_free_bits_for_two_pages(
            PageKey::new(space, left),
            left_free,
            PageKey::new(space, right),
            right_free,
        )
        .unwrap();
    assert_eq!(engine.bitmap_probe(space, left).unwrap().free, free_bits_for(left_free));
    assert_eq!(engine.bitmap_probe(space, right).unwrap().free, free_bits_for(right_free));
}

#[test]
fn bitmap_bit_lifecycle_and_free_estimate() {
    let (_dir, engine) = open_engine(Options::default());
    let space = SpaceId(11);
    engine.create_space(space).unwrap();
    let leaf = engine.alloc_leaf_page(space, true).unwrap();
    let target = PageKey::new(space, leaf);
    assert!(engine.evict_page(space, leaf).unwrap());

    assert_eq!(
        engine.try_buffer_insert(target, &entry_of(500, 77), TxId(1)).unwrap(),
        Outcome::Deferred
    );
    assert!(engine.bitmap_probe(space, leaf).unwrap().buffered);

    drop(engine.get_user_page(space, leaf).unwrap());
    let bits = engine.bitmap_probe(space, leaf).unwrap();
    assert!(!bits.buffered);

    // The estimate must never overstate the page's reclaimable space, and
    // right after a merge it is exact.
    let actual = engine.leaf_free_bytes(space, leaf).unwrap();
    assert_eq!(bits.free, free_bits_for(actual));

    // Shrink the free space further by direct inserts; the estimate keeps
    // pace in the same mini-transactions.
    for i in 0..8u64 {
        engine.apply_insert(target, &entry_of(1800, 100 + i), TxId(2)).unwrap();
    }
    let bits = engine.bitmap_probe(space, leaf).unwrap();
    let actual = engine.leaf_free_bytes(space, leaf).unwrap();
    assert!(free_bits_for(actual) >= bits.free);
    assert_eq!(bits.free, free_bits_for(actual));

    // An unbounded shrink drops the estimate to zero first; the lazy
    // refresh later pulls it back up to the true quantized value.
    engine.reset_free_bits(space, leaf).unwrap();
    assert_eq!(engine.bitmap_probe(space, leaf).unwrap().free, 0);
    engine.refresh_free_bits(space, leaf).unwrap();
    assert_eq!(
        engine.bitmap_probe(space, leaf).unwrap().free,
        free_bits_for(engine.leaf_free_bytes(space, leaf).unwrap())
    );
}

#[test]
fn row_locks_refuse_buffering() {
    let (_dir, engine) = open_engine(Options::default());
    let space = SpaceId(14);
    engine.create_space(space).unwrap();
    let leaf = engine.alloc_leaf_page(space, true).unwrap();
    let target = PageKey::new(space, leaf);
    assert!(engine.evict_page(space, leaf).unwrap());

    engine.set_row_locked(space, leaf, true);
    assert_eq!(
        engine.try_buffer_insert(target, &entry_of(100, 1), TxId(1)).unwrap(),
        Outcome::RejectedTryAgain
    );
    engine.set_row_locked(space, leaf, false);
    assert_eq!(
        engine.try_buffer_insert(target, &entry_of(100, 1), TxId(1)).unwrap(),
        Outcome::Deferred
    );
}
