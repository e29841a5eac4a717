mod util;

use antumbra::{Options, Outcome, PageKey, SpaceId, TxId};
use util::{assert_size_invariant, entry_of, open_engine};

#[test]
fn discard_purges_without_applying() {
    let (_dir, engine) = open_engine(Options::default());
    let space = SpaceId(9);
    engine.create_space(space).unwrap();
    let leaf_a = engine.alloc_leaf_page(space, true).unwrap();
    let leaf_b = engine.alloc_leaf_page(space, true).unwrap();
    assert!(engine.evict_page(space, leaf_a).unwrap());
    assert!(engine.evict_page(space, leaf_b).unwrap());

    for i in 0..5u64 {
        assert_eq!(
            engine
                .try_buffer_insert(PageKey::new(space, leaf_a), &entry_of(200, i), TxId(1))
                .unwrap(),
            Outcome::Deferred
        );
    }
    for i in 0..3u64 {
        assert_eq!(
            engine
                .try_buffer_insert(PageKey::new(space, leaf_b), &entry_of(200, 100 + i), TxId(1))
                .unwrap(),
            Outcome::Deferred
        );
    }

    let before = engine.status().n_merged_recs;
    let purged = engine.drop_space(space).unwrap();
    assert_eq!(purged, 8);
    assert_eq!(engine.status().n_merged_recs, before + 8);
    assert_eq!(
        engine
            .changebuf()
            .buffered_record_count(Some(space), None)
            .unwrap(),
        0
    );

    // Until the space id is redefined, buffering for it is refused.
    assert_eq!(
        engine
            .try_buffer_insert(PageKey::new(space, leaf_a), &entry_of(64, 999), TxId(2))
            .unwrap(),
        Outcome::RejectedTryAgain
    );

    engine.changebuf().validate_tree().unwrap();
    assert_size_invariant(&engine.status());
}

#[test]
fn discard_is_scoped_to_one_space() {
    let (_dir, engine) = open_engine(Options::default());
    let kept = SpaceId(5);
    let dropped = SpaceId(6);
    engine.create_space(kept).unwrap();
    engine.create_space(dropped).unwrap();
    let kept_leaf = engine.alloc_leaf_page(kept, true).unwrap();
    let dropped_leaf = engine.alloc_leaf_page(dropped, true).unwrap();
    assert!(engine.evict_page(kept, kept_leaf).unwrap());
    assert!(engine.evict_page(dropped, dropped_leaf).unwrap());

    for i in 0..4u64 {
        engine
            .try_buffer_insert(PageKey::new(kept, kept_leaf), &entry_of(150, i), TxId(1))
            .unwrap();
        engine
            .try_buffer_insert(
                PageKey::new(dropped, dropped_leaf),
                &entry_of(150, 50 + i),
                TxId(1),
            )
            .unwrap();
    }

    assert_eq!(engine.drop_space(dropped).unwrap(), 4);
    assert_eq!(
        engine
            .changebuf()
            .buffered_record_count(Some(kept), None)
            .unwrap(),
        4
    );

    // The kept space still merges normally.
    drop(engine.get_user_page(kept, kept_leaf).unwrap());
    assert_eq!(engine.leaf_records(kept, kept_leaf).unwrap().len(), 4);
    assert!(!engine.bitmap_probe(kept, kept_leaf).unwrap().buffered);
}

#[test]
fn dropped_space_ids_are_not_recycled() {
    let (_dir, engine) = open_engine(Options::default());
    let space = SpaceId(40);
    engine.create_space(space).unwrap();
    engine.drop_space(space).unwrap();
    // Fresh ids start above every id ever seen.
    assert!(engine.alloc_space_id().0 > 40);
}
