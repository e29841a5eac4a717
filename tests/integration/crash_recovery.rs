mod util;

use antumbra::{Engine, MergeOutcome, Options, Outcome, PageKey, SpaceId, TxId};
use util::{entry_of, init_tracing};

#[test]
fn committed_buffering_survives_a_crash() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let space = SpaceId(4);
    let leaf;
    let entries: Vec<_> = (0..2u64).map(|i| entry_of(250, i)).collect();

    {
        let engine = Engine::open(dir.path(), Options::default()).unwrap();
        engine.create_space(space).unwrap();
        leaf = engine.alloc_leaf_page(space, true).unwrap();
        assert!(engine.evict_page(space, leaf).unwrap());
        for entry in &entries {
            assert_eq!(
                engine
                    .try_buffer_insert(PageKey::new(space, leaf), entry, TxId(1))
                    .unwrap(),
                Outcome::Deferred
            );
        }
        // Dropped without a checkpoint: the WAL is all that survives.
    }

    let engine = Engine::open(dir.path(), Options::default()).unwrap();
    assert!(engine.bitmap_probe(space, leaf).unwrap().buffered);
    assert_eq!(
        engine
            .changebuf()
            .buffered_record_count(Some(space), Some(leaf))
            .unwrap(),
        2
    );
    drop(engine.get_user_page(space, leaf).unwrap());
    let records = engine.leaf_records(space, leaf).unwrap();
    assert_eq!(records.len(), 2);
    for entry in &entries {
        assert!(records.contains(&entry.payload()));
    }
}

#[test]
fn crash_between_delete_mark_and_physical_delete() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let space = SpaceId(3);
    let leaf;
    let entry = entry_of(400, 42);

    {
        let engine = Engine::open(dir.path(), Options::default()).unwrap();
        engine.create_space(space).unwrap();
        leaf = engine.alloc_leaf_page(space, true).unwrap();
        assert!(engine.evict_page(space, leaf).unwrap());
        assert_eq!(
            engine
                .try_buffer_insert(PageKey::new(space, leaf), &entry, TxId(9))
                .unwrap(),
            Outcome::Deferred
        );
    }

    // Second incarnation runs the merge with the fault armed: the entry is
    // applied and the record delete-marked, then the engine "dies" before
    // the physical delete.
    {
        let opts = Options {
            crash_before_physical_delete: true,
            ..Options::default()
        };
        let engine = Engine::open(dir.path(), opts).unwrap();
        drop(engine.get_user_page(space, leaf).unwrap());
        // The crash point left the buffered bit set and the record behind.
        assert!(engine.bitmap_probe(space, leaf).unwrap().buffered);
        assert_eq!(
            engine
                .changebuf()
                .buffered_record_count(Some(space), Some(leaf))
                .unwrap(),
            1
        );
        assert_eq!(engine.leaf_records(space, leaf).unwrap(), vec![entry.payload()]);
    }

    // Third incarnation: the buffered bit triggers a benign re-merge. The
    // delete-marked record must not be applied a second time, only removed.
    let engine = Engine::open(dir.path(), Options::default()).unwrap();
    assert!(engine.bitmap_probe(space, leaf).unwrap().buffered);
    let frame = engine.get_user_page(space, leaf).unwrap();
    drop(frame);
    assert_eq!(engine.leaf_records(space, leaf).unwrap(), vec![entry.payload()]);
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
fn merge_reports_the_injected_crash_point() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let space = SpaceId(8);
    let opts = Options {
        crash_before_physical_delete: true,
        ..Options::default()
    };
    let engine = Engine::open(dir.path(), opts).unwrap();
    engine.create_space(space).unwrap();
    let leaf = engine.alloc_leaf_page(space, true).unwrap();
    let target = PageKey::new(space, leaf);
    assert!(engine.evict_page(space, leaf).unwrap());
    assert_eq!(
        engine.try_buffer_insert(target, &entry_of(100, 1), TxId(1)).unwrap(),
        Outcome::Deferred
    );

    let frame = engine.page_frame(space, leaf).unwrap();
    let outcome = engine
        .changebuf()
        .merge_for_page(antumbra::EntryContext::outside(), Some(&frame), target, true)
        .unwrap();
    assert_eq!(outcome, MergeOutcome::CrashPoint);
}

#[test]
fn reopening_is_idempotent() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let space = SpaceId(15);
    let leaf;

    {
        let engine = Engine::open(dir.path(), Options::default()).unwrap();
        engine.create_space(space).unwrap();
        leaf = engine.alloc_leaf_page(space, true).unwrap();
        assert!(engine.evict_page(space, leaf).unwrap());
        for i in 0..5u64 {
            engine
                .try_buffer_insert(PageKey::new(space, leaf), &entry_of(300, i), TxId(1))
                .unwrap();
        }
    }

    // Replaying the same log again from its start must land in the same
    // state: open, observe, close without new writes, open again.
    let first = {
        let engine = Engine::open(dir.path(), Options::default()).unwrap();
        (
            engine.status().seg_size,
            engine
                .changebuf()
                .buffered_record_count(Some(space), Some(leaf))
                .unwrap(),
        )
    };
    let second = {
        let engine = Engine::open(dir.path(), Options::default()).unwrap();
        (
            engine.status().seg_size,
            engine
                .changebuf()
                .buffered_record_count(Some(space), Some(leaf))
                .unwrap(),
        )
    };
    assert_eq!(first, second);
    assert_eq!(first.1, 5);
}
