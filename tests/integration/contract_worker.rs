mod util;

use std::time::{Duration, Instant};

use antumbra::{Options, Outcome, PageKey, SpaceId, TxId};
use util::{assert_size_invariant, entry_of, open_engine};

fn seed_buffered_load(
    engine: &antumbra::Engine,
    space: SpaceId,
    leaves: usize,
    per_leaf: usize,
    entry_len: usize,
) -> Vec<antumbra::PageNo> {
    engine.create_space(space).unwrap();
    let mut pages = Vec::new();
    for _ in 0..leaves {
        let leaf = engine.alloc_leaf_page(space, true).unwrap();
        assert!(engine.evict_page(space, leaf).unwrap());
        pages.push(leaf);
    }
    let mut seed = 0u64;
    for &leaf in &pages {
        for _ in 0..per_leaf {
            assert_eq!(
                engine
                    .try_buffer_insert(PageKey::new(space, leaf), &entry_of(entry_len, seed), TxId(1))
                    .unwrap(),
                Outcome::Deferred
            );
            seed += 1;
        }
    }
    pages
}

#[test]
fn contraction_drains_the_buffer() {
    let (_dir, engine) = open_engine(Options::default());
    let space = SpaceId(21);
    let leaves = seed_buffered_load(&engine, space, 10, 3, 400);

    let mut rounds = 0;
    loop {
        let (bytes, _pages) = engine.contract(true).unwrap();
        if bytes == 0 {
            break;
        }
        rounds += 1;
        assert!(rounds < 1000, "contraction failed to converge");
    }

    assert_eq!(
        engine.changebuf().buffered_record_count(None, None).unwrap(),
        0
    );
    for &leaf in &leaves {
        assert_eq!(engine.leaf_records(space, leaf).unwrap().len(), 3);
        assert!(!engine.bitmap_probe(space, leaf).unwrap().buffered);
    }
    assert!(engine.changebuf().is_empty().unwrap());
    assert!(engine.status().empty);
    assert_size_invariant(&engine.status());
}

#[test]
fn background_contractor_enforces_the_ceiling() {
    util::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let space = SpaceId(22);
    {
        // Seed under a roomy ceiling so nothing contracts during setup.
        let engine = antumbra::Engine::open(dir.path(), Options::default()).unwrap();
        seed_buffered_load(&engine, space, 20, 4, 700);
        assert!(engine.status().size > 1);
        engine.checkpoint().unwrap();
    }
    // Reopen with a one-page ceiling: the buffer is now far oversized.
    let opts = Options {
        max_size_pages: 1,
        cache_pages: 256,
        ..Options::default()
    };
    let engine = antumbra::Engine::open(dir.path(), opts).unwrap();
    assert!(engine.status().size > 1);

    engine.start_contractor(Duration::from_millis(5));
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if engine.status().size <= 1 || Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    engine.stop_contractor();

    // The worker contracts until the tree fits the ceiling again; it does
    // not owe us a completely empty buffer.
    let status = engine.status();
    assert!(
        status.size <= 1,
        "the worker should have shrunk the tree to its ceiling: {status:?}"
    );
    assert_size_invariant(&status);
}

#[test]
fn excess_free_pages_go_back_to_the_space() {
    let (_dir, engine) = open_engine(Options::default());
    let space = SpaceId(23);
    seed_buffered_load(&engine, space, 30, 5, 1000);

    // Drain everything; the shed tree pages pile up on the free list.
    let merged = engine
        .changebuf()
        .contract_for_n_pages(antumbra::EntryContext::outside(), true, usize::MAX)
        .unwrap();
    assert!(merged > 0);
    let loaded = engine.status();
    assert_size_invariant(&loaded);
    assert!(loaded.free_list_len > 0);

    for _ in 0..16 {
        engine.changebuf().free_excess_pages().unwrap();
    }
    let trimmed = engine.status();
    assert_size_invariant(&trimmed);
    assert!(
        trimmed.seg_size <= loaded.seg_size,
        "freeing excess pages must not grow the segment"
    );
    // The free list sits at or below the shrink threshold now.
    assert!(trimmed.free_list_len <= 3 + trimmed.size / 2 + 3 * trimmed.height as usize);
}

#[test]
fn count_mode_tallies_without_buffering() {
    let opts = Options {
        mode: antumbra::BufferMode::Count,
        ..Options::default()
    };
    let (_dir, engine) = open_engine(opts);
    let space = SpaceId(24);
    engine.create_space(space).unwrap();
    let leaf = engine.alloc_leaf_page(space, true).unwrap();
    assert!(engine.evict_page(space, leaf).unwrap());

    for i in 0..3u64 {
        assert_eq!(
            engine
                .try_buffer_insert(PageKey::new(space, leaf), &entry_of(100, i), TxId(1))
                .unwrap(),
            Outcome::RejectedTryAgain
        );
    }
    let status = engine.status();
    assert_eq!(status.n_counted, 3);
    assert_eq!(status.n_inserts, 0);
    assert_eq!(
        engine.changebuf().buffered_record_count(None, None).unwrap(),
        0
    );
}
