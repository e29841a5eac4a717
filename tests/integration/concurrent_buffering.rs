mod util;

use std::sync::atomic::{AtomicUsize, Ordering};

use antumbra::{Options, Outcome, PageKey, SpaceId, TxId};
use util::{assert_size_invariant, entry_of, open_engine};

#[test]
fn parallel_buffering_is_atomic_per_operation() {
    let (_dir, engine) = open_engine(Options::default());
    let space = SpaceId(31);
    engine.create_space(space).unwrap();

    let mut leaves = Vec::new();
    for _ in 0..8 {
        let leaf = engine.alloc_leaf_page(space, true).unwrap();
        assert!(engine.evict_page(space, leaf).unwrap());
        leaves.push(leaf);
    }

    const THREADS: usize = 4;
    const OPS_PER_THREAD: usize = 40;
    let deferred = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for tid in 0..THREADS {
            let engine = &engine;
            let leaves = &leaves;
            let deferred = &deferred;
            scope.spawn(move || {
                for i in 0..OPS_PER_THREAD {
                    let leaf = leaves[(tid + i) % leaves.len()];
                    let seed = (tid * OPS_PER_THREAD + i) as u64;
                    let outcome = engine
                        .try_buffer_insert(
                            PageKey::new(space, leaf),
                            &entry_of(150, seed),
                            TxId(seed + 1),
                        )
                        .unwrap();
                    match outcome {
                        Outcome::Deferred => {
                            deferred.fetch_add(1, Ordering::Relaxed);
                        }
                        Outcome::RejectedTryAgain | Outcome::RejectedBitmapFull => {}
                        Outcome::RejectedTooBig => panic!("150-byte entries are never too big"),
                    }
                }
            });
        }
    });

    let deferred = deferred.load(Ordering::Relaxed);
    engine.changebuf().validate_tree().unwrap();
    assert_size_invariant(&engine.status());

    // Every deferred operation is visible exactly once after the merges;
    // none of the rejected ones left anything behind.
    let buffered_total = engine.changebuf().buffered_record_count(None, None).unwrap();
    let mut applied_total = 0usize;
    for &leaf in &leaves {
        drop(engine.get_user_page(space, leaf).unwrap());
        assert!(!engine.bitmap_probe(space, leaf).unwrap().buffered);
        applied_total += engine.leaf_records(space, leaf).unwrap().len();
    }
    assert_eq!(applied_total, deferred);
    // Whatever was buffered before the reads is gone now.
    assert!(buffered_total <= deferred);
    assert_eq!(engine.changebuf().buffered_record_count(None, None).unwrap(), 0);
    assert_eq!(engine.status().n_inserts as usize, deferred);
}
