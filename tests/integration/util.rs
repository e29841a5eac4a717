#![allow(dead_code)]

use std::sync::Once;

use antumbra::{ChangeBufStatus, Engine, Field, FieldKind, FieldType, Options, Tuple};
use tempfile::TempDir;

pub fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn open_engine(opts: Options) -> (TempDir, Engine) {
    init_tracing();
    let dir = tempfile::tempdir().expect("tmpdir");
    let engine = Engine::open(dir.path(), opts).expect("open engine");
    (dir, engine)
}

/// An entry with one opaque binary field of `len` value bytes, keyed by
/// `seed` so entries stay distinct. Its on-page footprint is `len + 8`.
pub fn entry_of(len: usize, seed: u64) -> Tuple {
    let mut value = vec![0xA5u8; len];
    let seed_bytes = seed.to_be_bytes();
    let n = seed_bytes.len().min(len);
    value[..n].copy_from_slice(&seed_bytes[..n]);
    Tuple {
        fields: vec![Field {
            ty: FieldType {
                kind: FieldKind::Binary,
                len: 0,
                charset: 0,
                nullable: true,
            },
            value: Some(value),
        }]
        .into(),
    }
}

/// Size bookkeeping invariant: tree pages plus free-list pages plus the
/// header account for the whole segment.
pub fn assert_size_invariant(status: &ChangeBufStatus) {
    assert_eq!(
        status.size + status.free_list_len + 1,
        status.seg_size,
        "size bookkeeping out of sync: {status:?}"
    );
}
