//! # Antumbra - storage-engine kernel with a change buffer
//!
//! Antumbra is the core of a page-based B-tree storage engine whose
//! headline subsystem is the **change buffer**: a persistent, crash-safe
//! auxiliary B-tree that defers modifications to secondary-index leaf pages
//! that are not resident in the buffer pool. Deferred modifications are
//! merged into their target page when an unrelated read brings the page in,
//! when a background contraction schedules it, or purged outright when the
//! tablespace is dropped.
//!
//! ## Quick start
//!
//! ```no_run
//! use antumbra::{Engine, Options, Outcome, PageKey, SpaceId, TxId};
//!
//! let engine = Engine::open("my_engine_dir", Options::default())?;
//! engine.create_space(SpaceId(7))?;
//! let leaf = engine.alloc_leaf_page(SpaceId(7), true)?;
//! let target = PageKey::new(SpaceId(7), leaf);
//!
//! # let entry = antumbra::Tuple::default();
//! match engine.try_buffer_insert(target, &entry, TxId(1))? {
//!     Outcome::Deferred => {}                      // buffered; done
//!     _ => engine.apply_insert(target, &entry, TxId(1))?, // apply directly
//! }
//! # Ok::<(), antumbra::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - **Kernel**: slotted pages ([`page`]), a buffer pool with page latches
//!   ([`pool`]), mini-transactions over a redo log ([`mtr`], [`wal`]) and
//!   per-tablespace files ([`space`]).
//! - **Auxiliary tree** ([`btree`]): byte-string records, fixed root, page
//!   consumption fed by the change buffer's own free list.
//! - **Change buffer** ([`changebuf`]): bitmaps, record codec, free list,
//!   buffering, merge, discard and the background contractor.

pub mod btree;
pub mod changebuf;
pub mod db;
pub mod mtr;
pub mod page;
pub mod pool;
pub mod space;
pub mod types;
pub mod wal;

pub use changebuf::codec::{BufferedOp, Field, FieldKind, FieldType, Tuple};
pub use changebuf::{
    BufferMode, ChangeBufStatus, ChangeBuffer, EntryContext, MergeOutcome, Options, Outcome,
};
pub use db::Engine;
pub use types::{Error, PageKey, PageNo, Result, SpaceId, TxId};
