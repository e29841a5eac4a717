//! Buffer pool: page frames shared between the kernel and the change buffer.
//!
//! Frames are keyed by `(space, page)` and carry a `parking_lot::RwLock` that
//! doubles as the page latch. Eviction only considers frames that are neither
//! latched nor io-fixed; dirty frames are written back first, which is safe
//! because every committed change already sits in the WAL.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::page::PAGE_SIZE;
use crate::space::SpaceManager;
use crate::types::{PageKey, Result, SpaceId};

#[derive(Debug)]
pub struct Frame {
    pub data: Box<[u8]>,
    pub dirty: bool,
    pub io_fixed: bool,
}

impl Frame {
    fn from_image(data: Box<[u8]>) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        Self {
            data,
            dirty: false,
            io_fixed: false,
        }
    }
}

pub type FrameRef = Arc<RwLock<Frame>>;

pub struct PagePool {
    capacity: usize,
    inner: Mutex<PoolInner>,
    row_locks: Mutex<FxHashSet<PageKey>>,
}

struct PoolInner {
    frames: FxHashMap<PageKey, FrameRef>,
    recency: LruCache<PageKey, ()>,
}

impl PagePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(PoolInner {
                frames: FxHashMap::default(),
                recency: LruCache::unbounded(),
            }),
            row_locks: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fetches the frame for `key`, reading it from the space file on a miss.
    pub fn get(&self, spaces: &SpaceManager, key: PageKey) -> Result<FrameRef> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get(&key) {
            let frame = Arc::clone(frame);
            inner.recency.promote(&key);
            return Ok(frame);
        }
        let image = spaces.read_page(key.space, key.page)?;
        let frame = Arc::new(RwLock::new(Frame::from_image(image)));
        inner.frames.insert(key, Arc::clone(&frame));
        inner.recency.put(key, ());
        self.evict_excess(&mut inner, spaces);
        Ok(frame)
    }

    /// True when the page has a frame in the pool, without touching recency.
    pub fn resident(&self, key: PageKey) -> bool {
        self.inner.lock().frames.contains_key(&key)
    }

    pub fn set_io_fixed(&self, frame: &FrameRef, fixed: bool) {
        frame.write().io_fixed = fixed;
    }

    /// Forces a page out of the pool, writing it back when dirty. Returns
    /// false when the frame is latched by someone else.
    pub fn evict(&self, spaces: &SpaceManager, key: PageKey) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(frame) = inner.frames.get(&key).cloned() else {
            return Ok(true);
        };
        let Some(mut guard) = frame.try_write() else {
            return Ok(false);
        };
        if guard.io_fixed {
            return Ok(false);
        }
        if guard.dirty {
            spaces.write_page(key.space, key.page, &guard.data)?;
            guard.dirty = false;
        }
        drop(guard);
        inner.frames.remove(&key);
        inner.recency.pop(&key);
        Ok(true)
    }

    fn evict_excess(&self, inner: &mut PoolInner, spaces: &SpaceManager) {
        while inner.frames.len() > self.capacity {
            let mut victim = None;
            for (key, _) in inner.recency.iter().rev() {
                let Some(frame) = inner.frames.get(key) else {
                    continue;
                };
                if let Some(mut guard) = frame.try_write() {
                    if guard.io_fixed {
                        continue;
                    }
                    if guard.dirty {
                        if spaces.write_page(key.space, key.page, &guard.data).is_err() {
                            continue;
                        }
                        guard.dirty = false;
                    }
                    victim = Some(*key);
                    break;
                }
            }
            match victim {
                Some(key) => {
                    inner.frames.remove(&key);
                    inner.recency.pop(&key);
                }
                None => break,
            }
        }
    }

    /// Writes every dirty frame back to its space file.
    pub fn flush_all(&self, spaces: &SpaceManager) -> Result<()> {
        let frames: Vec<(PageKey, FrameRef)> = {
            let inner = self.inner.lock();
            inner
                .frames
                .iter()
                .map(|(k, f)| (*k, Arc::clone(f)))
                .collect()
        };
        for (key, frame) in frames {
            let mut guard = frame.write();
            if guard.dirty {
                spaces.write_page(key.space, key.page, &guard.data)?;
                guard.dirty = false;
            }
        }
        Ok(())
    }

    /// Drops every frame of a space without write-back. Used when the space
    /// itself is going away.
    pub fn discard_space(&self, space: SpaceId) {
        let mut inner = self.inner.lock();
        let keys: Vec<PageKey> = inner
            .frames
            .keys()
            .filter(|k| k.space == space)
            .copied()
            .collect();
        for key in keys {
            inner.frames.remove(&key);
            inner.recency.pop(&key);
        }
    }

    /// Marks or clears an explicit row lock on a page. The change buffer
    /// refuses to defer modifications for pages with row locks.
    pub fn set_row_locked(&self, key: PageKey, locked: bool) {
        let mut locks = self.row_locks.lock();
        if locked {
            locks.insert(key);
        } else {
            locks.remove(&key);
        }
    }

    pub fn row_locks_exist(&self, key: PageKey) -> bool {
        self.row_locks.lock().contains(&key)
    }
}
