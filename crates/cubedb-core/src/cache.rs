//! Version-validated result cache.
//!
//! Memoizes the final value computed for a general address. An entry records
//! the cube's structure stamp, rules version and data version at publish
//! time; a lookup only returns the entry when all three still match, so a
//! fact write, rule change or committed dimension edit makes every older
//! entry unreachable without an eager flush. Stale entries found during
//! lookup are discarded on the spot.
//!
//! Bounded by an access-tick LRU: when full, the oldest eighth of the
//! entries is evicted in one batch.

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::dimension::MemberId;
use crate::CellValue;

/// The cube version triple an entry is valid against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VersionStamp {
    /// Sum of the cube's dimensions' structure versions; strictly increases
    /// with every commit.
    pub structure: u64,
    pub rules: u64,
    pub data: u64,
}

struct Entry {
    value: CellValue,
    stamp: VersionStamp,
    last_used: u64,
}

struct Inner {
    map: AHashMap<Vec<MemberId>, Entry>,
    tick: u64,
}

pub(crate) struct ResultCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                map: AHashMap::new(),
                tick: 0,
            }),
        }
    }

    pub fn lookup(&self, addr: &[MemberId], stamp: VersionStamp) -> Option<CellValue> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        match inner.map.get_mut(addr) {
            Some(entry) if entry.stamp == stamp => {
                entry.last_used = tick;
                Some(entry.value)
            }
            Some(_) => {
                inner.map.remove(addr);
                None
            }
            None => None,
        }
    }

    pub fn publish(&self, addr: Vec<MemberId>, value: CellValue, stamp: VersionStamp) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if inner.map.len() >= self.capacity && !inner.map.contains_key(&addr) {
            evict_oldest(&mut inner.map, self.capacity);
        }
        inner.map.insert(
            addr,
            Entry {
                value,
                stamp,
                last_used: tick,
            },
        );
    }

    pub fn clear(&self) {
        self.inner.lock().map.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }
}

fn evict_oldest(map: &mut AHashMap<Vec<MemberId>, Entry>, capacity: usize) {
    let mut ticks: Vec<u64> = map.values().map(|e| e.last_used).collect();
    ticks.sort_unstable();
    // Drop the oldest eighth, at least one entry.
    let cut = ticks[(capacity / 8).min(ticks.len() - 1)];
    map.retain(|_, e| e.last_used > cut);
}
