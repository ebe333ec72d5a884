//! Fixed-capacity concurrent hash table.
//!
//! Behaves like a preallocated BPF hash map: a hard entry ceiling, no
//! growth, no eviction, and an atomic insert-if-absent. Values are
//! allocated up front and are expected to be made of atomics, so callers
//! mutate them in place through shared references.
//!
//! Each slot word carries a state in its low two bits and the key's hash
//! above them. A slot moves EMPTY -> CLAIMED -> READY and never goes back
//! while shared. Lookups treat a CLAIMED slot as absent and keep probing,
//! so they never wait. An inserter only waits on a CLAIMED slot whose hash
//! tag matches its own, since that claim may be for the same key.
//!
//! Capacity is reserved when an inserter reaches the first EMPTY slot of
//! its chain and is given back if the key turns out to be present. Right
//! at the ceiling a caller can therefore see [`Insert::Full`] while a
//! concurrent caller is inserting the same key.

use std::cell::UnsafeCell;
use std::hash::{BuildHasher, BuildHasherDefault, Hash, Hasher};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const STATE_MASK: u64 = 0b11;
const EMPTY: u64 = 0;
const CLAIMED: u64 = 1;
const READY: u64 = 2;

fn tag(hash: u64) -> u64 {
    hash & !STATE_MASK
}

/// 64-bit FNV-1a.
#[derive(Debug, Clone, Copy)]
pub struct FnvHasher(u64);

impl Default for FnvHasher {
    fn default() -> Self {
        FnvHasher(0xcbf2_9ce4_8422_2325)
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        let prime: u64 = 0x0100_0000_01b3;
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(prime);
        }
    }
}

type FnvBuildHasher = BuildHasherDefault<FnvHasher>;

/// Outcome of [`FixedTable::insert_with`].
#[derive(Debug)]
pub enum Insert<'a, V> {
    /// This call created the entry.
    Inserted(&'a V),
    /// The key was already present, possibly inserted by a concurrent caller.
    Present(&'a V),
    /// The key is absent and the table holds `capacity` entries.
    Full,
}

impl<'a, V> Insert<'a, V> {
    /// The entry, whoever created it.
    pub fn entry(self) -> Option<&'a V> {
        match self {
            Insert::Inserted(v) | Insert::Present(v) => Some(v),
            Insert::Full => None,
        }
    }
}

struct Slot<K, V> {
    word: AtomicU64,
    key: UnsafeCell<MaybeUninit<K>>,
    value: V,
}

impl<K: Copy, V> Slot<K, V> {
    /// # Safety
    ///
    /// The caller must have observed `READY` with acquire ordering.
    unsafe fn key(&self) -> &K {
        (*self.key.get()).assume_init_ref()
    }
}

/// Open-addressing table with linear probing and a hard entry ceiling.
pub struct FixedTable<K, V> {
    slots: Box<[Slot<K, V>]>,
    mask: usize,
    capacity: usize,
    len: AtomicUsize,
    hasher: FnvBuildHasher,
}

// Keys are written once by the claiming thread before the release store of
// READY and only read after an acquire load of READY.
unsafe impl<K: Send, V: Send> Send for FixedTable<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for FixedTable<K, V> {}

impl<K, V> FixedTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Default,
{
    /// Preallocate a table holding at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        let slot_count = capacity.saturating_mul(2).max(2).next_power_of_two();
        let slots = (0..slot_count)
            .map(|_| Slot {
                word: AtomicU64::new(EMPTY),
                key: UnsafeCell::new(MaybeUninit::uninit()),
                value: V::default(),
            })
            .collect();

        Self {
            slots,
            mask: slot_count - 1,
            capacity,
            len: AtomicUsize::new(0),
            hasher: FnvBuildHasher::default(),
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of published entries plus reservations held by inserts in
    /// flight.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hash(&self, key: &K) -> u64 {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    fn home(&self, hash: u64) -> usize {
        (hash as usize) & self.mask
    }

    fn reserve(&self) -> bool {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    /// Look up a published entry. Never waits on a concurrent insert.
    pub fn get(&self, key: &K) -> Option<&V> {
        let hash = self.hash(key);
        let ready = tag(hash) | READY;
        let mut idx = self.home(hash);
        for _ in 0..self.slots.len() {
            let slot = &self.slots[idx];
            let word = slot.word.load(Ordering::Acquire);
            if word == EMPTY {
                return None;
            }
            // SAFETY: the slot is READY.
            if word == ready && unsafe { slot.key() } == key {
                return Some(&slot.value);
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Insert `key` if it is absent, running `init` on the fresh value before
    /// the entry becomes visible. Among concurrent callers for the same key
    /// at most one sees [`Insert::Inserted`].
    pub fn insert_with<F>(&self, key: &K, init: F) -> Insert<'_, V>
    where
        F: FnOnce(&V),
    {
        let hash = self.hash(key);
        let claimed = tag(hash) | CLAIMED;
        let ready = tag(hash) | READY;
        let mut idx = self.home(hash);
        let mut reserved = false;
        let mut probes = 0;

        while probes < self.slots.len() {
            let slot = &self.slots[idx];
            let word = slot.word.load(Ordering::Acquire);
            if word == EMPTY {
                if !reserved {
                    if !self.reserve() {
                        return Insert::Full;
                    }
                    reserved = true;
                }
                if slot
                    .word
                    .compare_exchange(EMPTY, claimed, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    // Lost the slot, look at what the winner put there.
                    continue;
                }
                // SAFETY: the claim gives this thread exclusive access to the key.
                unsafe {
                    (*slot.key.get()).write(*key);
                }
                init(&slot.value);
                slot.word.store(ready, Ordering::Release);
                return Insert::Inserted(&slot.value);
            }
            if word == claimed {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: the slot is READY.
            if word == ready && unsafe { slot.key() } == key {
                if reserved {
                    self.len.fetch_sub(1, Ordering::AcqRel);
                }
                return Insert::Present(&slot.value);
            }
            idx = (idx + 1) & self.mask;
            probes += 1;
        }

        if reserved {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        Insert::Full
    }

    /// Visit every published entry. Entries inserted concurrently may or may
    /// not be seen.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.slots.iter().filter_map(|slot| {
            if slot.word.load(Ordering::Acquire) & STATE_MASK == READY {
                // SAFETY: the slot is READY.
                Some((unsafe { *slot.key() }, &slot.value))
            } else {
                None
            }
        })
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot.word.get_mut() = EMPTY;
            slot.value = V::default();
        }
        *self.len.get_mut() = 0;
    }
}
