//! Open-addressed hash table over `Py<PyAny>` key/value handles.
//!
//! Linear probing, metadata byte per slot (`EMPTY`/`TOMBSTONE`/`H2`), 70%
//! max load factor on occupancy (live entries plus tombstones), resized to
//! fit live size. Knows nothing about the facade's mutation modes — it's
//! purely the mapping primitive those modes gate.

use pyo3::prelude::*;

use crate::error::allocation_failure;

pub const EMPTY: u8 = 0;
pub const TOMBSTONE: u8 = 1;

pub const MIN_CAPACITY: usize = 16;
const LOAD_FACTOR_NUM: usize = 7;
const LOAD_FACTOR_DEN: usize = 10;

#[inline(always)]
fn h1(hash: isize, capacity: usize) -> usize {
    (hash as usize) & (capacity - 1)
}

#[inline(always)]
fn h2(hash: isize) -> u8 {
    let top = ((hash as usize) >> (usize::BITS - 8)) as u8;
    (top | 2) & 0xFF
}

fn next_pow2_at_least(n: usize, min: usize) -> usize {
    n.max(min).next_power_of_two()
}

pub struct HashCore {
    capacity: usize,
    size: usize,
    /// Slots with `meta != EMPTY`, i.e. live entries plus tombstones. Tracked
    /// separately from `size` because tombstones are reclaimed only by a
    /// resize: gating resize on `size` alone lets occupancy reach `capacity`
    /// with no EMPTY slot left while `size` is still under the load factor,
    /// which breaks every probe's termination guarantee.
    used: usize,
    meta: Vec<u8>,
    hash: Vec<isize>,
    key: Vec<Option<Py<PyAny>>>,
    val: Vec<Option<Py<PyAny>>>,
}

impl HashCore {
    /// Allocate a fresh table. `requested_capacity` is rounded up to a power
    /// of two and to at least `MIN_CAPACITY`. Allocation is all-at-once via
    /// `try_reserve_exact`, so an OOM here is a catchable error, not an abort.
    pub fn new(requested_capacity: usize) -> PyResult<Self> {
        let capacity = next_pow2_at_least(requested_capacity, MIN_CAPACITY);
        Self::with_capacity(capacity)
    }

    fn with_capacity(capacity: usize) -> PyResult<Self> {
        let mut meta = Vec::new();
        meta.try_reserve_exact(capacity)
            .map_err(|e| allocation_failure(format!("failed to allocate hash table: {e}")))?;
        meta.resize(capacity, EMPTY);

        let mut hash = Vec::new();
        hash.try_reserve_exact(capacity)
            .map_err(|e| allocation_failure(format!("failed to allocate hash table: {e}")))?;
        hash.resize(capacity, 0);

        let mut key: Vec<Option<Py<PyAny>>> = Vec::new();
        key.try_reserve_exact(capacity)
            .map_err(|e| allocation_failure(format!("failed to allocate hash table: {e}")))?;
        key.resize_with(capacity, || None);

        let mut val: Vec<Option<Py<PyAny>>> = Vec::new();
        val.try_reserve_exact(capacity)
            .map_err(|e| allocation_failure(format!("failed to allocate hash table: {e}")))?;
        val.resize_with(capacity, || None);

        Ok(HashCore {
            capacity,
            size: 0,
            used: 0,
            meta,
            hash,
            key,
            val,
        })
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Gates on occupancy (`used`: live + tombstone), not live `size` — a
    /// probe must still reach an EMPTY slot within `capacity` steps even
    /// when most of that occupancy is tombstones from prior deletes.
    fn needs_resize_for_one_more(&self) -> bool {
        (self.used + 1) * LOAD_FACTOR_DEN > LOAD_FACTOR_NUM * self.capacity
    }

    /// Smallest power-of-two capacity that keeps `target_live_size` within
    /// the load factor. Resize always rebuilds tombstone-free, so sizing off
    /// live entries (rather than doubling blindly) means a run of
    /// delete/insert churn rebuilds at the same capacity instead of growing
    /// forever.
    fn capacity_for_live_size(target_live_size: usize) -> usize {
        let min_capacity =
            (target_live_size * LOAD_FACTOR_DEN).div_ceil(LOAD_FACTOR_NUM);
        next_pow2_at_least(min_capacity, MIN_CAPACITY)
    }

    pub fn get(&self, py: Python<'_>, key: &Bound<'_, PyAny>) -> PyResult<Option<Py<PyAny>>> {
        let hash = key.hash()?;
        let target_h2 = h2(hash);
        let mask = self.capacity - 1;
        let mut idx = h1(hash, self.capacity);

        for _ in 0..self.capacity {
            match self.meta[idx] {
                EMPTY => return Ok(None),
                TOMBSTONE => {}
                m if m == target_h2 => {
                    if let Some(stored) = &self.key[idx] {
                        if key.eq(stored.bind(py))? {
                            return Ok(self.val[idx].as_ref().map(|v| v.clone_ref(py)));
                        }
                    }
                }
                _ => {}
            }
            idx = (idx + 1) & mask;
        }
        Ok(None)
    }

    /// Insert or overwrite. Returns nothing — callers that need to know
    /// whether the key was new should `get()` first (the facade does this to
    /// decide between "insert" and "update" mode permissions).
    pub fn set(&mut self, py: Python<'_>, key: Py<PyAny>, val: Py<PyAny>) -> PyResult<()> {
        if self.needs_resize_for_one_more() {
            self.resize(Self::capacity_for_live_size(self.size + 1))?;
        }

        let bound_key = key.bind(py).clone();
        let hash = bound_key.hash()?;
        let target_h2 = h2(hash);
        let mask = self.capacity - 1;
        let mut idx = h1(hash, self.capacity);
        let mut first_deleted: Option<usize> = None;

        for _ in 0..self.capacity {
            match self.meta[idx] {
                EMPTY => {
                    let reused_tombstone = first_deleted.is_some();
                    let target = first_deleted.unwrap_or(idx);
                    self.meta[target] = target_h2;
                    self.hash[target] = hash;
                    self.key[target] = Some(key);
                    self.val[target] = Some(val);
                    self.size += 1;
                    if !reused_tombstone {
                        self.used += 1;
                    }
                    return Ok(());
                }
                TOMBSTONE => {
                    if first_deleted.is_none() {
                        first_deleted = Some(idx);
                    }
                }
                m if m == target_h2 => {
                    if let Some(stored) = &self.key[idx] {
                        if bound_key.eq(stored.bind(py))? {
                            self.val[idx] = Some(val);
                            return Ok(());
                        }
                    }
                }
                _ => {}
            }
            idx = (idx + 1) & mask;
        }

        // Unreachable given invariant (2): `used` (live + tombstone) is kept
        // at <=70% capacity by the resize check above, so a probe always
        // finds an EMPTY or matching slot before wrapping the whole table.
        // Logged rather than panicking across the FFI boundary.
        log::error!("hash table probe exhausted capacity without finding a slot");
        Err(allocation_failure("internal hash table invariant violated"))
    }

    /// Remove the entry for `key`, if present, returning its value.
    pub fn delete(&mut self, py: Python<'_>, key: &Bound<'_, PyAny>) -> PyResult<Option<Py<PyAny>>> {
        let hash = key.hash()?;
        let target_h2 = h2(hash);
        let mask = self.capacity - 1;
        let mut idx = h1(hash, self.capacity);

        for _ in 0..self.capacity {
            match self.meta[idx] {
                EMPTY => return Ok(None),
                TOMBSTONE => {}
                m if m == target_h2 => {
                    if let Some(stored) = &self.key[idx] {
                        if key.eq(stored.bind(py))? {
                            self.meta[idx] = TOMBSTONE;
                            self.key[idx] = None;
                            let removed = self.val[idx].take();
                            self.size -= 1;
                            return Ok(removed);
                        }
                    }
                }
                _ => {}
            }
            idx = (idx + 1) & mask;
        }
        Ok(None)
    }

    /// Remove the first occupied slot in index order. Used by `popitem()`.
    pub fn pop_first_occupied(&mut self) -> Option<(Py<PyAny>, Py<PyAny>)> {
        for idx in 0..self.capacity {
            if self.meta[idx] >= 2 {
                self.meta[idx] = TOMBSTONE;
                let key = self.key[idx].take().expect("occupied slot has a key");
                let val = self.val[idx].take().expect("occupied slot has a value");
                self.size -= 1;
                return Some((key, val));
            }
        }
        None
    }

    pub fn clear(&mut self) {
        for idx in 0..self.capacity {
            if self.meta[idx] >= 2 {
                self.meta[idx] = EMPTY;
                self.key[idx] = None;
                self.val[idx] = None;
            }
        }
        self.size = 0;
        self.used = 0;
    }

    /// Rebuild at `new_capacity` (rounded up to a power of two), dropping
    /// every tombstone. Re-inserts each occupied entry using its cached hash
    /// — no host `hash()`/`equals()` call, since every key in the old table
    /// is already known-distinct and the fresh table starts all-EMPTY. That
    /// means this can only fail on allocation, never mid-reinsert. Since the
    /// caller sizes `new_capacity` off live `size`, a run of delete/insert
    /// churn rebuilds at the same capacity instead of growing.
    fn resize(&mut self, new_capacity: usize) -> PyResult<()> {
        let new_capacity = next_pow2_at_least(new_capacity, MIN_CAPACITY);
        let mut next = HashCore::with_capacity(new_capacity)?;

        for idx in 0..self.capacity {
            if self.meta[idx] >= 2 {
                let hash = self.hash[idx];
                let key = self.key[idx].take().expect("occupied slot has a key");
                let val = self.val[idx].take().expect("occupied slot has a value");
                next.insert_fresh(hash, key, val);
            }
        }

        log::debug!(
            "resized hash table: {} -> {} (size {})",
            self.capacity,
            next.capacity,
            self.size
        );
        *self = next;
        Ok(())
    }

    /// Insert into a table known to contain no entry equal to `key` and no
    /// tombstones (used only during resize). Skips `equals()` entirely.
    fn insert_fresh(&mut self, hash: isize, key: Py<PyAny>, val: Py<PyAny>) {
        let mask = self.capacity - 1;
        let mut idx = h1(hash, self.capacity);
        loop {
            if self.meta[idx] == EMPTY {
                self.meta[idx] = h2(hash);
                self.hash[idx] = hash;
                self.key[idx] = Some(key);
                self.val[idx] = Some(val);
                self.size += 1;
                self.used += 1;
                return;
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Scan order used by every snapshot helper below and by `popitem`.
    fn occupied_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.capacity).filter(move |&i| self.meta[i] >= 2)
    }

    pub fn keys_snapshot(&self, py: Python<'_>) -> Vec<Py<PyAny>> {
        self.occupied_indices()
            .map(|i| self.key[i].as_ref().unwrap().clone_ref(py))
            .collect()
    }

    pub fn values_snapshot(&self, py: Python<'_>) -> Vec<Py<PyAny>> {
        self.occupied_indices()
            .map(|i| self.val[i].as_ref().unwrap().clone_ref(py))
            .collect()
    }

    pub fn items_snapshot(&self, py: Python<'_>) -> Vec<(Py<PyAny>, Py<PyAny>)> {
        self.occupied_indices()
            .map(|i| {
                (
                    self.key[i].as_ref().unwrap().clone_ref(py),
                    self.val[i].as_ref().unwrap().clone_ref(py),
                )
            })
            .collect()
    }

    /// Shallow copy: fresh arrays at the same capacity, every handle
    /// `clone_ref`'d (not deep-copied).
    pub fn shallow_copy(&self, py: Python<'_>) -> PyResult<HashCore> {
        let mut copy = HashCore::with_capacity(self.capacity)?;
        copy.meta.copy_from_slice(&self.meta);
        copy.hash.copy_from_slice(&self.hash);
        for i in 0..self.capacity {
            copy.key[i] = self.key[i].as_ref().map(|k| k.clone_ref(py));
            copy.val[i] = self.val[i].as_ref().map(|v| v.clone_ref(py));
        }
        copy.size = self.size;
        copy.used = self.used;
        Ok(copy)
    }

    /// Visit every occupied handle — used by the facade's `__traverse__`
    /// for CPython's cyclic garbage collector.
    pub fn for_each_handle(&self, mut f: impl FnMut(&Py<PyAny>)) {
        for i in self.occupied_indices() {
            if let Some(k) = &self.key[i] {
                f(k);
            }
            if let Some(v) = &self.val[i] {
                f(v);
            }
        }
    }
}
