//! UDP query-id multiplexing.
//!
//! Maps 16-bit transaction ids to in-flight query state in one of two modes,
//! chosen process-wide at startup:
//!
//! - **Sequential** (default): a fixed table of slots indexed by a monotonic
//!   offset. Each slot carries its own try-acquire guard, so a `save → get`
//!   pair on the same id and a `save → expiry` race are both resolved by
//!   whoever acquires the slot first.
//! - **Randomized**: a sparse map keyed by random ids, guarded as a whole.
//!
//! Either way an id is allocated at most once between dispatch and
//! reclamation; a collision evicts the previous occupant, which the owner
//! reports as a reuse plus a synthesized timeout.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use rand::Rng;

use crate::query::PendingQuery;

/// One slot of the sequential table.
///
/// `state` is the slot guard: mutation happens only under its (try-)lock.
/// `in_use` mirrors whether the slot holds a query so the sweep can skip
/// empty slots without touching the lock.
struct IdSlot {
    in_use: AtomicBool,
    age: AtomicU32,
    state: Mutex<Option<PendingQuery>>,
}

impl IdSlot {
    fn empty() -> Self {
        Self {
            in_use: AtomicBool::new(false),
            age: AtomicU32::new(0),
            state: Mutex::new(None),
        }
    }
}

/// Fixed-size slot table addressed by `offset mod len`.
pub(crate) struct SequentialIdTable {
    slots: Vec<IdSlot>,
    offset: AtomicU64,
}

impl SequentialIdTable {
    pub(crate) fn new(size: u16) -> Self {
        let size = usize::from(size).max(1);
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, IdSlot::empty);
        Self {
            slots,
            offset: AtomicU64::new(0),
        }
    }

    /// Store `query`, returning the allocated id and any evicted occupant.
    pub(crate) fn save(&self, query: PendingQuery) -> (u16, Option<PendingQuery>) {
        loop {
            let next = self.offset.fetch_add(1, Ordering::Relaxed);
            let id = (next % self.slots.len() as u64) as u16;
            let slot = &self.slots[usize::from(id)];
            let Ok(mut state) = slot.state.try_lock() else {
                continue;
            };
            let evicted = state.replace(query);
            slot.age.store(0, Ordering::Relaxed);
            slot.in_use.store(true, Ordering::Relaxed);
            return (id, evicted);
        }
    }

    /// Place `query` back into slot `id` if it is free.
    ///
    /// On a busy slot (or a busy guard, or an out-of-range id) the incoming
    /// query is handed back for the caller to account as a reuse.
    pub(crate) fn restore(&self, id: u16, query: PendingQuery) -> Result<(), PendingQuery> {
        let Some(slot) = self.slots.get(usize::from(id)) else {
            return Err(query);
        };
        let Ok(mut state) = slot.state.try_lock() else {
            return Err(query);
        };
        if state.is_some() {
            return Err(query);
        }
        *state = Some(query);
        slot.age.store(0, Ordering::Relaxed);
        slot.in_use.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Take the query stored under `id`, if any.
    pub(crate) fn take(&self, id: u16) -> Option<PendingQuery> {
        let slot = self.slots.get(usize::from(id))?;
        let Ok(mut state) = slot.state.try_lock() else {
            return None;
        };
        let taken = state.take();
        if taken.is_some() {
            slot.in_use.store(false, Ordering::Relaxed);
        }
        taken
    }

    /// Age every occupied slot by one tick and drain the expired ones.
    ///
    /// A slot expires once its age exceeds `timeout_ticks`. Slots whose
    /// guard is busy are left for the next pass; the owner of the guard
    /// decides their fate.
    pub(crate) fn sweep_expired(
        &self,
        timeout_ticks: u32,
        mut on_expire: impl FnMut(PendingQuery),
    ) {
        for slot in &self.slots {
            if !slot.in_use.load(Ordering::Relaxed) {
                continue;
            }
            if slot.age.load(Ordering::Relaxed) <= timeout_ticks {
                slot.age.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let Ok(mut state) = slot.state.try_lock() else {
                continue;
            };
            // Recheck under the guard: a concurrent save resets the age.
            if slot.age.load(Ordering::Relaxed) > timeout_ticks {
                if let Some(query) = state.take() {
                    slot.in_use.store(false, Ordering::Relaxed);
                    slot.age.store(0, Ordering::Relaxed);
                    drop(state);
                    on_expire(query);
                }
            }
        }
    }

    /// Number of occupied slots.
    pub(crate) fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.in_use.load(Ordering::Relaxed))
            .count()
    }
}

struct MapSlot {
    age: u32,
    query: PendingQuery,
}

/// Sparse id map used in randomized mode.
pub(crate) struct RandomizedIdMap {
    map: Mutex<HashMap<u16, MapSlot>>,
}

impl RandomizedIdMap {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Store `query` under a random absent id.
    ///
    /// Draws up to five candidates; if every one collides, the last
    /// candidate is forcibly evicted and returned.
    pub(crate) fn save(&self, query: PendingQuery) -> (u16, Option<PendingQuery>) {
        let mut map = self.map.lock().expect("id map lock poisoned");
        let mut rng = rand::rng();
        let mut attempts_left = 5;
        loop {
            attempts_left -= 1;
            let id: u16 = rng.random();
            match map.entry(id) {
                Entry::Vacant(entry) => {
                    entry.insert(MapSlot { age: 0, query });
                    return (id, None);
                }
                Entry::Occupied(mut entry) if attempts_left == 0 => {
                    let old = entry.insert(MapSlot { age: 0, query });
                    return (id, Some(old.query));
                }
                Entry::Occupied(_) => {}
            }
        }
    }

    pub(crate) fn restore(&self, id: u16, query: PendingQuery) -> Result<(), PendingQuery> {
        let mut map = self.map.lock().expect("id map lock poisoned");
        match map.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(MapSlot { age: 0, query });
                Ok(())
            }
            Entry::Occupied(_) => Err(query),
        }
    }

    pub(crate) fn take(&self, id: u16) -> Option<PendingQuery> {
        let mut map = self.map.lock().expect("id map lock poisoned");
        map.remove(&id).map(|slot| slot.query)
    }

    pub(crate) fn sweep_expired(
        &self,
        timeout_ticks: u32,
        mut on_expire: impl FnMut(PendingQuery),
    ) {
        let mut expired = Vec::new();
        {
            let mut map = self.map.lock().expect("id map lock poisoned");
            map.retain(|_, slot| {
                if slot.age > timeout_ticks {
                    expired.push(slot.query.clone());
                    false
                } else {
                    slot.age += 1;
                    true
                }
            });
        }
        // Run handlers outside the map lock.
        for query in expired {
            on_expire(query);
        }
    }

    pub(crate) fn in_use(&self) -> usize {
        self.map.lock().expect("id map lock poisoned").len()
    }
}

/// The per-backend id table in whichever mode the process selected.
pub(crate) enum IdStateTable {
    Sequential(SequentialIdTable),
    Randomized(RandomizedIdMap),
}

impl IdStateTable {
    pub(crate) fn new(randomized: bool, max_outstanding: u16) -> Self {
        if randomized {
            Self::Randomized(RandomizedIdMap::new())
        } else {
            Self::Sequential(SequentialIdTable::new(max_outstanding))
        }
    }

    pub(crate) fn save(&self, query: PendingQuery) -> (u16, Option<PendingQuery>) {
        match self {
            Self::Sequential(table) => table.save(query),
            Self::Randomized(map) => map.save(query),
        }
    }

    pub(crate) fn restore(&self, id: u16, query: PendingQuery) -> Result<(), PendingQuery> {
        match self {
            Self::Sequential(table) => table.restore(id, query),
            Self::Randomized(map) => map.restore(id, query),
        }
    }

    pub(crate) fn take(&self, id: u16) -> Option<PendingQuery> {
        match self {
            Self::Sequential(table) => table.take(id),
            Self::Randomized(map) => map.take(id),
        }
    }

    pub(crate) fn sweep_expired(&self, timeout_ticks: u32, on_expire: impl FnMut(PendingQuery)) {
        match self {
            Self::Sequential(table) => table.sweep_expired(timeout_ticks, on_expire),
            Self::Randomized(map) => map.sweep_expired(timeout_ticks, on_expire),
        }
    }

    pub(crate) fn in_use(&self) -> usize {
        match self {
            Self::Sequential(table) => table.in_use(),
            Self::Randomized(map) => map.in_use(),
        }
    }
}
