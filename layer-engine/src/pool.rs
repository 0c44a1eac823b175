//! Weighted round-robin bookkeeping for one datacenter's sockets.
//!
//! [`Pool`] holds the connection map and the weight map side by side and is
//! the only thing that mutates either, so their key sets never drift apart.
//! It knows nothing about sockets; the datacenter wraps it in a lock and
//! performs the I/O that a [`Level`] decision asks for.

use std::collections::BTreeMap;

/// Below this minimum weight every socket gets [`LOW_BONUS`].
pub const LOW_WATERMARK:  i64 = 50;
/// Below this minimum weight the pool grows, or gets [`HIGH_BONUS`] when full.
pub const HIGH_WATERMARK: i64 = 100;
pub const LOW_BONUS:      i64 = 50;
pub const HIGH_BONUS:     i64 = 1000;
/// Sockets opened by one leveling pass at most.
pub const GROW_STEP:      usize = 2;

/// Outcome of a leveling pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    /// Every weight was raised by this much.
    Boosted(i64),
    /// The caller should open this many more sockets.
    Grow(usize),
    /// Nothing to do.
    Idle,
}

#[derive(Debug)]
pub struct Pool<C> {
    connections: BTreeMap<usize, C>,
    weights:     BTreeMap<usize, i64>,
    read_dec:    i64,
    write_dec:   i64,
}

impl<C: Clone> Pool<C> {
    pub fn new(read_dec: i64, write_dec: i64) -> Self {
        Self { connections: BTreeMap::new(), weights: BTreeMap::new(), read_dec, write_dec }
    }

    pub fn set_decrements(&mut self, read_dec: i64, write_dec: i64) {
        self.read_dec = read_dec;
        self.write_dec = write_dec;
    }

    /// Add or replace the socket at `id`. Its weight restarts at zero.
    pub fn insert(&mut self, id: usize, conn: C) -> Option<C> {
        self.weights.insert(id, 0);
        self.connections.insert(id, conn)
    }

    pub fn remove(&mut self, id: usize) -> Option<C> {
        self.weights.remove(&id);
        self.connections.remove(&id)
    }

    pub fn clear(&mut self) -> Vec<C> {
        self.weights.clear();
        std::mem::take(&mut self.connections).into_values().collect()
    }

    pub fn get(&self, id: usize) -> Option<&C> { self.connections.get(&id) }
    pub fn contains(&self, id: usize) -> bool { self.connections.contains_key(&id) }
    pub fn len(&self) -> usize { self.connections.len() }
    pub fn is_empty(&self) -> bool { self.connections.is_empty() }
    pub fn ids(&self) -> Vec<usize> { self.connections.keys().copied().collect() }
    pub fn connections(&self) -> impl Iterator<Item = &C> { self.connections.values() }
    pub fn weight(&self, id: usize) -> Option<i64> { self.weights.get(&id).copied() }

    /// The `n` lowest indices not in use.
    pub fn free_ids(&self, n: usize) -> Vec<usize> {
        (0..).filter(|id| !self.connections.contains_key(id)).take(n).collect()
    }

    /// Pick the heaviest socket and charge it one unit.
    ///
    /// Single-socket pools skip the weighting entirely. Ties go to the
    /// lowest index.
    pub fn select(&mut self) -> Option<(usize, C)> {
        if self.connections.len() <= 1 {
            return self.connections.iter().next().map(|(id, c)| (*id, c.clone()));
        }
        let mut best: Option<(usize, i64)> = None;
        for (&id, &w) in &self.weights {
            if best.is_none_or(|(_, bw)| w > bw) {
                best = Some((id, w));
            }
        }
        let (id, _) = best?;
        if let Some(w) = self.weights.get_mut(&id) {
            *w -= 1;
        }
        self.connections.get(&id).map(|c| (id, c.clone()))
    }

    /// A read started (`true`) or finished (`false`) on `id`.
    pub fn reading(&mut self, id: usize, started: bool) {
        let dec = self.read_dec;
        self.adjust(id, if started { -dec } else { dec });
    }

    /// A write started (`true`) or finished (`false`) on `id`.
    pub fn writing(&mut self, id: usize, started: bool) {
        let dec = self.write_dec;
        self.adjust(id, if started { -dec } else { dec });
    }

    fn adjust(&mut self, id: usize, delta: i64) {
        if let Some(w) = self.weights.get_mut(&id) {
            *w = w.saturating_add(delta);
        }
    }

    /// One leveling pass. `max_sockets` is the ceiling for this datacenter.
    pub fn level(&mut self, max_sockets: usize) -> Level {
        let Some(min) = self.weights.values().copied().min() else {
            return Level::Idle;
        };
        if min < LOW_WATERMARK {
            self.boost(LOW_BONUS);
            return Level::Boosted(LOW_BONUS);
        }
        if min < HIGH_WATERMARK {
            let count = self.connections.len();
            if count < max_sockets {
                return Level::Grow(GROW_STEP.min(max_sockets - count));
            }
            self.boost(HIGH_BONUS);
            return Level::Boosted(HIGH_BONUS);
        }
        Level::Idle
    }

    fn boost(&mut self, by: i64) {
        for w in self.weights.values_mut() {
            *w = w.saturating_add(by);
        }
    }

    #[cfg(test)]
    fn keys_agree(&self) -> bool {
        self.connections.keys().eq(self.weights.keys())
    }
}
