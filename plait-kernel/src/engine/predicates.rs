//! Graph predicates: ancestor, self-ancestor, see, strongly-see.
//!
//! Pure functions of the DAG + roots, memoised in bounded LRU caches keyed
//! by `(x, y)`. The caches are replaced wholesale on reset — correctness
//! never depends on them, only throughput.
//!
//! All predicates are root-aware: a `KeyNotFound` from the store means the
//! hash predates the current frame and the roots are consulted instead.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;
use plait_model::{Hash, PubKey};

use super::Engine;
use crate::error::ConsensusError;

/// The engine's memoisation caches. Replaced atomically on reset.
pub(crate) struct Caches {
    pub ancestor: LruCache<(Hash, Hash), bool>,
    pub self_ancestor: LruCache<(Hash, Hash), bool>,
    pub strongly_see: LruCache<(Hash, Hash), bool>,
    pub round: LruCache<Hash, i64>,
    pub timestamp: LruCache<Hash, i64>,
}

impl Caches {
    pub fn new(size: usize) -> Self {
        let capacity = NonZeroUsize::new(size.max(1)).expect("cache capacity is non-zero");
        Caches {
            ancestor: LruCache::new(capacity),
            self_ancestor: LruCache::new(capacity),
            strongly_see: LruCache::new(capacity),
            round: LruCache::new(capacity),
            timestamp: LruCache::new(capacity),
        }
    }
}

impl Engine {
    /// True if y is an ancestor of x (reachable via self- and other-parent
    /// edges).
    pub fn ancestor(&mut self, x: &Hash, y: &Hash) -> Result<bool, ConsensusError> {
        if let Some(&cached) = self.caches.ancestor.get(&(*x, *y)) {
            return Ok(cached);
        }
        let result = self.ancestor_uncached(x, y)?;
        self.caches.ancestor.put((*x, *y), result);
        Ok(result)
    }

    fn ancestor_uncached(&mut self, x: &Hash, y: &Hash) -> Result<bool, ConsensusError> {
        if x == y {
            return Ok(true);
        }

        let ex = match self.store.get_event(x) {
            Ok(ex) => ex,
            Err(e) if e.is_key_not_found() => {
                // x predates the frame: it is an ancestor of y only if some
                // root records it as y's out-of-frame other-parent.
                for root in self.store.roots_by_self_parent().values() {
                    if let Some(other) = root.others.get(y) {
                        return Ok(other.hash == *x);
                    }
                }
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        // A strictly older Lamport timestamp cannot be a descendant.
        if self.lamport_timestamp_diff(x, y)? > 0 {
            return Ok(false);
        }

        match self.store.get_event(y) {
            Ok(ey) => {
                if ex.creator() == ey.creator() {
                    return Ok(ex.index() >= ey.index());
                }
            }
            Err(e) if e.is_key_not_found() => {
                // y may be a root's self-parent
                let root_coords = self
                    .store
                    .roots_by_self_parent()
                    .get(y)
                    .map(|r| (r.self_parent.creator_id, r.self_parent.index));
                match root_coords {
                    Some((creator_id, index)) => {
                        let y_creator = self.participants.by_id(creator_id).map(|p| p.pub_key);
                        if y_creator == Some(ex.creator()) {
                            return Ok(ex.index() >= index);
                        }
                    }
                    None => return Ok(false),
                }
            }
            Err(e) => return Err(e.into()),
        }

        if self.ancestor(&ex.self_parent(), y)? {
            return Ok(true);
        }
        match ex.other_parent() {
            Some(op) => self.ancestor(&op, y),
            None => Ok(false),
        }
    }

    /// True if y is a self-ancestor of x (self-parent edges only).
    pub fn self_ancestor(&mut self, x: &Hash, y: &Hash) -> Result<bool, ConsensusError> {
        if let Some(&cached) = self.caches.self_ancestor.get(&(*x, *y)) {
            return Ok(cached);
        }
        let result = self.self_ancestor_uncached(x, y)?;
        self.caches.self_ancestor.put((*x, *y), result);
        Ok(result)
    }

    fn self_ancestor_uncached(&mut self, x: &Hash, y: &Hash) -> Result<bool, ConsensusError> {
        if x == y {
            return Ok(true);
        }

        let ex = match self.store.get_event(x) {
            Ok(ex) => ex,
            Err(e) if e.is_key_not_found() => {
                let matches = self
                    .store
                    .roots_by_self_parent()
                    .get(x)
                    .is_some_and(|r| r.self_parent.hash == *y);
                return Ok(matches);
            }
            Err(e) => return Err(e.into()),
        };

        match self.store.get_event(y) {
            Ok(ey) => {
                if ex.creator() == ey.creator() {
                    return Ok(ex.index() >= ey.index());
                }
            }
            Err(e) if e.is_key_not_found() => {
                let root_coords = self
                    .store
                    .roots_by_self_parent()
                    .get(y)
                    .map(|r| (r.self_parent.creator_id, r.self_parent.index));
                if let Some((creator_id, index)) = root_coords {
                    let y_creator = self.participants.by_id(creator_id).map(|p| p.pub_key);
                    if y_creator == Some(ex.creator()) {
                        return Ok(ex.index() >= index);
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }

        Ok(false)
    }

    /// True if x sees y.
    ///
    /// An alias of `ancestor`: fork detection is unnecessary here because
    /// `insert_event` refuses any event whose self-parent is not the
    /// creator's last known event, so forks are never admitted.
    pub fn see(&mut self, x: &Hash, y: &Hash) -> Result<bool, ConsensusError> {
        self.ancestor(x, y)
    }

    /// True if x strongly sees y: x's ancestry contains events authored by a
    /// supermajority of participants, each of which sees y.
    pub fn strongly_see(&mut self, x: &Hash, y: &Hash) -> Result<bool, ConsensusError> {
        if let Some(&cached) = self.caches.strongly_see.get(&(*x, *y)) {
            return Ok(cached);
        }
        let mut sentinels = HashSet::new();
        self.map_sentinels(x, y, &mut sentinels)?;
        let result = sentinels.len() >= self.super_majority();
        self.caches.strongly_see.put((*x, *y), result);
        Ok(result)
    }

    /// Accumulate into `sentinels` the creators of every event in x's
    /// ancestry that sees y.
    pub(crate) fn map_sentinels(
        &mut self,
        x: &Hash,
        y: &Hash,
        sentinels: &mut HashSet<PubKey>,
    ) -> Result<(), ConsensusError> {
        if !self.see(x, y)? {
            return Ok(());
        }

        let ex = match self.store.get_event(x) {
            Ok(ex) => ex,
            Err(e) if e.is_key_not_found() => {
                let creator_id = self
                    .store
                    .roots_by_self_parent()
                    .get(x)
                    .map(|r| r.self_parent.creator_id);
                match creator_id {
                    Some(id) => {
                        if let Some(p) = self.participants.by_id(id) {
                            sentinels.insert(p.pub_key);
                        }
                        return Ok(());
                    }
                    None => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        sentinels.insert(ex.creator());

        if x == y {
            return Ok(());
        }

        if let Some(op) = ex.other_parent() {
            self.map_sentinels(&op, y, sentinels)?;
        }
        self.map_sentinels(&ex.self_parent(), y, sentinels)
    }
}
