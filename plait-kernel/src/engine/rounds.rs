//! Round and Lamport timestamp assignment, witness detection, and root
//! construction.
//!
//! Round assignment arbitrates between three sources, in order: the root
//! (for events directly attached to it), the other-parent's round when it
//! runs ahead of the self-parent's, and finally the witness-proof /
//! flag-table supermajority check that advances an event past its parent
//! round.

use plait_model::{Event, Hash, Root, RootEvent};

use super::Engine;
use crate::error::ConsensusError;

impl Engine {
    /// The round assigned to an event (or root self-parent) hash.
    pub fn round(&mut self, x: &Hash) -> Result<i64, ConsensusError> {
        if let Some(&cached) = self.caches.round.get(x) {
            return Ok(cached);
        }
        let result = self.round_uncached(x)?;
        self.caches.round.put(*x, result);
        Ok(result)
    }

    fn round_uncached(&mut self, x: &Hash) -> Result<i64, ConsensusError> {
        // x is a root self-parent: its round is authoritative.
        if let Some(round) = self
            .store
            .roots_by_self_parent()
            .get(x)
            .map(|r| r.self_parent.round)
        {
            return Ok(round);
        }

        let ex = self.store.get_event(x)?;
        let root = self.store.get_root(&ex.creator())?;

        // The event is directly attached to the root; next_round is
        // authoritative unless the other-parent is outside the root.
        if ex.self_parent() == root.self_parent.hash {
            let other_parent_in_root = match ex.other_parent() {
                None => true,
                Some(op) => root.others.get(x).is_some_and(|o| o.hash == op),
            };
            if other_parent_in_root {
                return Ok(root.next_round);
            }
        }

        let mut parent_round = self.round(&ex.self_parent())?;

        if let Some(op) = ex.other_parent() {
            let op_round = if root.others.get(x).is_some_and(|o| o.hash == op) {
                root.next_round
            } else {
                self.round(&op)?
            };

            if op_round > parent_round {
                // The other-parent runs ahead. If the flag table shows this
                // event already acknowledges witnesses of that round, it
                // belongs there (or past it).
                let witnesses = self.store.round_witnesses(op_round);
                let flags: Vec<Hash> = ex.message.flag_table.keys().copied().collect();
                let mut seen = 0usize;
                for flag in &flags {
                    if self.sees_round_witness(x, flag, &witnesses)? {
                        seen += 1;
                    }
                }
                if seen >= self.super_majority() {
                    return Ok(op_round + 1);
                }
                if seen > 0 {
                    return Ok(op_round);
                }
                parent_round = op_round;
            }
        }

        let witnesses = self.store.round_witnesses(parent_round);

        // Witness proof first, then flag table: a supermajority of
        // parent-round witnesses acknowledged by x advances it one round.
        let proof = ex.message.witness_proof.clone();
        if proof.len() >= self.super_majority() {
            let mut count = 0usize;
            for hash in &proof {
                if self.sees_round_witness(x, hash, &witnesses)? {
                    count += 1;
                }
            }
            if count >= self.super_majority() {
                return Ok(parent_round + 1);
            }
        }

        let flags: Vec<Hash> = ex.message.flag_table.keys().copied().collect();
        if flags.len() >= self.super_majority() {
            let mut count = 0usize;
            for flag in &flags {
                if self.sees_round_witness(x, flag, &witnesses)? {
                    count += 1;
                }
            }
            if count >= self.super_majority() {
                return Ok(parent_round + 1);
            }
        }

        Ok(parent_round)
    }

    /// True when `candidate` is one of `witnesses` (and not x itself) and x
    /// sees it.
    fn sees_round_witness(
        &mut self,
        x: &Hash,
        candidate: &Hash,
        witnesses: &[Hash],
    ) -> Result<bool, ConsensusError> {
        if candidate == x || !witnesses.contains(candidate) {
            return Ok(false);
        }
        self.see(x, candidate)
    }

    /// An event is a witness iff it is the first event of its creator in a
    /// new round.
    pub fn witness(&mut self, x: &Hash) -> Result<bool, ConsensusError> {
        let ex = self.store.get_event(x)?;
        let x_round = self.round(x)?;
        let sp_round = self.round(&ex.self_parent())?;
        Ok(x_round > sp_round)
    }

    /// Lamport timestamp: 1 + max over parents, with roots supplying the
    /// pre-frame values.
    pub fn lamport_timestamp(&mut self, x: &Hash) -> Result<i64, ConsensusError> {
        if let Some(&cached) = self.caches.timestamp.get(x) {
            return Ok(cached);
        }
        let result = self.lamport_timestamp_uncached(x)?;
        self.caches.timestamp.put(*x, result);
        Ok(result)
    }

    fn lamport_timestamp_uncached(&mut self, x: &Hash) -> Result<i64, ConsensusError> {
        if let Some(lt) = self
            .store
            .roots_by_self_parent()
            .get(x)
            .map(|r| r.self_parent.lamport_timestamp)
        {
            return Ok(lt);
        }

        let ex = self.store.get_event(x)?;
        let root = self.store.get_root(&ex.creator())?;

        let mut plt = if ex.self_parent() == root.self_parent.hash {
            root.self_parent.lamport_timestamp
        } else {
            self.lamport_timestamp(&ex.self_parent())?
        };

        if let Some(op) = ex.other_parent() {
            let op_lt = match self.store.get_event(&op) {
                Ok(_) => Some(self.lamport_timestamp(&op)?),
                Err(e) if e.is_key_not_found() => {
                    // Pre-frame other-parent: the root records its timestamp.
                    root.others
                        .get(x)
                        .filter(|o| o.hash == op)
                        .map(|o| o.lamport_timestamp)
                }
                Err(e) => return Err(e.into()),
            };
            if let Some(t) = op_lt {
                if t > plt {
                    plt = t;
                }
            }
        }

        Ok(plt + 1)
    }

    /// lamport(y) - lamport(x)
    pub(crate) fn lamport_timestamp_diff(&mut self, x: &Hash, y: &Hash) -> Result<i64, ConsensusError> {
        let xlt = self.lamport_timestamp(x)?;
        let ylt = self.lamport_timestamp(y)?;
        Ok(ylt - xlt)
    }

    // -----------------------------------------------------------------------
    // Root construction
    // -----------------------------------------------------------------------

    pub(crate) fn create_self_parent_root_event(
        &mut self,
        ev: &Event,
    ) -> Result<RootEvent, ConsensusError> {
        let sp = ev.self_parent();
        let lamport_timestamp = self.lamport_timestamp(&sp)?;
        let round = self.round(&sp)?;
        let creator_id = self
            .participants
            .by_pub_key(&ev.creator())
            .ok_or(ConsensusError::UnknownParticipant(ev.creator()))?
            .id;
        Ok(RootEvent {
            hash: sp,
            creator_id,
            index: ev.index() - 1,
            lamport_timestamp,
            round,
        })
    }

    pub(crate) fn create_other_parent_root_event(
        &mut self,
        ev: &Event,
    ) -> Result<RootEvent, ConsensusError> {
        let op = ev
            .other_parent()
            .expect("caller checked the other-parent exists");

        // The other-parent might itself predate the frame and live in the
        // creator's root.
        let root = self.store.get_root(&ev.creator())?;
        if let Some(other) = root.others.get(&ev.hash()).filter(|o| o.hash == op) {
            return Ok(other.clone());
        }

        let other_parent = self.store.get_event(&op)?;
        let lamport_timestamp = self.lamport_timestamp(&op)?;
        let round = self.round(&op)?;
        let creator_id = self
            .participants
            .by_pub_key(&other_parent.creator())
            .ok_or(ConsensusError::UnknownParticipant(other_parent.creator()))?
            .id;
        Ok(RootEvent {
            hash: op,
            creator_id,
            index: other_parent.index(),
            lamport_timestamp,
            round,
        })
    }

    /// Build the root that stands in for everything at or below `ev` when a
    /// frame is cut at it.
    pub(crate) fn create_root(&mut self, ev: &Event) -> Result<Root, ConsensusError> {
        let next_round = self.round(&ev.hash())?;
        let self_parent = self.create_self_parent_root_event(ev)?;

        let mut root = Root {
            next_round,
            self_parent,
            others: Default::default(),
        };
        if ev.other_parent().is_some() {
            let other = self.create_other_parent_root_event(ev)?;
            root.others.insert(ev.hash(), other);
        }
        Ok(root)
    }
}
