//! Round bookkeeping.
//!
//! A `RoundInfo` records which events were assigned to a round, which of
//! them are witnesses, and the fame of each witness as virtual voting
//! resolves it. A round is *decided* when every witness has fame other than
//! `Undefined`.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::Hash;

/// Fame of a witness. `Undefined` until the voting simulation decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub enum Famous {
    #[default]
    Undefined,
    True,
    False,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct RoundEvent {
    /// Set once the event's round-received is known.
    pub consensus: bool,
    pub witness: bool,
    pub famous: Famous,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RoundInfo {
    /// Whether this round has been queued for fame decision. Local state,
    /// used to keep the pending-rounds queue free of duplicates.
    pub queued: bool,
    pub events: BTreeMap<Hash, RoundEvent>,
}

impl RoundInfo {
    /// Record an event in this round. Idempotent.
    pub fn add_event(&mut self, hash: Hash, witness: bool) {
        self.events.entry(hash).or_insert(RoundEvent {
            consensus: false,
            witness,
            famous: Famous::Undefined,
        });
    }

    pub fn witnesses(&self) -> Vec<Hash> {
        self.events
            .iter()
            .filter(|(_, e)| e.witness)
            .map(|(h, _)| *h)
            .collect()
    }

    pub fn famous_witnesses(&self) -> Vec<Hash> {
        self.events
            .iter()
            .filter(|(_, e)| e.witness && e.famous == Famous::True)
            .map(|(h, _)| *h)
            .collect()
    }

    pub fn set_fame(&mut self, hash: &Hash, famous: bool) {
        if let Some(event) = self.events.get_mut(hash) {
            event.famous = if famous { Famous::True } else { Famous::False };
        }
    }

    /// True when the witness's fame is settled.
    pub fn is_decided(&self, hash: &Hash) -> bool {
        self.events
            .get(hash)
            .is_some_and(|e| e.witness && e.famous != Famous::Undefined)
    }

    /// True when every witness in the round has decided fame.
    pub fn witnesses_decided(&self) -> bool {
        self.events
            .values()
            .all(|e| !e.witness || e.famous != Famous::Undefined)
    }

    /// Mark an event as a consensus event of this round.
    pub fn set_consensus_event(&mut self, hash: Hash) {
        self.events
            .entry(hash)
            .or_insert_with(RoundEvent::default)
            .consensus = true;
    }

    /// Consensus events, in hash order. Callers re-sort by Lamport
    /// timestamp when building frames.
    pub fn consensus_events(&self) -> Vec<Hash> {
        self.events
            .iter()
            .filter(|(_, e)| e.consensus)
            .map(|(h, _)| *h)
            .collect()
    }
}
