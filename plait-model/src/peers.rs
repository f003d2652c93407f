//! Participants registry
//!
//! The ordered set of validator public keys, each paired with a stable
//! integer ID derived from the key alone (`crypto::participant_id`). The
//! registry is the source of the two consensus thresholds:
//!
//! - **supermajority** = ⌊2n/3⌋ + 1 — strongly-seeing, round advancement,
//!   fame decisions.
//! - **trust count** = ⌈n/3⌉ — a block with *more* than this many valid
//!   signatures becomes the anchor block.

use std::collections::HashMap;

use crate::crypto;
use crate::types::PubKey;

/// A single consensus participant.
#[derive(Debug, Clone, PartialEq, Eq, borsh::BorshSerialize, borsh::BorshDeserialize)]
pub struct Participant {
    /// The participant's Ed25519 public key.
    pub pub_key: PubKey,
    /// Stable integer ID, derivable from the key alone.
    pub id: i64,
}

impl Participant {
    pub fn new(pub_key: PubKey) -> Self {
        let id = crypto::participant_id(&pub_key);
        Participant { pub_key, id }
    }
}

/// The ordered participant set.
///
/// Iteration order is ascending by participant ID — the canonical ordering
/// used for frame roots and `known_events` maps.
#[derive(Debug, Clone, Default)]
pub struct Participants {
    sorted: Vec<Participant>,
    by_pubkey: HashMap<PubKey, usize>,
    by_id: HashMap<i64, usize>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParticipantsError {
    #[error("duplicate participant {0}")]
    Duplicate(PubKey),
    #[error("unknown participant {0}")]
    Unknown(PubKey),
}

impl Participants {
    /// Build a registry from a set of public keys.
    pub fn new(keys: impl IntoIterator<Item = PubKey>) -> Result<Self, ParticipantsError> {
        let mut participants = Participants::default();
        for key in keys {
            participants.add(key)?;
        }
        Ok(participants)
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// ⌊2n/3⌋ + 1
    pub fn super_majority(&self) -> usize {
        2 * self.len() / 3 + 1
    }

    /// ⌈n/3⌉
    pub fn trust_count(&self) -> usize {
        self.len().div_ceil(3)
    }

    pub fn by_pub_key(&self, key: &PubKey) -> Option<&Participant> {
        self.by_pubkey.get(key).map(|&i| &self.sorted[i])
    }

    pub fn by_id(&self, id: i64) -> Option<&Participant> {
        self.by_id.get(&id).map(|&i| &self.sorted[i])
    }

    pub fn contains(&self, key: &PubKey) -> bool {
        self.by_pubkey.contains_key(key)
    }

    /// Participants in canonical (ascending ID) order.
    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.sorted.iter()
    }

    /// Public keys in canonical order.
    pub fn pub_keys(&self) -> impl Iterator<Item = &PubKey> {
        self.sorted.iter().map(|p| &p.pub_key)
    }

    /// Add a participant (internal peer-add transaction).
    pub fn add(&mut self, key: PubKey) -> Result<(), ParticipantsError> {
        if self.by_pubkey.contains_key(&key) {
            return Err(ParticipantsError::Duplicate(key));
        }
        let participant = Participant::new(key);
        let pos = self
            .sorted
            .partition_point(|p| p.id < participant.id);
        self.sorted.insert(pos, participant);
        self.reindex();
        Ok(())
    }

    /// Remove a participant (internal peer-remove transaction).
    pub fn remove(&mut self, key: &PubKey) -> Result<(), ParticipantsError> {
        let pos = *self
            .by_pubkey
            .get(key)
            .ok_or(ParticipantsError::Unknown(*key))?;
        self.sorted.remove(pos);
        self.reindex();
        Ok(())
    }

    fn reindex(&mut self) {
        self.by_pubkey = self
            .sorted
            .iter()
            .enumerate()
            .map(|(i, p)| (p.pub_key, i))
            .collect();
        self.by_id = self
            .sorted
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id, i))
            .collect();
    }
}
