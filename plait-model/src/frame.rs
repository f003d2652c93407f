//! Frame: a canonical cut of the DAG at a given round-received.
//!
//! A frame is self-contained: the roots describe each participant's boundary
//! and the events are the round's consensus events in their final order. A
//! node can be reset from a `(block, frame)` pair without replaying history.
//!
//! The frame hash is `blake3(borsh(frame))`; roots are ordered by
//! participant ID and events by Lamport timestamp, so the encoding is
//! canonical and two honest nodes derive the same digest.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crypto;
use crate::event::EventMessage;
use crate::root::Root;
use crate::types::Hash;

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Frame {
    /// The round-received this frame corresponds to.
    pub round: i64,
    /// One root per participant, ordered by participant ID.
    pub roots: Vec<Root>,
    /// Consensus events, ordered by Lamport timestamp (signature tie-break).
    pub events: Vec<EventMessage>,
}

impl Frame {
    /// Deterministic digest of the canonical encoding.
    pub fn hash(&self) -> Hash {
        let bytes = borsh::to_vec(self).expect("borsh serialization cannot fail");
        crypto::content_hash(&bytes)
    }
}
