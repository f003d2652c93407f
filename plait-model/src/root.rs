//! Roots: the base of the DAG.
//!
//! Each participant is assigned a `Root` on top of which its events are
//! inserted. The first event of a participant must have the root's
//! `self_parent.hash` as its self-parent. This construction allows a DAG to
//! be re-seeded from the middle of another DAG (after a reset), with the
//! roots standing in for the pre-frame history.
//!
//! `others` handles the awkward case of an event whose other-parent predates
//! the frame: the map records, per child event hash, a `RootEvent` describing
//! the out-of-frame parent so graph predicates and round assignment can
//! still resolve it.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crypto;
use crate::types::Hash;

/// Enough information about a pre-frame event to allow inserting and
/// ordering events on top of it.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RootEvent {
    pub hash: Hash,
    pub creator_id: i64,
    pub index: i64,
    pub lamport_timestamp: i64,
    pub round: i64,
}

impl RootEvent {
    /// The root event at the very beginning of a DAG: a synthetic hash and
    /// sentinel coordinates one step below the first real event.
    pub fn base(creator_id: i64) -> Self {
        RootEvent {
            hash: crypto::root_self_parent(creator_id),
            creator_id,
            index: -1,
            lamport_timestamp: -1,
            round: -1,
        }
    }
}

/// Per-participant boundary object.
///
/// `next_round` is the proposed round for the root's first child; it is
/// authoritative only when the child's other-parent is absent or recorded in
/// `others`.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Root {
    pub next_round: i64,
    pub self_parent: RootEvent,
    /// child event hash → stand-in for its out-of-frame other-parent.
    pub others: BTreeMap<Hash, RootEvent>,
}

impl Root {
    /// The root for a fresh DAG (round 0, nothing before it).
    pub fn base(creator_id: i64) -> Self {
        Root {
            next_round: 0,
            self_parent: RootEvent::base(creator_id),
            others: BTreeMap::new(),
        }
    }
}
