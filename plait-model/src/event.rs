//! Event: the atomic unit of the Plait DAG.
//!
//! An `EventBody` is the unsigned body — what the creator vouches for.
//! An `Event` wraps it with the signature and the gossip side-band (flag
//! table, witness proof, integer wire shortcuts), plus the derived fields
//! the consensus engine assigns after insertion.
//!
//! Serialization:
//! - `EventBody` uses **Borsh** for deterministic hashing and signing; the
//!   event hash is `blake3(borsh(body))`.
//! - `WireEvent` is the gossip form: the body's parent hashes are replaced
//!   by integer shortcuts `{self_parent_index, other_parent_creator_id,
//!   other_parent_index, creator_id}` and resolved back on receipt.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::block::{BlockSignature, WireBlockSignature};
use crate::crypto;
use crate::types::{Hash, PubKey, Signature};

// ---------------------------------------------------------------------------
// Internal transactions
// ---------------------------------------------------------------------------

/// Peer add/removal directives carried inside event bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum TransactionType {
    PeerAdd,
    PeerRemove,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct InternalTransaction {
    pub tx_type: TransactionType,
    pub peer: PubKey,
}

impl InternalTransaction {
    pub fn new(tx_type: TransactionType, peer: PubKey) -> Self {
        InternalTransaction { tx_type, peer }
    }
}

// ---------------------------------------------------------------------------
// Flag table
// ---------------------------------------------------------------------------

/// Per-event map of witness hashes the event transitively acknowledges.
///
/// Keys are witness event hashes; a value of 1 marks the flag as set.
/// `BTreeMap` keeps the Borsh encoding canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FlagTable(pub BTreeMap<Hash, i64>);

impl FlagTable {
    pub fn new() -> Self {
        FlagTable(BTreeMap::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.0.get(hash).is_some_and(|&flag| flag != 0)
    }

    pub fn insert(&mut self, hash: Hash) {
        self.0.insert(hash, 1);
    }

    pub fn keys(&self) -> impl Iterator<Item = &Hash> {
        self.0.keys()
    }

    /// OR-merge with another flag table (used when a new head inherits the
    /// flags of both parents).
    pub fn merge(&self, other: &FlagTable) -> FlagTable {
        let mut merged = self.0.clone();
        for (hash, &flag) in &other.0 {
            if flag != 0 {
                merged.insert(*hash, 1);
            }
        }
        FlagTable(merged)
    }
}

impl FromIterator<Hash> for FlagTable {
    fn from_iter<I: IntoIterator<Item = Hash>>(iter: I) -> Self {
        FlagTable(iter.into_iter().map(|h| (h, 1)).collect())
    }
}

// ---------------------------------------------------------------------------
// Event body
// ---------------------------------------------------------------------------

/// The unsigned body of an event. This is the content that gets hashed and
/// signed; everything else travels outside the signature.
///
/// `parents[0]` is the self-parent (the creator's previous event, or the
/// root's synthetic self-parent hash for the creator's first event);
/// `parents[1]`, when present, is the other-parent.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct EventBody {
    /// Opaque application payloads, in submission order.
    pub transactions: Vec<Vec<u8>>,
    /// Peer add/remove directives.
    pub internal_transactions: Vec<InternalTransaction>,
    /// Parent hashes, self-parent first.
    pub parents: Vec<Hash>,
    /// Creator's public key.
    pub creator: PubKey,
    /// Index of this event in the creator's sequence.
    pub index: i64,
    /// Block signatures the creator is gossiping.
    pub block_signatures: Vec<BlockSignature>,
}

impl EventBody {
    /// Canonical content hash: `blake3(borsh(self))`.
    pub fn hash(&self) -> Hash {
        let bytes = borsh::to_vec(self).expect("borsh serialization cannot fail");
        crypto::content_hash(&bytes)
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Signed event plus gossip side-band. This is what travels between stores
/// inside frames; the wire form (`WireEvent`) additionally compresses the
/// parent hashes into integer shortcuts.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct EventMessage {
    pub body: EventBody,
    /// Creator's Ed25519 signature over `body.hash()`.
    pub signature: Signature,
    pub flag_table: FlagTable,
    /// For witnesses: hashes of the roots supporting witnesshood.
    pub witness_proof: Vec<Hash>,

    // Wire shortcuts. It is cheaper to gossip ints than hashes; -1 = unset.
    pub self_parent_index: i64,
    pub other_parent_creator_id: i64,
    pub other_parent_index: i64,
    pub creator_id: i64,
}

/// An event with its locally-derived consensus state.
///
/// The message is immutable once inserted; the derived fields are assigned
/// by the pipeline (round, Lamport timestamp, round-received) or locally at
/// insertion (topological index) and never gossiped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub message: EventMessage,

    /// Monotonic insertion counter, local to this node.
    pub topological_index: i64,
    pub round: Option<i64>,
    pub lamport_timestamp: Option<i64>,
    pub round_received: Option<i64>,
}

impl Event {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transactions: Vec<Vec<u8>>,
        internal_transactions: Vec<InternalTransaction>,
        block_signatures: Vec<BlockSignature>,
        self_parent: Hash,
        other_parent: Option<Hash>,
        creator: PubKey,
        index: i64,
        flag_table: FlagTable,
    ) -> Self {
        let mut parents = vec![self_parent];
        parents.extend(other_parent);
        let body = EventBody {
            transactions,
            internal_transactions,
            parents,
            creator,
            index,
            block_signatures,
        };
        Event::from_message(EventMessage {
            body,
            signature: Signature::ZERO,
            flag_table,
            witness_proof: Vec::new(),
            self_parent_index: -1,
            other_parent_creator_id: -1,
            other_parent_index: -1,
            creator_id: -1,
        })
    }

    /// Rebuild an event from its gossiped message, clearing all derived state.
    pub fn from_message(message: EventMessage) -> Self {
        Event {
            message,
            topological_index: 0,
            round: None,
            lamport_timestamp: None,
            round_received: None,
        }
    }

    pub fn creator(&self) -> PubKey {
        self.message.body.creator
    }

    pub fn index(&self) -> i64 {
        self.message.body.index
    }

    pub fn self_parent(&self) -> Hash {
        self.message.body.parents.first().copied().unwrap_or(Hash::ZERO)
    }

    pub fn other_parent(&self) -> Option<Hash> {
        self.message.body.parents.get(1).copied()
    }

    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.message.body.transactions
    }

    pub fn block_signatures(&self) -> &[BlockSignature] {
        &self.message.body.block_signatures
    }

    /// True if the event carries a payload or is the initial event of its
    /// creator. Loaded events are what the commit counter tracks.
    pub fn is_loaded(&self) -> bool {
        self.message.body.index == 0
            || !self.message.body.transactions.is_empty()
            || !self.message.body.internal_transactions.is_empty()
    }

    /// Content hash of the body.
    pub fn hash(&self) -> Hash {
        self.message.body.hash()
    }

    pub fn sign(&mut self, key: &ed25519_dalek::SigningKey) {
        self.message.signature = crypto::sign_hash(key, &self.hash());
    }

    /// Verify the creator's signature over the body hash.
    pub fn verify(&self) -> Result<(), crypto::CryptoError> {
        crypto::verify_hash(
            &self.message.body.creator,
            &self.hash(),
            &self.message.signature,
        )
    }

    pub fn set_round(&mut self, round: i64) {
        self.round = Some(round);
    }

    pub fn set_lamport_timestamp(&mut self, timestamp: i64) {
        self.lamport_timestamp = Some(timestamp);
    }

    pub fn set_round_received(&mut self, round: i64) {
        self.round_received = Some(round);
    }

    pub fn set_wire_info(
        &mut self,
        self_parent_index: i64,
        other_parent_creator_id: i64,
        other_parent_index: i64,
        creator_id: i64,
    ) {
        self.message.self_parent_index = self_parent_index;
        self.message.other_parent_creator_id = other_parent_creator_id;
        self.message.other_parent_index = other_parent_index;
        self.message.creator_id = creator_id;
    }

    pub fn wire_info_set(&self) -> bool {
        self.message.creator_id >= 0
    }

    pub fn replace_flag_table(&mut self, flag_table: FlagTable) {
        self.message.flag_table = flag_table;
    }

    pub fn to_wire(&self) -> WireEvent {
        WireEvent {
            body: WireBody {
                transactions: self.message.body.transactions.clone(),
                internal_transactions: self.message.body.internal_transactions.clone(),
                block_signatures: self
                    .message
                    .body
                    .block_signatures
                    .iter()
                    .map(BlockSignature::to_wire)
                    .collect(),
                self_parent_index: self.message.self_parent_index,
                other_parent_creator_id: self.message.other_parent_creator_id,
                other_parent_index: self.message.other_parent_index,
                creator_id: self.message.creator_id,
                index: self.message.body.index,
            },
            signature: self.message.signature,
            flag_table: self.message.flag_table.clone(),
            witness_proof: self.message.witness_proof.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Total order on events: Lamport timestamp, ties broken by the numeric
/// comparison of the signature's R component. Ed25519 signing is
/// deterministic, so the comparator is stable across honest re-signings.
pub fn cmp_by_lamport(a: &Event, b: &Event) -> Ordering {
    let at = a.lamport_timestamp.unwrap_or(-1);
    let bt = b.lamport_timestamp.unwrap_or(-1);
    at.cmp(&bt).then_with(|| {
        a.message
            .signature
            .r_component()
            .cmp(&b.message.signature.r_component())
    })
}

/// Partial order on events: local insertion order.
pub fn cmp_by_topological(a: &Event, b: &Event) -> Ordering {
    a.topological_index.cmp(&b.topological_index)
}

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// Gossip body: parent hashes replaced by integer shortcuts.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct WireBody {
    pub transactions: Vec<Vec<u8>>,
    pub internal_transactions: Vec<InternalTransaction>,
    pub block_signatures: Vec<WireBlockSignature>,

    pub self_parent_index: i64,
    pub other_parent_creator_id: i64,
    pub other_parent_index: i64,
    pub creator_id: i64,

    pub index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct WireEvent {
    pub body: WireBody,
    pub signature: Signature,
    pub flag_table: FlagTable,
    pub witness_proof: Vec<Hash>,
}

impl WireEvent {
    /// Expand the wire block signatures with the creator's key.
    pub fn block_signatures(&self, validator: &PubKey) -> Vec<BlockSignature> {
        self.body
            .block_signatures
            .iter()
            .map(|ws| BlockSignature {
                validator: *validator,
                index: ws.index,
                signature: ws.signature,
            })
            .collect()
    }
}
