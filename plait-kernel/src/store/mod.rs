//! Store: persistence boundary of the consensus engine.
//!
//! The engine consumes the `Store` trait and never assumes a backend:
//! `InmemStore` keeps everything in maps, `DiskStore` layers a redb database
//! under the same in-memory indexes so a node can bootstrap from its own
//! history.
//!
//! `StoreError::KeyNotFound` is a recognised sentinel, distinct from I/O
//! failure: the graph predicates interpret it as "look in the roots" rather
//! than as fatal.

mod disk;
mod inmem;

use std::collections::{BTreeMap, HashMap};

use plait_model::{Block, Event, Frame, Hash, PubKey, Root, RoundInfo};
use thiserror::Error;

pub use disk::DiskStore;
pub use inmem::InmemStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("unknown participant {0}")]
    UnknownParticipant(PubKey),

    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("borsh decode error: {0}")]
    Decode(#[from] borsh::io::Error),

    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

impl StoreError {
    pub fn key_not_found(what: impl std::fmt::Display) -> Self {
        StoreError::KeyNotFound(what.to_string())
    }

    /// The lookup-miss sentinel. Everything else is an I/O or corruption
    /// failure and must surface.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound(_))
    }
}

/// CRUD over events, rounds, blocks, frames, and roots, plus the
/// per-participant indexes the engine leans on.
pub trait Store: Send {
    /// Capacity hint for the engine's predicate caches.
    fn cache_size(&self) -> usize;

    fn get_event(&self, hash: &Hash) -> Result<Event, StoreError>;
    fn set_event(&mut self, event: Event) -> Result<(), StoreError>;

    /// Hash of the participant's event at the given index.
    fn participant_event(&self, participant: &PubKey, index: i64) -> Result<Hash, StoreError>;

    /// Hashes of the participant's events with index > `since`, ascending.
    fn participant_events(&self, participant: &PubKey, since: i64) -> Result<Vec<Hash>, StoreError>;

    /// Last event of the participant. The boolean is true when the
    /// participant has no events yet and the hash is its root's self-parent.
    fn last_event_from(&self, participant: &PubKey) -> Result<(Hash, bool), StoreError>;

    /// Last *consensus* event of the participant, with the same root
    /// fallback as `last_event_from`.
    fn last_consensus_event_from(&self, participant: &PubKey) -> Result<(Hash, bool), StoreError>;

    /// participant ID → index of its last known event (-1 when only the
    /// root is known).
    fn known_events(&self) -> BTreeMap<i64, i64>;

    fn consensus_events(&self) -> Vec<Hash>;
    fn consensus_events_count(&self) -> usize;
    fn add_consensus_event(&mut self, event: &Event) -> Result<(), StoreError>;

    fn get_round(&self, index: i64) -> Result<RoundInfo, StoreError>;
    fn set_round(&mut self, index: i64, round: RoundInfo) -> Result<(), StoreError>;
    /// Highest round index seen, -1 when none.
    fn last_round(&self) -> i64;
    fn round_witnesses(&self, index: i64) -> Vec<Hash>;
    /// Number of rounds created.
    fn rounds(&self) -> usize;

    fn get_block(&self, index: i64) -> Result<Block, StoreError>;
    fn set_block(&mut self, block: Block) -> Result<(), StoreError>;
    /// Highest block index, -1 when none.
    fn last_block_index(&self) -> i64;

    fn get_frame(&self, round: i64) -> Result<Frame, StoreError>;
    fn set_frame(&mut self, frame: Frame) -> Result<(), StoreError>;

    fn get_root(&self, participant: &PubKey) -> Result<Root, StoreError>;
    /// All roots, keyed by their self-parent hash. Graph predicates use this
    /// to resolve hashes that predate the current frame.
    fn roots_by_self_parent(&self) -> &HashMap<Hash, Root>;

    /// Every stored event in topological (insertion) order, with derived
    /// consensus state cleared. This feeds `Engine::bootstrap`.
    fn topological_events(&self) -> Result<Vec<Event>, StoreError>;

    /// Replace all indexes with a fresh base derived from the given roots.
    /// Blocks survive a reset; everything event-related is dropped.
    fn reset(&mut self, roots: BTreeMap<PubKey, Root>) -> Result<(), StoreError>;
}
