//! Core: the node-level wrapper around the consensus engine.
//!
//! Owns the signing key, tracks the local head and sequence number, pools
//! transactions and block signatures between gossip rounds, and translates
//! wire events in and out of the engine.

use std::collections::BTreeMap;

use plait_model::{
    cmp_by_topological, Block, BlockSignature, Event, FlagTable, Frame, Hash, Participants,
    PubKey, WireEvent,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::Engine;
use crate::error::ConsensusError;
use crate::store::Store;

pub struct Core {
    key: ed25519_dalek::SigningKey,
    pub_key: PubKey,
    id: i64,
    engine: Engine,

    head: Hash,
    seq: i64,

    transaction_pool: Vec<Vec<u8>>,
    block_signature_pool: Vec<BlockSignature>,
}

impl Core {
    pub fn new(
        key: ed25519_dalek::SigningKey,
        participants: Participants,
        store: Box<dyn Store>,
        commit_tx: Option<mpsc::UnboundedSender<Block>>,
    ) -> Self {
        let pub_key = plait_model::crypto::public_key(&key);
        let id = plait_model::crypto::participant_id(&pub_key);
        Core {
            key,
            pub_key,
            id,
            engine: Engine::new(participants, store, commit_tx),
            head: Hash::ZERO,
            seq: -1,
            transaction_pool: Vec::new(),
            block_signature_pool: Vec::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn pub_key(&self) -> PubKey {
        self.pub_key
    }

    pub fn head(&self) -> Hash {
        self.head
    }

    pub fn seq(&self) -> i64 {
        self.seq
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Resolve the head and sequence number from the store (through the
    /// root when the node has no events yet).
    pub fn set_head_and_seq(&mut self) -> Result<(), ConsensusError> {
        let (last, is_root) = self.engine.store().last_event_from(&self.pub_key)?;
        let (head, seq) = if is_root {
            let root = self.engine.store().get_root(&self.pub_key)?;
            (root.self_parent.hash, root.self_parent.index)
        } else {
            let last_event = self.engine.store().get_event(&last)?;
            (last, last_event.index())
        };

        self.head = head;
        self.seq = seq;
        self.engine.set_local_head(self.pub_key, head);
        debug!(head = %self.head, seq = self.seq, is_root, "head and seq set");
        Ok(())
    }

    /// Replay the persisted event log through the pipeline.
    pub fn bootstrap(&mut self) -> Result<(), ConsensusError> {
        self.engine.bootstrap()?;
        self.set_head_and_seq()
    }

    // -----------------------------------------------------------------------
    // Insertion
    // -----------------------------------------------------------------------

    pub fn sign_and_insert_self_event(&mut self, mut event: Event) -> Result<(), ConsensusError> {
        event.sign(&self.key);
        self.insert_event(event, true)
    }

    pub fn insert_event(&mut self, event: Event, set_wire_info: bool) -> Result<(), ConsensusError> {
        let creator = event.creator();
        let hash = event.hash();
        let index = event.index();
        self.engine.insert_event(event, set_wire_info)?;
        if creator == self.pub_key {
            self.head = hash;
            self.seq = index;
            self.engine.set_local_head(self.pub_key, hash);
        }
        Ok(())
    }

    pub fn known_events(&self) -> BTreeMap<i64, i64> {
        self.engine.store().known_events()
    }

    // -----------------------------------------------------------------------
    // Blocks
    // -----------------------------------------------------------------------

    /// Sign a block, persist the signature, and return it for gossip.
    pub fn sign_block(&mut self, mut block: Block) -> Result<BlockSignature, ConsensusError> {
        let sig = block.sign(&self.key);
        block.set_signature(sig.clone());
        self.engine.set_block(block)?;
        Ok(sig)
    }

    pub fn anchor_block_with_frame(&mut self) -> Result<(Block, Frame), ConsensusError> {
        self.engine.anchor_block_with_frame()
    }

    // -----------------------------------------------------------------------
    // Gossip
    // -----------------------------------------------------------------------

    /// True when the peer's knowledge trails ours by more than `sync_limit`
    /// events, in which case it should fast-forward instead of pulling.
    pub fn over_sync_limit(&self, known: &BTreeMap<i64, i64>, sync_limit: i64) -> bool {
        let mine = self.known_events();
        let mut unknown = 0i64;
        for (id, &last) in &mine {
            let theirs = known.get(id).copied().unwrap_or(-1);
            if last > theirs {
                unknown += last - theirs;
            }
        }
        unknown > sync_limit
    }

    /// Events we know about that the peer does not, in topological order.
    pub fn event_diff(&self, known: &BTreeMap<i64, i64>) -> Result<Vec<Event>, ConsensusError> {
        let mut unknown = Vec::new();
        for (id, &last) in known {
            let Some(participant) = self.engine.participants().by_id(*id) else {
                continue;
            };
            let pub_key = participant.pub_key;
            for hash in self.engine.store().participant_events(&pub_key, last)? {
                unknown.push(self.engine.store().get_event(&hash)?);
            }
        }
        unknown.sort_by(cmp_by_topological);
        Ok(unknown)
    }

    pub fn to_wire(&self, events: &[Event]) -> Vec<WireEvent> {
        events.iter().map(Event::to_wire).collect()
    }

    pub fn from_wire(&mut self, wire_events: Vec<WireEvent>) -> Result<Vec<Event>, ConsensusError> {
        wire_events
            .into_iter()
            .map(|w| self.engine.read_wire_info(w))
            .collect()
    }

    /// Ingest a batch of wire events from a peer, then record a new self
    /// event whose other-parent is the peer's head.
    pub fn sync(&mut self, unknown_events: Vec<WireEvent>) -> Result<(), ConsensusError> {
        debug!(
            unknown_events = unknown_events.len(),
            transaction_pool = self.transaction_pool.len(),
            block_signature_pool = self.block_signature_pool.len(),
            "sync"
        );

        let mut other_head = None;
        let count = unknown_events.len();
        for (k, wire) in unknown_events.into_iter().enumerate() {
            let event = self.engine.read_wire_info(wire)?;
            let hash = event.hash();
            self.insert_event(event, false)?;
            if k == count - 1 {
                other_head = Some(hash);
            }
        }

        self.add_self_event(other_head)
    }

    /// Fast-forward to a peer's (block, frame) pair after verifying the
    /// block's signatures and the frame hash.
    pub fn fast_forward(&mut self, block: Block, frame: Frame) -> Result<(), ConsensusError> {
        self.engine.check_block(&block)?;
        if block.frame_hash() != frame.hash() {
            return Err(ConsensusError::FrameHashMismatch);
        }
        self.engine.reset(block, frame)?;
        self.set_head_and_seq()?;
        self.run_consensus()?;
        Ok(())
    }

    /// Record a new self event carrying the pooled transactions and block
    /// signatures. Its flag table is the OR of both parents' tables.
    pub fn add_self_event(&mut self, other_head: Option<Hash>) -> Result<(), ConsensusError> {
        if other_head.is_none()
            && self.transaction_pool.is_empty()
            && self.block_signature_pool.is_empty()
        {
            debug!("empty transaction and block signature pools");
            return Ok(());
        }

        // The head may be a root self-parent (first event); it then has no
        // flags to inherit.
        let mut flag_table = match self.engine.store().get_event(&self.head) {
            Ok(parent) => parent.message.flag_table.clone(),
            Err(e) if e.is_key_not_found() => FlagTable::new(),
            Err(e) => return Err(e.into()),
        };
        if let Some(other) = other_head {
            if let Ok(other_parent) = self.engine.store().get_event(&other) {
                flag_table = flag_table.merge(&other_parent.message.flag_table);
            }
        }

        let mut event = Event::new(
            std::mem::take(&mut self.transaction_pool),
            Vec::new(),
            std::mem::take(&mut self.block_signature_pool),
            self.head,
            other_head,
            self.pub_key,
            self.seq + 1,
            flag_table,
        );
        // A first event has nothing to inherit; it acknowledges itself so
        // its flag table is never empty on the wire.
        if event.message.flag_table.is_empty() {
            let own = event.hash();
            event.message.flag_table.insert(own);
        }
        let transactions = event.transactions().len();
        let signatures = event.block_signatures().len();

        self.sign_and_insert_self_event(event)?;
        debug!(transactions, block_signatures = signatures, "created self event");
        Ok(())
    }

    /// Run the five consensus passes in order.
    pub fn run_consensus(&mut self) -> Result<(), ConsensusError> {
        self.engine.divide_rounds()?;
        self.engine.decide_fame()?;
        self.engine.decide_round_received()?;
        self.engine.process_decided_rounds()?;
        self.engine.process_sig_pool()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pools
    // -----------------------------------------------------------------------

    pub fn add_transactions(&mut self, txs: Vec<Vec<u8>>) {
        self.transaction_pool.extend(txs);
    }

    pub fn add_block_signature(&mut self, sig: BlockSignature) {
        self.block_signature_pool.push(sig);
    }

    pub fn transaction_pool_len(&self) -> usize {
        self.transaction_pool.len()
    }

    /// Something worth gossiping: uncommitted loaded events or non-empty
    /// pools.
    pub fn need_gossip(&self) -> bool {
        self.engine.pending_loaded_events() > 0
            || !self.transaction_pool.is_empty()
            || !self.block_signature_pool.is_empty()
    }

    pub fn head_event(&self) -> Result<Event, ConsensusError> {
        Ok(self.engine.store().get_event(&self.head)?)
    }

    pub fn consensus_events(&self) -> Vec<Hash> {
        self.engine.store().consensus_events()
    }

    pub fn consensus_events_count(&self) -> usize {
        self.engine.store().consensus_events_count()
    }

    pub fn consensus_transactions(&self) -> Result<Vec<Vec<u8>>, ConsensusError> {
        let mut txs = Vec::new();
        for hash in self.consensus_events() {
            let event = self.engine.store().get_event(&hash)?;
            txs.extend(event.transactions().iter().cloned());
        }
        Ok(txs)
    }

    pub fn last_block_index(&self) -> i64 {
        self.engine.store().last_block_index()
    }
}
