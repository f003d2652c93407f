//! The consensus engine: a DAG of signed events plus the machinery to
//! extract a total order and map it onto a chain of blocks.
//!
//! The engine owns the undetermined-events and pending-rounds queues, the
//! signature pool, and the predicate caches. All mutating operations are
//! serialised by the caller (the core actor); nothing here is concurrent.

mod pipeline;
mod predicates;
mod rounds;

use std::collections::BTreeMap;

use plait_model::{
    Block, Event, Frame, Hash, Participants, PubKey, Root, WireEvent,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ConsensusError;
use crate::store::Store;
use predicates::Caches;

/// A round queued for fame decision.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingRound {
    pub index: i64,
    pub decided: bool,
}

/// The local node's identity and current head, used to stamp the head's
/// flag table and witness proof when it turns out to be a witness.
#[derive(Debug, Clone, Copy)]
pub struct LocalHead {
    pub pub_key: PubKey,
    pub head: Hash,
}

pub struct Engine {
    pub(crate) participants: Participants,
    pub(crate) store: Box<dyn Store>,
    commit_tx: Option<mpsc::UnboundedSender<Block>>,

    pub(crate) caches: Caches,

    /// FIFO queue of events whose consensus order is not yet determined.
    pub(crate) undetermined_events: Vec<Hash>,
    /// FIFO queue of rounds which have not attained consensus yet.
    pub(crate) pending_rounds: Vec<PendingRound>,

    pub(crate) last_consensus_round: Option<i64>,
    first_consensus_round: Option<i64>,
    pub(crate) anchor_block: Option<i64>,

    /// Pool of block signatures awaiting attachment.
    pub(crate) sig_pool: Vec<plait_model::BlockSignature>,

    pub(crate) consensus_transactions: u64,
    pub(crate) pending_loaded_events: usize,
    topological_index: i64,

    pub(crate) local_head: Option<LocalHead>,
}

impl Engine {
    pub fn new(
        participants: Participants,
        store: Box<dyn Store>,
        commit_tx: Option<mpsc::UnboundedSender<Block>>,
    ) -> Self {
        let caches = Caches::new(store.cache_size());
        Engine {
            participants,
            store,
            commit_tx,
            caches,
            undetermined_events: Vec::new(),
            pending_rounds: Vec::new(),
            last_consensus_round: None,
            first_consensus_round: None,
            anchor_block: None,
            sig_pool: Vec::new(),
            consensus_transactions: 0,
            pending_loaded_events: 0,
            topological_index: 0,
            local_head: None,
        }
    }

    pub fn participants(&self) -> &Participants {
        &self.participants
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn super_majority(&self) -> usize {
        self.participants.super_majority()
    }

    pub fn trust_count(&self) -> usize {
        self.participants.trust_count()
    }

    pub fn last_consensus_round(&self) -> Option<i64> {
        self.last_consensus_round
    }

    pub fn first_consensus_round(&self) -> Option<i64> {
        self.first_consensus_round
    }

    pub fn anchor_block(&self) -> Option<i64> {
        self.anchor_block
    }

    pub fn undetermined_events(&self) -> &[Hash] {
        &self.undetermined_events
    }

    pub fn pending_loaded_events(&self) -> usize {
        self.pending_loaded_events
    }

    pub fn consensus_transactions(&self) -> u64 {
        self.consensus_transactions
    }

    pub fn sig_pool_len(&self) -> usize {
        self.sig_pool.len()
    }

    /// Tell the engine which event is the local node's head. The pipeline
    /// stamps the head's flag table when it becomes a witness.
    pub fn set_local_head(&mut self, pub_key: PubKey, head: Hash) {
        self.local_head = Some(LocalHead { pub_key, head });
    }

    /// Queue a block signature for `process_sig_pool`.
    pub fn add_block_signature(&mut self, sig: plait_model::BlockSignature) {
        self.sig_pool.push(sig);
    }

    /// Drop all memoisation caches. Predicate results are pure functions of
    /// the DAG + roots, so this affects throughput only.
    pub fn clear_caches(&mut self) {
        self.caches = Caches::new(self.store.cache_size());
    }

    /// Persist a block (used when the local node signs one).
    pub fn set_block(&mut self, block: Block) -> Result<(), ConsensusError> {
        self.store.set_block(block)?;
        Ok(())
    }

    pub(crate) fn set_last_consensus_round(&mut self, round: i64) {
        self.last_consensus_round = Some(round);
        if self.first_consensus_round.is_none() {
            self.first_consensus_round = Some(round);
        }
    }

    // -----------------------------------------------------------------------
    // Insertion
    // -----------------------------------------------------------------------

    /// Insert an event into the DAG. Verifies the signature, checks both
    /// parents are known, and refuses forks (the self-parent must be the
    /// creator's last known event). All-or-nothing: a rejected event leaves
    /// no partial state behind.
    pub fn insert_event(&mut self, mut event: Event, set_wire_info: bool) -> Result<(), ConsensusError> {
        if event.verify().is_err() {
            debug!(
                creator = %event.creator(),
                index = event.index(),
                hash = %event.hash(),
                "invalid event signature"
            );
            return Err(ConsensusError::InvalidSignature);
        }

        self.check_self_parent(&event)?;
        self.check_other_parent(&event)?;

        event.topological_index = self.topological_index;

        if set_wire_info {
            self.set_wire_info(&mut event)?;
        }

        let hash = event.hash();
        let loaded = event.is_loaded();
        let signatures = event.block_signatures().to_vec();

        self.store.set_event(event)?;
        self.topological_index += 1;

        self.undetermined_events.push(hash);
        if loaded {
            self.pending_loaded_events += 1;
        }
        self.sig_pool.extend(signatures);

        Ok(())
    }

    /// The self-parent must be the creator's last known event. This is what
    /// keeps forks out of the DAG.
    fn check_self_parent(&mut self, event: &Event) -> Result<(), ConsensusError> {
        let (last_known, _) = self.store.last_event_from(&event.creator())?;
        if event.self_parent() != last_known {
            debug!(
                creator = %event.creator(),
                self_parent = %event.self_parent(),
                last_known = %last_known,
                "self-parent mismatch"
            );
            return Err(ConsensusError::SelfParentMismatch);
        }
        Ok(())
    }

    /// The other-parent must be a known event or recorded in the creator's
    /// root.
    fn check_other_parent(&mut self, event: &Event) -> Result<(), ConsensusError> {
        let Some(op) = event.other_parent() else {
            return Ok(());
        };
        match self.store.get_event(&op) {
            Ok(_) => Ok(()),
            Err(e) if e.is_key_not_found() => {
                let root = self.store.get_root(&event.creator())?;
                let in_root = root
                    .others
                    .get(&event.hash())
                    .is_some_and(|other| other.hash == op);
                if in_root {
                    Ok(())
                } else {
                    Err(ConsensusError::UnknownOtherParent)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Wire info
    // -----------------------------------------------------------------------

    /// Fill in the integer shortcuts gossip uses in place of parent hashes.
    pub(crate) fn set_wire_info(&mut self, event: &mut Event) -> Result<(), ConsensusError> {
        let creator = event.creator();
        let creator_id = self
            .participants
            .by_pub_key(&creator)
            .ok_or(ConsensusError::UnknownParticipant(creator))?
            .id;

        // Could be the first event of this creator; use the root then.
        let self_parent_index = {
            let (last, is_root) = self.store.last_event_from(&creator)?;
            if is_root && last == event.self_parent() {
                self.store.get_root(&creator)?.self_parent.index
            } else {
                self.store.get_event(&event.self_parent())?.index()
            }
        };

        let mut other_parent_creator_id = -1;
        let mut other_parent_index = -1;
        if let Some(op) = event.other_parent() {
            let root = self.store.get_root(&creator)?;
            if let Some(other) = root.others.get(&event.hash()).filter(|o| o.hash == op) {
                other_parent_creator_id = other.creator_id;
                other_parent_index = other.index;
            } else {
                let other_parent = self.store.get_event(&op)?;
                other_parent_creator_id = self
                    .participants
                    .by_pub_key(&other_parent.creator())
                    .ok_or(ConsensusError::UnknownParticipant(other_parent.creator()))?
                    .id;
                other_parent_index = other_parent.index();
            }
        }

        event.set_wire_info(
            self_parent_index,
            other_parent_creator_id,
            other_parent_index,
            creator_id,
        );
        Ok(())
    }

    /// Convert a wire event back into a full event by resolving the integer
    /// shortcuts against the store (falling back to the creator's root for
    /// out-of-frame other-parents).
    pub fn read_wire_info(&mut self, wire: WireEvent) -> Result<Event, ConsensusError> {
        let creator = self
            .participants
            .by_id(wire.body.creator_id)
            .ok_or(ConsensusError::UnknownCreatorId(wire.body.creator_id))?
            .clone();

        let self_parent = if wire.body.self_parent_index >= 0 {
            self.store
                .participant_event(&creator.pub_key, wire.body.self_parent_index)?
        } else {
            self.store.get_root(&creator.pub_key)?.self_parent.hash
        };

        let mut other_parent = None;
        if wire.body.other_parent_index >= 0 {
            let op_creator = self
                .participants
                .by_id(wire.body.other_parent_creator_id)
                .ok_or(ConsensusError::UnknownCreatorId(
                    wire.body.other_parent_creator_id,
                ))?
                .clone();
            match self
                .store
                .participant_event(&op_creator.pub_key, wire.body.other_parent_index)
            {
                Ok(hash) => other_parent = Some(hash),
                Err(e) if e.is_key_not_found() => {
                    // The other-parent may predate the frame: search the
                    // creator's root for a matching stand-in.
                    let root = self.store.get_root(&creator.pub_key)?;
                    let found = root.others.values().find(|re| {
                        re.creator_id == wire.body.other_parent_creator_id
                            && re.index == wire.body.other_parent_index
                    });
                    match found {
                        Some(re) => other_parent = Some(re.hash),
                        None => return Err(ConsensusError::UnknownOtherParent),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        if wire.flag_table.is_empty() {
            return Err(ConsensusError::EmptyFlagTable);
        }

        let block_signatures = wire.block_signatures(&creator.pub_key);
        let mut event = Event::new(
            wire.body.transactions,
            wire.body.internal_transactions,
            block_signatures,
            self_parent,
            other_parent,
            creator.pub_key,
            wire.body.index,
            wire.flag_table,
        );
        event.message.signature = wire.signature;
        event.message.witness_proof = wire.witness_proof;
        event.set_wire_info(
            wire.body.self_parent_index,
            wire.body.other_parent_creator_id,
            wire.body.other_parent_index,
            wire.body.creator_id,
        );
        Ok(event)
    }

    // -----------------------------------------------------------------------
    // Block checks
    // -----------------------------------------------------------------------

    /// A block is acceptable as a reset base only with signatures from more
    /// than one third of participants.
    pub fn check_block(&self, block: &Block) -> Result<(), ConsensusError> {
        let mut valid = 0usize;
        for sig in block.block_signatures() {
            if block.verify(&sig).unwrap_or(false) {
                valid += 1;
            }
        }
        if valid <= self.trust_count() {
            return Err(ConsensusError::NotEnoughSignatures {
                got: valid,
                need: self.trust_count() + 1,
            });
        }
        debug!(valid_signatures = valid, "block check passed");
        Ok(())
    }

    /// The anchor block and its frame, the base for resetting a peer.
    pub fn anchor_block_with_frame(&mut self) -> Result<(Block, Frame), ConsensusError> {
        let index = self.anchor_block.ok_or(ConsensusError::NoAnchorBlock)?;
        let block = self.store.get_block(index)?;
        let frame = self.get_frame(block.round_received())?;
        Ok((block, frame))
    }

    // -----------------------------------------------------------------------
    // Reset & bootstrap
    // -----------------------------------------------------------------------

    /// Clear the engine and re-seed it from a (block, frame) pair.
    pub fn reset(&mut self, block: Block, frame: Frame) -> Result<(), ConsensusError> {
        self.last_consensus_round = None;
        self.first_consensus_round = None;
        self.anchor_block = None;

        self.undetermined_events.clear();
        self.pending_rounds.clear();
        self.pending_loaded_events = 0;
        self.topological_index = 0;

        self.clear_caches();

        // Frame roots are in canonical participant order.
        let roots: BTreeMap<PubKey, Root> = self
            .participants
            .iter()
            .map(|p| p.pub_key)
            .zip(frame.roots.iter().cloned())
            .collect();
        self.store.reset(roots)?;

        self.store.set_block(block.clone())?;
        self.set_last_consensus_round(block.round_received());

        // Frame events are consistent with the roots; wire info is already
        // set, so parents need no re-resolution.
        for message in frame.events {
            self.insert_event(Event::from_message(message), false)?;
        }

        Ok(())
    }

    /// Rebuild all consensus state by replaying the store's topological
    /// event log through the full pipeline.
    pub fn bootstrap(&mut self) -> Result<(), ConsensusError> {
        let events = self.store.topological_events()?;
        debug!(events = events.len(), "bootstrap replay");
        for event in events {
            self.insert_event(event, true)?;
        }
        self.divide_rounds()?;
        self.decide_fame()?;
        self.decide_round_received()?;
        self.process_decided_rounds()?;
        self.process_sig_pool()?;
        Ok(())
    }

    pub(crate) fn send_commit(&mut self, block: Block) {
        if let Some(tx) = &self.commit_tx {
            // A closed channel is backpressure from a shutting-down
            // application, not an error.
            if tx.send(block).is_err() {
                tracing::warn!("commit channel closed; dropping block");
            }
        }
    }
}
