//! The five-pass consensus pipeline.
//!
//! Each pass drains state set up by the previous one and is idempotent:
//! re-running the pipeline on unchanged input is a no-op, and a crash
//! between passes is recovered by bootstrap.
//!
//! divide_rounds → decide_fame → decide_round_received →
//! process_decided_rounds → process_sig_pool

use std::collections::{BTreeMap, HashMap, HashSet};

use plait_model::{cmp_by_lamport, crypto, Block, Event, FlagTable, Frame, Hash, PubKey, Root};
use tracing::{debug, warn};

use super::{Engine, PendingRound};
use crate::error::ConsensusError;

impl Engine {
    // -----------------------------------------------------------------------
    // DivideRounds
    // -----------------------------------------------------------------------

    /// Assign a round and Lamport timestamp to every undetermined event,
    /// flag witnesses, and queue fresh rounds for fame decision.
    pub fn divide_rounds(&mut self) -> Result<(), ConsensusError> {
        let undetermined = self.undetermined_events.clone();
        for hash in undetermined {
            let mut ev = self.store.get_event(&hash)?;
            let mut update_event = false;

            if ev.round.is_none() {
                let round_number = self.round(&hash)?;
                ev.set_round(round_number);
                update_event = true;

                let mut round_info = match self.store.get_round(round_number) {
                    Ok(info) => info,
                    Err(e) if e.is_key_not_found() => Default::default(),
                    Err(e) => return Err(e.into()),
                };

                // The lower bound keeps the base layer of a reset from being
                // reprocessed: normally no event lands below the last
                // consensus round, but a reset jumps straight into the
                // middle of the DAG.
                if !round_info.queued
                    && self
                        .last_consensus_round
                        .map_or(true, |lcr| round_number >= lcr)
                {
                    self.pending_rounds.push(PendingRound {
                        index: round_number,
                        decided: false,
                    });
                    round_info.queued = true;
                }

                let witness = self.witness(&hash)?;
                round_info.add_event(hash, witness);
                self.store.set_round(round_number, round_info)?;

                if witness {
                    self.stamp_local_head(&mut ev, &hash, round_number)?;
                }
            }

            if ev.lamport_timestamp.is_none() {
                let timestamp = self.lamport_timestamp(&hash)?;
                ev.set_lamport_timestamp(timestamp);
                update_event = true;
            }

            if update_event {
                if !ev.wire_info_set() {
                    self.set_wire_info(&mut ev)?;
                }
                self.store.set_event(ev)?;
            }
        }
        Ok(())
    }

    /// If the witness is the local head, overwrite its flag table with the
    /// witnesses of its round and its witness proof with the witnesses of
    /// the previous round (or the root self-parent for round 0).
    fn stamp_local_head(
        &mut self,
        ev: &mut Event,
        hash: &Hash,
        round: i64,
    ) -> Result<(), ConsensusError> {
        let Some(local) = self.local_head else {
            return Ok(());
        };
        if *hash != local.head || ev.creator() != local.pub_key {
            return Ok(());
        }

        let flag_table: FlagTable = self.store.round_witnesses(round).into_iter().collect();
        ev.replace_flag_table(flag_table);

        if round == 0 {
            let root = self.store.get_root(&ev.creator())?;
            ev.message.witness_proof = vec![root.self_parent.hash];
        } else {
            ev.message.witness_proof = self.store.round_witnesses(round - 1);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // DecideFame
    // -----------------------------------------------------------------------

    /// Decide the fame of witnesses by simulating the votes of later-round
    /// witnesses. Every `n`-th round is a coin round where a deterministic
    /// bit of the voter's hash breaks meta-stable splits.
    pub fn decide_fame(&mut self) -> Result<(), ConsensusError> {
        // votes[(y, x)] = y's vote on x's fame
        let mut votes: HashMap<(Hash, Hash), bool> = HashMap::new();

        // round number → position in pending_rounds
        let mut decided_rounds: BTreeMap<i64, usize> = BTreeMap::new();

        let pending = self.pending_rounds.clone();
        let n = self.participants.len() as i64;

        for (pos, pending_round) in pending.iter().enumerate() {
            let round_index = pending_round.index;
            let mut round_info = self.store.get_round(round_index)?;

            for x in round_info.witnesses() {
                if round_info.is_decided(&x) {
                    continue;
                }

                'vote_loop: for j in round_index + 1..=self.store.last_round() {
                    for y in self.store.round_witnesses(j) {
                        let diff = j - round_index;
                        if diff == 1 {
                            let sees = self.see(&y, &x)?;
                            votes.insert((y, x), sees);
                            continue;
                        }

                        // Count the votes of the strongly-seen witnesses of
                        // the previous round.
                        let mut strongly_seen = Vec::new();
                        for w in self.store.round_witnesses(j - 1) {
                            if self.strongly_see(&y, &w)? {
                                strongly_seen.push(w);
                            }
                        }
                        let mut yays = 0usize;
                        let mut nays = 0usize;
                        for w in &strongly_seen {
                            if votes.get(&(*w, x)).copied().unwrap_or(false) {
                                yays += 1;
                            } else {
                                nays += 1;
                            }
                        }
                        let vote = yays >= nays;
                        let tally = yays.max(nays);

                        // A single-participant network has no meta-stable
                        // splits to break; every round is a normal round.
                        if n == 1 || diff % n != 0 {
                            // normal round
                            if tally >= self.super_majority() {
                                round_info.set_fame(&x, vote);
                                votes.insert((y, x), vote);
                                break 'vote_loop;
                            }
                            votes.insert((y, x), vote);
                        } else {
                            // coin round
                            if tally >= self.super_majority() {
                                votes.insert((y, x), vote);
                            } else {
                                votes.insert((y, x), crypto::middle_bit(&y));
                            }
                        }
                    }
                }
            }

            let decided = round_info.witnesses_decided();
            self.store.set_round(round_index, round_info)?;
            if decided {
                decided_rounds.insert(round_index, pos);
            }
        }

        for pending_round in &mut self.pending_rounds {
            if decided_rounds.contains_key(&pending_round.index) {
                pending_round.decided = true;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // DecideRoundReceived
    // -----------------------------------------------------------------------

    /// An event is received in the first decided round whose famous
    /// witnesses all see it.
    pub fn decide_round_received(&mut self) -> Result<(), ConsensusError> {
        let mut still_undetermined = Vec::new();

        let undetermined = self.undetermined_events.clone();
        for x in undetermined {
            let mut received = false;
            let r = self.round(&x)?;

            for i in r + 1..=self.store.last_round() {
                let mut round_info = match self.store.get_round(i) {
                    Ok(info) => info,
                    Err(e) => {
                        // Can happen after a reset/fast-forward: rounds below
                        // the last consensus round are already settled.
                        if self.last_consensus_round.is_some_and(|lcr| r < lcr) {
                            received = true;
                            break;
                        }
                        return Err(e.into());
                    }
                };

                // Rounds are visited in order; one undecided round means
                // this event cannot be received yet.
                if !round_info.witnesses_decided() {
                    break;
                }

                let famous = round_info.famous_witnesses();
                let mut seen_by = 0usize;
                for w in &famous {
                    if self.see(w, &x)? {
                        seen_by += 1;
                    }
                }

                if seen_by == famous.len() && seen_by > 0 {
                    received = true;

                    let mut ev = self.store.get_event(&x)?;
                    ev.set_round_received(i);
                    self.store.set_event(ev)?;

                    round_info.set_consensus_event(x);
                    self.store.set_round(i, round_info)?;
                    break;
                }
            }

            if !received {
                still_undetermined.push(x);
            }
        }

        self.undetermined_events = still_undetermined;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // ProcessDecidedRounds
    // -----------------------------------------------------------------------

    /// Turn decided rounds into frames and blocks, in round order, stopping
    /// at the first undecided round.
    pub fn process_decided_rounds(&mut self) -> Result<(), ConsensusError> {
        let mut processed = 0usize;
        let result = self.process_decided_rounds_inner(&mut processed);
        self.pending_rounds.drain(..processed);
        result
    }

    fn process_decided_rounds_inner(
        &mut self,
        processed: &mut usize,
    ) -> Result<(), ConsensusError> {
        let pending = self.pending_rounds.clone();
        for pending_round in &pending {
            // A later round can be decided before an earlier one, but
            // processing must stay in order.
            if !pending_round.decided {
                break;
            }

            // After a reset the last consensus round re-enters the queue,
            // but its consensus events are already committed.
            if self.last_consensus_round == Some(pending_round.index) {
                continue;
            }

            let frame = self.get_frame(pending_round.index)?;
            let round_info = self.store.get_round(pending_round.index)?;
            debug!(
                round_received = pending_round.index,
                witnesses = round_info.famous_witnesses().len(),
                events = frame.events.len(),
                "processing decided round"
            );

            if frame.events.is_empty() {
                debug!(round = pending_round.index, "no events to commit");
            } else {
                for message in &frame.events {
                    let ev = Event::from_message(message.clone());
                    self.store.add_consensus_event(&ev)?;
                    self.consensus_transactions += ev.transactions().len() as u64;
                    if ev.is_loaded() {
                        self.pending_loaded_events =
                            self.pending_loaded_events.saturating_sub(1);
                    }
                }

                let block = Block::from_frame(self.store.last_block_index() + 1, &frame);
                if !block.transactions().is_empty() {
                    self.store.set_block(block.clone())?;
                    self.send_commit(block);
                }
            }

            *processed += 1;

            if self
                .last_consensus_round
                .map_or(true, |lcr| pending_round.index > lcr)
            {
                self.set_last_consensus_round(pending_round.index);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Frames
    // -----------------------------------------------------------------------

    /// The frame corresponding to a round-received: its consensus events in
    /// final order, plus a root per participant.
    pub fn get_frame(&mut self, round_received: i64) -> Result<Frame, ConsensusError> {
        match self.store.get_frame(round_received) {
            Ok(frame) => return Ok(frame),
            Err(e) if e.is_key_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let round_info = self.store.get_round(round_received)?;
        let mut events = Vec::new();
        for hash in round_info.consensus_events() {
            events.push(self.store.get_event(&hash)?);
        }
        events.sort_by(cmp_by_lamport);

        // The first frame event of each participant seeds its root.
        let mut roots: BTreeMap<PubKey, Root> = BTreeMap::new();
        for ev in &events {
            if !roots.contains_key(&ev.creator()) {
                let root = self.create_root(ev)?;
                roots.insert(ev.creator(), root);
            }
        }

        // Participants with no events in the frame inherit a root from
        // their last consensus event, or keep their current root.
        let participants: Vec<PubKey> = self.participants.pub_keys().copied().collect();
        for peer in &participants {
            if !roots.contains_key(peer) {
                let (last_consensus, is_root) = self.store.last_consensus_event_from(peer)?;
                let root = if is_root {
                    self.store.get_root(peer)?
                } else {
                    let last_event = self.store.get_event(&last_consensus)?;
                    self.create_root(&last_event)?
                };
                roots.insert(*peer, root);
            }
        }

        // Events may reference other-parents outside the frame. Record a
        // stand-in in the creator's root so the frame stays self-contained
        // when replayed into a reset DAG.
        let mut treated: HashSet<Hash> = HashSet::new();
        for i in 0..events.len() {
            let ev = events[i].clone();
            treated.insert(ev.hash());
            if let Some(op) = ev.other_parent() {
                if !treated.contains(&op) {
                    let self_parent_is_root = roots
                        .get(&ev.creator())
                        .is_some_and(|r| r.self_parent.hash == ev.self_parent());
                    if !self_parent_is_root {
                        let other = self.create_other_parent_root_event(&ev)?;
                        roots
                            .get_mut(&ev.creator())
                            .expect("root created above")
                            .others
                            .insert(ev.hash(), other);
                    }
                }
            }
        }

        // Canonical ordering: one root per participant, ascending ID.
        let ordered_roots: Vec<Root> = self
            .participants
            .pub_keys()
            .map(|pk| roots[pk].clone())
            .collect();

        let frame = Frame {
            round: round_received,
            roots: ordered_roots,
            events: events.into_iter().map(|e| e.message).collect(),
        };
        self.store.set_frame(frame.clone())?;
        Ok(frame)
    }

    // -----------------------------------------------------------------------
    // ProcessSigPool
    // -----------------------------------------------------------------------

    /// Attach pooled block signatures to their blocks; promote the anchor
    /// block when one accumulates more than the trust count.
    pub fn process_sig_pool(&mut self) -> Result<(), ConsensusError> {
        let mut processed: HashSet<usize> = HashSet::new();
        let pool = self.sig_pool.clone();

        for (i, sig) in pool.iter().enumerate() {
            if !self.participants.contains(&sig.validator) {
                warn!(
                    index = sig.index,
                    validator = %sig.validator,
                    "block signature from unknown validator"
                );
                processed.insert(i);
                continue;
            }

            // Signatures at or below the anchor block add nothing.
            if self.anchor_block.is_none() || sig.index > self.anchor_block.unwrap() {
                let mut block = match self.store.get_block(sig.index) {
                    Ok(block) => block,
                    Err(e) if e.is_key_not_found() => {
                        // Block not created yet; retry on the next run.
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                let valid = block.verify(sig)?;
                if !valid {
                    warn!(index = sig.index, validator = %sig.validator, "invalid block signature");
                    processed.insert(i);
                    continue;
                }

                block.set_signature(sig.clone());
                self.store.set_block(block.clone())?;

                if block.signatures.len() > self.trust_count()
                    && self.anchor_block.map_or(true, |a| block.index() > a)
                {
                    self.anchor_block = Some(block.index());
                    debug!(
                        block_index = block.index(),
                        signatures = block.signatures.len(),
                        trust_count = self.trust_count(),
                        "anchor block promoted"
                    );
                }
            }

            processed.insert(i);
        }

        self.sig_pool = pool
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !processed.contains(i))
            .map(|(_, sig)| sig)
            .collect();
        Ok(())
    }
}
