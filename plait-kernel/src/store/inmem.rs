//! In-memory store.
//!
//! Plain maps, no persistence. This is the backend used by tests and by
//! nodes that fast-forward from peers instead of replaying local history.

use std::collections::{BTreeMap, HashMap};

use plait_model::{Block, Event, Frame, Hash, Participants, PubKey, Root, RoundInfo};

use super::{Store, StoreError};

pub struct InmemStore {
    cache_size: usize,
    participants: Participants,

    events: HashMap<Hash, Event>,
    /// creator → (index → event hash), ascending.
    participant_events: HashMap<PubKey, BTreeMap<i64, Hash>>,

    roots: BTreeMap<PubKey, Root>,
    roots_by_self_parent: HashMap<Hash, Root>,

    rounds: BTreeMap<i64, RoundInfo>,
    blocks: BTreeMap<i64, Block>,
    frames: BTreeMap<i64, Frame>,

    consensus_events: Vec<Hash>,
    last_consensus_events: HashMap<PubKey, Hash>,

    last_round: i64,
    last_block_index: i64,
}

impl InmemStore {
    /// A fresh store with base roots for every participant.
    pub fn new(participants: Participants, cache_size: usize) -> Self {
        let roots: BTreeMap<PubKey, Root> = participants
            .iter()
            .map(|p| (p.pub_key, Root::base(p.id)))
            .collect();
        let roots_by_self_parent = index_roots(&roots);
        InmemStore {
            cache_size,
            participants,
            events: HashMap::new(),
            participant_events: HashMap::new(),
            roots,
            roots_by_self_parent,
            rounds: BTreeMap::new(),
            blocks: BTreeMap::new(),
            frames: BTreeMap::new(),
            consensus_events: Vec::new(),
            last_consensus_events: HashMap::new(),
            last_round: -1,
            last_block_index: -1,
        }
    }

    pub fn participants(&self) -> &Participants {
        &self.participants
    }
}

fn index_roots(roots: &BTreeMap<PubKey, Root>) -> HashMap<Hash, Root> {
    roots
        .values()
        .map(|r| (r.self_parent.hash, r.clone()))
        .collect()
}

impl Store for InmemStore {
    fn cache_size(&self) -> usize {
        self.cache_size
    }

    fn get_event(&self, hash: &Hash) -> Result<Event, StoreError> {
        self.events
            .get(hash)
            .cloned()
            .ok_or_else(|| StoreError::key_not_found(hash))
    }

    fn set_event(&mut self, event: Event) -> Result<(), StoreError> {
        let creator = event.creator();
        if !self.participants.contains(&creator) {
            return Err(StoreError::UnknownParticipant(creator));
        }
        let hash = event.hash();
        self.participant_events
            .entry(creator)
            .or_default()
            .insert(event.index(), hash);
        self.events.insert(hash, event);
        Ok(())
    }

    fn participant_event(&self, participant: &PubKey, index: i64) -> Result<Hash, StoreError> {
        self.participant_events
            .get(participant)
            .and_then(|m| m.get(&index))
            .copied()
            .ok_or_else(|| StoreError::key_not_found(format!("{participant}@{index}")))
    }

    fn participant_events(&self, participant: &PubKey, since: i64) -> Result<Vec<Hash>, StoreError> {
        Ok(self
            .participant_events
            .get(participant)
            .map(|m| {
                m.range(since + 1..)
                    .map(|(_, h)| *h)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default())
    }

    fn last_event_from(&self, participant: &PubKey) -> Result<(Hash, bool), StoreError> {
        if let Some((_, hash)) = self
            .participant_events
            .get(participant)
            .and_then(|m| m.iter().next_back())
        {
            return Ok((*hash, false));
        }
        let root = self
            .roots
            .get(participant)
            .ok_or(StoreError::UnknownParticipant(*participant))?;
        Ok((root.self_parent.hash, true))
    }

    fn last_consensus_event_from(&self, participant: &PubKey) -> Result<(Hash, bool), StoreError> {
        if let Some(hash) = self.last_consensus_events.get(participant) {
            return Ok((*hash, false));
        }
        let root = self
            .roots
            .get(participant)
            .ok_or(StoreError::UnknownParticipant(*participant))?;
        Ok((root.self_parent.hash, true))
    }

    fn known_events(&self) -> BTreeMap<i64, i64> {
        self.participants
            .iter()
            .map(|p| {
                let last = self
                    .participant_events
                    .get(&p.pub_key)
                    .and_then(|m| m.keys().next_back().copied())
                    .or_else(|| self.roots.get(&p.pub_key).map(|r| r.self_parent.index))
                    .unwrap_or(-1);
                (p.id, last)
            })
            .collect()
    }

    fn consensus_events(&self) -> Vec<Hash> {
        self.consensus_events.clone()
    }

    fn consensus_events_count(&self) -> usize {
        self.consensus_events.len()
    }

    fn add_consensus_event(&mut self, event: &Event) -> Result<(), StoreError> {
        self.consensus_events.push(event.hash());
        self.last_consensus_events
            .insert(event.creator(), event.hash());
        Ok(())
    }

    fn get_round(&self, index: i64) -> Result<RoundInfo, StoreError> {
        self.rounds
            .get(&index)
            .cloned()
            .ok_or_else(|| StoreError::key_not_found(format!("round {index}")))
    }

    fn set_round(&mut self, index: i64, round: RoundInfo) -> Result<(), StoreError> {
        self.rounds.insert(index, round);
        if index > self.last_round {
            self.last_round = index;
        }
        Ok(())
    }

    fn last_round(&self) -> i64 {
        self.last_round
    }

    fn round_witnesses(&self, index: i64) -> Vec<Hash> {
        self.rounds
            .get(&index)
            .map(|r| r.witnesses())
            .unwrap_or_default()
    }

    fn rounds(&self) -> usize {
        self.rounds.len()
    }

    fn get_block(&self, index: i64) -> Result<Block, StoreError> {
        self.blocks
            .get(&index)
            .cloned()
            .ok_or_else(|| StoreError::key_not_found(format!("block {index}")))
    }

    fn set_block(&mut self, block: Block) -> Result<(), StoreError> {
        let index = block.index();
        self.blocks.insert(index, block);
        if index > self.last_block_index {
            self.last_block_index = index;
        }
        Ok(())
    }

    fn last_block_index(&self) -> i64 {
        self.last_block_index
    }

    fn get_frame(&self, round: i64) -> Result<Frame, StoreError> {
        self.frames
            .get(&round)
            .cloned()
            .ok_or_else(|| StoreError::key_not_found(format!("frame {round}")))
    }

    fn set_frame(&mut self, frame: Frame) -> Result<(), StoreError> {
        self.frames.insert(frame.round, frame);
        Ok(())
    }

    fn get_root(&self, participant: &PubKey) -> Result<Root, StoreError> {
        self.roots
            .get(participant)
            .cloned()
            .ok_or_else(|| StoreError::key_not_found(format!("root of {participant}")))
    }

    fn roots_by_self_parent(&self) -> &HashMap<Hash, Root> {
        &self.roots_by_self_parent
    }

    fn topological_events(&self) -> Result<Vec<Event>, StoreError> {
        let mut events: Vec<&Event> = self.events.values().collect();
        events.sort_by_key(|e| e.topological_index);
        Ok(events
            .into_iter()
            .map(|e| Event::from_message(e.message.clone()))
            .collect())
    }

    fn reset(&mut self, roots: BTreeMap<PubKey, Root>) -> Result<(), StoreError> {
        self.events.clear();
        self.participant_events.clear();
        self.rounds.clear();
        self.frames.clear();
        self.consensus_events.clear();
        self.last_consensus_events.clear();
        self.last_round = -1;
        self.roots_by_self_parent = index_roots(&roots);
        self.roots = roots;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plait_model::{crypto, Event, FlagTable};

    fn make_key(seed: u8) -> ed25519_dalek::SigningKey {
        ed25519_dalek::SigningKey::from_bytes(&[seed; 32])
    }

    fn make_store(n: u8) -> (InmemStore, Vec<ed25519_dalek::SigningKey>) {
        let keys: Vec<_> = (1..=n).map(make_key).collect();
        let participants =
            Participants::new(keys.iter().map(crypto::public_key)).unwrap();
        (InmemStore::new(participants, 100), keys)
    }

    fn chain_event(key: &ed25519_dalek::SigningKey, parent: Hash, index: i64) -> Event {
        let mut ev = Event::new(
            vec![],
            vec![],
            vec![],
            parent,
            None,
            crypto::public_key(key),
            index,
            FlagTable::new(),
        );
        ev.sign(key);
        ev
    }

    #[test]
    fn events_and_participant_index() {
        let (mut store, keys) = make_store(2);
        let pk = crypto::public_key(&keys[0]);
        let root = store.get_root(&pk).unwrap();

        let (last, is_root) = store.last_event_from(&pk).unwrap();
        assert!(is_root);
        assert_eq!(last, root.self_parent.hash);

        let e0 = chain_event(&keys[0], root.self_parent.hash, 0);
        let e1 = chain_event(&keys[0], e0.hash(), 1);
        store.set_event(e0.clone()).unwrap();
        store.set_event(e1.clone()).unwrap();

        assert_eq!(store.participant_event(&pk, 0).unwrap(), e0.hash());
        assert_eq!(store.participant_event(&pk, 1).unwrap(), e1.hash());
        assert_eq!(
            store.participant_events(&pk, -1).unwrap(),
            vec![e0.hash(), e1.hash()]
        );
        assert_eq!(store.participant_events(&pk, 0).unwrap(), vec![e1.hash()]);

        let (last, is_root) = store.last_event_from(&pk).unwrap();
        assert!(!is_root);
        assert_eq!(last, e1.hash());

        let known = store.known_events();
        let id0 = crypto::participant_id(&pk);
        let id1 = crypto::participant_id(&crypto::public_key(&keys[1]));
        assert_eq!(known[&id0], 1);
        assert_eq!(known[&id1], -1);
    }

    #[test]
    fn unknown_creator_rejected() {
        let (mut store, _) = make_store(1);
        let stranger = make_key(99);
        let ev = chain_event(&stranger, Hash::ZERO, 0);
        assert!(matches!(
            store.set_event(ev),
            Err(StoreError::UnknownParticipant(_))
        ));
    }

    #[test]
    fn missing_event_is_key_not_found() {
        let (store, _) = make_store(1);
        let err = store.get_event(&Hash([9u8; 32])).unwrap_err();
        assert!(err.is_key_not_found());
    }

    #[test]
    fn rounds_and_blocks() {
        let (mut store, _) = make_store(1);
        assert_eq!(store.last_round(), -1);
        assert_eq!(store.last_block_index(), -1);

        let mut round = RoundInfo::default();
        round.add_event(Hash([1u8; 32]), true);
        store.set_round(2, round.clone()).unwrap();
        assert_eq!(store.last_round(), 2);
        assert_eq!(store.rounds(), 1);
        assert_eq!(store.get_round(2).unwrap(), round);
        assert_eq!(store.round_witnesses(2), vec![Hash([1u8; 32])]);
        assert!(store.round_witnesses(5).is_empty());

        let block = Block::new(0, 2, Hash([3u8; 32]), vec![b"tx".to_vec()]);
        store.set_block(block.clone()).unwrap();
        assert_eq!(store.last_block_index(), 0);
        assert_eq!(store.get_block(0).unwrap(), block);
    }

    #[test]
    fn reset_replaces_base_but_keeps_blocks() {
        let (mut store, keys) = make_store(2);
        let pk = crypto::public_key(&keys[0]);
        let root = store.get_root(&pk).unwrap();
        let e0 = chain_event(&keys[0], root.self_parent.hash, 0);
        store.set_event(e0).unwrap();
        store
            .set_block(Block::new(0, 1, Hash([3u8; 32]), vec![]))
            .unwrap();

        let mut new_root = Root::base(99);
        new_root.next_round = 1;
        let roots: BTreeMap<PubKey, Root> = store
            .participants()
            .iter()
            .map(|p| (p.pub_key, new_root.clone()))
            .collect();
        store.reset(roots).unwrap();

        // Events are gone, roots replaced, blocks survive
        assert!(store.participant_events(&pk, -1).unwrap().is_empty());
        assert_eq!(store.get_root(&pk).unwrap(), new_root);
        assert!(store
            .roots_by_self_parent()
            .contains_key(&new_root.self_parent.hash));
        assert_eq!(store.last_round(), -1);
        assert_eq!(store.last_block_index(), 0);
    }

    #[test]
    fn topological_order_preserved() {
        let (mut store, keys) = make_store(1);
        let pk = crypto::public_key(&keys[0]);
        let root = store.get_root(&pk).unwrap();

        let mut e0 = chain_event(&keys[0], root.self_parent.hash, 0);
        e0.topological_index = 0;
        let mut e1 = chain_event(&keys[0], e0.hash(), 1);
        e1.topological_index = 1;
        // Insert out of order; iteration must come back sorted
        store.set_event(e1.clone()).unwrap();
        store.set_event(e0.clone()).unwrap();

        let topo = store.topological_events().unwrap();
        assert_eq!(topo.len(), 2);
        assert_eq!(topo[0].hash(), e0.hash());
        assert_eq!(topo[1].hash(), e1.hash());
        // Derived state is cleared for replay
        assert_eq!(topo[0].round, None);
    }
}
