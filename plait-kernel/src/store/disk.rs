//! Disk-backed store.
//!
//! A redb database under the same in-memory indexes as `InmemStore`. Writes
//! go through to disk; reads are served from memory. After a restart the
//! in-memory side starts empty except for the roots — consensus state is
//! reconstructed by `Engine::bootstrap`, which replays `topological_events`
//! (read straight from the database) through the full pipeline. Blocks and
//! rounds are regenerated identically by the replay, so they are persisted
//! for inspection but never loaded back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use borsh::{BorshDeserialize, BorshSerialize};
use plait_model::{Block, Event, EventMessage, Frame, Hash, Participants, PubKey, Root, RoundInfo};
use redb::{Database, ReadableTable, TableDefinition};

use super::{InmemStore, Store, StoreError};

/// Events: blake3(borsh(body)) → borsh StoredEvent
const TABLE_EVENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("events");

/// Participant index: pubkey (32 bytes) ‖ event index (8 bytes big-endian) → event hash.
/// The key layout supports prefix scans per participant in index order.
const TABLE_PARTICIPANT_EVENTS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("participant_events");

/// Topological log: insertion counter (8 bytes big-endian) → event hash.
const TABLE_TOPOLOGICAL: TableDefinition<&[u8], &[u8]> = TableDefinition::new("topological");

/// Rounds: round index (8 bytes big-endian) → borsh RoundInfo
const TABLE_ROUNDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("rounds");

/// Blocks: block index (8 bytes big-endian) → borsh Block
const TABLE_BLOCKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("blocks");

/// Frames: round-received (8 bytes big-endian) → borsh Frame
const TABLE_FRAMES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("frames");

/// Roots: pubkey (32 bytes) → borsh Root
const TABLE_ROOTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("roots");

/// On-disk form of an event: the gossiped message plus the local insertion
/// counter. Derived consensus state is recomputed on bootstrap.
#[derive(BorshSerialize, BorshDeserialize)]
struct StoredEvent {
    message: EventMessage,
    topological_index: i64,
}

fn int_key(v: i64) -> [u8; 8] {
    debug_assert!(v >= 0, "negative index cannot be a storage key");
    (v as u64).to_be_bytes()
}

fn participant_key(participant: &PubKey, index: i64) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(participant.as_bytes());
    key[32..].copy_from_slice(&int_key(index));
    key
}

pub struct DiskStore {
    inmem: InmemStore,
    db: Database,
    path: PathBuf,
}

impl DiskStore {
    /// Open or create a database at `dir/plait.db`.
    ///
    /// Persisted roots are loaded; everything else waits for
    /// `Engine::bootstrap` to replay the topological log.
    pub fn open(
        dir: impl AsRef<Path>,
        participants: Participants,
        cache_size: usize,
    ) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| StoreError::InvalidData(format!("cannot create dir: {e}")))?;
        let path = dir.join("plait.db");
        let db = Database::builder().create(&path)?;

        // Ensure all tables exist
        {
            let write_txn = db.begin_write()?;
            let _ = write_txn.open_table(TABLE_EVENTS)?;
            let _ = write_txn.open_table(TABLE_PARTICIPANT_EVENTS)?;
            let _ = write_txn.open_table(TABLE_TOPOLOGICAL)?;
            let _ = write_txn.open_table(TABLE_ROUNDS)?;
            let _ = write_txn.open_table(TABLE_BLOCKS)?;
            let _ = write_txn.open_table(TABLE_FRAMES)?;
            let _ = write_txn.open_table(TABLE_ROOTS)?;
            write_txn.commit()?;
        }

        let mut store = DiskStore {
            inmem: InmemStore::new(participants, cache_size),
            db,
            path,
        };

        let persisted = store.load_roots()?;
        if persisted.is_empty() {
            // First open: persist the base roots
            store.persist_roots(&store.base_roots())?;
        } else {
            store.inmem.reset(persisted)?;
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn base_roots(&self) -> BTreeMap<PubKey, Root> {
        self.inmem
            .participants()
            .iter()
            .map(|p| (p.pub_key, Root::base(p.id)))
            .collect()
    }

    fn load_roots(&self) -> Result<BTreeMap<PubKey, Root>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_ROOTS)?;
        let mut roots = BTreeMap::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let pk = PubKey::try_from(k.value())
                .map_err(|_| StoreError::InvalidData("bad pubkey in roots table".into()))?;
            let root: Root = borsh::from_slice(v.value())?;
            roots.insert(pk, root);
        }
        Ok(roots)
    }

    fn persist_roots(&self, roots: &BTreeMap<PubKey, Root>) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_ROOTS)?;
            for (pk, root) in roots {
                let bytes = borsh::to_vec(root)?;
                table.insert(pk.as_bytes().as_slice(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl Store for DiskStore {
    fn cache_size(&self) -> usize {
        self.inmem.cache_size()
    }

    fn get_event(&self, hash: &Hash) -> Result<Event, StoreError> {
        self.inmem.get_event(hash)
    }

    fn set_event(&mut self, event: Event) -> Result<(), StoreError> {
        let hash = event.hash();
        let stored = StoredEvent {
            message: event.message.clone(),
            topological_index: event.topological_index,
        };
        let bytes = borsh::to_vec(&stored)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut events = write_txn.open_table(TABLE_EVENTS)?;
            events.insert(hash.as_bytes().as_slice(), bytes.as_slice())?;

            let mut by_participant = write_txn.open_table(TABLE_PARTICIPANT_EVENTS)?;
            let pkey = participant_key(&event.creator(), event.index());
            by_participant.insert(pkey.as_slice(), hash.as_bytes().as_slice())?;

            let mut topological = write_txn.open_table(TABLE_TOPOLOGICAL)?;
            let tkey = int_key(event.topological_index);
            topological.insert(tkey.as_slice(), hash.as_bytes().as_slice())?;
        }
        write_txn.commit()?;

        self.inmem.set_event(event)
    }

    fn participant_event(&self, participant: &PubKey, index: i64) -> Result<Hash, StoreError> {
        self.inmem.participant_event(participant, index)
    }

    fn participant_events(&self, participant: &PubKey, since: i64) -> Result<Vec<Hash>, StoreError> {
        self.inmem.participant_events(participant, since)
    }

    fn last_event_from(&self, participant: &PubKey) -> Result<(Hash, bool), StoreError> {
        self.inmem.last_event_from(participant)
    }

    fn last_consensus_event_from(&self, participant: &PubKey) -> Result<(Hash, bool), StoreError> {
        self.inmem.last_consensus_event_from(participant)
    }

    fn known_events(&self) -> BTreeMap<i64, i64> {
        self.inmem.known_events()
    }

    fn consensus_events(&self) -> Vec<Hash> {
        self.inmem.consensus_events()
    }

    fn consensus_events_count(&self) -> usize {
        self.inmem.consensus_events_count()
    }

    fn add_consensus_event(&mut self, event: &Event) -> Result<(), StoreError> {
        self.inmem.add_consensus_event(event)
    }

    fn get_round(&self, index: i64) -> Result<RoundInfo, StoreError> {
        self.inmem.get_round(index)
    }

    fn set_round(&mut self, index: i64, round: RoundInfo) -> Result<(), StoreError> {
        let bytes = borsh::to_vec(&round)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_ROUNDS)?;
            table.insert(int_key(index).as_slice(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        self.inmem.set_round(index, round)
    }

    fn last_round(&self) -> i64 {
        self.inmem.last_round()
    }

    fn round_witnesses(&self, index: i64) -> Vec<Hash> {
        self.inmem.round_witnesses(index)
    }

    fn rounds(&self) -> usize {
        self.inmem.rounds()
    }

    fn get_block(&self, index: i64) -> Result<Block, StoreError> {
        self.inmem.get_block(index)
    }

    fn set_block(&mut self, block: Block) -> Result<(), StoreError> {
        let bytes = borsh::to_vec(&block)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_BLOCKS)?;
            table.insert(int_key(block.index()).as_slice(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        self.inmem.set_block(block)
    }

    fn last_block_index(&self) -> i64 {
        self.inmem.last_block_index()
    }

    fn get_frame(&self, round: i64) -> Result<Frame, StoreError> {
        self.inmem.get_frame(round)
    }

    fn set_frame(&mut self, frame: Frame) -> Result<(), StoreError> {
        let bytes = borsh::to_vec(&frame)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_FRAMES)?;
            table.insert(int_key(frame.round).as_slice(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        self.inmem.set_frame(frame)
    }

    fn get_root(&self, participant: &PubKey) -> Result<Root, StoreError> {
        self.inmem.get_root(participant)
    }

    fn roots_by_self_parent(&self) -> &std::collections::HashMap<Hash, Root> {
        self.inmem.roots_by_self_parent()
    }

    /// Read the persisted topological log, joining against the events table.
    /// Derived consensus state is cleared so the replay starts clean.
    fn topological_events(&self) -> Result<Vec<Event>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let topological = read_txn.open_table(TABLE_TOPOLOGICAL)?;
        let events = read_txn.open_table(TABLE_EVENTS)?;

        let mut result = Vec::new();
        for entry in topological.iter()? {
            let (_, hash_bytes) = entry?;
            let value = events.get(hash_bytes.value())?.ok_or_else(|| {
                StoreError::InvalidData("topological log references missing event".into())
            })?;
            let stored: StoredEvent = borsh::from_slice(value.value())?;
            result.push(Event::from_message(stored.message));
        }
        Ok(result)
    }

    /// Clear the event log and round/frame state on disk, then persist the
    /// new roots. Blocks survive, matching the in-memory semantics.
    fn reset(&mut self, roots: BTreeMap<PubKey, Root>) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            write_txn.delete_table(TABLE_EVENTS)?;
            write_txn.delete_table(TABLE_PARTICIPANT_EVENTS)?;
            write_txn.delete_table(TABLE_TOPOLOGICAL)?;
            write_txn.delete_table(TABLE_ROUNDS)?;
            write_txn.delete_table(TABLE_FRAMES)?;
            let _ = write_txn.open_table(TABLE_EVENTS)?;
            let _ = write_txn.open_table(TABLE_PARTICIPANT_EVENTS)?;
            let _ = write_txn.open_table(TABLE_TOPOLOGICAL)?;
            let _ = write_txn.open_table(TABLE_ROUNDS)?;
            let _ = write_txn.open_table(TABLE_FRAMES)?;
        }
        write_txn.commit()?;

        self.persist_roots(&roots)?;
        self.inmem.reset(roots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plait_model::{crypto, FlagTable};

    fn make_key(seed: u8) -> ed25519_dalek::SigningKey {
        ed25519_dalek::SigningKey::from_bytes(&[seed; 32])
    }

    fn make_participants(n: u8) -> (Participants, Vec<ed25519_dalek::SigningKey>) {
        let keys: Vec<_> = (1..=n).map(make_key).collect();
        let participants =
            Participants::new(keys.iter().map(crypto::public_key)).unwrap();
        (participants, keys)
    }

    fn chain_event(
        key: &ed25519_dalek::SigningKey,
        parent: Hash,
        index: i64,
        topo: i64,
    ) -> Event {
        let mut ev = Event::new(
            vec![vec![index as u8]],
            vec![],
            vec![],
            parent,
            None,
            crypto::public_key(key),
            index,
            FlagTable::new(),
        );
        ev.sign(key);
        ev.topological_index = topo;
        ev
    }

    #[test]
    fn persist_and_replay_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (participants, keys) = make_participants(1);
        let pk = crypto::public_key(&keys[0]);

        let (h0, h1) = {
            let mut store =
                DiskStore::open(dir.path(), participants.clone(), 100).unwrap();
            let root = store.get_root(&pk).unwrap();
            let e0 = chain_event(&keys[0], root.self_parent.hash, 0, 0);
            let e1 = chain_event(&keys[0], e0.hash(), 1, 1);
            store.set_event(e0.clone()).unwrap();
            store.set_event(e1.clone()).unwrap();
            (e0.hash(), e1.hash())
        };

        let store = DiskStore::open(dir.path(), participants, 100).unwrap();
        let topo = store.topological_events().unwrap();
        assert_eq!(topo.len(), 2);
        assert_eq!(topo[0].hash(), h0);
        assert_eq!(topo[1].hash(), h1);
        // Replay events come back with derived state cleared
        assert_eq!(topo[0].round, None);
        assert_eq!(topo[0].lamport_timestamp, None);
    }

    #[test]
    fn roots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (participants, keys) = make_participants(2);
        let pk = crypto::public_key(&keys[0]);

        let replacement = {
            let mut store =
                DiskStore::open(dir.path(), participants.clone(), 100).unwrap();
            let mut root = store.get_root(&pk).unwrap();
            root.next_round = 5;
            let roots: BTreeMap<PubKey, Root> = store
                .inmem
                .participants()
                .iter()
                .map(|p| (p.pub_key, root.clone()))
                .collect();
            store.reset(roots).unwrap();
            root
        };

        let store = DiskStore::open(dir.path(), participants, 100).unwrap();
        assert_eq!(store.get_root(&pk).unwrap(), replacement);
        assert!(store.topological_events().unwrap().is_empty());
    }

    #[test]
    fn reset_clears_event_log() {
        let dir = tempfile::tempdir().unwrap();
        let (participants, keys) = make_participants(1);
        let pk = crypto::public_key(&keys[0]);

        let mut store = DiskStore::open(dir.path(), participants, 100).unwrap();
        let root = store.get_root(&pk).unwrap();
        let e0 = chain_event(&keys[0], root.self_parent.hash, 0, 0);
        store.set_event(e0).unwrap();
        store
            .set_block(Block::new(0, 1, Hash([1u8; 32]), vec![b"tx".to_vec()]))
            .unwrap();

        let roots: BTreeMap<PubKey, Root> = store
            .inmem
            .participants()
            .iter()
            .map(|p| (p.pub_key, Root::base(p.id)))
            .collect();
        store.reset(roots).unwrap();

        assert!(store.topological_events().unwrap().is_empty());
        assert!(store.participant_events(&pk, -1).unwrap().is_empty());
        assert_eq!(store.last_block_index(), 0);
    }
}
