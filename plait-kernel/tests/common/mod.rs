#![allow(dead_code)] // each test binary uses a subset of these helpers

//! Shared fixtures for consensus tests.
//!
//! DAGs are described as a list of `Play`s on top of one seed event per
//! participant, mirroring the canonical three-node gossip pattern:
//!
//! ```text
//! h0  |   h2
//! | \ | / |
//! |   h1  |
//! |  /|   |
//! g02 |   |
//! | \ |   |
//! |   \   |
//! |   | \ |
//! |   |  g21
//! |   | / |
//! |  g10  |
//! | / |   |
//! g0  |   g2
//! | \ | / |
//! |   g1  |
//! ...
//! e0  e1  e2
//! ```
//!
//! Flag tables are the witnesses of the self-parent's round that the event
//! strongly sees, hand-derived for the fixture graph; witness proofs carry
//! the previous round's witnesses, as a live node would stamp them.

use std::collections::HashMap;

use plait_kernel::{Engine, InmemStore};
use plait_model::{crypto, Event, FlagTable, Hash, Participants, PubKey};

pub const CACHE_SIZE: usize = 100;

pub struct TestNode {
    pub key: ed25519_dalek::SigningKey,
    pub pub_key: PubKey,
    pub id: i64,
}

impl TestNode {
    pub fn new(seed: u8) -> Self {
        let key = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
        let pub_key = crypto::public_key(&key);
        let id = crypto::participant_id(&pub_key);
        TestNode { key, pub_key, id }
    }
}

/// One event on top of the seeds: creator (by node position), index within
/// the creator, parents, payload, flag table and witness proof by name.
pub struct Play {
    pub to: usize,
    pub index: i64,
    pub self_parent: &'static str,
    pub other_parent: Option<&'static str>,
    pub name: &'static str,
    pub txs: Vec<Vec<u8>>,
    pub known: &'static [&'static str],
    pub proof: &'static [&'static str],
}

impl Play {
    pub fn new(
        to: usize,
        index: i64,
        self_parent: &'static str,
        other_parent: Option<&'static str>,
        name: &'static str,
        txs: Vec<Vec<u8>>,
        known: &'static [&'static str],
        proof: &'static [&'static str],
    ) -> Self {
        Play {
            to,
            index,
            self_parent,
            other_parent,
            name,
            txs,
            known,
            proof,
        }
    }
}

pub fn test_nodes(n: u8) -> Vec<TestNode> {
    (1..=n).map(TestNode::new).collect()
}

pub fn participants(nodes: &[TestNode]) -> Participants {
    Participants::new(nodes.iter().map(|n| n.pub_key)).unwrap()
}

pub fn new_engine(nodes: &[TestNode]) -> Engine {
    let participants = participants(nodes);
    let store = InmemStore::new(participants.clone(), CACHE_SIZE);
    Engine::new(participants, Box::new(store), None)
}

/// Build the seed events (one index-0 event per node, self-acknowledging
/// flag table) plus every play, in order. Returns the events and a
/// name → hash index.
pub fn build_events(
    nodes: &[TestNode],
    plays: &[Play],
) -> (Vec<Event>, HashMap<&'static str, Hash>) {
    let mut events = Vec::new();
    let mut index: HashMap<&'static str, Hash> = HashMap::new();

    let seed_names = ["e0", "e1", "e2", "e3", "e4", "e5", "e6", "e7"];
    for (i, node) in nodes.iter().enumerate() {
        let root_hash = crypto::root_self_parent(node.id);
        let mut event = Event::new(
            vec![],
            vec![],
            vec![],
            root_hash,
            None,
            node.pub_key,
            0,
            FlagTable::new(),
        );
        let own = event.hash();
        event.message.flag_table.insert(own);
        event.message.witness_proof = vec![root_hash];
        event.sign(&node.key);
        index.insert(seed_names[i], event.hash());
        events.push(event);
    }

    for play in plays {
        let node = &nodes[play.to];
        let self_parent = index[play.self_parent];
        let other_parent = play.other_parent.map(|n| index[n]);
        let flag_table: FlagTable = play.known.iter().map(|n| index[n]).collect();

        let mut event = Event::new(
            play.txs.clone(),
            vec![],
            vec![],
            self_parent,
            other_parent,
            node.pub_key,
            play.index,
            flag_table,
        );
        event.message.witness_proof = play.proof.iter().map(|n| index[n]).collect();
        event.sign(&node.key);
        index.insert(play.name, event.hash());
        events.push(event);
    }

    (events, index)
}

pub fn insert_all(engine: &mut Engine, events: &[Event]) {
    for (i, event) in events.iter().enumerate() {
        if let Err(e) = engine.insert_event(event.clone(), true) {
            panic!("inserting event {i} failed: {e}");
        }
    }
}

/// The five-event extension of the seeds used by the round/witness tests.
///
/// ```text
/// |   f1  |
/// |  /|   |
/// e02 |   |
/// | \ |   |
/// |   \   |
/// |   | \ |
/// |   |  e21
/// |   | / |
/// |  e10  |
/// | / |   |
/// e0  e1  e2
/// ```
pub fn round_plays() -> Vec<Play> {
    vec![
        Play::new(1, 1, "e1", Some("e0"), "e10", vec![], &[], &[]),
        Play::new(2, 1, "e2", Some("e10"), "e21", vec![], &["e0"], &[]),
        Play::new(0, 1, "e0", Some("e21"), "e02", vec![], &["e0", "e1"], &[]),
        Play::new(
            1,
            2,
            "e10",
            Some("e02"),
            "f1",
            vec![],
            &["e0", "e1", "e2"],
            &["e0", "e1", "e2"],
        ),
    ]
}

/// The full 18-event pattern (e/f/g/h) used by the consensus tests. One
/// transaction rides on e21 so the first decided frame produces a block.
pub fn consensus_plays() -> Vec<Play> {
    vec![
        Play::new(1, 1, "e1", Some("e0"), "e10", vec![], &[], &[]),
        Play::new(
            2,
            1,
            "e2",
            Some("e10"),
            "e21",
            vec![b"e21-payload".to_vec()],
            &["e0"],
            &[],
        ),
        Play::new(0, 1, "e0", Some("e21"), "e02", vec![], &["e0", "e1"], &[]),
        Play::new(
            1,
            2,
            "e10",
            Some("e02"),
            "f1",
            vec![],
            &["e0", "e1", "e2"],
            &["e0", "e1", "e2"],
        ),
        Play::new(
            0,
            2,
            "e02",
            Some("f1"),
            "f0",
            vec![],
            &["e0", "e1", "e2"],
            &["e0", "e1", "e2"],
        ),
        Play::new(
            2,
            2,
            "e21",
            Some("f1"),
            "f2",
            vec![],
            &["e0", "e1", "e2"],
            &["e0", "e1", "e2"],
        ),
        Play::new(1, 3, "f1", Some("f0"), "f10", vec![], &[], &[]),
        Play::new(2, 3, "f2", Some("f10"), "f21", vec![], &["f0", "f1"], &[]),
        Play::new(0, 3, "f0", Some("f21"), "f02", vec![], &["f0", "f1"], &[]),
        Play::new(
            1,
            4,
            "f10",
            Some("f02"),
            "g1",
            vec![],
            &["f0", "f1", "f2"],
            &["f0", "f1", "f2"],
        ),
        Play::new(
            0,
            4,
            "f02",
            Some("g1"),
            "g0",
            vec![],
            &["f0", "f1", "f2"],
            &["f0", "f1", "f2"],
        ),
        Play::new(
            2,
            4,
            "f21",
            Some("g1"),
            "g2",
            vec![],
            &["f0", "f1", "f2"],
            &["f0", "f1", "f2"],
        ),
        Play::new(1, 5, "g1", Some("g0"), "g10", vec![], &[], &[]),
        Play::new(2, 5, "g2", Some("g10"), "g21", vec![], &["g0", "g1"], &[]),
        Play::new(0, 5, "g0", Some("g21"), "g02", vec![], &["g0", "g1"], &[]),
        Play::new(
            1,
            6,
            "g10",
            Some("g02"),
            "h1",
            vec![],
            &["g0", "g1", "g2"],
            &["g0", "g1", "g2"],
        ),
        Play::new(
            0,
            6,
            "g02",
            Some("h1"),
            "h0",
            vec![],
            &["g0", "g1", "g2"],
            &["g0", "g1", "g2"],
        ),
        Play::new(
            2,
            6,
            "g21",
            Some("h1"),
            "h2",
            vec![],
            &["g0", "g1", "g2"],
            &["g0", "g1", "g2"],
        ),
    ]
}

/// Reverse lookup for assertion messages.
pub fn name_of(index: &HashMap<&'static str, Hash>, hash: &Hash) -> String {
    index
        .iter()
        .find(|(_, h)| *h == hash)
        .map(|(n, _)| n.to_string())
        .unwrap_or_else(|| format!("{hash}"))
}
