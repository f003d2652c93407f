//! Application proxy boundary.
//!
//! The engine delivers committed blocks to the application and, during
//! fast-forward, asks it for snapshots. The trait is synchronous and
//! state-machine shaped; the actor drives it with per-call deadlines.

use std::collections::HashMap;
use std::sync::Mutex;

use plait_model::{crypto, Block, Hash};

/// The application side of the commit boundary.
///
/// `commit_block` must apply the block's transactions deterministically and
/// return the resulting state hash. `snapshot`/`restore` support
/// fast-forwarding a lagging node.
pub trait Application: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn commit_block(&self, block: &Block) -> Result<Hash, Self::Error>;

    fn snapshot(&self, block_index: i64) -> Result<Vec<u8>, Self::Error>;

    fn restore(&self, snapshot: &[u8]) -> Result<Hash, Self::Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum InmemAppError {
    #[error("no snapshot for block {0}")]
    UnknownSnapshot(i64),
}

/// In-memory application used by tests and demos: state is the running
/// digest of every committed transaction, snapshots are kept per block.
pub struct InmemApp {
    inner: Mutex<InmemAppState>,
}

#[derive(Default)]
struct InmemAppState {
    committed: Vec<Vec<u8>>,
    state_hash: Hash,
    snapshots: HashMap<i64, Vec<u8>>,
}

impl InmemApp {
    pub fn new() -> Self {
        InmemApp {
            inner: Mutex::new(InmemAppState::default()),
        }
    }

    pub fn committed_transactions(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().committed.clone()
    }

    pub fn state_hash(&self) -> Hash {
        self.inner.lock().unwrap().state_hash
    }
}

impl Default for InmemApp {
    fn default() -> Self {
        Self::new()
    }
}

impl Application for InmemApp {
    type Error = InmemAppError;

    fn commit_block(&self, block: &Block) -> Result<Hash, Self::Error> {
        let mut state = self.inner.lock().unwrap();
        let mut material = state.state_hash.as_bytes().to_vec();
        for tx in block.transactions() {
            state.committed.push(tx.clone());
            material.extend_from_slice(tx);
        }
        state.state_hash = crypto::content_hash(&material);

        let snapshot = borsh::to_vec(&state.committed).expect("borsh serialization cannot fail");
        state.snapshots.insert(block.index(), snapshot);
        Ok(state.state_hash)
    }

    fn snapshot(&self, block_index: i64) -> Result<Vec<u8>, Self::Error> {
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .get(&block_index)
            .cloned()
            .ok_or(InmemAppError::UnknownSnapshot(block_index))
    }

    fn restore(&self, snapshot: &[u8]) -> Result<Hash, Self::Error> {
        let committed: Vec<Vec<u8>> =
            borsh::from_slice(snapshot).unwrap_or_default();
        let mut state = self.inner.lock().unwrap();
        let mut material = Hash::ZERO.as_bytes().to_vec();
        for tx in &committed {
            material.extend_from_slice(tx);
        }
        state.committed = committed;
        state.state_hash = crypto::content_hash(&material);
        Ok(state.state_hash)
    }
}
