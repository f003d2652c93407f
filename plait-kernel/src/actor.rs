//! Core actor: a dedicated task that owns the `Core` and serialises every
//! mutating operation, in the style of a command-channel actor.
//!
//! Gossip handlers talk to it through `CoreHandle`; committed blocks flow
//! from the engine's commit channel to the application proxy with a
//! per-call deadline. A timed-out commit leaves the block queued and is
//! retried on the next pipeline run.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use plait_model::{Block, Frame, WireEvent};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::ConsensusError;
use crate::node::Core;
use crate::proxy::Application;

/// Node lifecycle: `Gossiping` → (`CatchingUp` during fast-forward) →
/// `Shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Gossiping,
    CatchingUp,
    Shutdown,
}

/// Commands accepted by the core actor.
pub enum CoreCmd {
    /// Queue a transaction for the next self event.
    SubmitTransaction(Vec<u8>),
    /// Ingest a peer's events and run the pipeline.
    Sync {
        events: Vec<WireEvent>,
        resp: oneshot::Sender<Result<(), ConsensusError>>,
    },
    /// Events the peer is missing, as wire events.
    EventDiff {
        known: BTreeMap<i64, i64>,
        resp: oneshot::Sender<Result<Vec<WireEvent>, ConsensusError>>,
    },
    /// Our per-participant event indexes.
    KnownEvents {
        resp: oneshot::Sender<BTreeMap<i64, i64>>,
    },
    /// Reset from a peer's (block, frame) pair.
    FastForward {
        block: Block,
        frame: Frame,
        resp: oneshot::Sender<Result<(), ConsensusError>>,
    },
    State {
        resp: oneshot::Sender<NodeState>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct CoreHandle {
    cmd_tx: mpsc::UnboundedSender<CoreCmd>,
}

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("core actor is gone")]
    ActorGone,
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

impl CoreHandle {
    pub fn submit_transaction(&self, tx: Vec<u8>) -> Result<(), HandleError> {
        self.cmd_tx
            .send(CoreCmd::SubmitTransaction(tx))
            .map_err(|_| HandleError::ActorGone)
    }

    pub async fn sync(&self, events: Vec<WireEvent>) -> Result<(), HandleError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(CoreCmd::Sync { events, resp })
            .map_err(|_| HandleError::ActorGone)?;
        rx.await.map_err(|_| HandleError::ActorGone)??;
        Ok(())
    }

    pub async fn event_diff(
        &self,
        known: BTreeMap<i64, i64>,
    ) -> Result<Vec<WireEvent>, HandleError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(CoreCmd::EventDiff { known, resp })
            .map_err(|_| HandleError::ActorGone)?;
        Ok(rx.await.map_err(|_| HandleError::ActorGone)??)
    }

    pub async fn known_events(&self) -> Result<BTreeMap<i64, i64>, HandleError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(CoreCmd::KnownEvents { resp })
            .map_err(|_| HandleError::ActorGone)?;
        rx.await.map_err(|_| HandleError::ActorGone)
    }

    pub async fn fast_forward(&self, block: Block, frame: Frame) -> Result<(), HandleError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(CoreCmd::FastForward { block, frame, resp })
            .map_err(|_| HandleError::ActorGone)?;
        rx.await.map_err(|_| HandleError::ActorGone)??;
        Ok(())
    }

    pub async fn state(&self) -> Result<NodeState, HandleError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(CoreCmd::State { resp })
            .map_err(|_| HandleError::ActorGone)?;
        rx.await.map_err(|_| HandleError::ActorGone)
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(CoreCmd::Shutdown);
    }
}

pub struct CoreActor<A: Application + 'static> {
    core: Core,
    app: Arc<A>,
    cmd_rx: mpsc::UnboundedReceiver<CoreCmd>,
    commit_rx: mpsc::UnboundedReceiver<Block>,
    commit_timeout: Duration,
    state: NodeState,
    /// Blocks awaiting application commit (retried after timeouts).
    uncommitted: VecDeque<Block>,
}

impl<A: Application + 'static> CoreActor<A> {
    /// Wire up a core actor. `commit_rx` is the receiving side of the
    /// engine's commit channel.
    pub fn new(
        core: Core,
        app: Arc<A>,
        commit_rx: mpsc::UnboundedReceiver<Block>,
        commit_timeout: Duration,
    ) -> (Self, CoreHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            CoreActor {
                core,
                app,
                cmd_rx,
                commit_rx,
                commit_timeout,
                state: NodeState::Gossiping,
                uncommitted: VecDeque::new(),
            },
            CoreHandle { cmd_tx },
        )
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(CoreCmd::Shutdown) | None => {
                            self.state = NodeState::Shutdown;
                            debug!("core actor shutting down");
                            return;
                        }
                        Some(cmd) => self.handle_cmd(cmd).await,
                    }
                }
                Some(block) = self.commit_rx.recv() => {
                    self.uncommitted.push_back(block);
                    self.drain_commits().await;
                }
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: CoreCmd) {
        match cmd {
            CoreCmd::SubmitTransaction(tx) => {
                self.core.add_transactions(vec![tx]);
            }
            CoreCmd::Sync { events, resp } => {
                let result = self
                    .core
                    .sync(events)
                    .and_then(|()| self.core.run_consensus());
                let _ = resp.send(result);
                self.collect_commits();
                self.drain_commits().await;
            }
            CoreCmd::EventDiff { known, resp } => {
                let result = self
                    .core
                    .event_diff(&known)
                    .map(|events| self.core.to_wire(&events));
                let _ = resp.send(result);
            }
            CoreCmd::KnownEvents { resp } => {
                let _ = resp.send(self.core.known_events());
            }
            CoreCmd::FastForward { block, frame, resp } => {
                self.state = NodeState::CatchingUp;
                let result = self.core.fast_forward(block, frame);
                self.state = NodeState::Gossiping;
                let _ = resp.send(result);
                self.collect_commits();
                self.drain_commits().await;
            }
            CoreCmd::State { resp } => {
                let _ = resp.send(self.state);
            }
            CoreCmd::Shutdown => unreachable!("handled in run"),
        }
    }

    /// Pull everything the pipeline pushed on the commit channel during the
    /// last run.
    fn collect_commits(&mut self) {
        while let Ok(block) = self.commit_rx.try_recv() {
            self.uncommitted.push_back(block);
        }
    }

    /// Deliver queued blocks to the application, strictly in index order.
    /// A deadline miss leaves the block at the front for the next attempt.
    async fn drain_commits(&mut self) {
        while let Some(block) = self.uncommitted.pop_front() {
            let app = Arc::clone(&self.app);
            let to_commit = block.clone();
            let call = tokio::task::spawn_blocking(move || app.commit_block(&to_commit));

            match tokio::time::timeout(self.commit_timeout, call).await {
                Ok(Ok(Ok(state_hash))) => {
                    debug!(block = block.index(), state_hash = %state_hash, "block committed");
                    match self.core.sign_block(block) {
                        Ok(sig) => self.core.add_block_signature(sig),
                        Err(e) => warn!(error = %e, "signing committed block failed"),
                    }
                }
                Ok(Ok(Err(e))) => {
                    warn!(block = block.index(), error = %e, "application rejected block; will retry");
                    self.uncommitted.push_front(block);
                    break;
                }
                Ok(Err(join_err)) => {
                    warn!(block = block.index(), error = %join_err, "commit task failed; will retry");
                    self.uncommitted.push_front(block);
                    break;
                }
                Err(_) => {
                    warn!(block = block.index(), "commit deadline exceeded; will retry");
                    self.uncommitted.push_front(block);
                    break;
                }
            }
        }
    }
}
