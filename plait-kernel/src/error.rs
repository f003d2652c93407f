//! Error taxonomy of the consensus engine.
//!
//! Four kinds, handled differently:
//! - *validation* — a bad event or block from a peer; rejected and logged,
//!   gossip continues (`is_validation` returns true).
//! - *lookup* — `StoreError::KeyNotFound`; absorbed by the graph predicates
//!   ("consult the roots") and never surfaced.
//! - *threshold* — a block below the trust count; callers continue.
//! - *fatal* — store corruption or unresolvable wire info; surfaced to the
//!   caller, which halts the consensus loop.

use plait_model::crypto::CryptoError;
use plait_model::PubKey;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("invalid event signature")]
    InvalidSignature,

    #[error("self-parent is not the creator's last known event")]
    SelfParentMismatch,

    #[error("other-parent not known")]
    UnknownOtherParent,

    #[error("unknown participant {0}")]
    UnknownParticipant(PubKey),

    #[error("unknown creator id {0}")]
    UnknownCreatorId(i64),

    #[error("event flag table is empty")]
    EmptyFlagTable,

    #[error("frame hash does not match block")]
    FrameHashMismatch,

    #[error("no anchor block")]
    NoAnchorBlock,

    #[error("not enough valid block signatures: got {got}, need at least {need}")]
    NotEnoughSignatures { got: usize, need: usize },

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ConsensusError {
    /// Non-fatal input rejection: the offending event is dropped and the
    /// node keeps gossiping. `NotEnoughSignatures` is not validation but
    /// threshold: the block is fine, it just has not accumulated enough
    /// signatures yet.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ConsensusError::InvalidSignature
                | ConsensusError::SelfParentMismatch
                | ConsensusError::UnknownOtherParent
                | ConsensusError::UnknownParticipant(_)
                | ConsensusError::UnknownCreatorId(_)
                | ConsensusError::EmptyFlagTable
        )
    }
}
