//! Plait Model
//!
//! Pure data types for the Plait consensus engine, decoupled from storage
//! engines and the virtual-voting pipeline.

pub mod block;
pub mod crypto;
pub mod event;
pub mod frame;
pub mod peers;
pub mod root;
pub mod round;
pub mod types;

pub use block::{Block, BlockBody, BlockSignature, WireBlockSignature};
pub use event::{
    cmp_by_lamport, cmp_by_topological, Event, EventBody, EventMessage, FlagTable,
    InternalTransaction, TransactionType, WireBody, WireEvent,
};
pub use frame::Frame;
pub use peers::{Participant, Participants, ParticipantsError};
pub use root::{Root, RootEvent};
pub use round::{Famous, RoundEvent, RoundInfo};
pub use types::{Hash, PubKey, Signature};
