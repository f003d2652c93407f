//! Plait Kernel
//!
//! Virtual-voting consensus engine over a DAG of signed events.
//!
//! - **Engine**: event insertion, graph predicates, and the five-pass
//!   pipeline that extracts a total order and emits blocks
//! - **Store**: persistence boundary (`InmemStore`, `DiskStore`)
//! - **Core**: node-level wrapper owning the keypair, head, and gossip pools
//! - **CoreActor**: command-channel actor serialising the core and driving
//!   the application proxy

pub mod actor;
pub mod engine;
pub mod error;
pub mod node;
pub mod proxy;
pub mod store;

pub use actor::{CoreActor, CoreCmd, CoreHandle, HandleError, NodeState};
pub use engine::Engine;
pub use error::ConsensusError;
pub use node::Core;
pub use proxy::{Application, InmemApp};
pub use store::{DiskStore, InmemStore, Store, StoreError};
