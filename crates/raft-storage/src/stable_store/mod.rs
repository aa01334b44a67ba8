//! # stable_store
//!
//! why: persist the current term and vote that election safety relies on
//! relations: read and written by election logic, produced by the registry
//! what: StableStore trait, memory and local (json file) backends

mod local;
mod memory;

pub use local::LocalStableStore;
pub use memory::MemoryStableStore;

use raft_core::PeerId;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// the record a stable store keeps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    /// empty when no vote was granted in `term`
    pub voted_for: PeerId,
}

/// trait for durable storage of `(current term, voted for)`
///
/// setters return only once the new value is durable; on error the previous
/// value stays in place, readable and durable. getters never observe a term
/// without the vote written alongside it.
pub trait StableStore: Send + Sync {
    /// load persisted state, or start from term 0 with no vote
    fn init(&mut self) -> Result<()>;

    fn get_term(&self) -> u64;

    fn set_term(&mut self, term: u64) -> Result<()>;

    fn get_voted_for(&self) -> PeerId;

    fn set_voted_for(&mut self, peer_id: &PeerId) -> Result<()>;

    /// persist both values in one write
    fn set_term_and_voted_for(&mut self, term: u64, peer_id: &PeerId) -> Result<()>;

    /// fresh, uninitialized store of the same kind configured from `uri`
    fn new_instance(&self, uri: &str) -> Result<Box<dyn StableStore>>;
}
