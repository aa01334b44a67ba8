//! # memory stable store
//!
//! why: keep term and vote in process memory for tests
//! relations: registered under the `memory` scheme
//! what: MemoryStableStore, per-path shared state

use parking_lot::{Mutex, RwLock};
use raft_core::PeerId;
use std::collections::HashMap;
use std::sync::Arc;

use super::{HardState, StableStore};
use crate::error::Result;
use crate::uri::parse_uri;

type SharedStates = Arc<Mutex<HashMap<String, Arc<RwLock<HardState>>>>>;

/// in-memory stable store
///
/// like the memory log store, instances for the same path created from the
/// same prototype share their state.
pub struct MemoryStableStore {
    states: SharedStates,
    state: Arc<RwLock<HardState>>,
}

impl MemoryStableStore {
    pub fn prototype() -> Self {
        Self::with_namespace("", SharedStates::default())
    }

    fn with_namespace(path: &str, states: SharedStates) -> Self {
        let state = states.lock().entry(path.to_string()).or_default().clone();
        Self { states, state }
    }
}

impl StableStore for MemoryStableStore {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn get_term(&self) -> u64 {
        self.state.read().term
    }

    fn set_term(&mut self, term: u64) -> Result<()> {
        self.state.write().term = term;
        Ok(())
    }

    fn get_voted_for(&self) -> PeerId {
        self.state.read().voted_for.clone()
    }

    fn set_voted_for(&mut self, peer_id: &PeerId) -> Result<()> {
        self.state.write().voted_for = peer_id.clone();
        Ok(())
    }

    fn set_term_and_voted_for(&mut self, term: u64, peer_id: &PeerId) -> Result<()> {
        *self.state.write() = HardState {
            term,
            voted_for: peer_id.clone(),
        };
        Ok(())
    }

    fn new_instance(&self, uri: &str) -> Result<Box<dyn StableStore>> {
        let (_, path) = parse_uri(uri)?;
        Ok(Box::new(Self::with_namespace(path, self.states.clone())))
    }
}
