//! Live ports and the tokens that let aux channels find their main port.

use crate::port::Port;
use dashmap::DashMap;
use rand::Rng;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Every connected main port, plus outstanding aux tokens.
#[derive(Default)]
pub struct PortRegistry {
    ports: DashMap<Uuid, Arc<Port>>,
    aux_tokens: DashMap<u64, (Uuid, Weak<Port>)>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, port: Arc<Port>) {
        self.ports.insert(port.id, port);
    }

    /// Forgets a port and any token issued for it.
    pub fn remove(&self, id: &Uuid) -> Option<Arc<Port>> {
        self.aux_tokens.retain(|_, (owner, _)| owner != id);
        self.ports.remove(id).map(|(_, port)| port)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Port>> {
        self.ports.get(id).map(|p| p.clone())
    }

    /// Issues a one-shot token the client presents on its aux connection.
    pub fn issue_aux_token(&self, port: &Arc<Port>) -> u64 {
        let mut rng = rand::thread_rng();
        loop {
            let token: u64 = rng.gen();
            if token == 0 {
                continue;
            }
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.aux_tokens.entry(token) {
                slot.insert((port.id, Arc::downgrade(port)));
                return token;
            }
        }
    }

    /// Redeems a token. Each token works once.
    pub fn claim_aux_token(&self, token: u64) -> Option<Arc<Port>> {
        self.aux_tokens
            .remove(&token)
            .and_then(|(_, (_, port))| port.upgrade())
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Removes and returns every port.
    pub fn drain(&self) -> Vec<Arc<Port>> {
        let ids: Vec<Uuid> = self.ports.iter().map(|e| *e.key()).collect();
        self.aux_tokens.clear();
        ids.into_iter()
            .filter_map(|id| self.ports.remove(&id).map(|(_, port)| port))
            .collect()
    }
}
