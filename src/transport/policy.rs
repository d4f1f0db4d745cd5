//! Admission control.
//!
//! The ceiling applies to distinct client *processes*, not to logical
//! connections: once a process holds one admitted identity every further
//! identity from that process is admitted too, whatever the ceiling.

use std::sync::Mutex;

use hashbrown::{HashMap, HashSet};
use tracing::{debug, info};

use super::identity::ConnectionIdentity;

pub trait ConnectionPolicy: Send + Sync {
    /// Admits `identity`, unless the ceiling is reached and its process is
    /// unknown. Idempotent for identities already admitted.
    fn connect_client(&self, identity: &ConnectionIdentity) -> bool;

    /// Releases `identity`. Unknown identities are ignored so duplicate
    /// disconnect notifications are harmless.
    fn client_disconnected(&self, identity: &ConnectionIdentity);

    fn is_max_connections_reached(&self) -> bool;

    fn is_connect_allowed(&self, identity: &ConnectionIdentity) -> bool;

    fn max_connections(&self) -> usize;

    /// Number of distinct processes holding at least one identity.
    fn connected_processes(&self) -> usize;

    /// Number of admitted identities over all processes.
    fn connected_clients(&self) -> usize;
}

pub struct ConnectionPolicyImpl {
    max_connections: usize,
    clients_by_process: Mutex<HashMap<String, HashSet<ConnectionIdentity>>>,
}

impl ConnectionPolicyImpl {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            clients_by_process: Mutex::new(HashMap::new()),
        }
    }

    fn ledger(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, HashSet<ConnectionIdentity>>>
    {
        // the ledger holds no invariant a panicking holder could break
        // halfway, so a poisoned lock is still usable
        self.clients_by_process
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ConnectionPolicy for ConnectionPolicyImpl {
    fn connect_client(&self, identity: &ConnectionIdentity) -> bool {
        let mut ledger = self.ledger();
        let process_id = identity.process_id();
        if !ledger.contains_key(process_id)
            && ledger.len() >= self.max_connections
        {
            info!(
                "refusing {}: {} of {} client processes connected",
                identity,
                ledger.len(),
                self.max_connections
            );
            return false;
        }
        let newly_admitted = ledger
            .entry(process_id.to_string())
            .or_default()
            .insert(identity.clone());
        if newly_admitted {
            debug!(
                "admitted {} ({} processes connected)",
                identity,
                ledger.len()
            );
        }
        true
    }

    fn client_disconnected(&self, identity: &ConnectionIdentity) {
        let mut ledger = self.ledger();
        let process_id = identity.process_id();
        let Some(identities) = ledger.get_mut(process_id) else {
            return;
        };
        if identities.remove(identity) {
            debug!("released {}", identity);
        }
        if identities.is_empty() {
            ledger.remove(process_id);
        }
    }

    fn is_max_connections_reached(&self) -> bool {
        self.ledger().len() >= self.max_connections
    }

    fn is_connect_allowed(&self, identity: &ConnectionIdentity) -> bool {
        let ledger = self.ledger();
        ledger.contains_key(identity.process_id())
            || ledger.len() < self.max_connections
    }

    fn max_connections(&self) -> usize {
        self.max_connections
    }

    fn connected_processes(&self) -> usize {
        self.ledger().len()
    }

    fn connected_clients(&self) -> usize {
        self.ledger().values().map(HashSet::len).sum()
    }
}

/// Admits everyone and keeps no ledger.
#[derive(Default)]
pub struct NullConnectionPolicy;

impl ConnectionPolicy for NullConnectionPolicy {
    fn connect_client(&self, _: &ConnectionIdentity) -> bool {
        true
    }

    fn client_disconnected(&self, _: &ConnectionIdentity) {}

    fn is_max_connections_reached(&self) -> bool {
        false
    }

    fn is_connect_allowed(&self, _: &ConnectionIdentity) -> bool {
        true
    }

    fn max_connections(&self) -> usize {
        usize::MAX
    }

    fn connected_processes(&self) -> usize {
        0
    }

    fn connected_clients(&self) -> usize {
        0
    }
}
