//! Known clients and reconnect reconciliation.
//!
//! Records outlive their transport: a disconnected client stays in the table
//! (with `connected = false`) so a reconnecting device can reclaim its
//! original `connectionId` and first-seen `timestamp`.
//!
//! Matching rules, in order:
//! - On `manifest`, a `uuid` that belongs to another stored record wins. The
//!   stored record is reused and the provisional one removed.
//! - On connect, a disconnected record from the same IP is reused, but only
//!   if it never reported a `uuid`.
//! - Otherwise the connection gets a fresh record keyed by its transport
//!   address, re-keyed to the manifest `uuid` once one arrives.

use std::collections::HashMap;

use deckhost_core::{Client, ClientManifest, ReconciliationAmbiguity, RoutingError};
use parking_lot::RwLock;

/// Outcome of a manifest exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// The connection's id from now on.
    pub id: String,
    /// A stored record was reclaimed.
    pub rejoined: bool,
    /// Set when the uuid was already live on another connection.
    pub ambiguity: Option<ReconciliationAmbiguity>,
}

#[derive(Default)]
pub struct ClientTable {
    clients: RwLock<HashMap<String, Client>>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new transport. Returns the record it is bound to.
    pub fn connect(&self, provisional_id: &str, ip: &str, now_ms: i64) -> Client {
        let mut clients = self.clients.write();

        let rejoin = clients
            .values()
            .filter(|c| !c.connected && c.uuid.is_none() && c.ip == ip)
            .min_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then(a.connection_id.cmp(&b.connection_id))
            })
            .map(|c| c.connection_id.clone())
            .or_else(|| {
                clients
                    .get(provisional_id)
                    .filter(|c| !c.connected)
                    .map(|c| c.connection_id.clone())
            });

        if let Some(client) = rejoin.and_then(|id| clients.get_mut(&id)) {
            tracing::info!("Client '{}' rejoined from {}", client.connection_id, ip);
            client.connected = true;
            return client.clone();
        }

        let client = Client::new(provisional_id, ip, now_ms);
        tracing::info!("Client '{}' connected", provisional_id);
        clients.insert(provisional_id.to_string(), client.clone());
        client
    }

    /// Apply a client manifest to the record bound to `current_id`.
    pub fn reconcile(
        &self,
        current_id: &str,
        manifest: &ClientManifest,
    ) -> Result<Reconciliation, RoutingError> {
        let mut clients = self.clients.write();
        if !clients.contains_key(current_id) {
            return Err(RoutingError::ClientNotFound(current_id.to_string()));
        }

        let Some(uuid) = manifest.uuid.clone() else {
            if let Some(client) = clients.get_mut(current_id) {
                client.apply_manifest(manifest);
            }
            return Ok(Reconciliation {
                id: current_id.to_string(),
                rejoined: false,
                ambiguity: None,
            });
        };

        let stored = clients
            .values()
            .find(|c| c.uuid.as_deref() == Some(uuid.as_str()) && c.connection_id != current_id)
            .map(|c| (c.connection_id.clone(), c.connected));

        match stored {
            Some((holder, true)) => {
                let ambiguity = ReconciliationAmbiguity {
                    uuid: uuid.clone(),
                    holder,
                };
                tracing::warn!("{}", ambiguity);

                let suffix = uuid::Uuid::new_v4().simple().to_string();
                let fresh_id = format!("{}-{}", uuid, &suffix[..8]);
                let Some(mut client) = clients.remove(current_id) else {
                    return Err(RoutingError::ClientNotFound(current_id.to_string()));
                };
                client.connection_id = fresh_id.clone();
                client.uuid = Some(fresh_id.clone());
                client.apply_manifest(manifest);
                clients.insert(fresh_id.clone(), client);

                Ok(Reconciliation {
                    id: fresh_id,
                    rejoined: false,
                    ambiguity: Some(ambiguity),
                })
            }
            Some((stored_id, false)) => {
                let provisional = clients.remove(current_id);
                let Some(client) = clients.get_mut(&stored_id) else {
                    return Err(RoutingError::ClientNotFound(stored_id));
                };
                client.connected = true;
                if let Some(provisional) = provisional {
                    client.ip = provisional.ip;
                }
                client.apply_manifest(manifest);
                tracing::info!("Connection '{}' reclaimed client '{}'", current_id, stored_id);

                Ok(Reconciliation {
                    id: stored_id,
                    rejoined: true,
                    ambiguity: None,
                })
            }
            None => {
                let rekey = current_id != uuid && !clients.contains_key(&uuid);
                let Some(mut client) = clients.remove(current_id) else {
                    return Err(RoutingError::ClientNotFound(current_id.to_string()));
                };
                client.uuid = Some(uuid.clone());
                client.apply_manifest(manifest);

                let id = if rekey { uuid } else { current_id.to_string() };
                client.connection_id = id.clone();
                clients.insert(id.clone(), client);

                Ok(Reconciliation {
                    id,
                    rejoined: false,
                    ambiguity: None,
                })
            }
        }
    }

    /// Mark a client disconnected. The record is kept.
    pub fn disconnect(&self, id: &str) -> Option<Client> {
        let mut clients = self.clients.write();
        let client = clients.get_mut(id)?;
        client.connected = false;
        tracing::info!("Client '{}' disconnected", id);
        Some(client.clone())
    }

    /// Forget a client entirely.
    pub fn evict(&self, id: &str) -> Option<Client> {
        self.clients.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().get(id).cloned()
    }

    /// Every known client, oldest first.
    pub fn all(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = self.clients.read().values().cloned().collect();
        clients.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.connection_id.cmp(&b.connection_id))
        });
        clients
    }

    /// Clients with an open transport, oldest first.
    pub fn connected(&self) -> Vec<Client> {
        self.all().into_iter().filter(|c| c.connected).collect()
    }
}
