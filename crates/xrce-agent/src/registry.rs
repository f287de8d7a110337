// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Client registry.
//
// Primary index ClientKey -> ProxyClient and secondary index
// ObjectId -> ClientKey, both guarded by a single lock so they never
// disagree. Proxies are handed out as Arc so no caller has to keep the
// lock while talking to DDS.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::ProxyClient;
use crate::error::XrceError;
use crate::protocol::{ClientKey, CreateClientPayload, ObjectId, ResultStatus};
use crate::proxy::ProxyBridge;
use crate::transport::TransportAddr;

#[derive(Default)]
struct RegistryInner {
    clients: HashMap<ClientKey, Arc<ProxyClient>>,
    objects: HashMap<ObjectId, ClientKey>,
}

/// All live clients of one agent.
pub struct ClientRegistry {
    inner: Mutex<RegistryInner>,
    max_clients: usize,
    bridge: Arc<dyn ProxyBridge>,
}

impl ClientRegistry {
    pub fn new(max_clients: usize, bridge: Arc<dyn ProxyBridge>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_clients,
            bridge,
        }
    }

    /// Register a new client. An existing client with the same key is left
    /// untouched and `ErrAlreadyExists` is returned.
    pub fn create(
        &self,
        params: &CreateClientPayload,
        peer: Option<TransportAddr>,
    ) -> ResultStatus {
        let key = params.client_key;
        let mut inner = self.inner.lock();
        let result = if inner.clients.contains_key(&key) {
            Err(XrceError::ClientExists(key))
        } else if inner.clients.len() >= self.max_clients {
            Err(XrceError::TooManyClients(self.max_clients))
        } else {
            let proxy = ProxyClient::new(key, params.session_id, peer, self.bridge.clone());
            inner.clients.insert(key, Arc::new(proxy));
            Ok(())
        };
        let total = inner.clients.len();
        drop(inner);

        match &result {
            Ok(()) => log::info!(
                "Client {} created (session 0x{:02x}, {} live)",
                key,
                params.session_id,
                total
            ),
            Err(e) => log::warn!("Client {} not created: {}", key, e),
        }
        ResultStatus::from(&result)
    }

    /// Remove a client and every object id bound to it, then tear down its
    /// DDS entities.
    pub fn delete(&self, key: ClientKey) -> ResultStatus {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.clients.remove(&key);
            if removed.is_some() {
                inner.objects.retain(|_, owner| *owner != key);
            }
            removed
        };

        match removed {
            Some(proxy) => {
                let released = proxy.release();
                log::info!("Client {} deleted ({} objects released)", key, released);
                ResultStatus::OK
            }
            None => {
                log::debug!("Delete of unknown client {}", key);
                ResultStatus::from(&XrceError::ClientNotFound(key))
            }
        }
    }

    pub fn lookup_by_client(&self, key: ClientKey) -> Option<Arc<ProxyClient>> {
        self.inner.lock().clients.get(&key).cloned()
    }

    /// Owner of `object_id`, if bound.
    pub fn resolve_object(&self, object_id: ObjectId) -> Option<ClientKey> {
        self.inner.lock().objects.get(&object_id).copied()
    }

    /// Owner and proxy of `object_id`, resolved under one lock acquisition.
    pub fn lookup_by_object(&self, object_id: ObjectId) -> Option<(ClientKey, Arc<ProxyClient>)> {
        let inner = self.inner.lock();
        let key = *inner.objects.get(&object_id)?;
        let proxy = inner.clients.get(&key)?.clone();
        Some((key, proxy))
    }

    /// Record that `object_id` belongs to `key`.
    ///
    /// Rebinding to the same owner is a no-op. An id already owned by
    /// another client is refused.
    pub fn bind_object(&self, object_id: ObjectId, key: ClientKey) -> Result<(), XrceError> {
        let mut inner = self.inner.lock();
        if !inner.clients.contains_key(&key) {
            return Err(XrceError::ClientNotFound(key));
        }
        match inner.objects.get(&object_id) {
            Some(owner) if *owner != key => Err(XrceError::ObjectOwnedByOther {
                object: object_id,
                owner: *owner,
            }),
            _ => {
                inner.objects.insert(object_id, key);
                Ok(())
            }
        }
    }

    pub fn unbind_objects(&self, object_ids: &[ObjectId]) {
        let mut inner = self.inner.lock();
        for id in object_ids {
            inner.objects.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().clients.is_empty()
    }

    /// Number of entries in the secondary index.
    pub fn bound_objects(&self) -> usize {
        self.inner.lock().objects.len()
    }
}
