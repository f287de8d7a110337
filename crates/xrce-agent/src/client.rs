// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Proxy client: the agent-side state of one connected XRCE client.
//
// Owns the client's object table and forwards entity operations to the
// DDS side through a ProxyBridge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::XrceError;
use crate::protocol::{
    ClientKey, CreatePayload, ObjectId, ObjectKind, ObjectRepresentation, Sample, SampleInfo,
};
use crate::proxy::ProxyBridge;
use crate::transport::TransportAddr;

// ---------------------------------------------------------------------------
// XRCE object (proxy entity)
// ---------------------------------------------------------------------------

/// An XRCE object representing a DDS entity created through the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrceObject {
    pub object_id: ObjectId,
    pub kind: ObjectKind,
    /// `None` for participants.
    pub parent_id: Option<ObjectId>,
    /// Topic referenced by a writer/reader.
    pub topic_id: Option<ObjectId>,
    /// Handle returned by ProxyBridge (opaque DDS entity id).
    pub bridge_handle: u32,
    /// Samples handed out so far (readers only).
    pub samples_read: u32,
}

impl XrceObject {
    fn depends_on(&self, id: ObjectId) -> bool {
        self.parent_id == Some(id) || self.topic_id == Some(id)
    }
}

/// Deletion order: leaves first.
fn teardown_rank(kind: ObjectKind) -> u8 {
    match kind {
        ObjectKind::DataWriter | ObjectKind::DataReader => 0,
        ObjectKind::Publisher | ObjectKind::Subscriber => 1,
        ObjectKind::Topic => 2,
        ObjectKind::Participant => 3,
    }
}

fn handle_of(
    objects: &HashMap<ObjectId, XrceObject>,
    id: ObjectId,
    expected: ObjectKind,
) -> Result<u32, XrceError> {
    let obj = objects.get(&id).ok_or(XrceError::ObjectNotFound(id))?;
    if obj.kind != expected {
        return Err(XrceError::WrongObjectKind {
            object: id,
            expected,
        });
    }
    Ok(obj.bridge_handle)
}

// ---------------------------------------------------------------------------
// Proxy client
// ---------------------------------------------------------------------------

/// State for one connected XRCE client.
///
/// Shared as `Arc<ProxyClient>` by the registry; the object table has its
/// own lock so callers never hold the registry lock while talking to DDS.
pub struct ProxyClient {
    key: ClientKey,
    session_id: u8,
    peer: Option<TransportAddr>,
    created_at: Instant,
    /// Sequence number of the next reply sent to this client.
    next_sequence: AtomicU16,
    bridge: Arc<dyn ProxyBridge>,
    objects: Mutex<HashMap<ObjectId, XrceObject>>,
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("key", &self.key)
            .field("session_id", &self.session_id)
            .field("peer", &self.peer)
            .field("objects", &self.objects.lock().len())
            .finish()
    }
}

impl ProxyClient {
    pub fn new(
        key: ClientKey,
        session_id: u8,
        peer: Option<TransportAddr>,
        bridge: Arc<dyn ProxyBridge>,
    ) -> Self {
        Self {
            key,
            session_id,
            peer,
            created_at: Instant::now(),
            next_sequence: AtomicU16::new(0),
            bridge,
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(&self) -> ClientKey {
        self.key
    }

    pub fn session_id(&self) -> u8 {
        self.session_id
    }

    /// Where this client's traffic came from, if it connected over the wire.
    pub fn peer(&self) -> Option<&TransportAddr> {
        self.peer.as_ref()
    }

    /// Take the next outbound sequence number. Wraps at `u16::MAX`.
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Snapshot of one object.
    pub fn get_object(&self, id: ObjectId) -> Option<XrceObject> {
        self.objects.lock().get(&id).cloned()
    }

    /// Create a DDS entity for `payload` and record it.
    pub fn create(&self, payload: &CreatePayload) -> Result<(), XrceError> {
        let id = payload.object_id;
        if id.is_client() {
            return Err(XrceError::InvalidRepresentation(
                "object id reserved for the client".into(),
            ));
        }

        let mut objects = self.objects.lock();
        if objects.contains_key(&id) {
            return Err(XrceError::ObjectExists(id));
        }

        let parent = payload.parent_id;
        let (handle, parent_id, topic_id) = match &payload.representation {
            ObjectRepresentation::Participant { domain_id } => {
                (self.bridge.create_participant(*domain_id)?, None, None)
            }
            ObjectRepresentation::Topic { name, type_name } => {
                if name.is_empty() {
                    return Err(XrceError::InvalidRepresentation("empty topic name".into()));
                }
                let p = handle_of(&objects, parent, ObjectKind::Participant)?;
                (self.bridge.create_topic(p, name, type_name)?, Some(parent), None)
            }
            ObjectRepresentation::Publisher => {
                let p = handle_of(&objects, parent, ObjectKind::Participant)?;
                (self.bridge.create_publisher(p)?, Some(parent), None)
            }
            ObjectRepresentation::Subscriber => {
                let p = handle_of(&objects, parent, ObjectKind::Participant)?;
                (self.bridge.create_subscriber(p)?, Some(parent), None)
            }
            ObjectRepresentation::DataWriter { topic_id } => {
                let p = handle_of(&objects, parent, ObjectKind::Publisher)?;
                let t = handle_of(&objects, *topic_id, ObjectKind::Topic)?;
                (self.bridge.create_writer(p, t)?, Some(parent), Some(*topic_id))
            }
            ObjectRepresentation::DataReader { topic_id } => {
                let s = handle_of(&objects, parent, ObjectKind::Subscriber)?;
                let t = handle_of(&objects, *topic_id, ObjectKind::Topic)?;
                (self.bridge.create_reader(s, t)?, Some(parent), Some(*topic_id))
            }
        };

        objects.insert(
            id,
            XrceObject {
                object_id: id,
                kind: payload.kind(),
                parent_id,
                topic_id,
                bridge_handle: handle,
                samples_read: 0,
            },
        );
        log::debug!(
            "Client {}: created {:?} {} (handle {})",
            self.key,
            payload.kind(),
            id,
            handle
        );
        Ok(())
    }

    /// Delete `id` and every object that depends on it.
    /// Returns all removed ids, `id` included.
    pub fn delete(&self, id: ObjectId) -> Result<Vec<ObjectId>, XrceError> {
        let mut objects = self.objects.lock();
        if !objects.contains_key(&id) {
            return Err(XrceError::ObjectNotFound(id));
        }

        let mut doomed = vec![id];
        let mut i = 0;
        while i < doomed.len() {
            let current = doomed[i];
            for obj in objects.values() {
                if obj.depends_on(current) && !doomed.contains(&obj.object_id) {
                    doomed.push(obj.object_id);
                }
            }
            i += 1;
        }

        let mut removed: Vec<XrceObject> =
            doomed.iter().filter_map(|oid| objects.remove(oid)).collect();
        drop(objects);

        removed.sort_by_key(|o| teardown_rank(o.kind));
        for obj in &removed {
            if let Err(e) = self.bridge.delete_entity(obj.bridge_handle) {
                log::warn!(
                    "Client {}: bridge failed to delete {} (handle {}): {}",
                    self.key,
                    obj.object_id,
                    obj.bridge_handle,
                    e
                );
            }
        }
        Ok(doomed)
    }

    /// Write `data` through the DataWriter `id`.
    pub fn write(&self, id: ObjectId, data: &[u8]) -> Result<(), XrceError> {
        let handle = handle_of(&self.objects.lock(), id, ObjectKind::DataWriter)?;
        self.bridge.write_data(handle, data)
    }

    /// Take up to `max_samples` (at least one) samples from the DataReader `id`.
    pub fn read(&self, id: ObjectId, max_samples: u16) -> Result<Vec<Sample>, XrceError> {
        let mut objects = self.objects.lock();
        let handle = handle_of(&objects, id, ObjectKind::DataReader)?;
        let raw = self.bridge.read_data(handle, max_samples.max(1))?;

        let offset = self.created_at.elapsed().as_millis() as u32;
        let reader = objects.get_mut(&id).ok_or(XrceError::ObjectNotFound(id))?;
        let samples = raw
            .into_iter()
            .map(|data| {
                let info = SampleInfo {
                    state: 0,
                    sequence_number: reader.samples_read,
                    session_time_offset: offset,
                };
                reader.samples_read = reader.samples_read.wrapping_add(1);
                Sample { info, data }
            })
            .collect();
        Ok(samples)
    }

    /// Delete every DDS entity this client owns. Returns how many were removed.
    pub fn release(&self) -> usize {
        let mut removed: Vec<XrceObject> = self.objects.lock().drain().map(|(_, o)| o).collect();
        removed.sort_by_key(|o| teardown_rank(o.kind));
        for obj in &removed {
            if let Err(e) = self.bridge.delete_entity(obj.bridge_handle) {
                log::warn!(
                    "Client {}: bridge failed to release {}: {}",
                    self.key,
                    obj.object_id,
                    e
                );
            }
        }
        removed.len()
    }
}
