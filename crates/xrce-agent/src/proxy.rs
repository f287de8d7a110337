// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// ProxyBridge trait - bridges XRCE proxy clients to an actual DDS implementation.
//
// This is intentionally DDS-agnostic: any DDS library can implement it.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::error::XrceError;

/// Bridge between the agent's proxy clients and a DDS implementation.
///
/// Handles are opaque to the agent. Implementations can target hdds,
/// Cyclone DDS, Fast-DDS, or any other compliant DDS middleware.
pub trait ProxyBridge: Send + Sync {
    /// Create a DDS DomainParticipant.
    fn create_participant(&self, domain_id: u16) -> Result<u32, XrceError>;

    /// Create a DDS Topic under the given participant.
    fn create_topic(
        &self,
        participant: u32,
        name: &str,
        type_name: &str,
    ) -> Result<u32, XrceError>;

    fn create_publisher(&self, participant: u32) -> Result<u32, XrceError>;

    fn create_subscriber(&self, participant: u32) -> Result<u32, XrceError>;

    /// Create a DataWriter under `publisher` for `topic`.
    fn create_writer(&self, publisher: u32, topic: u32) -> Result<u32, XrceError>;

    /// Create a DataReader under `subscriber` for `topic`.
    fn create_reader(&self, subscriber: u32, topic: u32) -> Result<u32, XrceError>;

    /// Write serialized data through the given writer.
    fn write_data(&self, writer: u32, data: &[u8]) -> Result<(), XrceError>;

    /// Take up to `max_samples` samples from the given reader.
    /// An empty vector means no data is available.
    fn read_data(&self, reader: u32, max_samples: u16) -> Result<Vec<Vec<u8>>, XrceError>;

    /// Delete a DDS entity by handle.
    fn delete_entity(&self, entity: u32) -> Result<(), XrceError>;
}

// ---------------------------------------------------------------------------
// Null bridge
// ---------------------------------------------------------------------------

/// A no-op bridge that always succeeds and never has data.
pub struct NullBridge;

impl ProxyBridge for NullBridge {
    fn create_participant(&self, _domain_id: u16) -> Result<u32, XrceError> {
        Ok(1)
    }

    fn create_topic(
        &self,
        _participant: u32,
        _name: &str,
        _type_name: &str,
    ) -> Result<u32, XrceError> {
        Ok(2)
    }

    fn create_publisher(&self, _participant: u32) -> Result<u32, XrceError> {
        Ok(3)
    }

    fn create_subscriber(&self, _participant: u32) -> Result<u32, XrceError> {
        Ok(4)
    }

    fn create_writer(&self, _publisher: u32, _topic: u32) -> Result<u32, XrceError> {
        Ok(5)
    }

    fn create_reader(&self, _subscriber: u32, _topic: u32) -> Result<u32, XrceError> {
        Ok(6)
    }

    fn write_data(&self, _writer: u32, _data: &[u8]) -> Result<(), XrceError> {
        Ok(())
    }

    fn read_data(&self, _reader: u32, _max_samples: u16) -> Result<Vec<Vec<u8>>, XrceError> {
        Ok(Vec::new())
    }

    fn delete_entity(&self, _entity: u32) -> Result<(), XrceError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loopback bridge
// ---------------------------------------------------------------------------

/// Samples kept per reader before the oldest is dropped.
const LOOPBACK_READER_DEPTH: usize = 64;

#[derive(Debug)]
enum LoopbackEntity {
    Participant,
    Topic { name: String },
    Publisher,
    Subscriber,
    Writer { topic: String },
    Reader { topic: String, queue: VecDeque<Vec<u8>> },
}

#[derive(Debug, Default)]
struct LoopbackState {
    next_handle: u32,
    entities: HashMap<u32, LoopbackEntity>,
}

impl LoopbackState {
    fn insert(&mut self, entity: LoopbackEntity) -> u32 {
        self.next_handle += 1;
        self.entities.insert(self.next_handle, entity);
        self.next_handle
    }

    fn topic_name(&self, topic: u32) -> Result<String, XrceError> {
        match self.entities.get(&topic) {
            Some(LoopbackEntity::Topic { name }) => Ok(name.clone()),
            _ => Err(XrceError::Bridge(format!("handle {} is not a topic", topic))),
        }
    }

    fn require(
        &self,
        handle: u32,
        what: &str,
        ok: fn(&LoopbackEntity) -> bool,
    ) -> Result<(), XrceError> {
        match self.entities.get(&handle) {
            Some(e) if ok(e) => Ok(()),
            _ => Err(XrceError::Bridge(format!("handle {} is not a {}", handle, what))),
        }
    }
}

/// In-process bridge: samples written on a topic are delivered to every
/// reader of a topic with the same name, across all clients.
///
/// Lets the agent run standalone (no DDS stack) with clients talking to
/// each other through it.
#[derive(Debug, Default)]
pub struct LoopbackBridge {
    state: Mutex<LoopbackState>,
}

impl LoopbackBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.state.lock().entities.len()
    }
}

impl ProxyBridge for LoopbackBridge {
    fn create_participant(&self, domain_id: u16) -> Result<u32, XrceError> {
        log::debug!("[loopback] participant on domain {}", domain_id);
        Ok(self.state.lock().insert(LoopbackEntity::Participant))
    }

    fn create_topic(
        &self,
        participant: u32,
        name: &str,
        _type_name: &str,
    ) -> Result<u32, XrceError> {
        let mut state = self.state.lock();
        state.require(participant, "participant", |e| {
            matches!(e, LoopbackEntity::Participant)
        })?;
        Ok(state.insert(LoopbackEntity::Topic {
            name: name.to_string(),
        }))
    }

    fn create_publisher(&self, participant: u32) -> Result<u32, XrceError> {
        let mut state = self.state.lock();
        state.require(participant, "participant", |e| {
            matches!(e, LoopbackEntity::Participant)
        })?;
        Ok(state.insert(LoopbackEntity::Publisher))
    }

    fn create_subscriber(&self, participant: u32) -> Result<u32, XrceError> {
        let mut state = self.state.lock();
        state.require(participant, "participant", |e| {
            matches!(e, LoopbackEntity::Participant)
        })?;
        Ok(state.insert(LoopbackEntity::Subscriber))
    }

    fn create_writer(&self, publisher: u32, topic: u32) -> Result<u32, XrceError> {
        let mut state = self.state.lock();
        state.require(publisher, "publisher", |e| matches!(e, LoopbackEntity::Publisher))?;
        let topic = state.topic_name(topic)?;
        Ok(state.insert(LoopbackEntity::Writer { topic }))
    }

    fn create_reader(&self, subscriber: u32, topic: u32) -> Result<u32, XrceError> {
        let mut state = self.state.lock();
        state.require(subscriber, "subscriber", |e| {
            matches!(e, LoopbackEntity::Subscriber)
        })?;
        let topic = state.topic_name(topic)?;
        Ok(state.insert(LoopbackEntity::Reader {
            topic,
            queue: VecDeque::new(),
        }))
    }

    fn write_data(&self, writer: u32, data: &[u8]) -> Result<(), XrceError> {
        let mut state = self.state.lock();
        let topic = match state.entities.get(&writer) {
            Some(LoopbackEntity::Writer { topic }) => topic.clone(),
            _ => return Err(XrceError::Bridge(format!("handle {} is not a writer", writer))),
        };
        for entity in state.entities.values_mut() {
            if let LoopbackEntity::Reader { topic: t, queue } = entity {
                if *t == topic {
                    if queue.len() == LOOPBACK_READER_DEPTH {
                        queue.pop_front();
                    }
                    queue.push_back(data.to_vec());
                }
            }
        }
        Ok(())
    }

    fn read_data(&self, reader: u32, max_samples: u16) -> Result<Vec<Vec<u8>>, XrceError> {
        let mut state = self.state.lock();
        match state.entities.get_mut(&reader) {
            Some(LoopbackEntity::Reader { queue, .. }) => {
                let n = queue.len().min(max_samples as usize);
                Ok(queue.drain(..n).collect())
            }
            _ => Err(XrceError::Bridge(format!("handle {} is not a reader", reader))),
        }
    }

    fn delete_entity(&self, entity: u32) -> Result<(), XrceError> {
        self.state
            .lock()
            .entities
            .remove(&entity)
            .map(|_| ())
            .ok_or_else(|| XrceError::Bridge(format!("unknown handle {}", entity)))
    }
}
