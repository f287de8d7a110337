// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// XRCE Agent main loop.
//
// Accepts XRCE clients over any transport, dispatches submessages to the
// owning proxy client, and queues replies for the delivery worker.
//
// The agent is shared as `Arc<Agent>`: `run()` blocks one thread while
// `stop()` and the client/reply API are callable from any other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::ProxyClient;
use crate::config::AgentConfig;
use crate::error::XrceError;
use crate::protocol::{
    self, ClientKey, CreateClientPayload, CreatePayload, DataFormat, DataPayload, DataSeqPayload,
    DeletePayload, MessageHeader, ObjectId, PackedSamplesPayload, ReadDataPayload, ResultStatus,
    Sample, SampleDelta, SamplePayload, SampleSeqPayload, StatusCode, StatusPayload, Submessage,
    SubmessageHeader, WriteDataPayload, XrceMessage,
};
use crate::proxy::ProxyBridge;
use crate::registry::ClientRegistry;
use crate::reply::{DeliveryStats, DeliveryStatsSnapshot, Reply, ReplyDispatcher, ReplyQueue};
use crate::transport::{SerialTransport, TransportAddr, UdpTransport, XrceTransport};

/// Transport bound at init time, with its default reply locator and the
/// worker draining replies into it.
struct Link {
    transport: Arc<dyn XrceTransport>,
    locator: TransportAddr,
    dispatcher: ReplyDispatcher,
}

/// The XRCE agent. Bridges resource-constrained clients to DDS.
pub struct Agent {
    config: AgentConfig,
    registry: ClientRegistry,
    replies: Arc<ReplyQueue>,
    stats: Arc<DeliveryStats>,
    running: AtomicBool,
    link: Mutex<Option<Link>>,
}

impl Agent {
    /// Create a new agent with the given configuration and DDS bridge.
    pub fn new(config: AgentConfig, bridge: Arc<dyn ProxyBridge>) -> Result<Self, XrceError> {
        config.validate()?;
        Ok(Self {
            registry: ClientRegistry::new(config.max_clients, bridge),
            config,
            replies: Arc::new(ReplyQueue::new()),
            stats: Arc::new(DeliveryStats::new()),
            running: AtomicBool::new(false),
            link: Mutex::new(None),
        })
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    /// Bind a serial device. Replies go back over the same device.
    pub fn init_serial(&self, device: &str) -> Result<(), XrceError> {
        let transport = SerialTransport::open(device, self.config.poll_interval())?;
        let locator = transport.addr();
        self.init_with_transport(Arc::new(transport), locator)
    }

    /// Listen on `in_port`; `udp_peer_host:out_port` is the default reply
    /// destination.
    pub fn init_udp(&self, in_port: u16, out_port: u16) -> Result<(), XrceError> {
        let locator = TransportAddr::Udp(self.config.peer_addr(out_port)?);
        let transport = UdpTransport::bind(in_port, self.config.poll_interval())?;
        if let Ok(local) = transport.local_addr() {
            log::info!("Listening on udp://{}", local);
        }
        self.init_with_transport(Arc::new(transport), locator)
    }

    /// Bind an already-open transport and start the reply worker.
    pub fn init_with_transport(
        &self,
        transport: Arc<dyn XrceTransport>,
        locator: TransportAddr,
    ) -> Result<(), XrceError> {
        let mut link = self.link.lock();
        if link.is_some() {
            return Err(XrceError::AlreadyInitialized);
        }
        if self.replies.is_closed() {
            return Err(XrceError::Stopped);
        }
        let dispatcher = ReplyDispatcher::spawn(
            Arc::clone(&self.replies),
            Arc::clone(&transport),
            self.config.buffer_size,
            Arc::clone(&self.stats),
        )?;
        log::info!("XRCE agent initialized (default locator {})", locator);
        *link = Some(Link {
            transport,
            locator,
            dispatcher,
        });
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Receive and dispatch messages until [`Agent::stop`] is called.
    pub fn run(&self) -> Result<(), XrceError> {
        let transport = self
            .link
            .lock()
            .as_ref()
            .map(|l| Arc::clone(&l.transport))
            .ok_or(XrceError::NotInitialized)?;

        let mut buf = vec![0u8; self.config.buffer_size];
        log::info!("XRCE agent running");
        while self.running.load(Ordering::Acquire) {
            match transport.recv(&mut buf) {
                Ok(Some((n, from))) => self.process_incoming(&from, &buf[..n]),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Transport receive failed: {}", e);
                    std::thread::sleep(self.config.poll_interval());
                }
            }
        }
        log::info!("XRCE agent stopped");
        Ok(())
    }

    /// Stop the run loop and the reply worker. Pending replies are dropped.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.replies.shutdown();
        if let Some(link) = self.link.lock().as_mut() {
            link.dispatcher.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Parse one received buffer and dispatch every submessage in order.
    pub fn process_incoming(&self, from: &TransportAddr, data: &[u8]) {
        for frame in protocol::parse_frames(data) {
            self.on_message(from, &frame.header, &frame.sub_header, &frame.payload);
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Route one submessage to its handler.
    pub fn on_message(
        &self,
        from: &TransportAddr,
        header: &MessageHeader,
        sub_header: &SubmessageHeader,
        payload: &Submessage,
    ) {
        match payload {
            Submessage::CreateClient(p) => self.handle_create_client(from, header, p),
            Submessage::Create(p) => self.handle_create(from, header, p),
            Submessage::Delete(p) => self.handle_delete(from, header, p),
            Submessage::WriteData(p) => self.handle_write_data(from, header, p),
            Submessage::ReadData(p) => self.handle_read_data(from, header, p),
            Submessage::Status(_)
            | Submessage::Data(_)
            | Submessage::Sample(_)
            | Submessage::DataSeq(_)
            | Submessage::SampleSeq(_)
            | Submessage::PackedSamples(_) => {
                log::warn!(
                    "Ignoring submessage from client {} at {}: {}",
                    header.client_key,
                    from,
                    XrceError::UnexpectedSubmessage(sub_header.submessage_id)
                );
            }
        }
    }

    /// Handle CREATE_CLIENT: register the proxy and send STATUS back.
    fn handle_create_client(
        &self,
        from: &TransportAddr,
        header: &MessageHeader,
        payload: &CreateClientPayload,
    ) {
        let result = self.register_client(header, payload, Some(from.clone()));
        let reply_header = MessageHeader {
            session_id: payload.session_id,
            stream_id: header.stream_id,
            sequence_nr: 0,
            client_key: payload.client_key,
        };
        self.send_status(from, &reply_header, payload.request_id, ObjectId::CLIENT, result);
    }

    /// Handle CREATE: build the object in the owning proxy and index it.
    fn handle_create(&self, from: &TransportAddr, header: &MessageHeader, payload: &CreatePayload) {
        let result = self.create_object(header.client_key, payload);
        if let Err(e) = &result {
            log::warn!(
                "CREATE {:?} {} for client {} failed: {}",
                payload.kind(),
                payload.object_id,
                header.client_key,
                e
            );
        }
        self.send_status(
            from,
            header,
            payload.request_id,
            payload.object_id,
            ResultStatus::from(&result),
        );
    }

    fn create_object(&self, key: ClientKey, payload: &CreatePayload) -> Result<(), XrceError> {
        let proxy = self
            .registry
            .lookup_by_client(key)
            .ok_or(XrceError::ClientNotFound(key))?;
        proxy.create(payload)?;
        if let Err(e) = self.registry.bind_object(payload.object_id, key) {
            // Keep proxy and index in agreement.
            if let Err(rollback) = proxy.delete(payload.object_id) {
                log::warn!(
                    "Rollback of {} for client {} failed: {}",
                    payload.object_id,
                    key,
                    rollback
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// Handle DELETE: the whole client for `ObjectId::CLIENT`, otherwise one
    /// object and everything under it.
    fn handle_delete(&self, from: &TransportAddr, header: &MessageHeader, payload: &DeletePayload) {
        let result = if payload.object_id.is_client() {
            self.delete_client(header.client_key)
        } else {
            let result = self.delete_object(header.client_key, payload.object_id);
            if let Err(e) = &result {
                log::debug!("DELETE {} for client {}: {}", payload.object_id, header.client_key, e);
            }
            ResultStatus::from(&result)
        };
        self.send_status(from, header, payload.request_id, payload.object_id, result);
    }

    fn delete_object(&self, key: ClientKey, id: ObjectId) -> Result<(), XrceError> {
        let proxy = self.resolve_owned(key, id)?;
        match proxy.delete(id) {
            Ok(removed) => {
                self.registry.unbind_objects(&removed);
                Ok(())
            }
            Err(XrceError::ObjectNotFound(missing)) if missing == id => {
                // Index entry without an object behind it.
                self.registry.unbind_objects(&[id]);
                Err(XrceError::ObjectNotFound(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Handle WRITE_DATA. Success is acknowledged only on request.
    fn handle_write_data(
        &self,
        from: &TransportAddr,
        header: &MessageHeader,
        payload: &WriteDataPayload,
    ) {
        let result = self
            .resolve_owned(header.client_key, payload.object_id)
            .and_then(|proxy| proxy.write(payload.object_id, &payload.data));
        match &result {
            Ok(()) if !payload.reply_requested => return,
            Ok(()) => {}
            Err(e) => log::debug!(
                "WRITE_DATA to {} for client {} failed: {}",
                payload.object_id,
                header.client_key,
                e
            ),
        }
        self.send_status(
            from,
            header,
            payload.request_id,
            payload.object_id,
            ResultStatus::from(&result),
        );
    }

    /// Handle READ_DATA: one DATA per sample, or batched DATA split so each
    /// reply fits the output buffer.
    fn handle_read_data(
        &self,
        from: &TransportAddr,
        header: &MessageHeader,
        payload: &ReadDataPayload,
    ) {
        let request_id = payload.request_id;
        let object_id = payload.object_id;
        let samples = match self
            .resolve_owned(header.client_key, object_id)
            .and_then(|proxy| proxy.read(object_id, payload.max_samples))
        {
            Ok(samples) => samples,
            Err(e) => {
                log::debug!("READ_DATA on {} for client {}: {}", object_id, header.client_key, e);
                self.send_status(from, header, request_id, object_id, ResultStatus::from(&e));
                return;
            }
        };

        if samples.is_empty() {
            self.send_status(from, header, request_id, object_id, ResultStatus::OK);
            return;
        }

        // A sample too large for any reply cannot be delivered in this format.
        let format = payload.format;
        let capacity = self.config.buffer_size;
        let total = samples.len();
        let samples: Vec<Sample> = samples
            .into_iter()
            .filter(|s| format.empty_message_len() + format.sample_len(s.data.len()) <= capacity)
            .collect();
        let oversize = total - samples.len();

        match format {
            DataFormat::Data => {
                for sample in samples {
                    let data = DataPayload {
                        request_id,
                        object_id,
                        data: sample.data,
                    };
                    self.send(from, header, data);
                }
            }
            DataFormat::Sample => {
                for sample in samples {
                    let data = SamplePayload {
                        request_id,
                        object_id,
                        sample,
                    };
                    self.send(from, header, data);
                }
            }
            DataFormat::DataSeq => {
                for batch in split_batches(samples, format, capacity) {
                    let data = DataSeqPayload {
                        request_id,
                        object_id,
                        data: batch.into_iter().map(|s| s.data).collect(),
                    };
                    self.send(from, header, data);
                }
            }
            DataFormat::SampleSeq => {
                for batch in split_batches(samples, format, capacity) {
                    let data = SampleSeqPayload {
                        request_id,
                        object_id,
                        samples: batch,
                    };
                    self.send(from, header, data);
                }
            }
            DataFormat::PackedSamples => {
                for batch in split_batches(samples, format, capacity) {
                    self.send(from, header, pack_samples(request_id, object_id, batch));
                }
            }
        }

        if oversize > 0 {
            log::warn!(
                "READ_DATA on {} for client {}: {} sample(s) exceed the {} byte buffer",
                object_id,
                header.client_key,
                oversize,
                capacity
            );
            let status = ResultStatus::new(StatusCode::ErrResources);
            self.send_status(from, header, request_id, object_id, status);
        }
    }

    /// Proxy owning `id`, provided `key` is that owner.
    fn resolve_owned(&self, key: ClientKey, id: ObjectId) -> Result<Arc<ProxyClient>, XrceError> {
        let (owner, proxy) = self
            .registry
            .lookup_by_object(id)
            .ok_or(XrceError::ObjectNotFound(id))?;
        if owner != key {
            return Err(XrceError::ObjectOwnedByOther { object: id, owner });
        }
        Ok(proxy)
    }

    // -----------------------------------------------------------------------
    // Client API
    // -----------------------------------------------------------------------

    /// Register a client that has no transport address of its own; its
    /// replies go to the default locator.
    pub fn create_client(
        &self,
        header: &MessageHeader,
        payload: &CreateClientPayload,
    ) -> ResultStatus {
        self.register_client(header, payload, None)
    }

    fn register_client(
        &self,
        header: &MessageHeader,
        payload: &CreateClientPayload,
        peer: Option<TransportAddr>,
    ) -> ResultStatus {
        if let Err(e) = payload.validate() {
            log::warn!("Rejecting client {}: {}", payload.client_key, e);
            return ResultStatus::from(&e);
        }
        if header.client_key != payload.client_key {
            log::debug!(
                "CREATE_CLIENT header key {} differs from payload key {}",
                header.client_key,
                payload.client_key
            );
        }
        self.registry.create(payload, peer)
    }

    pub fn delete_client(&self, key: ClientKey) -> ResultStatus {
        self.registry.delete(key)
    }

    pub fn get_client(&self, key: ClientKey) -> Option<Arc<ProxyClient>> {
        self.registry.lookup_by_client(key)
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    // -----------------------------------------------------------------------
    // Replies
    // -----------------------------------------------------------------------

    /// Queue `payload` for the client named in `header`.
    ///
    /// The destination is the client's own address when known, otherwise
    /// the default locator. Returns `false` if the reply was not queued.
    pub fn add_reply(&self, header: &MessageHeader, payload: impl Into<Submessage>) -> bool {
        self.add_message(XrceMessage::single(*header, payload))
    }

    /// Queue a complete message; destination resolved as in [`Agent::add_reply`].
    pub fn add_message(&self, message: XrceMessage) -> bool {
        let key = message.header.client_key;
        let destination = self
            .registry
            .lookup_by_client(key)
            .and_then(|c| c.peer().cloned())
            .or_else(|| self.default_locator());
        match destination {
            Some(destination) => self.enqueue(Reply {
                destination,
                message,
            }),
            None => {
                log::warn!("No destination for reply to client {}", key);
                false
            }
        }
    }

    /// Locator bound at init.
    pub fn default_locator(&self) -> Option<TransportAddr> {
        self.link.lock().as_ref().map(|l| l.locator.clone())
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn send(&self, to: &TransportAddr, header: &MessageHeader, payload: impl Into<Submessage>) {
        self.enqueue(Reply {
            destination: to.clone(),
            message: XrceMessage::single(*header, payload),
        });
    }

    fn send_status(
        &self,
        to: &TransportAddr,
        header: &MessageHeader,
        request_id: u16,
        object_id: ObjectId,
        result: ResultStatus,
    ) {
        let status = StatusPayload {
            request_id,
            object_id,
            result,
        };
        self.send(to, header, status);
    }

    /// Registered clients get their own reply sequence; replies to any
    /// other key go out numbered 0.
    fn enqueue(&self, reply: Reply) -> bool {
        let client = self.registry.lookup_by_client(reply.message.header.client_key);
        let queued = self.replies.push_with(reply, |msg| {
            msg.header.sequence_nr = client.as_ref().map_or(0, |c| c.next_sequence());
        });
        if !queued {
            log::debug!("Reply queue closed, reply dropped");
        }
        queued
    }
}

/// Most samples one packed reply carries; sequence deltas are a single byte.
const MAX_PACKED_SAMPLES: usize = u8::MAX as usize + 1;

/// Group samples, in order, into batches whose `format` reply fits
/// `capacity` bytes. Every sample must fit on its own.
fn split_batches(samples: Vec<Sample>, format: DataFormat, capacity: usize) -> Vec<Vec<Sample>> {
    let mut batches = Vec::new();
    let mut current: Vec<Sample> = Vec::new();
    let mut len = format.empty_message_len();
    for sample in samples {
        let item = format.sample_len(sample.data.len());
        let full = len + item > capacity
            || (format == DataFormat::PackedSamples && current.len() == MAX_PACKED_SAMPLES);
        if full && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            len = format.empty_message_len();
        }
        len += item;
        current.push(sample);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Pack samples relative to the first one's metadata.
fn pack_samples(
    request_id: u16,
    object_id: ObjectId,
    samples: Vec<Sample>,
) -> PackedSamplesPayload {
    let info = samples.first().map(|s| s.info).unwrap_or_default();
    let samples = samples
        .into_iter()
        .map(|s| SampleDelta {
            state: s.info.state,
            seq_delta: s.info.sequence_number.wrapping_sub(info.sequence_number) as u8,
            timestamp_delta: s
                .info
                .session_time_offset
                .wrapping_sub(info.session_time_offset) as u16,
            data: s.data,
        })
        .collect();
    PackedSamplesPayload {
        request_id,
        object_id,
        info,
        samples,
    }
}
