// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DDS-XRCE agent.
//!
//! Terminates the OMG DDS-XRCE (eXtremely Resource Constrained Environments)
//! protocol for resource-constrained devices (MCUs, sensors, embedded Linux)
//! and forwards their requests to per-client proxies backed by DDS.
//!
//! # Architecture
//!
//! ```text
//! XRCE Client (MCU)                XRCE Agent (this crate)         DDS Network
//!   ESP32 / STM32                    Linux / Windows
//!        |                                |                            |
//!        |--- CREATE_CLIENT ------------>|                            |
//!        |--- CREATE(topic) ------------>|--- create DDS reader ----->|
//!        |--- WRITE_DATA(payload) ------>|--- DDS write ------------->|
//!        |<-- DATA(payload) -------------|<-- DDS sample ------------|
//!        |--- DELETE ------------------->|--- cleanup --------------->|
//! ```
//!
//! Inside the agent, the run loop parses each received buffer and hands
//! every submessage to [`Agent::on_message`]. Handlers resolve the owning
//! [`ProxyClient`] through the [`ClientRegistry`] and push replies onto a
//! [`ReplyQueue`]; a dedicated worker ([`ReplyDispatcher`]) serializes and
//! sends them in enqueue order.
//!
//! # Key Features
//!
//! - **Transport-agnostic**: UDP and Serial (UART) transports, or any [`XrceTransport`]
//! - **DDS-agnostic**: Any DDS implementation can be plugged in via [`ProxyBridge`]
//! - **Bounded buffers**: replies that do not fit the configured buffer are rejected
//!
//! # Transports
//!
//! | Transport | Use Case | MTU |
//! |-----------|----------|-----|
//! | [`UdpTransport`] | WiFi / Ethernet MCUs | 1500 |
//! | [`SerialTransport`] | UART / RS-485 / HC-12 | 64-256 |

pub mod agent;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod reply;
pub mod transport;

// Re-exports for convenience.
pub use agent::Agent;
pub use client::{ProxyClient, XrceObject};
pub use config::AgentConfig;
pub use error::XrceError;
pub use protocol::{
    // Identifiers
    ClientKey, ObjectId,
    // Message types
    Frame, MessageHeader, SubmessageHeader, Submessage, XrceMessage,
    // Payload types
    CreateClientPayload, CreatePayload, DeletePayload, ObjectRepresentation,
    WriteDataPayload, ReadDataPayload, StatusPayload,
    DataPayload, SamplePayload, DataSeqPayload, SampleSeqPayload, PackedSamplesPayload,
    Sample, SampleDelta, SampleInfo,
    // Enums
    DataFormat, ObjectKind, ResultStatus, StatusCode,
    // Functions
    parse_frames, parse_message, parse_submessage,
    serialize_message, serialize_message_into, serialize_submessage,
    encode_string, decode_string,
};
pub use proxy::{LoopbackBridge, NullBridge, ProxyBridge};
pub use registry::ClientRegistry;
pub use reply::{DeliveryStats, DeliveryStatsSnapshot, Pop, Reply, ReplyDispatcher, ReplyQueue};
pub use transport::{SerialTransport, TransportAddr, UdpTransport, XrceTransport};

#[cfg(test)]
mod tests;
