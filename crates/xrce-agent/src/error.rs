// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Error type shared by the codec, registry, proxy and transports.

use thiserror::Error;

use crate::protocol::{ClientKey, ObjectId, ObjectKind, StatusCode};

/// Errors produced by the XRCE agent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XrceError {
    /// Not enough bytes to parse a header / payload.
    #[error("buffer too short")]
    BufferTooShort,

    #[error("unknown submessage id: 0x{0:02x}")]
    UnknownSubmessageId(u8),

    #[error("unknown object kind: 0x{0:02x}")]
    UnknownObjectKind(u8),

    #[error("unknown status code: 0x{0:02x}")]
    UnknownStatusCode(u8),

    #[error("unknown data format: 0x{0:02x}")]
    UnknownDataFormat(u8),

    /// Payload length does not match what the submessage kind requires.
    #[error("payload length mismatch")]
    PayloadLengthMismatch,

    /// Serialized message does not fit the fixed transport buffer.
    #[error("message of {needed} bytes exceeds buffer of {capacity} bytes")]
    BufferOverflow { needed: usize, capacity: usize },

    /// Agent-bound message carried a variant only the agent may send.
    #[error("unexpected submessage 0x{0:02x} from client")]
    UnexpectedSubmessage(u8),

    /// CREATE_CLIENT without the "XRCE" cookie.
    #[error("invalid XRCE cookie")]
    InvalidCookie,

    #[error("incompatible XRCE major version {0}")]
    IncompatibleVersion(u8),

    #[error("client {0} already exists")]
    ClientExists(ClientKey),

    #[error("client {0} not found")]
    ClientNotFound(ClientKey),

    /// Registry is at `max_clients`.
    #[error("client limit reached ({0})")]
    TooManyClients(usize),

    #[error("object {0} already exists")]
    ObjectExists(ObjectId),

    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    /// Object id is already bound to another client in the secondary index.
    #[error("object {object} is owned by client {owner}")]
    ObjectOwnedByOther { object: ObjectId, owner: ClientKey },

    #[error("object {object} is not a {expected:?}")]
    WrongObjectKind { object: ObjectId, expected: ObjectKind },

    /// Object representation inside a CREATE payload is unusable.
    #[error("invalid object representation: {0}")]
    InvalidRepresentation(String),

    /// A transport-level I/O error (message only, not the original error).
    #[error("I/O error: {0}")]
    Io(String),

    /// Bridge / proxy error forwarded from the DDS side.
    #[error("bridge error: {0}")]
    Bridge(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("agent transport not initialized")]
    NotInitialized,

    #[error("agent transport already initialized")]
    AlreadyInitialized,

    #[error("agent stopped, cannot be initialized again")]
    Stopped,
}

impl From<std::io::Error> for XrceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl XrceError {
    /// Status code reported to the peer when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ClientExists(_) | Self::ObjectExists(_) => StatusCode::ErrAlreadyExists,
            Self::ClientNotFound(_) | Self::ObjectNotFound(_) => StatusCode::ErrUnknownReference,
            Self::ObjectOwnedByOther { .. } => StatusCode::ErrDenied,
            Self::TooManyClients(_) | Self::BufferOverflow { .. } => StatusCode::ErrResources,
            Self::IncompatibleVersion(_) => StatusCode::ErrIncompatible,
            Self::WrongObjectKind { .. } => StatusCode::ErrMismatch,
            Self::InvalidCookie
            | Self::InvalidRepresentation(_)
            | Self::BufferTooShort
            | Self::PayloadLengthMismatch
            | Self::UnknownSubmessageId(_)
            | Self::UnknownObjectKind(_)
            | Self::UnknownStatusCode(_)
            | Self::UnknownDataFormat(_)
            | Self::UnexpectedSubmessage(_) => StatusCode::ErrInvalidData,
            Self::Io(_)
            | Self::Bridge(_)
            | Self::Config(_)
            | Self::NotInitialized
            | Self::AlreadyInitialized
            | Self::Stopped => StatusCode::ErrDdsError,
        }
    }
}
