// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// DDS-XRCE wire format parser/builder.
//
// All parsing is safe: malformed input returns Err, never panics.
// Multi-byte fields are little-endian.

use std::fmt;

use crate::error::XrceError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// XRCE message header size in bytes (session, stream, sequence, client key).
pub const MESSAGE_HEADER_SIZE: usize = 8;

/// XRCE submessage header size in bytes.
pub const SUBMESSAGE_HEADER_SIZE: usize = 4;

/// Size of an encoded [`SampleInfo`].
pub const SAMPLE_INFO_SIZE: usize = 9;

/// Cookie carried by every CREATE_CLIENT.
pub const XRCE_COOKIE: [u8; 4] = *b"XRCE";

/// Protocol version spoken by this agent (major, minor).
pub const XRCE_VERSION: [u8; 2] = [0x01, 0x00];

// Submessage IDs
pub const SUBMSG_CREATE_CLIENT: u8 = 0x00;
pub const SUBMSG_CREATE: u8 = 0x01;
pub const SUBMSG_DELETE: u8 = 0x03;
pub const SUBMSG_STATUS: u8 = 0x05;
pub const SUBMSG_WRITE_DATA: u8 = 0x07;
pub const SUBMSG_READ_DATA: u8 = 0x08;
pub const SUBMSG_DATA: u8 = 0x09;

// Submessage flags
pub const FLAG_LITTLE_ENDIAN: u8 = 0x01;
pub const FLAG_FORMAT_MASK: u8 = 0x0E;
/// WRITE_DATA: client wants a STATUS even when the write succeeds.
pub const FLAG_REPLY_REQUESTED: u8 = 0x80;

// Object kinds
pub const OBJ_PARTICIPANT: u8 = 0x01;
pub const OBJ_TOPIC: u8 = 0x02;
pub const OBJ_PUBLISHER: u8 = 0x03;
pub const OBJ_SUBSCRIBER: u8 = 0x04;
pub const OBJ_DATAWRITER: u8 = 0x05;
pub const OBJ_DATAREADER: u8 = 0x06;

// Status codes
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_OK_MATCHED: u8 = 0x01;
pub const STATUS_ERR_DDS_ERROR: u8 = 0x80;
pub const STATUS_ERR_MISMATCH: u8 = 0x81;
pub const STATUS_ERR_ALREADY_EXISTS: u8 = 0x82;
pub const STATUS_ERR_DENIED: u8 = 0x83;
pub const STATUS_ERR_UNKNOWN_REFERENCE: u8 = 0x84;
pub const STATUS_ERR_INVALID_DATA: u8 = 0x85;
pub const STATUS_ERR_INCOMPATIBLE: u8 = 0x86;
pub const STATUS_ERR_RESOURCES: u8 = 0x87;

// Data delivery formats (carried in DATA / READ_DATA)
pub const FORMAT_DATA: u8 = 0x00;
pub const FORMAT_SAMPLE: u8 = 0x02;
pub const FORMAT_DATA_SEQ: u8 = 0x08;
pub const FORMAT_SAMPLE_SEQ: u8 = 0x0A;
pub const FORMAT_PACKED_SAMPLES: u8 = 0x0E;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque 4-byte key chosen by the client at CREATE_CLIENT time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ClientKey(pub [u8; 4]);

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{:02x}{:02x}{:02x}{:02x}", a, b, c, d)
    }
}

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientKey({})", self)
    }
}

impl From<[u8; 4]> for ClientKey {
    fn from(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

/// Identifier of an object owned by a client.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId(pub u16);

impl ObjectId {
    /// Addresses the client object itself (DELETE of the whole client).
    pub const CLIENT: ObjectId = ObjectId(0xFFF0);

    pub fn is_client(self) -> bool {
        self == Self::CLIENT
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

// ---------------------------------------------------------------------------
// Object kind enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    Participant = OBJ_PARTICIPANT,
    Topic = OBJ_TOPIC,
    Publisher = OBJ_PUBLISHER,
    Subscriber = OBJ_SUBSCRIBER,
    DataWriter = OBJ_DATAWRITER,
    DataReader = OBJ_DATAREADER,
}

impl ObjectKind {
    pub fn from_u8(v: u8) -> Result<Self, XrceError> {
        match v {
            OBJ_PARTICIPANT => Ok(Self::Participant),
            OBJ_TOPIC => Ok(Self::Topic),
            OBJ_PUBLISHER => Ok(Self::Publisher),
            OBJ_SUBSCRIBER => Ok(Self::Subscriber),
            OBJ_DATAWRITER => Ok(Self::DataWriter),
            OBJ_DATAREADER => Ok(Self::DataReader),
            _ => Err(XrceError::UnknownObjectKind(v)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// Status code / result status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Ok = STATUS_OK,
    OkMatched = STATUS_OK_MATCHED,
    ErrDdsError = STATUS_ERR_DDS_ERROR,
    ErrMismatch = STATUS_ERR_MISMATCH,
    ErrAlreadyExists = STATUS_ERR_ALREADY_EXISTS,
    ErrDenied = STATUS_ERR_DENIED,
    ErrUnknownReference = STATUS_ERR_UNKNOWN_REFERENCE,
    ErrInvalidData = STATUS_ERR_INVALID_DATA,
    ErrIncompatible = STATUS_ERR_INCOMPATIBLE,
    ErrResources = STATUS_ERR_RESOURCES,
}

impl StatusCode {
    pub fn from_u8(v: u8) -> Result<Self, XrceError> {
        match v {
            STATUS_OK => Ok(Self::Ok),
            STATUS_OK_MATCHED => Ok(Self::OkMatched),
            STATUS_ERR_DDS_ERROR => Ok(Self::ErrDdsError),
            STATUS_ERR_MISMATCH => Ok(Self::ErrMismatch),
            STATUS_ERR_ALREADY_EXISTS => Ok(Self::ErrAlreadyExists),
            STATUS_ERR_DENIED => Ok(Self::ErrDenied),
            STATUS_ERR_UNKNOWN_REFERENCE => Ok(Self::ErrUnknownReference),
            STATUS_ERR_INVALID_DATA => Ok(Self::ErrInvalidData),
            STATUS_ERR_INCOMPATIBLE => Ok(Self::ErrIncompatible),
            STATUS_ERR_RESOURCES => Ok(Self::ErrResources),
            _ => Err(XrceError::UnknownStatusCode(v)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok | Self::OkMatched)
    }
}

/// Outcome of a registry or proxy operation, as reported to the caller
/// and carried inside STATUS replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultStatus {
    pub status: StatusCode,
    /// Implementation-defined detail, 0 when unused.
    pub implementation_status: u8,
}

impl ResultStatus {
    pub const OK: ResultStatus = ResultStatus::new(StatusCode::Ok);

    pub const fn new(status: StatusCode) -> Self {
        Self {
            status,
            implementation_status: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

impl From<&XrceError> for ResultStatus {
    fn from(e: &XrceError) -> Self {
        Self::new(e.status_code())
    }
}

impl<T> From<&Result<T, XrceError>> for ResultStatus {
    fn from(r: &Result<T, XrceError>) -> Self {
        match r {
            Ok(_) => Self::OK,
            Err(e) => Self::from(e),
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.status)?;
        if self.implementation_status != 0 {
            write!(f, " ({})", self.implementation_status)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Data format enum
// ---------------------------------------------------------------------------

/// How READ_DATA results are packed into DATA submessages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DataFormat {
    #[default]
    Data = FORMAT_DATA,
    Sample = FORMAT_SAMPLE,
    DataSeq = FORMAT_DATA_SEQ,
    SampleSeq = FORMAT_SAMPLE_SEQ,
    PackedSamples = FORMAT_PACKED_SAMPLES,
}

impl DataFormat {
    pub fn from_u8(v: u8) -> Result<Self, XrceError> {
        match v {
            FORMAT_DATA => Ok(Self::Data),
            FORMAT_SAMPLE => Ok(Self::Sample),
            FORMAT_DATA_SEQ => Ok(Self::DataSeq),
            FORMAT_SAMPLE_SEQ => Ok(Self::SampleSeq),
            FORMAT_PACKED_SAMPLES => Ok(Self::PackedSamples),
            _ => Err(XrceError::UnknownDataFormat(v)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether several samples share one DATA submessage.
    pub fn is_batched(self) -> bool {
        matches!(self, Self::DataSeq | Self::SampleSeq | Self::PackedSamples)
    }

    /// Serialized size of a one-submessage DATA message in this format
    /// carrying no samples.
    pub fn empty_message_len(self) -> usize {
        let body = match self {
            Self::Data => 0,
            Self::Sample => SAMPLE_INFO_SIZE,
            Self::DataSeq | Self::SampleSeq => 2,
            Self::PackedSamples => SAMPLE_INFO_SIZE + 2,
        };
        MESSAGE_HEADER_SIZE + SUBMESSAGE_HEADER_SIZE + 4 + body
    }

    /// Bytes one sample carrying `data_len` bytes adds to such a message.
    pub fn sample_len(self, data_len: usize) -> usize {
        let overhead = match self {
            Self::Data | Self::Sample => 0,
            Self::DataSeq => 2,
            Self::SampleSeq => SAMPLE_INFO_SIZE + 2,
            // state, seq delta, timestamp delta, length
            Self::PackedSamples => 6,
        };
        overhead + data_len
    }
}

// ---------------------------------------------------------------------------
// Message header
// ---------------------------------------------------------------------------

/// Top-level XRCE message header (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub session_id: u8,
    pub stream_id: u8,
    pub sequence_nr: u16,
    pub client_key: ClientKey,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, XrceError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(XrceError::BufferTooShort);
        }
        Ok(Self {
            session_id: buf[0],
            stream_id: buf[1],
            sequence_nr: u16::from_le_bytes([buf[2], buf[3]]),
            client_key: ClientKey([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.session_id);
        buf.push(self.stream_id);
        buf.extend_from_slice(&self.sequence_nr.to_le_bytes());
        buf.extend_from_slice(&self.client_key.0);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MESSAGE_HEADER_SIZE);
        self.write_to(&mut buf);
        buf
    }
}

// ---------------------------------------------------------------------------
// Submessage header
// ---------------------------------------------------------------------------

/// Submessage header (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmessageHeader {
    pub submessage_id: u8,
    pub flags: u8,
    pub length: u16,
}

impl SubmessageHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, XrceError> {
        if buf.len() < SUBMESSAGE_HEADER_SIZE {
            return Err(XrceError::BufferTooShort);
        }
        Ok(Self {
            submessage_id: buf[0],
            flags: buf[1],
            length: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.submessage_id);
        buf.push(self.flags);
        buf.extend_from_slice(&self.length.to_le_bytes());
    }
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

/// CREATE_CLIENT (0x00)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateClientPayload {
    pub request_id: u16,
    pub xrce_cookie: [u8; 4],
    pub xrce_version: [u8; 2],
    pub xrce_vendor_id: [u8; 2],
    pub client_key: ClientKey,
    pub session_id: u8,
}

impl CreateClientPayload {
    /// A well-formed request for `client_key` speaking this agent's version.
    pub fn new(request_id: u16, client_key: ClientKey, session_id: u8) -> Self {
        Self {
            request_id,
            xrce_cookie: XRCE_COOKIE,
            xrce_version: XRCE_VERSION,
            xrce_vendor_id: [0, 0],
            client_key,
            session_id,
        }
    }

    /// Check cookie and major version.
    pub fn validate(&self) -> Result<(), XrceError> {
        if self.xrce_cookie != XRCE_COOKIE {
            return Err(XrceError::InvalidCookie);
        }
        if self.xrce_version[0] != XRCE_VERSION[0] {
            return Err(XrceError::IncompatibleVersion(self.xrce_version[0]));
        }
        Ok(())
    }
}

/// Kind-specific part of a CREATE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectRepresentation {
    Participant { domain_id: u16 },
    Topic { name: String, type_name: String },
    Publisher,
    Subscriber,
    DataWriter { topic_id: ObjectId },
    DataReader { topic_id: ObjectId },
}

impl ObjectRepresentation {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Participant { .. } => ObjectKind::Participant,
            Self::Topic { .. } => ObjectKind::Topic,
            Self::Publisher => ObjectKind::Publisher,
            Self::Subscriber => ObjectKind::Subscriber,
            Self::DataWriter { .. } => ObjectKind::DataWriter,
            Self::DataReader { .. } => ObjectKind::DataReader,
        }
    }
}

/// CREATE (0x01) - create a DDS entity on the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePayload {
    pub request_id: u16,
    pub object_id: ObjectId,
    /// Owning object; ignored for participants.
    pub parent_id: ObjectId,
    pub representation: ObjectRepresentation,
}

impl CreatePayload {
    pub fn kind(&self) -> ObjectKind {
        self.representation.kind()
    }
}

/// DELETE (0x03)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletePayload {
    pub request_id: u16,
    pub object_id: ObjectId,
}

/// WRITE_DATA (0x07)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteDataPayload {
    pub request_id: u16,
    pub object_id: ObjectId,
    /// Set from / encoded as [`FLAG_REPLY_REQUESTED`].
    pub reply_requested: bool,
    pub data: Vec<u8>,
}

/// READ_DATA (0x08)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadDataPayload {
    pub request_id: u16,
    pub object_id: ObjectId,
    pub max_samples: u16,
    pub format: DataFormat,
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

/// STATUS (0x05)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPayload {
    pub request_id: u16,
    pub object_id: ObjectId,
    pub result: ResultStatus,
}

/// Per-sample metadata attached to SAMPLE formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleInfo {
    pub state: u8,
    pub sequence_number: u32,
    /// Milliseconds since the owning client was created.
    pub session_time_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub info: SampleInfo,
    pub data: Vec<u8>,
}

/// Sample metadata relative to the base [`SampleInfo`] of a packed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleDelta {
    pub state: u8,
    pub seq_delta: u8,
    pub timestamp_delta: u16,
    pub data: Vec<u8>,
}

/// DATA, format `Data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub request_id: u16,
    pub object_id: ObjectId,
    pub data: Vec<u8>,
}

/// DATA, format `Sample`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePayload {
    pub request_id: u16,
    pub object_id: ObjectId,
    pub sample: Sample,
}

/// DATA, format `DataSeq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSeqPayload {
    pub request_id: u16,
    pub object_id: ObjectId,
    pub data: Vec<Vec<u8>>,
}

/// DATA, format `SampleSeq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSeqPayload {
    pub request_id: u16,
    pub object_id: ObjectId,
    pub samples: Vec<Sample>,
}

/// DATA, format `PackedSamples`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedSamplesPayload {
    pub request_id: u16,
    pub object_id: ObjectId,
    pub info: SampleInfo,
    pub samples: Vec<SampleDelta>,
}

// ---------------------------------------------------------------------------
// Unified submessage enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submessage {
    // client -> agent
    CreateClient(CreateClientPayload),
    Create(CreatePayload),
    Delete(DeletePayload),
    WriteData(WriteDataPayload),
    ReadData(ReadDataPayload),
    // agent -> client
    Status(StatusPayload),
    Data(DataPayload),
    Sample(SamplePayload),
    DataSeq(DataSeqPayload),
    SampleSeq(SampleSeqPayload),
    PackedSamples(PackedSamplesPayload),
}

impl Submessage {
    pub fn id(&self) -> u8 {
        match self {
            Self::CreateClient(_) => SUBMSG_CREATE_CLIENT,
            Self::Create(_) => SUBMSG_CREATE,
            Self::Delete(_) => SUBMSG_DELETE,
            Self::WriteData(_) => SUBMSG_WRITE_DATA,
            Self::ReadData(_) => SUBMSG_READ_DATA,
            Self::Status(_) => SUBMSG_STATUS,
            Self::Data(_)
            | Self::Sample(_)
            | Self::DataSeq(_)
            | Self::SampleSeq(_)
            | Self::PackedSamples(_) => SUBMSG_DATA,
        }
    }

    fn flags(&self) -> u8 {
        let extra = match self {
            Self::WriteData(p) if p.reply_requested => FLAG_REPLY_REQUESTED,
            Self::Data(_) => FORMAT_DATA,
            Self::Sample(_) => FORMAT_SAMPLE,
            Self::DataSeq(_) => FORMAT_DATA_SEQ,
            Self::SampleSeq(_) => FORMAT_SAMPLE_SEQ,
            Self::PackedSamples(_) => FORMAT_PACKED_SAMPLES,
            _ => 0,
        };
        FLAG_LITTLE_ENDIAN | extra
    }
}

impl From<CreateClientPayload> for Submessage {
    fn from(p: CreateClientPayload) -> Self {
        Self::CreateClient(p)
    }
}

impl From<CreatePayload> for Submessage {
    fn from(p: CreatePayload) -> Self {
        Self::Create(p)
    }
}

impl From<DeletePayload> for Submessage {
    fn from(p: DeletePayload) -> Self {
        Self::Delete(p)
    }
}

impl From<WriteDataPayload> for Submessage {
    fn from(p: WriteDataPayload) -> Self {
        Self::WriteData(p)
    }
}

impl From<ReadDataPayload> for Submessage {
    fn from(p: ReadDataPayload) -> Self {
        Self::ReadData(p)
    }
}

impl From<StatusPayload> for Submessage {
    fn from(p: StatusPayload) -> Self {
        Self::Status(p)
    }
}

impl From<DataPayload> for Submessage {
    fn from(p: DataPayload) -> Self {
        Self::Data(p)
    }
}

impl From<SamplePayload> for Submessage {
    fn from(p: SamplePayload) -> Self {
        Self::Sample(p)
    }
}

impl From<DataSeqPayload> for Submessage {
    fn from(p: DataSeqPayload) -> Self {
        Self::DataSeq(p)
    }
}

impl From<SampleSeqPayload> for Submessage {
    fn from(p: SampleSeqPayload) -> Self {
        Self::SampleSeq(p)
    }
}

impl From<PackedSamplesPayload> for Submessage {
    fn from(p: PackedSamplesPayload) -> Self {
        Self::PackedSamples(p)
    }
}

// ---------------------------------------------------------------------------
// Full XRCE message / parsed frame
// ---------------------------------------------------------------------------

/// A complete XRCE message: one header + one or more submessages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrceMessage {
    pub header: MessageHeader,
    pub submessages: Vec<Submessage>,
}

impl XrceMessage {
    pub fn single(header: MessageHeader, submessage: impl Into<Submessage>) -> Self {
        Self {
            header,
            submessages: vec![submessage.into()],
        }
    }
}

/// One `(header, sub_header, payload)` triple handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MessageHeader,
    pub sub_header: SubmessageHeader,
    pub payload: Submessage,
}

// ---------------------------------------------------------------------------
// Parsing helpers (little-endian)
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], XrceError> {
        if self.off + n > self.buf.len() {
            return Err(XrceError::PayloadLengthMismatch);
        }
        let s = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, XrceError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, XrceError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, XrceError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], XrceError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn object_id(&mut self) -> Result<ObjectId, XrceError> {
        self.u16().map(ObjectId)
    }

    /// u16 length prefix followed by that many bytes.
    fn blob(&mut self) -> Result<Vec<u8>, XrceError> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Length-prefixed UTF-8 string.
    fn string(&mut self) -> Result<String, XrceError> {
        String::from_utf8(self.blob()?)
            .map_err(|e| XrceError::InvalidRepresentation(format!("string is not UTF-8: {}", e)))
    }

    fn sample_info(&mut self) -> Result<SampleInfo, XrceError> {
        Ok(SampleInfo {
            state: self.u8()?,
            sequence_number: self.u32()?,
            session_time_offset: self.u32()?,
        })
    }

    fn rest(&mut self) -> Vec<u8> {
        let s = self.buf[self.off..].to_vec();
        self.off = self.buf.len();
        s
    }

    fn is_empty(&self) -> bool {
        self.off >= self.buf.len()
    }
}

fn put_blob(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
    buf.extend_from_slice(data);
}

fn put_sample_info(buf: &mut Vec<u8>, info: &SampleInfo) {
    buf.push(info.state);
    buf.extend_from_slice(&info.sequence_number.to_le_bytes());
    buf.extend_from_slice(&info.session_time_offset.to_le_bytes());
}

// ---------------------------------------------------------------------------
// Submessage parsing
// ---------------------------------------------------------------------------

fn parse_representation(
    kind: ObjectKind,
    cur: &mut Cursor<'_>,
) -> Result<ObjectRepresentation, XrceError> {
    let repr = match kind {
        ObjectKind::Participant => ObjectRepresentation::Participant {
            domain_id: cur.u16()?,
        },
        ObjectKind::Topic => ObjectRepresentation::Topic {
            name: cur.string()?,
            type_name: cur.string()?,
        },
        ObjectKind::Publisher => ObjectRepresentation::Publisher,
        ObjectKind::Subscriber => ObjectRepresentation::Subscriber,
        ObjectKind::DataWriter => ObjectRepresentation::DataWriter {
            topic_id: cur.object_id()?,
        },
        ObjectKind::DataReader => ObjectRepresentation::DataReader {
            topic_id: cur.object_id()?,
        },
    };
    Ok(repr)
}

fn parse_data(flags: u8, cur: &mut Cursor<'_>) -> Result<Submessage, XrceError> {
    let request_id = cur.u16()?;
    let object_id = cur.object_id()?;
    let submsg = match DataFormat::from_u8(flags & FLAG_FORMAT_MASK)? {
        DataFormat::Data => Submessage::Data(DataPayload {
            request_id,
            object_id,
            data: cur.rest(),
        }),
        DataFormat::Sample => {
            let info = cur.sample_info()?;
            Submessage::Sample(SamplePayload {
                request_id,
                object_id,
                sample: Sample {
                    info,
                    data: cur.rest(),
                },
            })
        }
        DataFormat::DataSeq => {
            let count = cur.u16()?;
            let data = (0..count)
                .map(|_| cur.blob())
                .collect::<Result<Vec<_>, _>>()?;
            Submessage::DataSeq(DataSeqPayload {
                request_id,
                object_id,
                data,
            })
        }
        DataFormat::SampleSeq => {
            let count = cur.u16()?;
            let mut samples = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let info = cur.sample_info()?;
                let data = cur.blob()?;
                samples.push(Sample { info, data });
            }
            Submessage::SampleSeq(SampleSeqPayload {
                request_id,
                object_id,
                samples,
            })
        }
        DataFormat::PackedSamples => {
            let info = cur.sample_info()?;
            let count = cur.u16()?;
            let mut samples = Vec::with_capacity(count as usize);
            for _ in 0..count {
                samples.push(SampleDelta {
                    state: cur.u8()?,
                    seq_delta: cur.u8()?,
                    timestamp_delta: cur.u16()?,
                    data: cur.blob()?,
                });
            }
            Submessage::PackedSamples(PackedSamplesPayload {
                request_id,
                object_id,
                info,
                samples,
            })
        }
    };
    Ok(submsg)
}

/// Parse a single submessage (header + payload) starting at `buf`.
/// Returns (sub_header, submessage, bytes_consumed).
pub fn parse_submessage(buf: &[u8]) -> Result<(SubmessageHeader, Submessage, usize), XrceError> {
    let hdr = SubmessageHeader::parse(buf)?;
    let payload_end = SUBMESSAGE_HEADER_SIZE + hdr.length as usize;
    if buf.len() < payload_end {
        return Err(XrceError::BufferTooShort);
    }
    let mut cur = Cursor::new(&buf[SUBMESSAGE_HEADER_SIZE..payload_end]);

    let submsg = match hdr.submessage_id {
        SUBMSG_CREATE_CLIENT => Submessage::CreateClient(CreateClientPayload {
            request_id: cur.u16()?,
            xrce_cookie: cur.array()?,
            xrce_version: cur.array()?,
            xrce_vendor_id: cur.array()?,
            client_key: ClientKey(cur.array()?),
            session_id: cur.u8()?,
        }),
        SUBMSG_CREATE => {
            let request_id = cur.u16()?;
            let object_id = cur.object_id()?;
            let kind = ObjectKind::from_u8(cur.u8()?)?;
            let parent_id = cur.object_id()?;
            let representation = parse_representation(kind, &mut cur)?;
            Submessage::Create(CreatePayload {
                request_id,
                object_id,
                parent_id,
                representation,
            })
        }
        SUBMSG_DELETE => Submessage::Delete(DeletePayload {
            request_id: cur.u16()?,
            object_id: cur.object_id()?,
        }),
        SUBMSG_WRITE_DATA => Submessage::WriteData(WriteDataPayload {
            request_id: cur.u16()?,
            object_id: cur.object_id()?,
            reply_requested: hdr.flags & FLAG_REPLY_REQUESTED != 0,
            data: cur.rest(),
        }),
        SUBMSG_READ_DATA => Submessage::ReadData(ReadDataPayload {
            request_id: cur.u16()?,
            object_id: cur.object_id()?,
            max_samples: cur.u16()?,
            format: DataFormat::from_u8(cur.u8()?)?,
        }),
        SUBMSG_STATUS => Submessage::Status(StatusPayload {
            request_id: cur.u16()?,
            object_id: cur.object_id()?,
            result: ResultStatus {
                status: StatusCode::from_u8(cur.u8()?)?,
                implementation_status: cur.u8()?,
            },
        }),
        SUBMSG_DATA => parse_data(hdr.flags, &mut cur)?,
        other => return Err(XrceError::UnknownSubmessageId(other)),
    };
    if !cur.is_empty() {
        return Err(XrceError::PayloadLengthMismatch);
    }
    Ok((hdr, submsg, payload_end))
}

// ---------------------------------------------------------------------------
// Full message parsing
// ---------------------------------------------------------------------------

/// Parse a complete XRCE message (header + one or more submessages).
pub fn parse_message(buf: &[u8]) -> Result<XrceMessage, XrceError> {
    let header = MessageHeader::parse(buf)?;
    let mut offset = MESSAGE_HEADER_SIZE;
    let mut submessages = Vec::new();
    while offset < buf.len() {
        let (_, submsg, consumed) = parse_submessage(&buf[offset..])?;
        submessages.push(submsg);
        offset += consumed;
    }
    if submessages.is_empty() {
        return Err(XrceError::BufferTooShort);
    }
    Ok(XrceMessage {
        header,
        submessages,
    })
}

/// Split a received buffer into dispatchable frames.
///
/// Submessages with an unknown id are skipped. Any other defect drops the
/// whole buffer: the result is empty rather than partially applied.
pub fn parse_frames(buf: &[u8]) -> Vec<Frame> {
    let header = match MessageHeader::parse(buf) {
        Ok(h) => h,
        Err(e) => {
            log::debug!("Dropping {} byte buffer: {}", buf.len(), e);
            return Vec::new();
        }
    };

    let mut frames = Vec::new();
    let mut offset = MESSAGE_HEADER_SIZE;
    while offset < buf.len() {
        match parse_submessage(&buf[offset..]) {
            Ok((sub_header, payload, consumed)) => {
                frames.push(Frame {
                    header,
                    sub_header,
                    payload,
                });
                offset += consumed;
            }
            Err(XrceError::UnknownSubmessageId(id)) => {
                // Length is still trustworthy: the header parsed.
                let skip = SubmessageHeader::parse(&buf[offset..])
                    .map(|h| SUBMESSAGE_HEADER_SIZE + h.length as usize)
                    .unwrap_or(buf.len() - offset);
                log::debug!("Skipping unknown submessage 0x{:02x}", id);
                offset += skip;
            }
            Err(e) => {
                log::warn!(
                    "Malformed XRCE message from client {}: {}",
                    header.client_key,
                    e
                );
                return Vec::new();
            }
        }
    }
    frames
}

// ---------------------------------------------------------------------------
// Submessage serialization
// ---------------------------------------------------------------------------

fn serialize_payload(submsg: &Submessage) -> Vec<u8> {
    let mut pl = Vec::new();
    match submsg {
        Submessage::CreateClient(p) => {
            pl.extend_from_slice(&p.request_id.to_le_bytes());
            pl.extend_from_slice(&p.xrce_cookie);
            pl.extend_from_slice(&p.xrce_version);
            pl.extend_from_slice(&p.xrce_vendor_id);
            pl.extend_from_slice(&p.client_key.0);
            pl.push(p.session_id);
        }
        Submessage::Create(p) => {
            pl.extend_from_slice(&p.request_id.to_le_bytes());
            pl.extend_from_slice(&p.object_id.0.to_le_bytes());
            pl.push(p.kind().as_u8());
            pl.extend_from_slice(&p.parent_id.0.to_le_bytes());
            match &p.representation {
                ObjectRepresentation::Participant { domain_id } => {
                    pl.extend_from_slice(&domain_id.to_le_bytes());
                }
                ObjectRepresentation::Topic { name, type_name } => {
                    pl.extend_from_slice(&encode_string(name));
                    pl.extend_from_slice(&encode_string(type_name));
                }
                ObjectRepresentation::Publisher | ObjectRepresentation::Subscriber => {}
                ObjectRepresentation::DataWriter { topic_id }
                | ObjectRepresentation::DataReader { topic_id } => {
                    pl.extend_from_slice(&topic_id.0.to_le_bytes());
                }
            }
        }
        Submessage::Delete(p) => {
            pl.extend_from_slice(&p.request_id.to_le_bytes());
            pl.extend_from_slice(&p.object_id.0.to_le_bytes());
        }
        Submessage::WriteData(p) => {
            pl.extend_from_slice(&p.request_id.to_le_bytes());
            pl.extend_from_slice(&p.object_id.0.to_le_bytes());
            pl.extend_from_slice(&p.data);
        }
        Submessage::ReadData(p) => {
            pl.extend_from_slice(&p.request_id.to_le_bytes());
            pl.extend_from_slice(&p.object_id.0.to_le_bytes());
            pl.extend_from_slice(&p.max_samples.to_le_bytes());
            pl.push(p.format.as_u8());
        }
        Submessage::Status(p) => {
            pl.extend_from_slice(&p.request_id.to_le_bytes());
            pl.extend_from_slice(&p.object_id.0.to_le_bytes());
            pl.push(p.result.status.as_u8());
            pl.push(p.result.implementation_status);
        }
        Submessage::Data(p) => {
            pl.extend_from_slice(&p.request_id.to_le_bytes());
            pl.extend_from_slice(&p.object_id.0.to_le_bytes());
            pl.extend_from_slice(&p.data);
        }
        Submessage::Sample(p) => {
            pl.extend_from_slice(&p.request_id.to_le_bytes());
            pl.extend_from_slice(&p.object_id.0.to_le_bytes());
            put_sample_info(&mut pl, &p.sample.info);
            pl.extend_from_slice(&p.sample.data);
        }
        Submessage::DataSeq(p) => {
            pl.extend_from_slice(&p.request_id.to_le_bytes());
            pl.extend_from_slice(&p.object_id.0.to_le_bytes());
            pl.extend_from_slice(&(p.data.len() as u16).to_le_bytes());
            for d in &p.data {
                put_blob(&mut pl, d);
            }
        }
        Submessage::SampleSeq(p) => {
            pl.extend_from_slice(&p.request_id.to_le_bytes());
            pl.extend_from_slice(&p.object_id.0.to_le_bytes());
            pl.extend_from_slice(&(p.samples.len() as u16).to_le_bytes());
            for s in &p.samples {
                put_sample_info(&mut pl, &s.info);
                put_blob(&mut pl, &s.data);
            }
        }
        Submessage::PackedSamples(p) => {
            pl.extend_from_slice(&p.request_id.to_le_bytes());
            pl.extend_from_slice(&p.object_id.0.to_le_bytes());
            put_sample_info(&mut pl, &p.info);
            pl.extend_from_slice(&(p.samples.len() as u16).to_le_bytes());
            for s in &p.samples {
                pl.push(s.state);
                pl.push(s.seq_delta);
                pl.extend_from_slice(&s.timestamp_delta.to_le_bytes());
                put_blob(&mut pl, &s.data);
            }
        }
    }
    pl
}

/// Serialize a submessage (header + payload) into bytes.
pub fn serialize_submessage(submsg: &Submessage) -> Vec<u8> {
    let payload = serialize_payload(submsg);
    let hdr = SubmessageHeader {
        submessage_id: submsg.id(),
        flags: submsg.flags(),
        length: payload.len() as u16,
    };
    let mut out = Vec::with_capacity(SUBMESSAGE_HEADER_SIZE + payload.len());
    hdr.write_to(&mut out);
    out.extend_from_slice(&payload);
    out
}

/// Serialize a full message (header + submessages).
pub fn serialize_message(msg: &XrceMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MESSAGE_HEADER_SIZE);
    msg.header.write_to(&mut buf);
    for sub in &msg.submessages {
        buf.extend_from_slice(&serialize_submessage(sub));
    }
    buf
}

/// Serialize `msg` into a fixed-capacity buffer. Returns the number of bytes
/// written, or `BufferOverflow` (buffer untouched) when it does not fit.
pub fn serialize_message_into(msg: &XrceMessage, out: &mut [u8]) -> Result<usize, XrceError> {
    let bytes = serialize_message(msg);
    if bytes.len() > out.len() {
        return Err(XrceError::BufferOverflow {
            needed: bytes.len(),
            capacity: out.len(),
        });
    }
    out[..bytes.len()].copy_from_slice(&bytes);
    Ok(bytes.len())
}

// ---------------------------------------------------------------------------
// Helper: length-prefixed strings for CREATE payloads (topic name etc.)
// ---------------------------------------------------------------------------

/// Encode a string as [len_u16_le][utf8_bytes].
pub fn encode_string(s: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + s.len());
    put_blob(&mut buf, s.as_bytes());
    buf
}

/// Decode a length-prefixed string. Returns (string, bytes_consumed).
pub fn decode_string(buf: &[u8]) -> Result<(String, usize), XrceError> {
    let mut cur = Cursor::new(buf);
    let s = cur.string().map_err(|e| match e {
        XrceError::PayloadLengthMismatch => XrceError::BufferTooShort,
        other => other,
    })?;
    Ok((s, cur.off))
}
