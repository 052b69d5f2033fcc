//! Wire framing for the binary RPC protocol.
//!
//! Every message starts with a fixed 14 byte header:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 4 | magic `IceP` |
//! | 4 | 2 | protocol major/minor |
//! | 6 | 2 | encoding major/minor |
//! | 8 | 1 | message type |
//! | 9 | 1 | compression status |
//! | 10 | 4 | total message size, header included |
//!
//! All integers are big-endian. Request and reply bodies start with a 4 byte request id; a batch
//! request body starts with a 4 byte request count followed by length prefixed requests.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// First four bytes of every message.
pub const MAGIC: [u8; 4] = *b"IceP";
/// Protocol major version sent and accepted.
pub const PROTOCOL_MAJOR: u8 = 1;
/// Protocol minor version sent.
pub const PROTOCOL_MINOR: u8 = 0;
/// Encoding major version sent and accepted.
pub const ENCODING_MAJOR: u8 = 1;
/// Encoding minor version sent.
pub const ENCODING_MINOR: u8 = 0;

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 14;
/// Size of the request id in request and reply bodies.
pub const REQUEST_ID_LEN: usize = 4;
/// Size of the request count starting a batch body.
pub const BATCH_COUNT_LEN: usize = 4;

/// Offset of the request id in request and reply frames.
pub const REQUEST_ID_OFFSET: usize = HEADER_SIZE;
/// Offset of the reply status byte in reply frames.
pub const REPLY_STATUS_OFFSET: usize = HEADER_SIZE + REQUEST_ID_LEN;

const MESSAGE_TYPE_OFFSET: usize = 8;
const COMPRESSION_OFFSET: usize = 9;
const SIZE_OFFSET: usize = 10;

/// The type of a framed message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// A one-way (request id 0) or two-way request.
    Request = 0,
    /// Several one-way requests flushed together.
    RequestBatch = 1,
    /// A reply to a two-way request.
    Reply = 2,
    /// Sent by the server after accept, and as a heartbeat afterwards.
    ValidateConnection = 3,
    /// Starts the graceful close handshake.
    CloseConnection = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::RequestBatch),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::ValidateConnection),
            4 => Ok(MessageType::CloseConnection),
            other => Err(Error::UnknownMessage(other)),
        }
    }
}

/// Compression status carried in the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionStatus {
    /// The body is not compressed and the sender does not support compression.
    NotCompressed = 0,
    /// The body is not compressed, but the sender supports compression and wants a compressed reply.
    Supported = 1,
    /// The body is compressed.
    Compressed = 2,
}

impl TryFrom<u8> for CompressionStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionStatus::NotCompressed),
            1 => Ok(CompressionStatus::Supported),
            2 => Ok(CompressionStatus::Compressed),
            other => Err(Error::Protocol(format!(
                "invalid compression status {other}"
            ))),
        }
    }
}

/// Status byte following the request id in a reply frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReplyStatus {
    /// The request succeeded.
    Ok = 0,
    /// The servant raised an application level error.
    UserException = 1,
    /// No servant exists for the target object.
    ObjectNotExist = 2,
    /// The target object has no such facet.
    FacetNotExist = 3,
    /// The target object has no such operation.
    OperationNotExist = 4,
    /// The server failed with a local runtime error.
    UnknownLocalException = 5,
    /// The servant raised an error the caller does not know about.
    UnknownUserException = 6,
    /// The dispatch failed for an unknown reason.
    UnknownException = 7,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::UserException,
            2 => ReplyStatus::ObjectNotExist,
            3 => ReplyStatus::FacetNotExist,
            4 => ReplyStatus::OperationNotExist,
            5 => ReplyStatus::UnknownLocalException,
            6 => ReplyStatus::UnknownUserException,
            7 => ReplyStatus::UnknownException,
            other => return Err(Error::Protocol(format!("invalid reply status {other}"))),
        })
    }
}

/// A decoded message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Kind of message
    pub message_type: MessageType,
    /// Compression status of the body
    pub compression: CompressionStatus,
    /// Total message size, header included.
    pub size: i32,
}

impl Header {
    /// An uncompressed header for a message of `size` bytes.
    pub fn new(message_type: MessageType, size: usize) -> Self {
        Header {
            message_type,
            compression: CompressionStatus::NotCompressed,
            size: size as i32,
        }
    }

    /// Encodes the header with the current protocol and encoding versions.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&MAGIC);
        header[4] = PROTOCOL_MAJOR;
        header[5] = PROTOCOL_MINOR;
        header[6] = ENCODING_MAJOR;
        header[7] = ENCODING_MINOR;
        header[MESSAGE_TYPE_OFFSET] = self.message_type as u8;
        header[COMPRESSION_OFFSET] = self.compression as u8;
        header[SIZE_OFFSET..HEADER_SIZE].copy_from_slice(&self.size.to_be_bytes());
        header
    }

    /// Validates whatever prefix of a header is available.
    ///
    /// The magic is checked once 4 bytes are present and the versions once 8 bytes are present, so a
    /// peer speaking another protocol is rejected before its full header arrives.
    pub fn check_prefix(buf: &[u8]) -> Result<()> {
        if buf.len() >= 4 && buf[..4] != MAGIC {
            let mut magic = [0u8; 4];
            magic.copy_from_slice(&buf[..4]);
            return Err(Error::BadMagic(magic));
        }
        if buf.len() >= 6 && buf[4] != PROTOCOL_MAJOR {
            return Err(Error::UnsupportedProtocol {
                major: buf[4],
                minor: buf[5],
            });
        }
        if buf.len() >= 8 && buf[6] != ENCODING_MAJOR {
            return Err(Error::UnsupportedEncoding {
                major: buf[6],
                minor: buf[7],
            });
        }
        Ok(())
    }

    /// Decodes and validates a complete header.
    pub fn decode(buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "header needs {HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        Header::check_prefix(buf)?;
        let message_type = MessageType::try_from(buf[MESSAGE_TYPE_OFFSET])?;
        let compression = CompressionStatus::try_from(buf[COMPRESSION_OFFSET])?;
        let size = read_i32(buf, SIZE_OFFSET).unwrap_or_default();
        if size < HEADER_SIZE as i32 {
            return Err(Error::IllegalMessageSize(size));
        }
        Ok(Header {
            message_type,
            compression,
            size,
        })
    }

    /// Overwrites the compression status and size of an encoded frame in place.
    pub fn rewrite(frame: &mut [u8], compression: CompressionStatus, size: usize) {
        frame[COMPRESSION_OFFSET] = compression as u8;
        frame[SIZE_OFFSET..HEADER_SIZE].copy_from_slice(&(size as i32).to_be_bytes());
    }
}

/// Reads a big-endian `i32` at `offset`, if the buffer is long enough.
pub fn read_i32(buf: &[u8], offset: usize) -> Option<i32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Encodes a request frame. A `request_id` of 0 marks a one-way request.
pub fn encode_request(request_id: i32, body: &[u8]) -> BytesMut {
    let size = HEADER_SIZE + REQUEST_ID_LEN + body.len();
    let mut frame = BytesMut::with_capacity(size);
    frame.put_slice(&Header::new(MessageType::Request, size).encode());
    frame.put_i32(request_id);
    frame.put_slice(body);
    frame
}

/// Overwrites the request id of an encoded request frame.
pub fn set_request_id(frame: &mut [u8], request_id: i32) {
    frame[REQUEST_ID_OFFSET..REQUEST_ID_OFFSET + REQUEST_ID_LEN]
        .copy_from_slice(&request_id.to_be_bytes());
}

/// Encodes several one-way request bodies into a single batch frame.
pub fn encode_batch(requests: &[Bytes]) -> BytesMut {
    let size = HEADER_SIZE
        + BATCH_COUNT_LEN
        + requests.iter().map(|req| 4 + req.len()).sum::<usize>();
    let mut frame = BytesMut::with_capacity(size);
    frame.put_slice(&Header::new(MessageType::RequestBatch, size).encode());
    frame.put_i32(requests.len() as i32);
    for request in requests {
        frame.put_u32(request.len() as u32);
        frame.put_slice(request);
    }
    frame
}

/// Splits the body of a batch frame into its requests.
pub fn decode_batch(frame: &Bytes) -> Result<Vec<Bytes>> {
    let count = read_i32(frame, HEADER_SIZE)
        .ok_or_else(|| Error::Protocol("batch request is missing its count".into()))?;
    if count < 0 {
        return Err(Error::Protocol(format!("invalid batch request count {count}")));
    }

    let mut offset = HEADER_SIZE + BATCH_COUNT_LEN;
    let mut requests = Vec::with_capacity((count as usize).min(1024));
    for _ in 0..count {
        let len = read_i32(frame, offset)
            .ok_or_else(|| Error::Protocol("truncated batch request".into()))?
            as u32 as usize;
        offset += 4;
        if offset + len > frame.len() {
            return Err(Error::Protocol("truncated batch request".into()));
        }
        requests.push(frame.slice(offset..offset + len));
        offset += len;
    }
    if offset != frame.len() {
        return Err(Error::Protocol(format!(
            "{} trailing bytes after batch requests",
            frame.len() - offset
        )));
    }
    Ok(requests)
}

/// Encodes a reply frame.
pub fn encode_reply(request_id: i32, status: ReplyStatus, body: &[u8]) -> BytesMut {
    let size = REPLY_STATUS_OFFSET + 1 + body.len();
    let mut frame = BytesMut::with_capacity(size);
    frame.put_slice(&Header::new(MessageType::Reply, size).encode());
    frame.put_i32(request_id);
    frame.put_u8(status as u8);
    frame.put_slice(body);
    frame
}

/// Encodes a body-less control frame (validate or close).
pub fn encode_control(message_type: MessageType) -> BytesMut {
    debug_assert!(matches!(
        message_type,
        MessageType::ValidateConnection | MessageType::CloseConnection
    ));
    BytesMut::from(&Header::new(message_type, HEADER_SIZE).encode()[..])
}
