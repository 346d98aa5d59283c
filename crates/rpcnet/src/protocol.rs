//! Wire protocol
//!
//! Every message starts with a 14-byte header:
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0 | 4 | magic `RPCP` |
//! | 4 | 2 | protocol version (1.0) |
//! | 6 | 2 | encoding version (1.1) |
//! | 8 | 1 | message type |
//! | 9 | 1 | compression status |
//! | 10 | 4 | total message size, little endian |
//!
//! A batch request adds a 4-byte request count right after the header.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{LocalError, Result, RpcError, UserError};
use crate::identity::Identity;
use crate::retry::OperationMode;

pub const MAGIC: [u8; 4] = *b"RPCP";
pub const PROTOCOL_MAJOR: u8 = 1;
pub const PROTOCOL_MINOR: u8 = 0;
pub const ENCODING_MAJOR: u8 = 1;
pub const ENCODING_MINOR: u8 = 1;

pub const HEADER_SIZE: usize = 14;
/// Header plus the request count of a batch
pub const BATCH_HEADER_SIZE: usize = HEADER_SIZE + 4;

/// Offset of the message size field
const SIZE_OFFSET: usize = 10;

/// Convert a `MessageSizeMax` property value in KB to bytes. Values below 1
/// or too large to represent mean no limit.
pub fn message_size_limit(kb: i64) -> usize {
    if kb < 1 || kb > i64::from(i32::MAX) / 1024 {
        usize::MAX
    } else {
        kb as usize * 1024
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    BatchRequest = 1,
    Reply = 2,
    ValidateConnection = 3,
    CloseConnection = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = LocalError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::BatchRequest),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::ValidateConnection),
            4 => Ok(MessageType::CloseConnection),
            other => Err(LocalError::Protocol(format!("unknown message type {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub compression: u8,
    pub size: usize,
}

impl Header {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&MAGIC);
        buf.put_u8(PROTOCOL_MAJOR);
        buf.put_u8(PROTOCOL_MINOR);
        buf.put_u8(ENCODING_MAJOR);
        buf.put_u8(ENCODING_MINOR);
        buf.put_u8(self.message_type as u8);
        buf.put_u8(self.compression);
        buf.put_i32_le(self.size as i32);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(LocalError::Protocol(format!(
                "message header too short: {} bytes",
                data.len()
            )));
        }
        let magic = [data[0], data[1], data[2], data[3]];
        if magic != MAGIC {
            return Err(LocalError::BadMagic(magic));
        }
        if data[4] != PROTOCOL_MAJOR {
            return Err(LocalError::UnsupportedProtocol {
                major: data[4],
                minor: data[5],
            });
        }
        if data[6] != ENCODING_MAJOR {
            return Err(LocalError::Protocol(format!(
                "unsupported encoding {}.{}",
                data[6], data[7]
            )));
        }
        let message_type = MessageType::try_from(data[8])?;
        let compression = data[9];
        if compression == 2 {
            return Err(LocalError::FeatureNotSupported("compressed messages".into()));
        }
        let mut size_bytes = &data[SIZE_OFFSET..HEADER_SIZE];
        let size = size_bytes.get_i32_le();
        if size < HEADER_SIZE as i32 {
            return Err(LocalError::Protocol(format!("illegal message size {}", size)));
        }
        Ok(Self {
            message_type,
            compression,
            size: size as usize,
        })
    }
}

/// Build a complete message from a type and body
pub fn encode_message(message_type: MessageType, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    Header {
        message_type,
        compression: 0,
        size: HEADER_SIZE + body.len(),
    }
    .encode(&mut buf);
    buf.put_slice(body);
    buf.freeze()
}

pub fn validate_connection_message() -> Bytes {
    encode_message(MessageType::ValidateConnection, &[])
}

pub fn close_connection_message() -> Bytes {
    encode_message(MessageType::CloseConnection, &[])
}

/// Write an empty batch header (count 0, size = header) into `buf`
pub fn write_batch_header(buf: &mut BytesMut) {
    Header {
        message_type: MessageType::BatchRequest,
        compression: 0,
        size: BATCH_HEADER_SIZE,
    }
    .encode(buf);
    buf.put_i32_le(0);
}

/// Fix up the size and request count of a filled batch buffer
pub fn finish_batch(buf: &mut BytesMut, count: usize) {
    let size = buf.len() as i32;
    buf[SIZE_OFFSET..HEADER_SIZE].copy_from_slice(&size.to_le_bytes());
    buf[HEADER_SIZE..BATCH_HEADER_SIZE].copy_from_slice(&(count as i32).to_le_bytes());
}

pub fn write_size(buf: &mut BytesMut, size: usize) {
    if size < 255 {
        buf.put_u8(size as u8);
    } else {
        buf.put_u8(255);
        buf.put_i32_le(size as i32);
    }
}

pub fn read_size(buf: &mut Bytes) -> Result<usize> {
    let first = read_u8(buf)?;
    if first < 255 {
        return Ok(first as usize);
    }
    if buf.remaining() < 4 {
        return Err(out_of_bounds());
    }
    let size = buf.get_i32_le();
    if size < 0 {
        return Err(LocalError::Marshal(format!("negative size {}", size)));
    }
    Ok(size as usize)
}

pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_size(buf, s.len());
    buf.put_slice(s.as_bytes());
}

pub fn read_string(buf: &mut Bytes) -> Result<String> {
    let len = read_size(buf)?;
    if buf.remaining() < len {
        return Err(out_of_bounds());
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| LocalError::Marshal("string is not valid UTF-8".into()))
}

fn read_u8(buf: &mut Bytes) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(out_of_bounds());
    }
    Ok(buf.get_u8())
}

fn read_i32(buf: &mut Bytes) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(out_of_bounds());
    }
    Ok(buf.get_i32_le())
}

fn out_of_bounds() -> LocalError {
    LocalError::Marshal("unexpected end of buffer".into())
}

fn write_identity(buf: &mut BytesMut, id: &Identity) {
    write_string(buf, &id.name);
    write_string(buf, &id.category);
}

fn read_identity(buf: &mut Bytes) -> Result<Identity> {
    let name = read_string(buf)?;
    let category = read_string(buf)?;
    Ok(Identity { name, category })
}

/// Facets travel as a sequence of at most one string
fn write_facet(buf: &mut BytesMut, facet: &str) {
    if facet.is_empty() {
        write_size(buf, 0);
    } else {
        write_size(buf, 1);
        write_string(buf, facet);
    }
}

fn read_facet(buf: &mut Bytes) -> Result<String> {
    match read_size(buf)? {
        0 => Ok(String::new()),
        1 => read_string(buf),
        n => Err(LocalError::Marshal(format!("facet sequence of length {}", n))),
    }
}

/// Parameters are wrapped in an encapsulation: size (including the 6-byte
/// prefix), encoding version, payload
fn write_encapsulation(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_i32_le((payload.len() + 6) as i32);
    buf.put_u8(ENCODING_MAJOR);
    buf.put_u8(ENCODING_MINOR);
    buf.put_slice(payload);
}

fn read_encapsulation(buf: &mut Bytes) -> Result<Bytes> {
    let size = read_i32(buf)?;
    if size < 6 || buf.remaining() < size as usize - 4 {
        return Err(LocalError::Marshal(format!("invalid encapsulation size {}", size)));
    }
    let _major = buf.get_u8();
    let _minor = buf.get_u8();
    Ok(buf.split_to(size as usize - 6))
}

/// An incoming or outgoing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// 0 for oneway and batched requests
    pub request_id: i32,
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: BTreeMap<String, String>,
    pub params: Bytes,
}

impl Request {
    pub fn new(identity: Identity, operation: impl Into<String>, params: Bytes) -> Self {
        Self {
            request_id: 0,
            identity,
            facet: String::new(),
            operation: operation.into(),
            mode: OperationMode::Normal,
            context: BTreeMap::new(),
            params,
        }
    }

    pub fn is_oneway(&self) -> bool {
        self.request_id == 0
    }

    /// Encode the request body. Batched entries carry no request id.
    pub fn encode_body(&self, buf: &mut BytesMut, with_id: bool) {
        if with_id {
            buf.put_i32_le(self.request_id);
        }
        write_identity(buf, &self.identity);
        write_facet(buf, &self.facet);
        write_string(buf, &self.operation);
        buf.put_u8(self.mode.to_u8());
        write_size(buf, self.context.len());
        for (k, v) in &self.context {
            write_string(buf, k);
            write_string(buf, v);
        }
        write_encapsulation(buf, &self.params);
    }

    pub fn decode_body(buf: &mut Bytes, with_id: bool) -> Result<Self> {
        let request_id = if with_id { read_i32(buf)? } else { 0 };
        let identity = read_identity(buf)?;
        let facet = read_facet(buf)?;
        let operation = read_string(buf)?;
        let mode = OperationMode::from_u8(read_u8(buf)?)
            .ok_or_else(|| LocalError::Marshal("invalid operation mode".into()))?;
        let count = read_size(buf)?;
        let mut context = BTreeMap::new();
        for _ in 0..count {
            let k = read_string(buf)?;
            let v = read_string(buf)?;
            context.insert(k, v);
        }
        let params = read_encapsulation(buf)?;
        Ok(Self {
            request_id,
            identity,
            facet,
            operation,
            mode,
            context,
            params,
        })
    }

    /// Complete Request message
    pub fn to_message(&self) -> Bytes {
        let mut body = BytesMut::new();
        self.encode_body(&mut body, true);
        encode_message(MessageType::Request, &body)
    }
}

/// Decode the entries of a BatchRequest message body
pub fn decode_batch(mut body: Bytes) -> Result<Vec<Request>> {
    let count = read_i32(&mut body)?;
    if count < 0 {
        return Err(LocalError::Marshal(format!("negative batch count {}", count)));
    }
    let mut requests = Vec::with_capacity(count as usize);
    for _ in 0..count {
        requests.push(Request::decode_body(&mut body, false)?);
    }
    Ok(requests)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    FacetNotExist = 3,
    OperationNotExist = 4,
    UnknownLocalException = 5,
    UnknownUserException = 6,
    UnknownException = 7,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = LocalError;

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
            other => return Err(LocalError::Protocol(format!("unknown reply status {}", other))),
        })
    }
}

/// Encode the reply to a twoway request
pub fn encode_reply(request_id: i32, result: &std::result::Result<Bytes, RpcError>) -> Bytes {
    let mut body = BytesMut::new();
    body.put_i32_le(request_id);
    match result {
        Ok(payload) => {
            body.put_u8(ReplyStatus::Ok as u8);
            write_encapsulation(&mut body, payload);
        }
        Err(RpcError::User(user)) => {
            body.put_u8(ReplyStatus::UserException as u8);
            let mut inner = BytesMut::new();
            write_string(&mut inner, &user.type_id);
            inner.put_slice(&user.payload);
            write_encapsulation(&mut body, &inner);
        }
        Err(RpcError::Local(local)) => match local {
            LocalError::ObjectNotExist {
                identity,
                facet,
                operation,
            }
            | LocalError::FacetNotExist {
                identity,
                facet,
                operation,
            }
            | LocalError::OperationNotExist {
                identity,
                facet,
                operation,
            } => {
                let status = match local {
                    LocalError::ObjectNotExist { .. } => ReplyStatus::ObjectNotExist,
                    LocalError::FacetNotExist { .. } => ReplyStatus::FacetNotExist,
                    _ => ReplyStatus::OperationNotExist,
                };
                body.put_u8(status as u8);
                write_string(&mut body, identity);
                write_facet(&mut body, facet);
                write_string(&mut body, operation);
            }
            LocalError::UnknownUser(msg) => {
                body.put_u8(ReplyStatus::UnknownUserException as u8);
                write_string(&mut body, msg);
            }
            LocalError::Unknown(msg) => {
                body.put_u8(ReplyStatus::UnknownException as u8);
                write_string(&mut body, msg);
            }
            LocalError::UnknownLocal(msg) => {
                body.put_u8(ReplyStatus::UnknownLocalException as u8);
                write_string(&mut body, msg);
            }
            other => {
                body.put_u8(ReplyStatus::UnknownLocalException as u8);
                write_string(&mut body, &other.to_string());
            }
        },
    }
    encode_message(MessageType::Reply, &body)
}

/// Decode a Reply message body into its request id and outcome
pub fn decode_reply(mut body: Bytes) -> Result<(i32, std::result::Result<Bytes, RpcError>)> {
    let request_id = read_i32(&mut body)?;
    let status = ReplyStatus::try_from(read_u8(&mut body)?)?;
    let outcome = match status {
        ReplyStatus::Ok => Ok(read_encapsulation(&mut body)?),
        ReplyStatus::UserException => {
            let mut inner = read_encapsulation(&mut body)?;
            let type_id = read_string(&mut inner)?;
            Err(RpcError::User(UserError {
                type_id,
                payload: inner,
            }))
        }
        ReplyStatus::ObjectNotExist | ReplyStatus::FacetNotExist | ReplyStatus::OperationNotExist => {
            let identity = read_string(&mut body)?;
            let facet = read_facet(&mut body)?;
            let operation = read_string(&mut body)?;
            Err(RpcError::Local(match status {
                ReplyStatus::ObjectNotExist => LocalError::ObjectNotExist {
                    identity,
                    facet,
                    operation,
                },
                ReplyStatus::FacetNotExist => LocalError::FacetNotExist {
                    identity,
                    facet,
                    operation,
                },
                _ => LocalError::OperationNotExist {
                    identity,
                    facet,
                    operation,
                },
            }))
        }
        ReplyStatus::UnknownLocalException => {
            Err(LocalError::UnknownLocal(read_string(&mut body)?).into())
        }
        ReplyStatus::UnknownUserException => {
            Err(LocalError::UnknownUser(read_string(&mut body)?).into())
        }
        ReplyStatus::UnknownException => Err(LocalError::Unknown(read_string(&mut body)?).into()),
    };
    Ok((request_id, outcome))
}

/// Reads whole messages from a byte stream
///
/// Partially received messages stay buffered, so a `read_message` future can
/// be dropped and retried without losing data.
pub struct MessageReader<T> {
    inner: T,
    max_size: usize,
    read_buf: BytesMut,
}

impl<T> MessageReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_size: usize::MAX,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl<T: AsyncRead + Unpin> MessageReader<T> {
    /// Read the next message. `Ok(None)` on a clean end of stream.
    pub async fn read_message(&mut self) -> Result<Option<(Header, Bytes)>> {
        loop {
            if self.read_buf.len() >= HEADER_SIZE {
                let header = Header::decode(&self.read_buf)?;
                if header.size > self.max_size {
                    return Err(LocalError::MemoryLimit {
                        size: header.size,
                        max: self.max_size,
                    });
                }
                if self.read_buf.len() >= header.size {
                    let mut message = self.read_buf.split_to(header.size).freeze();
                    message.advance(HEADER_SIZE);
                    return Ok(Some((header, message)));
                }
            }

            if self.read_buf.capacity() - self.read_buf.len() < 4096 {
                self.read_buf.reserve(8192);
            }
            let n = self.inner.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(LocalError::ConnectionLost(format!(
                    "end of stream inside a message ({} bytes buffered)",
                    self.read_buf.len()
                )));
            }
        }
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &[u8]) -> Result<()> {
    writer.write_all(message).await?;
    writer.flush().await?;
    Ok(())
}
