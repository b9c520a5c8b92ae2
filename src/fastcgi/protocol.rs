//! FastCGI wire codec.
//!
//! # Responsibilities
//! - Encode and decode the fixed 8-byte record header
//! - Encode and decode name-value pairs (1- or 4-byte length prefixes)
//! - Encode BEGIN_REQUEST bodies, decode END_REQUEST bodies
//!
//! # Record Layout
//! ```text
//! version:u8=1 | type:u8 | requestId:u16BE | contentLength:u16BE | paddingLength:u8 | reserved:u8
//! content[contentLength] | padding[paddingLength]
//! ```
//!
//! Every record written here is padded so its total size is a multiple of 8.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::fastcgi::error::{FcgiError, FcgiResult};

/// Number of bytes in a record header.
pub const HEADER_LEN: usize = 8;

/// Protocol version carried by every header.
pub const VERSION_1: u8 = 1;

/// Request id reserved for management records.
pub const NULL_REQUEST_ID: u16 = 0;

/// Hard limit of the 16-bit content length field.
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;

/// Practical per-record content ceiling. 65530 may work, but conservative
/// responders choke on anything close to the hard limit.
pub const MAX_WRITE: usize = 65500;

/// Chunk size used when streaming a body into STDIN records.
pub const STDIN_CHUNK: usize = 8 * 1024;

/// Flag bit in the begin-request body asking the responder to keep the connection.
pub const KEEP_CONN: u8 = 1;

pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

/// Record types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    /// Map a raw type byte; `None` for values outside the protocol.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            _ => return None,
        })
    }
}

/// Roles a begin-request can ask for. Only `Responder` is ever sent.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

/// Protocol status of an END_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    RequestComplete,
    CantMpxConn,
    Overloaded,
    UnknownRole,
    Other(u8),
}

impl From<u8> for ProtocolStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => ProtocolStatus::RequestComplete,
            1 => ProtocolStatus::CantMpxConn,
            2 => ProtocolStatus::Overloaded,
            3 => ProtocolStatus::UnknownRole,
            other => ProtocolStatus::Other(other),
        }
    }
}

impl From<ProtocolStatus> for u8 {
    fn from(status: ProtocolStatus) -> Self {
        match status {
            ProtocolStatus::RequestComplete => 0,
            ProtocolStatus::CantMpxConn => 1,
            ProtocolStatus::Overloaded => 2,
            ProtocolStatus::UnknownRole => 3,
            ProtocolStatus::Other(other) => other,
        }
    }
}

impl fmt::Display for ProtocolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolStatus::RequestComplete => write!(f, "request complete"),
            ProtocolStatus::CantMpxConn => write!(f, "cannot multiplex connection"),
            ProtocolStatus::Overloaded => write!(f, "overloaded"),
            ProtocolStatus::UnknownRole => write!(f, "unknown role"),
            ProtocolStatus::Other(code) => write!(f, "unknown protocol status {code}"),
        }
    }
}

/// Fixed-size record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
    pub reserved: u8,
}

impl Header {
    /// Header for `content_length` bytes of content, padded to an 8-byte boundary.
    pub fn new(record_type: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: VERSION_1,
            record_type: record_type as u8,
            request_id,
            content_length,
            padding_length: padding_for(content_length as usize),
            reserved: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let id = self.request_id.to_be_bytes();
        let len = self.content_length.to_be_bytes();
        [
            self.version,
            self.record_type,
            id[0],
            id[1],
            len[0],
            len[1],
            self.padding_length,
            self.reserved,
        ]
    }

    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
            reserved: buf[7],
        }
    }

    /// Decoded record type, `None` if the byte is outside the protocol.
    pub fn kind(&self) -> Option<RecordType> {
        RecordType::from_u8(self.record_type)
    }

    /// Bytes following the header that belong to this record.
    pub fn body_len(&self) -> usize {
        self.content_length as usize + self.padding_length as usize
    }
}

/// Zero bytes needed after `len` content bytes: `(-len) mod 8`.
pub fn padding_for(len: usize) -> u8 {
    ((8 - len % 8) % 8) as u8
}

/// Append one complete record (header, content, zero padding) to `buf`.
pub fn put_record(
    buf: &mut BytesMut,
    record_type: RecordType,
    request_id: u16,
    content: &[u8],
) -> FcgiResult<()> {
    if content.len() > MAX_CONTENT_LEN {
        return Err(FcgiError::RecordTooLarge(content.len()));
    }
    let header = Header::new(record_type, request_id, content.len() as u16);
    buf.reserve(HEADER_LEN + header.body_len());
    buf.put_slice(&header.to_bytes());
    buf.put_slice(content);
    buf.put_bytes(0, header.padding_length as usize);
    Ok(())
}

/// Encode one complete record.
pub fn encode_record(record_type: RecordType, request_id: u16, content: &[u8]) -> FcgiResult<Bytes> {
    let mut buf = BytesMut::new();
    put_record(&mut buf, record_type, request_id, content)?;
    Ok(buf.freeze())
}

/// Read exactly one header. A short read surfaces as `LostConnection`.
pub async fn read_header<R>(reader: &mut R) -> FcgiResult<Header>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut buf).await?;
    Ok(Header::from_bytes(&buf))
}

/// Read the content and padding that follow `header` into `buf`, keeping
/// only the content. The whole span is consumed even if the caller ignores it.
pub async fn read_body<R>(reader: &mut R, header: &Header, buf: &mut Vec<u8>) -> FcgiResult<()>
where
    R: AsyncRead + Unpin,
{
    buf.clear();
    buf.resize(header.body_len(), 0);
    reader.read_exact(&mut buf[..]).await?;
    buf.truncate(header.content_length as usize);
    Ok(())
}

/// Bytes the length prefix of a `len`-byte name or value takes.
pub fn size_len(len: usize) -> usize {
    if len > 127 {
        4
    } else {
        1
    }
}

/// Append a name or value length: one byte up to 127, otherwise four
/// big-endian bytes with bit 31 set.
pub fn put_size(buf: &mut BytesMut, size: u32) {
    if size > 127 {
        buf.put_u32(size | 1 << 31);
    } else {
        buf.put_u8(size as u8);
    }
}

/// Encoded size of one name-value pair.
pub fn pair_len(name: &[u8], value: &[u8]) -> usize {
    size_len(name.len()) + size_len(value.len()) + name.len() + value.len()
}

/// Append one name-value pair.
pub fn put_name_value(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    put_size(buf, name.len() as u32);
    put_size(buf, value.len() as u32);
    buf.put_slice(name);
    buf.put_slice(value);
}

/// Encode one name-value pair.
pub fn encode_name_value(name: &[u8], value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(pair_len(name, value));
    put_name_value(&mut buf, name, value);
    buf.freeze()
}

/// Cut `value` so that the pair fits in a single params record.
///
/// A pair is never split across records; an oversized value loses its tail
/// instead. Names that alone overflow a record are rejected.
pub fn fit_value<'a>(name: &[u8], value: &'a [u8]) -> FcgiResult<&'a [u8]> {
    // 8 = worst-case prefix bytes for the two lengths
    if 8 + name.len() + value.len() <= MAX_WRITE {
        return Ok(value);
    }
    let room = MAX_WRITE
        .checked_sub(8 + name.len())
        .ok_or(FcgiError::RecordTooLarge(8 + name.len()))?;
    Ok(&value[..room])
}

/// Decode a run of name-value pairs, as carried by PARAMS or GET_VALUES_RESULT content.
pub fn decode_name_values(mut data: &[u8]) -> FcgiResult<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    while !data.is_empty() {
        let name_len = take_size(&mut data)?;
        let value_len = take_size(&mut data)?;
        if data.len() < name_len + value_len {
            return Err(FcgiError::MalformedResponse(
                "name-value pair overruns record content".into(),
            ));
        }
        let name = String::from_utf8_lossy(&data[..name_len]).into_owned();
        let value = String::from_utf8_lossy(&data[name_len..name_len + value_len]).into_owned();
        data = &data[name_len + value_len..];
        pairs.push((name, value));
    }
    Ok(pairs)
}

fn take_size(data: &mut &[u8]) -> FcgiResult<usize> {
    let first = *data
        .first()
        .ok_or_else(|| FcgiError::MalformedResponse("truncated name-value length".into()))?;
    if first & 0x80 == 0 {
        *data = &data[1..];
        return Ok(first as usize);
    }
    if data.len() < 4 {
        return Err(FcgiError::MalformedResponse("truncated name-value length".into()));
    }
    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
    *data = &data[4..];
    Ok(size as usize)
}

/// Body of a BEGIN_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    pub role: Role,
    pub flags: u8,
}

impl BeginRequestBody {
    pub fn responder(keep_conn: bool) -> Self {
        Self {
            role: Role::Responder,
            flags: if keep_conn { KEEP_CONN } else { 0 },
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let role = (self.role as u16).to_be_bytes();
        [role[0], role[1], self.flags, 0, 0, 0, 0, 0]
    }
}

/// Body of an END_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

impl EndRequestBody {
    pub fn to_bytes(&self) -> [u8; 8] {
        let status = self.app_status.to_be_bytes();
        [
            status[0],
            status[1],
            status[2],
            status[3],
            self.protocol_status.into(),
            0,
            0,
            0,
        ]
    }

    pub fn from_bytes(content: &[u8]) -> FcgiResult<Self> {
        if content.len() < 8 {
            return Err(FcgiError::MalformedResponse(format!(
                "end-request body of {} bytes",
                content.len()
            )));
        }
        Ok(Self {
            app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
            protocol_status: ProtocolStatus::from(content[4]),
        })
    }
}
