//! FastCGI 1.0 record layer.
//!
//! Every record starts with an 8-byte header:
//!
//! ```text
//! version | type | request id (u16 BE) | content length (u16 BE) | padding length | reserved
//! ```
//!
//! followed by the content and the padding. Streams (PARAMS, STDIN, STDOUT,
//! STDERR) are sequences of records ended by an empty one.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{GatewayError, Result};

pub const VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;

/// Request id reserved for management records.
pub const MANAGEMENT_REQUEST_ID: u16 = 0;

/// BEGIN_REQUEST flag: keep the connection open after the request.
pub const FLAG_KEEP_CONN: u8 = 1;

pub const MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const MAX_REQS: &str = "FCGI_MAX_REQS";
pub const MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
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
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            11 => Self::UnknownType,
            _ => return None,
        })
    }
}

/// Role requested by BEGIN_REQUEST. Only `Responder` is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
}

impl Role {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Responder),
            2 => Some(Self::Authorizer),
            3 => Some(Self::Filter),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Responder => 1,
            Self::Authorizer => 2,
            Self::Filter => 3,
        }
    }
}

/// Protocol-level outcome carried by END_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMpxConn = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

impl ProtocolStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::RequestComplete),
            1 => Some(Self::CantMpxConn),
            2 => Some(Self::Overloaded),
            3 => Some(Self::UnknownRole),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl Header {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Self {
        Self {
            version: bytes[0],
            record_type: bytes[1],
            request_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            content_length: u16::from_be_bytes([bytes[4], bytes[5]]),
            padding_length: bytes[6],
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
            0,
        ]
    }
}

/// A decoded record, padding stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Raw type byte, kept so unknown types can be reported back.
    pub record_type: u8,
    pub request_id: u16,
    pub content: Vec<u8>,
}

impl Record {
    pub fn kind(&self) -> Option<RecordType> {
        RecordType::from_u8(self.record_type)
    }
}

/// Reads one record. Returns `Ok(None)` if the peer closed the connection
/// cleanly between records.
pub async fn read_record<R>(reader: &mut R) -> Result<Option<Record>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(GatewayError::protocol("connection closed inside a record header"));
        }
        filled += n;
    }

    let header = Header::parse(&header);
    if header.version != VERSION_1 {
        return Err(GatewayError::protocol(format!(
            "unsupported FastCGI version {}",
            header.version
        )));
    }

    let mut content = vec![0u8; header.content_length as usize];
    reader.read_exact(&mut content).await?;

    let mut padding = [0u8; u8::MAX as usize];
    reader
        .read_exact(&mut padding[..header.padding_length as usize])
        .await?;

    Ok(Some(Record {
        record_type: header.record_type,
        request_id: header.request_id,
        content,
    }))
}

/// Appends one record, padding the content to a multiple of eight bytes.
///
/// `content` must fit in a single record.
pub fn write_record(out: &mut Vec<u8>, record_type: RecordType, request_id: u16, content: &[u8]) {
    write_raw_record(out, record_type as u8, request_id, content);
}

fn write_raw_record(out: &mut Vec<u8>, record_type: u8, request_id: u16, content: &[u8]) {
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    let padding = (8 - content.len() % 8) % 8;

    let header = Header {
        version: VERSION_1,
        record_type,
        request_id,
        content_length: content.len() as u16,
        padding_length: padding as u8,
    };
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(content);
    out.resize(out.len() + padding, 0);
}

/// Appends `data` as a stream: as many full records as needed, then the
/// empty record that closes the stream.
pub fn write_stream(out: &mut Vec<u8>, record_type: RecordType, request_id: u16, data: &[u8]) {
    for chunk in data.chunks(MAX_CONTENT_LEN) {
        write_record(out, record_type, request_id, chunk);
    }
    write_record(out, record_type, request_id, &[]);
}

/// Body of a BEGIN_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequest {
    pub fn new(role: Role, keep_conn: bool) -> Self {
        Self {
            role: role.as_u16(),
            flags: if keep_conn { FLAG_KEEP_CONN } else { 0 },
        }
    }

    pub fn parse(content: &[u8]) -> Result<Self> {
        if content.len() != 8 {
            return Err(GatewayError::protocol(format!(
                "BEGIN_REQUEST body is {} bytes, expected 8",
                content.len()
            )));
        }
        Ok(Self {
            role: u16::from_be_bytes([content[0], content[1]]),
            flags: content[2],
        })
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let role = self.role.to_be_bytes();
        [role[0], role[1], self.flags, 0, 0, 0, 0, 0]
    }

    pub fn role(&self) -> Option<Role> {
        Role::from_u16(self.role)
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & FLAG_KEEP_CONN != 0
    }
}

/// Body of an END_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

impl EndRequest {
    pub fn new(app_status: u32, protocol_status: ProtocolStatus) -> Self {
        Self {
            app_status,
            protocol_status,
        }
    }

    pub fn parse(content: &[u8]) -> Result<Self> {
        if content.len() != 8 {
            return Err(GatewayError::protocol(format!(
                "END_REQUEST body is {} bytes, expected 8",
                content.len()
            )));
        }
        let protocol_status = ProtocolStatus::from_u8(content[4]).ok_or_else(|| {
            GatewayError::protocol(format!("unknown protocol status {}", content[4]))
        })?;
        Ok(Self {
            app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
            protocol_status,
        })
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let status = self.app_status.to_be_bytes();
        [
            status[0],
            status[1],
            status[2],
            status[3],
            self.protocol_status as u8,
            0,
            0,
            0,
        ]
    }
}

/// Appends an UNKNOWN_TYPE management record for `record_type`.
pub fn write_unknown_type(out: &mut Vec<u8>, record_type: u8) {
    write_raw_record(
        out,
        RecordType::UnknownType as u8,
        MANAGEMENT_REQUEST_ID,
        &[record_type, 0, 0, 0, 0, 0, 0, 0],
    );
}

/// Decodes a name-value pair stream (PARAMS, GET_VALUES).
///
/// Each length is one byte when below 128, otherwise four bytes big-endian
/// with the top bit set. Names and values that are not UTF-8 are decoded lossily.
pub fn decode_pairs(data: &[u8]) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let name_len = read_length(data, &mut pos)?;
        let value_len = read_length(data, &mut pos)?;

        let end = pos
            .checked_add(name_len)
            .and_then(|n| n.checked_add(value_len))
            .filter(|&end| end <= data.len())
            .ok_or_else(|| GatewayError::protocol("name-value pair overruns its record"))?;

        let name = String::from_utf8_lossy(&data[pos..pos + name_len]).into_owned();
        let value = String::from_utf8_lossy(&data[pos + name_len..end]).into_owned();
        pairs.push((name, value));
        pos = end;
    }

    Ok(pairs)
}

/// Appends name-value pairs in FastCGI encoding.
pub fn encode_pairs<'a, I>(pairs: I, out: &mut Vec<u8>)
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    for (name, value) in pairs {
        write_length(name.len(), out);
        write_length(value.len(), out);
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(value.as_bytes());
    }
}

fn read_length(data: &[u8], pos: &mut usize) -> Result<usize> {
    let first = *data
        .get(*pos)
        .ok_or_else(|| GatewayError::protocol("truncated name-value length"))?;

    if first & 0x80 == 0 {
        *pos += 1;
        return Ok(first as usize);
    }

    let bytes = data
        .get(*pos..*pos + 4)
        .ok_or_else(|| GatewayError::protocol("truncated name-value length"))?;
    *pos += 4;
    Ok(u32::from_be_bytes([bytes[0] & 0x7f, bytes[1], bytes[2], bytes[3]]) as usize)
}

fn write_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        out.extend_from_slice(&(len as u32 | 0x8000_0000).to_be_bytes());
    }
}
