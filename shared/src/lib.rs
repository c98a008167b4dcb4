//! Wire protocol shared by the frontend server and its clients.
//!
//! Two layers live here:
//! - the request frame (`id:u32 BE | route_len:u8 | route | json body`) and the
//!   outbound envelopes the server answers with
//! - the datagram package framing (`type:u8 | length:u24 BE | body`) used by the
//!   UDP connector, together with the bincode-encoded control bodies exchanged
//!   during the handshake

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const PKG_ID_BYTES: usize = 4;
pub const PKG_ROUTE_LENGTH_BYTES: usize = 1;
pub const PKG_HEAD_BYTES: usize = PKG_ID_BYTES + PKG_ROUTE_LENGTH_BYTES;
pub const MAX_ROUTE_LENGTH: usize = u8::MAX as usize;

pub const PACKAGE_HEAD_BYTES: usize = 4;
pub const MAX_PACKAGE_BODY: usize = 0x00FF_FFFF;

/// Route used for the notice flushed to a client right before it is dropped.
pub const KICK_ROUTE: &str = "onKick";

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {len} bytes is shorter than the {PKG_HEAD_BYTES} byte header")]
    FrameTooShort { len: usize },
    #[error("route length {route_len} overruns the {available} bytes left in the frame")]
    RouteOverflow { route_len: usize, available: usize },
    #[error("route of {0} bytes does not fit the one byte length field")]
    RouteTooLong(usize),
    #[error("route is not valid utf-8: {0}")]
    InvalidRoute(#[from] std::str::Utf8Error),
    #[error("invalid message body: {0}")]
    InvalidBody(#[from] serde_json::Error),
    #[error("package of {len} bytes is truncated")]
    PackageTruncated { len: usize },
    #[error("unknown package type {0}")]
    UnknownPackageType(u8),
    #[error("package body of {0} bytes exceeds the 24 bit length field")]
    PackageTooLarge(usize),
    #[error("invalid control body: {0}")]
    InvalidControl(#[from] bincode::Error),
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u32,
    pub route: String,
    pub body: Value,
}

impl Message {
    pub fn new(id: u32, route: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            route: route.into(),
            body,
        }
    }

    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        write_frame(self.id, &self.route, &self.body)
    }
}

/// Decodes one request frame.
///
/// Frames shorter than the five byte header, or whose route length runs past
/// the end of the frame, are rejected. The remainder after the route is parsed
/// as JSON.
pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    if frame.len() < PKG_HEAD_BYTES {
        return Err(ProtocolError::FrameTooShort { len: frame.len() });
    }

    let id = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let route_len = frame[PKG_ID_BYTES] as usize;
    let available = frame.len() - PKG_HEAD_BYTES;
    if route_len > available {
        return Err(ProtocolError::RouteOverflow {
            route_len,
            available,
        });
    }

    let route_end = PKG_HEAD_BYTES + route_len;
    let route = std::str::from_utf8(&frame[PKG_HEAD_BYTES..route_end])?.to_string();
    let body = serde_json::from_slice(&frame[route_end..])?;

    Ok(Message { id, route, body })
}

fn write_frame(id: u32, route: &str, body: &Value) -> Result<Vec<u8>, ProtocolError> {
    if route.len() > MAX_ROUTE_LENGTH {
        return Err(ProtocolError::RouteTooLong(route.len()));
    }

    let payload = serde_json::to_vec(body)?;
    let mut frame = Vec::with_capacity(PKG_HEAD_BYTES + route.len() + payload.len());
    frame.extend_from_slice(&id.to_be_bytes());
    frame.push(route.len() as u8);
    frame.extend_from_slice(route.as_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Outbound message from server to client.
///
/// Responses drop the route since the client matches them by request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Response { id: u32, body: Value },
    Push { route: String, body: Value },
}

/// Builds a response envelope when a request id is present, a push otherwise.
///
/// Request id `0` is never issued by clients and is treated as absent.
pub fn encode(request_id: Option<u32>, route: &str, body: Value) -> Envelope {
    match request_id {
        Some(id) if id != 0 => Envelope::Response { id, body },
        _ => Envelope::Push {
            route: route.to_string(),
            body,
        },
    }
}

impl Envelope {
    pub fn kick(reason: &str) -> Self {
        Envelope::Push {
            route: KICK_ROUTE.to_string(),
            body: serde_json::json!({ "reason": reason }),
        }
    }

    pub fn body(&self) -> &Value {
        match self {
            Envelope::Response { body, .. } | Envelope::Push { body, .. } => body,
        }
    }

    /// Binary layout used on datagram transports: responses carry their id
    /// and an empty route, pushes carry id 0 and their route.
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Envelope::Response { id, body } => write_frame(*id, "", body),
            Envelope::Push { route, body } => write_frame(0, route, body),
        }
    }

    /// JSON text used on stream transports.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Encodes a batch as one JSON array, each element structured-encoded.
pub fn encode_batch(envelopes: &[Envelope]) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(envelopes)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PackageType {
    Handshake = 1,
    HandshakeAck = 2,
    Heartbeat = 3,
    Data = 4,
    Kick = 5,
}

impl TryFrom<u8> for PackageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PackageType::Handshake),
            2 => Ok(PackageType::HandshakeAck),
            3 => Ok(PackageType::Heartbeat),
            4 => Ok(PackageType::Data),
            5 => Ok(PackageType::Kick),
            other => Err(ProtocolError::UnknownPackageType(other)),
        }
    }
}

/// One datagram package. Several may be concatenated in a single datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub kind: PackageType,
    pub body: Vec<u8>,
}

impl Package {
    pub fn new(kind: PackageType, body: Vec<u8>) -> Self {
        Self { kind, body }
    }

    pub fn empty(kind: PackageType) -> Self {
        Self::new(kind, Vec::new())
    }

    pub fn control(kind: PackageType, control: &Control) -> Result<Self, ProtocolError> {
        Ok(Self::new(kind, bincode::serialize(control)?))
    }

    pub fn to_control(&self) -> Result<Control, ProtocolError> {
        Ok(bincode::deserialize(&self.body)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.body.len();
        if len > MAX_PACKAGE_BODY {
            return Err(ProtocolError::PackageTooLarge(len));
        }

        let mut buf = Vec::with_capacity(PACKAGE_HEAD_BYTES + len);
        buf.push(self.kind as u8);
        buf.push((len >> 16) as u8);
        buf.push((len >> 8) as u8);
        buf.push(len as u8);
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    pub fn decode_all(buf: &[u8]) -> Result<Vec<Package>, ProtocolError> {
        let mut packages = Vec::new();
        let mut offset = 0;

        while offset < buf.len() {
            if buf.len() - offset < PACKAGE_HEAD_BYTES {
                return Err(ProtocolError::PackageTruncated { len: buf.len() });
            }

            let kind = PackageType::try_from(buf[offset])?;
            let len = ((buf[offset + 1] as usize) << 16)
                | ((buf[offset + 2] as usize) << 8)
                | buf[offset + 3] as usize;
            let start = offset + PACKAGE_HEAD_BYTES;
            let end = start + len;
            if end > buf.len() {
                return Err(ProtocolError::PackageTruncated { len: buf.len() });
            }

            packages.push(Package::new(kind, buf[start..end].to_vec()));
            offset = end;
        }

        Ok(packages)
    }
}

/// Handshake and termination bodies carried by non-data packages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Control {
    Hello {
        client_version: u32,
    },
    Welcome {
        session_id: u32,
        heartbeat_interval_ms: u64,
    },
    Rejected {
        reason: String,
    },
    Kick {
        reason: String,
    },
}
