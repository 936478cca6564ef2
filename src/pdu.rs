//! The PDUs of the proxy protocol.
//!
//! This module contains the wire representation of the protocol spoken
//! between the server and the proxy embedded in a router. Every PDU starts
//! with an eight byte header carrying the type, two reserved slots that
//! individual PDU types use for small scalar fields, and the overall
//! length. All multi-byte integers are big-endian.
//!
//! [`Pdu`] is the decoded representation; [`Pdu::encode`] and
//! [`Pdu::decode`] convert to and from frames. The receive loop reads the
//! header through [`Header`] first to learn how much more to expect.

use std::fmt;
use std::net::IpAddr;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::payload::{
    AddressPrefix, AsPathKind, BgpsecData, PathDirection, ResultSource,
    UpdateId, ValidationState, VerifyFlags,
};


/// The protocol version this server speaks.
pub const PROTOCOL_VERSION: u16 = 2;

/// The length of the basic header in bytes.
pub const HEADER_LEN: usize = 8;

/// The largest frame the server accepts.
///
/// Anything longer is treated as a framing error and ends the connection.
pub const MAX_PDU_LEN: u32 = 1 << 20;

/// The request token value that means "no token".
pub const NO_REQUEST_TOKEN: u32 = 0;

//--- PDU type codes.

pub const TYPE_HELLO: u8 = 0;
pub const TYPE_HELLO_RESPONSE: u8 = 1;
pub const TYPE_GOODBYE: u8 = 2;
pub const TYPE_VERIFY_V4: u8 = 3;
pub const TYPE_VERIFY_V6: u8 = 4;
pub const TYPE_SIGN_REQUEST: u8 = 5;
pub const TYPE_VERIFY_NOTIFICATION: u8 = 6;
pub const TYPE_SIGNATURE_NOTIFICATION: u8 = 7;
pub const TYPE_DELETE_UPDATE: u8 = 8;
pub const TYPE_PEER_CHANGE: u8 = 9;
pub const TYPE_SYNC_REQUEST: u8 = 10;
pub const TYPE_ERROR: u8 = 11;

/// The fixed part of the BGPsec request blob in bytes.
const BGPSEC_BLOB_HEAD: usize = 16;


//------------ ErrorCode -----------------------------------------------------

/// The error codes of the error PDU.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    WrongVersion,
    DuplicateProxyId,
    InvalidPacket,
    InternalError,
    AlgoNotSupported,
    UpdateNotFound,
}

impl ErrorCode {
    pub fn into_wire(self) -> u16 {
        match self {
            ErrorCode::WrongVersion => 0,
            ErrorCode::DuplicateProxyId => 1,
            ErrorCode::InvalidPacket => 2,
            ErrorCode::InternalError => 3,
            ErrorCode::AlgoNotSupported => 4,
            ErrorCode::UpdateNotFound => 5,
        }
    }

    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            0 => Some(ErrorCode::WrongVersion),
            1 => Some(ErrorCode::DuplicateProxyId),
            2 => Some(ErrorCode::InvalidPacket),
            3 => Some(ErrorCode::InternalError),
            4 => Some(ErrorCode::AlgoNotSupported),
            5 => Some(ErrorCode::UpdateNotFound),
            _ => None,
        }
    }
}


//------------ Header --------------------------------------------------------

/// The basic header every PDU starts with.
#[derive(Clone, Copy, Debug)]
pub struct Header {
    pub pdu_type: u8,
    pub reserved1: u16,
    pub reserved2: u8,
    pub length: u32,
}

impl Header {
    /// Parses a header from the first eight bytes of a frame.
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated)
        }
        let mut buf = buf;
        let header = Header {
            pdu_type: buf.get_u8(),
            reserved1: buf.get_u16(),
            reserved2: buf.get_u8(),
            length: buf.get_u32(),
        };
        if header.length < HEADER_LEN as u32
            || header.length > MAX_PDU_LEN
        {
            return Err(DecodeError::BadLength(header.length))
        }
        Ok(header)
    }

    fn write(self, buf: &mut BytesMut) {
        buf.put_u8(self.pdu_type);
        buf.put_u16(self.reserved1);
        buf.put_u8(self.reserved2);
        buf.put_u32(self.length);
    }
}


//------------ VerifyRequest -------------------------------------------------

/// A verify request for either address family.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerifyRequest {
    pub flags: VerifyFlags,
    pub roa_source: ResultSource,
    pub bgpsec_source: ResultSource,
    pub roa_default: ValidationState,
    pub bgpsec_default: ValidationState,
    pub aspa_default: ValidationState,
    pub request_token: u32,
    pub prefix: AddressPrefix,
    pub origin: u32,
    pub kind: AsPathKind,
    pub direction: PathDirection,
    pub bgpsec: BgpsecData,
}


//------------ Pdu -----------------------------------------------------------

/// A decoded PDU of the proxy protocol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Pdu {
    Hello {
        version: u16,
        proxy_id: u32,
        asn: u32,
        peers: Vec<u32>,
    },
    HelloResponse {
        version: u16,
        proxy_id: u32,
    },
    Goodbye {
        keep_window: u16,
    },
    VerifyRequest(Box<VerifyRequest>),
    SignRequest {
        algorithm: u16,
        block_type: u8,
        update_id: UpdateId,
        prepend_counter: u32,
        peer_as: u32,
    },
    VerifyNotification {
        result_type: VerifyFlags,
        roa: ValidationState,
        bgpsec: ValidationState,
        aspa: ValidationState,
        request_token: u32,
        update_id: UpdateId,
    },
    SignatureNotification {
        update_id: UpdateId,
        signature: Vec<u8>,
    },
    DeleteUpdate {
        keep_window: u16,
        update_id: UpdateId,
    },
    PeerChange {
        change_type: u8,
        peer_as: u32,
    },
    SyncRequest,
    Error {
        code: ErrorCode,
    },
}

impl Pdu {
    /// Returns the wire type code of the PDU.
    pub fn type_code(&self) -> u8 {
        match *self {
            Pdu::Hello { .. } => TYPE_HELLO,
            Pdu::HelloResponse { .. } => TYPE_HELLO_RESPONSE,
            Pdu::Goodbye { .. } => TYPE_GOODBYE,
            Pdu::VerifyRequest(ref request) => {
                if request.prefix.is_v4() { TYPE_VERIFY_V4 }
                else { TYPE_VERIFY_V6 }
            }
            Pdu::SignRequest { .. } => TYPE_SIGN_REQUEST,
            Pdu::VerifyNotification { .. } => TYPE_VERIFY_NOTIFICATION,
            Pdu::SignatureNotification { .. } => {
                TYPE_SIGNATURE_NOTIFICATION
            }
            Pdu::DeleteUpdate { .. } => TYPE_DELETE_UPDATE,
            Pdu::PeerChange { .. } => TYPE_PEER_CHANGE,
            Pdu::SyncRequest => TYPE_SYNC_REQUEST,
            Pdu::Error { .. } => TYPE_ERROR,
        }
    }

    /// Encodes the PDU into a frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match *self {
            Pdu::Hello { version, proxy_id, asn, ref peers } => {
                Header {
                    pdu_type: TYPE_HELLO,
                    reserved1: version,
                    reserved2: 0,
                    length: (20 + 4 * peers.len()) as u32,
                }.write(&mut buf);
                buf.put_u32(proxy_id);
                buf.put_u32(asn);
                buf.put_u32(peers.len() as u32);
                for peer in peers {
                    buf.put_u32(*peer);
                }
            }
            Pdu::HelloResponse { version, proxy_id } => {
                Header {
                    pdu_type: TYPE_HELLO_RESPONSE,
                    reserved1: version,
                    reserved2: 0,
                    length: 12,
                }.write(&mut buf);
                buf.put_u32(proxy_id);
            }
            Pdu::Goodbye { keep_window } => {
                Header {
                    pdu_type: TYPE_GOODBYE,
                    reserved1: keep_window,
                    reserved2: 0,
                    length: 8,
                }.write(&mut buf);
            }
            Pdu::VerifyRequest(ref request) => {
                self.encode_verify_request(request, &mut buf);
            }
            Pdu::SignRequest {
                algorithm, block_type, update_id, prepend_counter, peer_as
            } => {
                Header {
                    pdu_type: TYPE_SIGN_REQUEST,
                    reserved1: algorithm,
                    reserved2: block_type,
                    length: 20,
                }.write(&mut buf);
                buf.put_u32(update_id.into());
                buf.put_u32(prepend_counter);
                buf.put_u32(peer_as);
            }
            Pdu::VerifyNotification {
                result_type, roa, bgpsec, aspa, request_token, update_id
            } => {
                Header {
                    pdu_type: TYPE_VERIFY_NOTIFICATION,
                    reserved1: u16::from(result_type.into_wire()) << 8
                        | u16::from(roa.into_wire()),
                    reserved2: bgpsec.into_wire(),
                    length: 20,
                }.write(&mut buf);
                buf.put_u8(aspa.into_wire());
                buf.put_slice(&[0, 0, 0]);
                buf.put_u32(request_token);
                buf.put_u32(update_id.into());
            }
            Pdu::SignatureNotification { update_id, ref signature } => {
                Header {
                    pdu_type: TYPE_SIGNATURE_NOTIFICATION,
                    reserved1: 0,
                    reserved2: 0,
                    length: (16 + signature.len()) as u32,
                }.write(&mut buf);
                buf.put_u32(update_id.into());
                buf.put_u32(signature.len() as u32);
                buf.put_slice(signature);
            }
            Pdu::DeleteUpdate { keep_window, update_id } => {
                Header {
                    pdu_type: TYPE_DELETE_UPDATE,
                    reserved1: keep_window,
                    reserved2: 0,
                    length: 12,
                }.write(&mut buf);
                buf.put_u32(update_id.into());
            }
            Pdu::PeerChange { change_type, peer_as } => {
                Header {
                    pdu_type: TYPE_PEER_CHANGE,
                    reserved1: 0,
                    reserved2: change_type,
                    length: 12,
                }.write(&mut buf);
                buf.put_u32(peer_as);
            }
            Pdu::SyncRequest => {
                Header {
                    pdu_type: TYPE_SYNC_REQUEST,
                    reserved1: 0,
                    reserved2: 0,
                    length: 8,
                }.write(&mut buf);
            }
            Pdu::Error { code } => {
                Header {
                    pdu_type: TYPE_ERROR,
                    reserved1: code.into_wire(),
                    reserved2: 0,
                    length: 8,
                }.write(&mut buf);
            }
        }
        buf.freeze()
    }

    fn encode_verify_request(
        &self, request: &VerifyRequest, buf: &mut BytesMut
    ) {
        let blob_len = if request.bgpsec.is_empty() {
            0
        }
        else {
            BGPSEC_BLOB_HEAD
                + 4 * request.bgpsec.as_path.len()
                + request.bgpsec.path_attr.len()
        };
        let prefix_octets = if request.prefix.is_v4() { 4 } else { 16 };
        Header {
            pdu_type: self.type_code(),
            reserved1: u16::from(request.flags.into_wire()) << 8
                | u16::from(request.roa_source.into_wire()),
            reserved2: request.bgpsec_source.into_wire(),
            length: (24 + prefix_octets + blob_len) as u32,
        }.write(buf);
        buf.put_u8(request.roa_default.into_wire());
        buf.put_u8(request.bgpsec_default.into_wire());
        buf.put_u8(request.aspa_default.into_wire());
        buf.put_u8(request.prefix.address_length());
        buf.put_u32(request.request_token);
        match request.prefix.address() {
            IpAddr::V4(addr) => buf.put_slice(&addr.octets()),
            IpAddr::V6(addr) => buf.put_slice(&addr.octets()),
        }
        buf.put_u32(request.origin);
        buf.put_u32(blob_len as u32);
        if blob_len > 0 {
            buf.put_u16(request.bgpsec.as_path.len() as u16);
            buf.put_u16(request.bgpsec.path_attr.len() as u16);
            buf.put_u16(request.bgpsec.afi);
            buf.put_u8(request.bgpsec.safi);
            buf.put_u8(request.kind.into_wire());
            buf.put_u8(request.direction.into_wire());
            buf.put_slice(&[0, 0, 0]);
            buf.put_u32(request.bgpsec.local_as);
            for asn in &request.bgpsec.as_path {
                buf.put_u32(*asn);
            }
            buf.put_slice(&request.bgpsec.path_attr);
        }
    }

    /// Decodes a complete frame into a PDU.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let header = Header::parse(frame)?;
        if header.length as usize != frame.len() {
            return Err(DecodeError::BadLength(header.length))
        }
        let mut body = &frame[HEADER_LEN..];
        match header.pdu_type {
            TYPE_HELLO => {
                if body.remaining() < 12 {
                    return Err(DecodeError::Truncated)
                }
                let proxy_id = body.get_u32();
                let asn = body.get_u32();
                let count = body.get_u32() as usize;
                if body.remaining() != count * 4 {
                    return Err(DecodeError::BadLength(header.length))
                }
                let mut peers = Vec::with_capacity(count);
                for _ in 0..count {
                    peers.push(body.get_u32());
                }
                Ok(Pdu::Hello {
                    version: header.reserved1, proxy_id, asn, peers
                })
            }
            TYPE_HELLO_RESPONSE => {
                if body.remaining() != 4 {
                    return Err(DecodeError::BadLength(header.length))
                }
                Ok(Pdu::HelloResponse {
                    version: header.reserved1,
                    proxy_id: body.get_u32(),
                })
            }
            TYPE_GOODBYE => {
                if body.has_remaining() {
                    return Err(DecodeError::BadLength(header.length))
                }
                Ok(Pdu::Goodbye { keep_window: header.reserved1 })
            }
            TYPE_VERIFY_V4 | TYPE_VERIFY_V6 => {
                Self::decode_verify_request(header, body)
            }
            TYPE_SIGN_REQUEST => {
                if body.remaining() != 12 {
                    return Err(DecodeError::BadLength(header.length))
                }
                Ok(Pdu::SignRequest {
                    algorithm: header.reserved1,
                    block_type: header.reserved2,
                    update_id: body.get_u32().into(),
                    prepend_counter: body.get_u32(),
                    peer_as: body.get_u32(),
                })
            }
            TYPE_VERIFY_NOTIFICATION => {
                if body.remaining() != 12 {
                    return Err(DecodeError::BadLength(header.length))
                }
                let roa = ValidationState::from_wire(
                    (header.reserved1 & 0xff) as u8
                ).ok_or(DecodeError::BadValue("roa result"))?;
                let bgpsec = ValidationState::from_wire(header.reserved2)
                    .ok_or(DecodeError::BadValue("bgpsec result"))?;
                let aspa = ValidationState::from_wire(body.get_u8())
                    .ok_or(DecodeError::BadValue("aspa result"))?;
                body.advance(3);
                Ok(Pdu::VerifyNotification {
                    result_type: VerifyFlags::from_wire(
                        (header.reserved1 >> 8) as u8
                    ),
                    roa, bgpsec, aspa,
                    request_token: body.get_u32(),
                    update_id: body.get_u32().into(),
                })
            }
            TYPE_SIGNATURE_NOTIFICATION => {
                if body.remaining() < 8 {
                    return Err(DecodeError::Truncated)
                }
                let update_id = body.get_u32().into();
                let sig_len = body.get_u32() as usize;
                if body.remaining() != sig_len {
                    return Err(DecodeError::BadLength(header.length))
                }
                Ok(Pdu::SignatureNotification {
                    update_id,
                    signature: body.to_vec(),
                })
            }
            TYPE_DELETE_UPDATE => {
                if body.remaining() != 4 {
                    return Err(DecodeError::BadLength(header.length))
                }
                Ok(Pdu::DeleteUpdate {
                    keep_window: header.reserved1,
                    update_id: body.get_u32().into(),
                })
            }
            TYPE_PEER_CHANGE => {
                if body.remaining() != 4 {
                    return Err(DecodeError::BadLength(header.length))
                }
                Ok(Pdu::PeerChange {
                    change_type: header.reserved2,
                    peer_as: body.get_u32(),
                })
            }
            TYPE_SYNC_REQUEST => {
                if body.has_remaining() {
                    return Err(DecodeError::BadLength(header.length))
                }
                Ok(Pdu::SyncRequest)
            }
            TYPE_ERROR => {
                if body.has_remaining() {
                    return Err(DecodeError::BadLength(header.length))
                }
                ErrorCode::from_wire(header.reserved1)
                    .map(|code| Pdu::Error { code })
                    .ok_or(DecodeError::BadValue("error code"))
            }
            other => Err(DecodeError::BadType(other)),
        }
    }

    fn decode_verify_request(
        header: Header, mut body: &[u8]
    ) -> Result<Self, DecodeError> {
        let v4 = header.pdu_type == TYPE_VERIFY_V4;
        let prefix_octets = if v4 { 4usize } else { 16 };
        if body.remaining() < 8 + prefix_octets + 8 {
            return Err(DecodeError::Truncated)
        }
        let roa_default = ValidationState::from_wire(body.get_u8())
            .ok_or(DecodeError::BadValue("roa default"))?;
        let bgpsec_default = ValidationState::from_wire(body.get_u8())
            .ok_or(DecodeError::BadValue("bgpsec default"))?;
        let aspa_default = ValidationState::from_wire(body.get_u8())
            .ok_or(DecodeError::BadValue("aspa default"))?;
        let prefix_len = body.get_u8();
        if (v4 && prefix_len > 32) || prefix_len > 128 {
            return Err(DecodeError::BadValue("prefix length"))
        }
        let request_token = body.get_u32();
        let addr = if v4 {
            let mut octets = [0u8; 4];
            body.copy_to_slice(&mut octets);
            IpAddr::from(octets)
        }
        else {
            let mut octets = [0u8; 16];
            body.copy_to_slice(&mut octets);
            IpAddr::from(octets)
        };
        let origin = body.get_u32();
        let blob_len = body.get_u32() as usize;
        if body.remaining() != blob_len {
            return Err(DecodeError::BadLength(header.length))
        }

        let mut kind = AsPathKind::Sequence;
        let mut direction = PathDirection::UnknownStream;
        let mut bgpsec = BgpsecData::default();
        if blob_len > 0 {
            if blob_len < BGPSEC_BLOB_HEAD {
                return Err(DecodeError::Truncated)
            }
            let num_hops = body.get_u16() as usize;
            let attr_len = body.get_u16() as usize;
            bgpsec.afi = body.get_u16();
            bgpsec.safi = body.get_u8();
            kind = AsPathKind::from_wire(body.get_u8())
                .ok_or(DecodeError::BadValue("path kind"))?;
            direction = PathDirection::from_wire(body.get_u8());
            body.advance(3);
            bgpsec.local_as = body.get_u32();
            if body.remaining() != num_hops * 4 + attr_len {
                return Err(DecodeError::BadLength(header.length))
            }
            bgpsec.as_path.reserve(num_hops);
            for _ in 0..num_hops {
                bgpsec.as_path.push(body.get_u32());
            }
            bgpsec.path_attr = body.to_vec();
        }

        Ok(Pdu::VerifyRequest(Box::new(VerifyRequest {
            flags: VerifyFlags::from_wire((header.reserved1 >> 8) as u8),
            roa_source: ResultSource::from_wire(
                (header.reserved1 & 0xff) as u8
            ),
            bgpsec_source: ResultSource::from_wire(header.reserved2),
            roa_default,
            bgpsec_default,
            aspa_default,
            request_token,
            prefix: AddressPrefix::new(addr, prefix_len),
            origin,
            kind,
            direction,
            bgpsec,
        })))
    }
}


//------------ DecodeError ---------------------------------------------------

/// A frame could not be decoded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// The frame ended before the PDU was complete.
    Truncated,

    /// The length field disagrees with the actual frame.
    BadLength(u32),

    /// The type code is unknown.
    BadType(u8),

    /// A field carried a value outside its range.
    BadValue(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            DecodeError::Truncated => f.write_str("truncated PDU"),
            DecodeError::BadLength(len) => {
                write!(f, "invalid PDU length {}", len)
            }
            DecodeError::BadType(code) => {
                write!(f, "unknown PDU type {}", code)
            }
            DecodeError::BadValue(what) => {
                write!(f, "invalid value for {}", what)
            }
        }
    }
}


//============ Tests =========================================================
