//! Bit-exact wire codec.
//!
//! Every frame is `type(1) || length(4, big-endian) || payload`, with the
//! length excluding the header and bounded by the configured maximum.
//! All multi-byte integers are big-endian.
//!
//! Handshake messages and alerts travel in the clear; Data, Rekey, Ping,
//! Pong and Close are records: `seq(8) || sealed_payload`, sealed under the
//! traffic keys with the frame type and sequence number as AAD.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TunnelError;
use crate::types::{ProtocolVersion, HEADER_SIZE, MAX_MESSAGE_SIZE};
use crypto::chkem::{CHKEM_CIPHERTEXT_LEN, CHKEM_PUBLIC_KEY_LEN};

pub const TYPE_CLIENT_HELLO: u8 = 0x01;
pub const TYPE_SERVER_HELLO: u8 = 0x02;
pub const TYPE_CLIENT_FINISHED: u8 = 0x03;
pub const TYPE_SERVER_FINISHED: u8 = 0x04;
pub const TYPE_DATA: u8 = 0x10;
pub const TYPE_REKEY: u8 = 0x11;
pub const TYPE_PING: u8 = 0x12;
pub const TYPE_PONG: u8 = 0x13;
pub const TYPE_CLOSE: u8 = 0x14;
pub const TYPE_ALERT: u8 = 0xF0;

/// Sealed Finished payload: 32-byte verify_data plus the 16-byte tag.
pub const FINISHED_PAYLOAD_LEN: usize = 48;

/// First flight: the initiator's public key and suite offer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientHello {
    pub version: ProtocolVersion,
    pub random: [u8; 32],
    /// Echoed session id from an earlier connection, or empty.
    pub session_id: Vec<u8>,
    /// 1600-byte CH-KEM public key.
    pub public_key: Vec<u8>,
    /// Offered suites in preference order, raw wire identifiers.
    pub cipher_suites: Vec<u16>,
}

/// Second flight: the responder's encapsulation and suite choice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerHello {
    pub version: ProtocolVersion,
    pub random: [u8; 32],
    /// Fresh 16-byte session id.
    pub session_id: Vec<u8>,
    /// 1600-byte CH-KEM ciphertext.
    pub ciphertext: Vec<u8>,
    pub cipher_suite: u16,
}

/// Third and fourth flights: verify_data sealed under handshake keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finished {
    pub payload: Vec<u8>,
}

/// An encrypted record: Data, Rekey, Ping, Pong or Close.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub seq: u64,
    pub ciphertext: Vec<u8>,
}

/// Plaintext body carried inside a sealed Rekey record.
///
/// The requester's Rekey carries a fresh CH-KEM public key; the peer's
/// reply reuses the same layout with the encapsulation ciphertext in the
/// `public_key` position (both are 1600 bytes) and the activation sequence
/// echoed back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RekeyBody {
    pub public_key: Vec<u8>,
    pub activation_seq: u64,
}

impl RekeyBody {
    pub const ENCODED_LEN: usize = CHKEM_PUBLIC_KEY_LEN + 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.activation_seq.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TunnelError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(TunnelError::InvalidMessage("bad rekey body length"));
        }
        let (key_bytes, seq_bytes) = bytes.split_at(CHKEM_PUBLIC_KEY_LEN);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(seq_bytes);
        Ok(Self {
            public_key: key_bytes.to_vec(),
            activation_seq: u64::from_be_bytes(seq),
        })
    }
}

/// Alert severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Fatal,
}

impl AlertLevel {
    fn to_wire(self) -> u8 {
        match self {
            AlertLevel::Warning => 0x01,
            AlertLevel::Fatal => 0x02,
        }
    }

    fn from_wire(byte: u8) -> Result<Self, TunnelError> {
        match byte {
            0x01 => Ok(AlertLevel::Warning),
            0x02 => Ok(AlertLevel::Fatal),
            _ => Err(TunnelError::InvalidMessage("unknown alert level")),
        }
    }
}

impl core::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Fatal => write!(f, "fatal"),
        }
    }
}

/// Alert reason codes. Unknown codes from a peer are preserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertCode {
    CloseNotify,
    UnsupportedVersion,
    HandshakeFailure,
    DecryptionFailed,
    ProtocolViolation,
    InternalError,
    Unknown(u8),
}

impl AlertCode {
    fn to_wire(self) -> u8 {
        match self {
            AlertCode::CloseNotify => 0x00,
            AlertCode::UnsupportedVersion => 0x01,
            AlertCode::HandshakeFailure => 0x02,
            AlertCode::DecryptionFailed => 0x03,
            AlertCode::ProtocolViolation => 0x04,
            AlertCode::InternalError => 0x05,
            AlertCode::Unknown(byte) => byte,
        }
    }

    fn from_wire(byte: u8) -> Self {
        match byte {
            0x00 => AlertCode::CloseNotify,
            0x01 => AlertCode::UnsupportedVersion,
            0x02 => AlertCode::HandshakeFailure,
            0x03 => AlertCode::DecryptionFailed,
            0x04 => AlertCode::ProtocolViolation,
            0x05 => AlertCode::InternalError,
            other => AlertCode::Unknown(other),
        }
    }
}

impl core::fmt::Display for AlertCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AlertCode::CloseNotify => write!(f, "close_notify"),
            AlertCode::UnsupportedVersion => write!(f, "unsupported_version"),
            AlertCode::HandshakeFailure => write!(f, "handshake_failure"),
            AlertCode::DecryptionFailed => write!(f, "decryption_failed"),
            AlertCode::ProtocolViolation => write!(f, "protocol_violation"),
            AlertCode::InternalError => write!(f, "internal_error"),
            AlertCode::Unknown(byte) => write!(f, "unknown(0x{byte:02x})"),
        }
    }
}

/// Plaintext alert: `level(1) || code(1) || desc_len(1) || desc`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub code: AlertCode,
    pub description: String,
}

impl Alert {
    /// Build an alert; the description is truncated to 255 bytes.
    pub fn new(level: AlertLevel, code: AlertCode, description: &str) -> Self {
        let mut description = description.to_string();
        if description.len() > 255 {
            let mut cut = 255;
            while !description.is_char_boundary(cut) {
                cut -= 1;
            }
            description.truncate(cut);
        }
        Self {
            level,
            code,
            description,
        }
    }

    pub fn fatal(code: AlertCode, description: &str) -> Self {
        Self::new(AlertLevel::Fatal, code, description)
    }
}

/// Every frame the tunnel can carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    ClientFinished(Finished),
    ServerFinished(Finished),
    Data(Record),
    Rekey(Record),
    Ping(Record),
    Pong(Record),
    Close(Record),
    Alert(Alert),
}

impl Message {
    pub fn message_type(&self) -> u8 {
        match self {
            Message::ClientHello(_) => TYPE_CLIENT_HELLO,
            Message::ServerHello(_) => TYPE_SERVER_HELLO,
            Message::ClientFinished(_) => TYPE_CLIENT_FINISHED,
            Message::ServerFinished(_) => TYPE_SERVER_FINISHED,
            Message::Data(_) => TYPE_DATA,
            Message::Rekey(_) => TYPE_REKEY,
            Message::Ping(_) => TYPE_PING,
            Message::Pong(_) => TYPE_PONG,
            Message::Close(_) => TYPE_CLOSE,
            Message::Alert(_) => TYPE_ALERT,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Message::ClientHello(_) => "ClientHello",
            Message::ServerHello(_) => "ServerHello",
            Message::ClientFinished(_) => "ClientFinished",
            Message::ServerFinished(_) => "ServerFinished",
            Message::Data(_) => "Data",
            Message::Rekey(_) => "Rekey",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::Close(_) => "Close",
            Message::Alert(_) => "Alert",
        }
    }

    /// Encode the payload (everything after the 5-byte header).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::ClientHello(hello) => {
                out.push(hello.version.major);
                out.push(hello.version.minor);
                out.extend_from_slice(&hello.random);
                out.push(hello.session_id.len() as u8);
                out.extend_from_slice(&hello.session_id);
                out.extend_from_slice(&hello.public_key);
                out.extend_from_slice(&(hello.cipher_suites.len() as u16).to_be_bytes());
                for suite in &hello.cipher_suites {
                    out.extend_from_slice(&suite.to_be_bytes());
                }
            }
            Message::ServerHello(hello) => {
                out.push(hello.version.major);
                out.push(hello.version.minor);
                out.extend_from_slice(&hello.random);
                out.push(hello.session_id.len() as u8);
                out.extend_from_slice(&hello.session_id);
                out.extend_from_slice(&hello.ciphertext);
                out.extend_from_slice(&hello.cipher_suite.to_be_bytes());
            }
            Message::ClientFinished(finished) | Message::ServerFinished(finished) => {
                out.extend_from_slice(&finished.payload);
            }
            Message::Data(record)
            | Message::Rekey(record)
            | Message::Ping(record)
            | Message::Pong(record)
            | Message::Close(record) => {
                out.extend_from_slice(&record.seq.to_be_bytes());
                out.extend_from_slice(&record.ciphertext);
            }
            Message::Alert(alert) => {
                out.push(alert.level.to_wire());
                out.push(alert.code.to_wire());
                let desc = alert.description.as_bytes();
                out.push(desc.len() as u8);
                out.extend_from_slice(desc);
            }
        }
        out
    }

    /// Encode a complete frame: header plus payload.
    pub fn encode_frame(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.push(self.message_type());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Decode a payload for a given frame type.
    pub fn decode(frame_type: u8, payload: &[u8]) -> Result<Message, TunnelError> {
        let mut reader = Reader::new(payload);
        let message = match frame_type {
            TYPE_CLIENT_HELLO => Message::ClientHello(decode_client_hello(&mut reader)?),
            TYPE_SERVER_HELLO => Message::ServerHello(decode_server_hello(&mut reader)?),
            TYPE_CLIENT_FINISHED => Message::ClientFinished(decode_finished(&mut reader)?),
            TYPE_SERVER_FINISHED => Message::ServerFinished(decode_finished(&mut reader)?),
            TYPE_DATA => Message::Data(decode_record(&mut reader)?),
            TYPE_REKEY => Message::Rekey(decode_record(&mut reader)?),
            TYPE_PING => Message::Ping(decode_record(&mut reader)?),
            TYPE_PONG => Message::Pong(decode_record(&mut reader)?),
            TYPE_CLOSE => Message::Close(decode_record(&mut reader)?),
            TYPE_ALERT => Message::Alert(decode_alert(&mut reader)?),
            _ => return Err(TunnelError::InvalidMessage("unknown message type")),
        };
        if !reader.is_empty() {
            return Err(TunnelError::InvalidMessage("trailing bytes"));
        }
        Ok(message)
    }
}

fn decode_client_hello(reader: &mut Reader<'_>) -> Result<ClientHello, TunnelError> {
    let version = ProtocolVersion {
        major: reader.take_u8()?,
        minor: reader.take_u8()?,
    };
    let random = reader.take_array::<32>()?;
    let sid_len = reader.take_u8()? as usize;
    let session_id = reader.take_bytes(sid_len)?.to_vec();
    let public_key = reader.take_bytes(CHKEM_PUBLIC_KEY_LEN)?.to_vec();
    let suite_count = reader.take_u16()? as usize;
    if suite_count == 0 {
        return Err(TunnelError::InvalidMessage("empty cipher suite list"));
    }
    let mut cipher_suites = Vec::with_capacity(suite_count);
    for _ in 0..suite_count {
        cipher_suites.push(reader.take_u16()?);
    }
    Ok(ClientHello {
        version,
        random,
        session_id,
        public_key,
        cipher_suites,
    })
}

fn decode_server_hello(reader: &mut Reader<'_>) -> Result<ServerHello, TunnelError> {
    let version = ProtocolVersion {
        major: reader.take_u8()?,
        minor: reader.take_u8()?,
    };
    let random = reader.take_array::<32>()?;
    let sid_len = reader.take_u8()? as usize;
    let session_id = reader.take_bytes(sid_len)?.to_vec();
    let ciphertext = reader.take_bytes(CHKEM_CIPHERTEXT_LEN)?.to_vec();
    let cipher_suite = reader.take_u16()?;
    Ok(ServerHello {
        version,
        random,
        session_id,
        ciphertext,
        cipher_suite,
    })
}

fn decode_finished(reader: &mut Reader<'_>) -> Result<Finished, TunnelError> {
    let payload = reader.take_bytes(FINISHED_PAYLOAD_LEN)?.to_vec();
    Ok(Finished { payload })
}

fn decode_record(reader: &mut Reader<'_>) -> Result<Record, TunnelError> {
    let seq = reader.take_u64()?;
    let ciphertext = reader.take_remaining().to_vec();
    Ok(Record { seq, ciphertext })
}

fn decode_alert(reader: &mut Reader<'_>) -> Result<Alert, TunnelError> {
    let level = AlertLevel::from_wire(reader.take_u8()?)?;
    let code = AlertCode::from_wire(reader.take_u8()?);
    let desc_len = reader.take_u8()? as usize;
    let description = String::from_utf8_lossy(reader.take_bytes(desc_len)?).into_owned();
    Ok(Alert {
        level,
        code,
        description,
    })
}

/// Cursor over a frame payload.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_bytes(&mut self, n: usize) -> Result<&'a [u8], TunnelError> {
        if self.buf.len() < n {
            return Err(TunnelError::InvalidMessage("truncated message"));
        }
        let (taken, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(taken)
    }

    fn take_remaining(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn take_u8(&mut self) -> Result<u8, TunnelError> {
        Ok(self.take_bytes(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, TunnelError> {
        let bytes = self.take_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take_u64(&mut self) -> Result<u64, TunnelError> {
        let bytes = self.take_bytes(8)?;
        let mut array = [0u8; 8];
        array.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(array))
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], TunnelError> {
        let bytes = self.take_bytes(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(bytes);
        Ok(array)
    }
}

/// Length-prefixed frame codec for `Framed` transports.
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TunnelError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let frame_type = src[0];
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if length > self.max_frame_len {
            return Err(TunnelError::MessageTooLarge {
                size: length,
                max: self.max_frame_len,
            });
        }
        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }
        src.advance(HEADER_SIZE);
        let payload = src.split_to(length);
        Message::decode(frame_type, &payload).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = TunnelError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), TunnelError> {
        let payload = message.encode_payload();
        if payload.len() > self.max_frame_len {
            return Err(TunnelError::MessageTooLarge {
                size: payload.len(),
                max: self.max_frame_len,
            });
        }
        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u8(message.message_type());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}
