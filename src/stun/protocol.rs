// src/stun/protocol.rs
//! STUN Binding message encoding and decoding (RFC 8489)

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use crate::error::{IceResult, StunError};

type HmacSha1 = Hmac<Sha1>;

/// STUN magic cookie (RFC 8489 Section 5)
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN message header size
pub const HEADER_SIZE: usize = 20;

/// Transaction ID size in bytes (96 bits)
pub const TRANSACTION_ID_SIZE: usize = 12;

/// XOR value applied to the CRC-32 for the FINGERPRINT attribute
const FINGERPRINT_XOR: u32 = 0x5354554e;

/// MESSAGE-INTEGRITY attribute length on the wire (header + HMAC-SHA1)
const INTEGRITY_ATTR_LEN: u16 = 24;

/// FINGERPRINT attribute length on the wire
const FINGERPRINT_ATTR_LEN: u16 = 8;

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

/// Binding message types understood by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    BindingRequest = 0x0001,
    BindingIndication = 0x0011,
    BindingSuccess = 0x0101,
    BindingError = 0x0111,
}

impl MessageType {
    pub fn class(self) -> MessageClass {
        match self {
            Self::BindingRequest => MessageClass::Request,
            Self::BindingIndication => MessageClass::Indication,
            Self::BindingSuccess => MessageClass::SuccessResponse,
            Self::BindingError => MessageClass::ErrorResponse,
        }
    }

    fn from_value(value: u16) -> Result<Self, StunError> {
        match value {
            0x0001 => Ok(Self::BindingRequest),
            0x0011 => Ok(Self::BindingIndication),
            0x0101 => Ok(Self::BindingSuccess),
            0x0111 => Ok(Self::BindingError),
            other => Err(StunError::InvalidMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BindingRequest => "Binding Request",
            Self::BindingIndication => "Binding Indication",
            Self::BindingSuccess => "Binding Success",
            Self::BindingError => "Binding Error",
        };
        f.write_str(name)
    }
}

/// STUN transaction ID (96 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; TRANSACTION_ID_SIZE]);

impl TransactionId {
    /// Generate a new random transaction ID
    pub fn new() -> Self {
        let mut id = [0u8; TRANSACTION_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; TRANSACTION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TRANSACTION_ID_SIZE] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, StunError> {
        if slice.len() != TRANSACTION_ID_SIZE {
            return Err(StunError::AttributeParse {
                attr_type: 0,
                reason: format!("transaction ID must be 12 bytes, got {}", slice.len()),
            });
        }
        let mut id = [0u8; TRANSACTION_ID_SIZE];
        id.copy_from_slice(slice);
        Ok(Self(id))
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// STUN attribute types the agent works with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Username,
    MessageIntegrity,
    ErrorCode,
    XorMappedAddress,
    Priority,
    UseCandidate,
    Fingerprint,
    IceControlled,
    IceControlling,
    Raw(u16),
}

impl AttributeType {
    pub fn value(self) -> u16 {
        match self {
            Self::Username => 0x0006,
            Self::MessageIntegrity => 0x0008,
            Self::ErrorCode => 0x0009,
            Self::XorMappedAddress => 0x0020,
            Self::Priority => 0x0024,
            Self::UseCandidate => 0x0025,
            Self::Fingerprint => 0x8028,
            Self::IceControlled => 0x8029,
            Self::IceControlling => 0x802A,
            Self::Raw(v) => v,
        }
    }

    pub fn from_value(value: u16) -> Self {
        match value {
            0x0006 => Self::Username,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x0020 => Self::XorMappedAddress,
            0x0024 => Self::Priority,
            0x0025 => Self::UseCandidate,
            0x8028 => Self::Fingerprint,
            0x8029 => Self::IceControlled,
            0x802A => Self::IceControlling,
            other => Self::Raw(other),
        }
    }
}

/// STUN attribute values
#[derive(Debug, Clone)]
pub enum AttributeValue {
    Username(String),
    MessageIntegrity(Vec<u8>),
    ErrorCode { code: u16, reason: String },
    XorMappedAddress(SocketAddr),
    Priority(u32),
    UseCandidate,
    Fingerprint(u32),
    IceControlled(u64),
    IceControlling(u64),
    Raw(Vec<u8>),
}

/// A single STUN attribute
#[derive(Debug, Clone)]
pub struct Attribute {
    pub attr_type: AttributeType,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(attr_type: AttributeType, value: AttributeValue) -> Self {
        Self { attr_type, value }
    }

    fn encode(&self, buf: &mut BytesMut, tid: &TransactionId) {
        let start = buf.len();
        buf.put_u16(self.attr_type.value());
        buf.put_u16(0); // length placeholder
        let value_start = buf.len();

        match &self.value {
            AttributeValue::Username(s) => buf.put_slice(s.as_bytes()),
            AttributeValue::MessageIntegrity(hmac) => buf.put_slice(hmac),
            AttributeValue::ErrorCode { code, reason } => {
                buf.put_u16(0);
                buf.put_u8((code / 100) as u8);
                buf.put_u8((code % 100) as u8);
                buf.put_slice(reason.as_bytes());
            }
            AttributeValue::XorMappedAddress(addr) => encode_xor_address(buf, addr, tid),
            AttributeValue::Priority(p) => buf.put_u32(*p),
            AttributeValue::UseCandidate => {}
            AttributeValue::Fingerprint(fp) => buf.put_u32(*fp),
            AttributeValue::IceControlled(tb) | AttributeValue::IceControlling(tb) => {
                buf.put_u64(*tb)
            }
            AttributeValue::Raw(data) => buf.put_slice(data),
        }

        let value_len = buf.len() - value_start;
        buf[start + 2..start + 4].copy_from_slice(&(value_len as u16).to_be_bytes());

        // Pad to a 4-byte boundary
        let padding = (4 - (value_len % 4)) % 4;
        for _ in 0..padding {
            buf.put_u8(0);
        }
    }

    fn decode(buf: &mut BytesMut, tid: &TransactionId) -> Result<Self, StunError> {
        if buf.remaining() < 4 {
            return Err(StunError::AttributeParse {
                attr_type: 0,
                reason: "attribute header too short".to_string(),
            });
        }

        let attr_type_value = buf.get_u16();
        let attr_length = buf.get_u16() as usize;
        let attr_type = AttributeType::from_value(attr_type_value);

        if buf.remaining() < attr_length {
            return Err(StunError::AttributeParse {
                attr_type: attr_type_value,
                reason: format!(
                    "truncated: expected {} bytes, got {}",
                    attr_length,
                    buf.remaining()
                ),
            });
        }

        let mut value_buf = buf.split_to(attr_length);
        let padding = (4 - (attr_length % 4)) % 4;
        if buf.remaining() >= padding {
            buf.advance(padding);
        }

        let exact = |expected: usize| -> Result<(), StunError> {
            if value_buf.len() != expected {
                Err(StunError::AttributeParse {
                    attr_type: attr_type_value,
                    reason: format!("must be {} bytes, got {}", expected, value_buf.len()),
                })
            } else {
                Ok(())
            }
        };

        let value = match attr_type {
            AttributeType::Username => {
                let s = String::from_utf8(value_buf.to_vec()).map_err(|_| {
                    StunError::AttributeParse {
                        attr_type: attr_type_value,
                        reason: "USERNAME is not valid UTF-8".to_string(),
                    }
                })?;
                AttributeValue::Username(s)
            }
            AttributeType::MessageIntegrity => {
                exact(20)?;
                AttributeValue::MessageIntegrity(value_buf.to_vec())
            }
            AttributeType::ErrorCode => {
                if value_buf.len() < 4 {
                    return Err(StunError::AttributeParse {
                        attr_type: attr_type_value,
                        reason: "ERROR-CODE too short".to_string(),
                    });
                }
                value_buf.advance(2);
                let class = value_buf.get_u8() as u16;
                let number = value_buf.get_u8() as u16;
                let reason = String::from_utf8_lossy(&value_buf).into_owned();
                AttributeValue::ErrorCode {
                    code: class * 100 + number,
                    reason,
                }
            }
            AttributeType::XorMappedAddress => {
                AttributeValue::XorMappedAddress(decode_xor_address(&mut value_buf, tid)?)
            }
            AttributeType::Priority => {
                exact(4)?;
                AttributeValue::Priority(value_buf.get_u32())
            }
            AttributeType::UseCandidate => {
                exact(0)?;
                AttributeValue::UseCandidate
            }
            AttributeType::Fingerprint => {
                exact(4)?;
                AttributeValue::Fingerprint(value_buf.get_u32())
            }
            AttributeType::IceControlled => {
                exact(8)?;
                AttributeValue::IceControlled(value_buf.get_u64())
            }
            AttributeType::IceControlling => {
                exact(8)?;
                AttributeValue::IceControlling(value_buf.get_u64())
            }
            AttributeType::Raw(_) => AttributeValue::Raw(value_buf.to_vec()),
        };

        Ok(Attribute::new(attr_type, value))
    }
}

/// Fast classifier: does this buffer look like a STUN message?
pub fn is_stun(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE
        && (data[0] & 0xC0) == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

/// A STUN Binding message
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,

    /// Original bytes for decoded messages, needed for integrity checks
    raw: Vec<u8>,
    /// Byte offset of the MESSAGE-INTEGRITY attribute within `raw`
    integrity_offset: Option<usize>,
}

impl Message {
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
            raw: Vec::new(),
            integrity_offset: None,
        }
    }

    /// New Binding request with a fresh transaction ID
    pub fn binding_request() -> Self {
        Self::new(MessageType::BindingRequest, TransactionId::new())
    }

    /// New Binding success response echoing the request's transaction ID
    pub fn binding_success(transaction_id: TransactionId) -> Self {
        Self::new(MessageType::BindingSuccess, transaction_id)
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    pub fn get_attribute(&self, attr_type: AttributeType) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    pub fn contains(&self, attr_type: AttributeType) -> bool {
        self.attributes.iter().any(|a| a.attr_type == attr_type)
    }

    /// USERNAME attribute value
    pub fn username(&self) -> Option<&str> {
        match self.get_attribute(AttributeType::Username)?.value {
            AttributeValue::Username(ref s) => Some(s),
            _ => None,
        }
    }

    /// PRIORITY attribute value
    pub fn priority(&self) -> Option<u32> {
        match self.get_attribute(AttributeType::Priority)?.value {
            AttributeValue::Priority(p) => Some(p),
            _ => None,
        }
    }

    /// XOR-MAPPED-ADDRESS attribute value
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        match self.get_attribute(AttributeType::XorMappedAddress)?.value {
            AttributeValue::XorMappedAddress(addr) => Some(addr),
            _ => None,
        }
    }

    /// Encode the message, optionally appending MESSAGE-INTEGRITY (keyed
    /// with `integrity_key`) and FINGERPRINT, in that order.
    pub fn encode(&self, integrity_key: Option<&[u8]>, add_fingerprint: bool) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(128);

        buf.put_u16(self.message_type as u16);
        buf.put_u16(0); // length placeholder
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            match attr.attr_type {
                // Appended last with correct length fix-ups
                AttributeType::MessageIntegrity | AttributeType::Fingerprint => continue,
                _ => attr.encode(&mut buf, &self.transaction_id),
            }
        }

        if let Some(key) = integrity_key {
            // The length field must cover the integrity attribute itself
            let length = (buf.len() - HEADER_SIZE) as u16 + INTEGRITY_ATTR_LEN;
            buf[2..4].copy_from_slice(&length.to_be_bytes());

            let hmac = compute_integrity(&buf, key);
            Attribute::new(
                AttributeType::MessageIntegrity,
                AttributeValue::MessageIntegrity(hmac),
            )
            .encode(&mut buf, &self.transaction_id);
        }

        if add_fingerprint {
            let length = (buf.len() - HEADER_SIZE) as u16 + FINGERPRINT_ATTR_LEN;
            buf[2..4].copy_from_slice(&length.to_be_bytes());

            let fingerprint = crc32fast::hash(&buf) ^ FINGERPRINT_XOR;
            Attribute::new(
                AttributeType::Fingerprint,
                AttributeValue::Fingerprint(fingerprint),
            )
            .encode(&mut buf, &self.transaction_id);
        }

        let final_length = (buf.len() - HEADER_SIZE) as u16;
        buf[2..4].copy_from_slice(&final_length.to_be_bytes());

        buf.to_vec()
    }

    /// Decode a message, keeping the raw bytes for later integrity checks
    pub fn decode(data: &[u8]) -> IceResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort(data.len()).into());
        }

        let mut buf = BytesMut::from(data);

        let message_type_value = buf.get_u16();
        let message_length = buf.get_u16() as usize;
        let magic_cookie = buf.get_u32();

        if magic_cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie(magic_cookie).into());
        }

        let transaction_id = TransactionId::from_slice(&buf.split_to(TRANSACTION_ID_SIZE))?;

        if buf.len() != message_length {
            return Err(StunError::AttributeParse {
                attr_type: 0,
                reason: format!(
                    "length mismatch: header says {}, got {}",
                    message_length,
                    buf.len()
                ),
            }
            .into());
        }

        let message_type = MessageType::from_value(message_type_value)?;

        let mut message = Message::new(message_type, transaction_id);
        message.raw = data.to_vec();

        while buf.has_remaining() {
            let offset = data.len() - buf.remaining();
            let attr = Attribute::decode(&mut buf, &transaction_id)?;
            if attr.attr_type == AttributeType::MessageIntegrity && message.integrity_offset.is_none()
            {
                message.integrity_offset = Some(offset);
            }
            message.attributes.push(attr);
        }

        Ok(message)
    }

    /// Verify MESSAGE-INTEGRITY against a short-term credential key.
    ///
    /// The HMAC input is the message up to (not including) the integrity
    /// attribute, with the header length rewritten to end just after it.
    pub fn verify_integrity(&self, key: &[u8]) -> IceResult<()> {
        let offset = self
            .integrity_offset
            .ok_or(StunError::MissingAttribute("MESSAGE-INTEGRITY"))?;

        let expected = match &self
            .get_attribute(AttributeType::MessageIntegrity)
            .ok_or(StunError::MissingAttribute("MESSAGE-INTEGRITY"))?
            .value
        {
            AttributeValue::MessageIntegrity(hmac) => hmac.clone(),
            _ => return Err(StunError::IntegrityCheckFailed.into()),
        };

        let mut input = self.raw[..offset].to_vec();
        let length = (offset - HEADER_SIZE) as u16 + INTEGRITY_ATTR_LEN;
        input[2..4].copy_from_slice(&length.to_be_bytes());

        let mut mac = HmacSha1::new_from_slice(key).map_err(|_| StunError::IntegrityCheckFailed)?;
        mac.update(&input);
        mac.verify_slice(&expected)
            .map_err(|_| StunError::IntegrityCheckFailed)?;
        Ok(())
    }

    /// Verify the FINGERPRINT attribute of a decoded message
    pub fn verify_fingerprint(&self) -> IceResult<()> {
        let expected = match &self
            .get_attribute(AttributeType::Fingerprint)
            .ok_or(StunError::MissingAttribute("FINGERPRINT"))?
            .value
        {
            AttributeValue::Fingerprint(fp) => *fp,
            _ => return Err(StunError::FingerprintCheckFailed.into()),
        };

        // FINGERPRINT is always the last attribute
        if self.raw.len() < FINGERPRINT_ATTR_LEN as usize {
            return Err(StunError::FingerprintCheckFailed.into());
        }
        let covered = &self.raw[..self.raw.len() - FINGERPRINT_ATTR_LEN as usize];
        let computed = crc32fast::hash(covered) ^ FINGERPRINT_XOR;

        if computed != expected {
            return Err(StunError::FingerprintCheckFailed.into());
        }
        Ok(())
    }
}

/// Compute the HMAC-SHA1 short-term MESSAGE-INTEGRITY value
fn compute_integrity(data: &[u8], key: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn encode_xor_address(buf: &mut BytesMut, addr: &SocketAddr, tid: &TransactionId) {
    buf.put_u8(0); // reserved
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let magic = MAGIC_COOKIE.to_be_bytes();

    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(0x01);
            buf.put_u16(port);
            let mut octets = ip.octets();
            for i in 0..4 {
                octets[i] ^= magic[i];
            }
            buf.put_slice(&octets);
        }
        IpAddr::V6(ip) => {
            buf.put_u8(0x02);
            buf.put_u16(port);
            let mut octets = ip.octets();
            let tid_bytes = tid.as_bytes();
            for i in 0..4 {
                octets[i] ^= magic[i];
            }
            for i in 0..12 {
                octets[i + 4] ^= tid_bytes[i];
            }
            buf.put_slice(&octets);
        }
    }
}

fn decode_xor_address(buf: &mut BytesMut, tid: &TransactionId) -> Result<SocketAddr, StunError> {
    if buf.remaining() < 4 {
        return Err(StunError::AttributeParse {
            attr_type: AttributeType::XorMappedAddress.value(),
            reason: "address attribute too short".to_string(),
        });
    }

    buf.advance(1); // reserved
    let family = buf.get_u8();
    let port = buf.get_u16() ^ (MAGIC_COOKIE >> 16) as u16;
    let magic = MAGIC_COOKIE.to_be_bytes();

    match family {
        0x01 => {
            if buf.remaining() < 4 {
                return Err(StunError::AttributeParse {
                    attr_type: AttributeType::XorMappedAddress.value(),
                    reason: "IPv4 address incomplete".to_string(),
                });
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            for i in 0..4 {
                octets[i] ^= magic[i];
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            if buf.remaining() < 16 {
                return Err(StunError::AttributeParse {
                    attr_type: AttributeType::XorMappedAddress.value(),
                    reason: "IPv6 address incomplete".to_string(),
                });
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let tid_bytes = tid.as_bytes();
            for i in 0..4 {
                octets[i] ^= magic[i];
            }
            for i in 0..12 {
                octets[i + 4] ^= tid_bytes[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(StunError::InvalidAddressFamily(other)),
    }
}
