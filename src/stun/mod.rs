// src/stun/mod.rs
//! STUN Binding message support (RFC 8489 subset)
//!
//! The agent only ever exchanges Binding requests, success responses and
//! indications, authenticated with short-term credentials. This module
//! provides exactly that subset: header parsing, the attributes ICE needs
//! (USERNAME, MESSAGE-INTEGRITY, FINGERPRINT, XOR-MAPPED-ADDRESS, PRIORITY,
//! USE-CANDIDATE, ICE-CONTROLLING/CONTROLLED), and short-term integrity
//! signing and verification.

pub mod protocol;

pub use protocol::{
    is_stun, Attribute, AttributeType, AttributeValue, Message, MessageClass, MessageType,
    TransactionId, HEADER_SIZE, MAGIC_COOKIE, TRANSACTION_ID_SIZE,
};
