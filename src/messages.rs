//! # Wire Protocol Messages
//!
//! Every datagram exchanged by the rendezvous protocol is one of the serde
//! types below, serialized with bincode under a size limit.
//!
//! ## Layering
//!
//! | Layer | Type | Protection |
//! |-------|------|------------|
//! | Client → server datagram | [`Envelope`] | none (carries sealed payload) |
//! | Handshake payload | [`HandshakeMessage`] | RSA-OAEP to the server key |
//! | Session request | [`SessionRequest`] | AES-128-GCM under the session key |
//! | Server → client datagram | [`ServerReply`] | `Quiz`/`InitiateSecret` in the clear, `Sealed` otherwise |
//! | Sealed payload | [`SessionPayload`] | AES-128-GCM under a session or ticket key |
//!
//! A forwarded ticket travels peer to peer as `ServerReply::Sealed`, so a
//! client decodes server pushes and introductions through one path.
//!
//! ## Security Limits
//!
//! - `MAX_DATAGRAM_SIZE`: receive buffer and deserialization limit (64 KiB)
//! - All decoding goes through [`decode`], which enforces the limit and
//!   rejects trailing bytes

use std::net::SocketAddr;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::crypto::{random_iv, SessionKey, IV_LEN, SESSION_KEY_LEN};
use crate::error::ProtocolError;

/// Maximum datagram we will read or decode.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
        .with_fixint_encoding()
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(bincode_options().serialize(value)?)
}

/// Deserialize with size bounds enforced.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(bincode_options().deserialize(bytes)?)
}

// ============================================================================
// Client → Server
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// A [`HandshakeMessage`] sealed to the server's public key.
    Asym { user: String, message: Vec<u8> },
    /// A [`SessionRequest`] sealed under the sender's session key.
    Sym {
        user: String,
        message: Vec<u8>,
        iv: [u8; IV_LEN],
    },
}

impl Envelope {
    pub fn user(&self) -> &str {
        match self {
            Envelope::Asym { user, .. } => user,
            Envelope::Sym { user, .. } => user,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    NowOnline {
        user: String,
    },
    QuizResponse {
        answer: i64,
        /// Fixed-width encoding of the client's DH public value.
        pub_key: Vec<u8>,
    },
    Complete {
        /// SHA-384 confirmation over `gpowbw ‖ S`.
        hash: Vec<u8>,
    },
}

/// Requests a sessioned client sends under its session key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRequest {
    List {
        nonce: u64,
        issued_at_ms: u64,
    },
    Talk {
        user: String,
        nonce: u64,
        issued_at_ms: u64,
    },
    /// Log out: the server drops the session and confirms with a disconnect notice.
    Disconnect {
        nonce: u64,
        issued_at_ms: u64,
    },
}

impl SessionRequest {
    pub fn nonce(&self) -> u64 {
        match self {
            SessionRequest::List { nonce, .. }
            | SessionRequest::Talk { nonce, .. }
            | SessionRequest::Disconnect { nonce, .. } => *nonce,
        }
    }

    pub fn issued_at_ms(&self) -> u64 {
        match self {
            SessionRequest::List { issued_at_ms, .. }
            | SessionRequest::Talk { issued_at_ms, .. }
            | SessionRequest::Disconnect { issued_at_ms, .. } => *issued_at_ms,
        }
    }
}

// ============================================================================
// Server → Client
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerReply {
    Quiz {
        challenge: Vec<u8>,
        answer: [u8; 32],
    },
    InitiateSecret {
        /// SHA-256 over `gpowbw ‖ S`, proving the server holds the verifier.
        hash: [u8; 32],
        pub_key: Vec<u8>,
    },
    /// A [`SessionPayload`] sealed under a session key or a ticket key.
    Sealed {
        message: Vec<u8>,
        iv: [u8; IV_LEN],
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPayload {
    /// Response to `List`; echoes the request nonce plus one.
    Users { users: Vec<String>, nonce: u64 },
    /// Response to `Talk`: the ticket key, the ticket sealed for the peer,
    /// and where to deliver it.
    Grant {
        key: [u8; SESSION_KEY_LEN],
        nonce: u64,
        ticket: Vec<u8>,
        ticket_iv: [u8; IV_LEN],
        address: SocketAddr,
    },
    /// The recipient's session has ended.
    Disconnect { nonce: u64, issued_at_ms: u64 },
    /// Ticket contents: `user` at `address` wants to talk using `key`.
    TalkTo {
        key: [u8; SESSION_KEY_LEN],
        nonce: u64,
        issued_at_ms: u64,
        user: String,
        address: SocketAddr,
    },
}

// ============================================================================
// Sealing
// ============================================================================

/// Seal a request from `user` under its session key.
pub fn seal_request(key: &SessionKey, user: &str, request: &SessionRequest) -> Result<Vec<u8>, ProtocolError> {
    let iv = random_iv()?;
    let message = key.seal(&iv, &encode(request)?)?;
    encode(&Envelope::Sym { user: user.to_owned(), message, iv })
}

pub fn seal_payload(key: &SessionKey, payload: &SessionPayload) -> Result<ServerReply, ProtocolError> {
    let iv = random_iv()?;
    let message = key.seal(&iv, &encode(payload)?)?;
    Ok(ServerReply::Sealed { message, iv })
}

pub fn open_payload(key: &SessionKey, message: &[u8], iv: &[u8; IV_LEN]) -> Result<SessionPayload, ProtocolError> {
    decode(&key.open(iv, message)?)
}
