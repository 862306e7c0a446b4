//! # Ticket-Granting Exchange
//!
//! Introduces two sessioned clients so they can talk directly.
//!
//! 1. A sends `Talk { user: B }` under its session key.
//! 2. The server mints a fresh key `K` and builds
//!    - `T = Enc(key_B, TalkTo { K, nonce, A, addr(A) })`, the ticket
//!    - `R = Enc(key_A, Grant { K, nonce + 1, T, iv_T, addr(B) })`, the response
//! 3. A forwards `T` with `iv_T` to `addr(B)`; B opens it with its own
//!    session key and learns `K` and where A is.
//!
//! The server never sees traffic protected by `K`.

use std::net::SocketAddr;

use crate::crypto::{random_iv, random_nonce, SessionKey, IV_LEN};
use crate::error::ProtocolError;
use crate::messages::{encode, open_payload, seal_payload, ServerReply, SessionPayload};
use crate::registry::Session;

/// Mint `K`, seal the ticket for `target`, and seal the grant for the
/// requester. Returns the reply to send to the requester.
pub fn mint_introduction(
    requester: &str,
    requester_session: &Session,
    target_session: &Session,
    request_nonce: u64,
    now_ms: u64,
) -> Result<ServerReply, ProtocolError> {
    let key = SessionKey::generate()?;

    let ticket_payload = SessionPayload::TalkTo {
        key: *key.as_bytes(),
        nonce: random_nonce()?,
        issued_at_ms: now_ms,
        user: requester.to_owned(),
        address: requester_session.address,
    };
    let ticket_iv = random_iv()?;
    let ticket = target_session.key.seal(&ticket_iv, &encode(&ticket_payload)?)?;

    let grant = SessionPayload::Grant {
        key: *key.as_bytes(),
        nonce: request_nonce.wrapping_add(1),
        ticket,
        ticket_iv,
        address: target_session.address,
    };
    seal_payload(&requester_session.key, &grant)
}

/// What the requester learns from a grant.
#[derive(Debug)]
pub struct TalkGrant {
    pub key: SessionKey,
    pub ticket: Vec<u8>,
    pub ticket_iv: [u8; IV_LEN],
    pub address: SocketAddr,
}

impl TalkGrant {
    /// Accept a decrypted grant only if it answers the request with `request_nonce`.
    pub fn from_payload(payload: SessionPayload, request_nonce: u64) -> Result<Self, ProtocolError> {
        match payload {
            SessionPayload::Grant { key, nonce, ticket, ticket_iv, address } => {
                if nonce != request_nonce.wrapping_add(1) {
                    return Err(ProtocolError::ReplayDetected);
                }
                Ok(Self {
                    key: SessionKey::from_bytes(key),
                    ticket,
                    ticket_iv,
                    address,
                })
            }
            _ => Err(ProtocolError::Malformed("expected a talk grant")),
        }
    }

    /// The datagram that delivers the ticket to the peer.
    pub fn delivery(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(&ServerReply::Sealed {
            message: self.ticket.clone(),
            iv: self.ticket_iv,
        })
    }
}

/// What the addressee learns from a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introduction {
    pub peer: String,
    pub address: SocketAddr,
    pub key: SessionKey,
    pub nonce: u64,
    pub issued_at_ms: u64,
}

impl Introduction {
    pub fn from_payload(payload: SessionPayload) -> Result<Self, ProtocolError> {
        match payload {
            SessionPayload::TalkTo { key, nonce, issued_at_ms, user, address } => Ok(Self {
                peer: user,
                address,
                key: SessionKey::from_bytes(key),
                nonce,
                issued_at_ms,
            }),
            _ => Err(ProtocolError::Malformed("expected a ticket")),
        }
    }
}

/// Decrypt a forwarded ticket with the addressee's own session key.
pub fn open_ticket(own_key: &SessionKey, ticket: &[u8], ticket_iv: &[u8; IV_LEN]) -> Result<Introduction, ProtocolError> {
    Introduction::from_payload(open_payload(own_key, ticket, ticket_iv)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(port: u16) -> Session {
        Session {
            key: SessionKey::generate().unwrap(),
            address: SocketAddr::from(([127, 0, 0, 1], port)),
            established_at_ms: 0,
        }
    }

    fn grant_for(alice: &Session, bob: &Session, nonce: u64) -> TalkGrant {
        let ServerReply::Sealed { message, iv } = mint_introduction("alice", alice, bob, nonce, 1_000).unwrap() else {
            panic!("expected sealed reply");
        };
        TalkGrant::from_payload(open_payload(&alice.key, &message, &iv).unwrap(), nonce).unwrap()
    }

    #[test]
    fn test_introduction_delivers_same_key_to_both() {
        let alice = session(4001);
        let bob = session(4002);

        let grant = grant_for(&alice, &bob, 10);
        assert_eq!(grant.address, bob.address);

        let intro = open_ticket(&bob.key, &grant.ticket, &grant.ticket_iv).unwrap();
        assert_eq!(intro.peer, "alice");
        assert_eq!(intro.address, alice.address);
        assert_eq!(intro.key, grant.key);
        assert_eq!(intro.issued_at_ms, 1_000);
    }

    #[test]
    fn test_ticket_only_opens_for_addressee() {
        let alice = session(4001);
        let bob = session(4002);
        let grant = grant_for(&alice, &bob, 10);

        assert_eq!(
            open_ticket(&alice.key, &grant.ticket, &grant.ticket_iv),
            Err(ProtocolError::Decryption)
        );
    }

    #[test]
    fn test_grant_only_opens_for_requester() {
        let alice = session(4001);
        let bob = session(4002);
        let ServerReply::Sealed { message, iv } = mint_introduction("alice", &alice, &bob, 3, 0).unwrap() else {
            panic!("expected sealed reply");
        };
        assert_eq!(open_payload(&bob.key, &message, &iv), Err(ProtocolError::Decryption));
    }

    #[test]
    fn test_grant_with_wrong_nonce_rejected() {
        let alice = session(4001);
        let bob = session(4002);
        let ServerReply::Sealed { message, iv } = mint_introduction("alice", &alice, &bob, 3, 0).unwrap() else {
            panic!("expected sealed reply");
        };
        let payload = open_payload(&alice.key, &message, &iv).unwrap();
        assert!(matches!(TalkGrant::from_payload(payload, 4), Err(ProtocolError::ReplayDetected)));
    }

    #[test]
    fn test_delivery_carries_ticket_and_iv() {
        let alice = session(4001);
        let bob = session(4002);
        let grant = grant_for(&alice, &bob, u64::MAX);

        let delivered: ServerReply = crate::messages::decode(&grant.delivery().unwrap()).unwrap();
        let ServerReply::Sealed { message, iv } = delivered else {
            panic!("expected sealed delivery");
        };
        assert_eq!(open_ticket(&bob.key, &message, &iv).unwrap().peer, "alice");
    }

    #[test]
    fn test_fresh_key_per_introduction() {
        let alice = session(4001);
        let bob = session(4002);
        assert_ne!(grant_for(&alice, &bob, 1).key, grant_for(&alice, &bob, 2).key);
    }
}
