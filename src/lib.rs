//! # Tessera - Password-Authenticated Rendezvous
//!
//! Tessera lets clients log in to a rendezvous server with a password the
//! server never stores, then asks the server to introduce them to each other
//! with Kerberos-style tickets:
//!
//! - **Puzzle**: a proof-of-work gate in front of every login attempt
//! - **Handshake**: Diffie-Hellman augmented with a password verifier, with
//!   mutual proof of password knowledge
//! - **Sessions**: a per-user AES-128-GCM key and address on the server
//! - **Tickets**: a fresh key for two sessioned clients, sealed separately for each
//!
//! ## Architecture
//!
//! The protocol engines are sans-IO: they consume decoded datagrams and
//! return datagrams to send. [`RendezvousServer`] wraps the server engine in
//! an actor that owns the socket and all mutable state, so mutations are
//! processed sequentially. [`Client`] drives the client engine over any
//! [`Datagram`] socket with bounded receives.
//!
//! ## Security Model
//!
//! - The server stores only `v = g^H(password ‖ salt) mod p`
//! - Handshake messages are sealed to the server's RSA key (OAEP-SHA256)
//! - Failures are never reported on the wire; the peer times out
//! - Every sealed request and push carries a nonce and timestamp checked
//!   against a bounded, time-windowed history
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `group` | Diffie-Hellman arithmetic over a safe-prime group |
//! | `crypto` | RSA-OAEP, AES-128-GCM, transcript hashes, key derivation |
//! | `puzzle` | Proof-of-work issue, solve and verify |
//! | `handshake` | Client and server handshake state machines |
//! | `registry` | Session registry and nonce histories |
//! | `ticket` | Introduction tickets |
//! | `messages` | Wire types and bounded serialization |
//! | `server` | Protocol engine and actor handle |
//! | `client` | Async client driver |
//! | `transport` | Datagram trait, retrying send, bounded receive |
//! | `config` | Group parameters and verifier table |

mod client;
mod config;
mod crypto;
mod error;
mod group;
mod handshake;
mod messages;
mod puzzle;
mod registry;
mod server;
mod ticket;
mod transport;

pub use client::{Client, ClientConfig, Inbound};
pub use config::{enroll, GroupConfig, VerifierStore, VerifierTable};
pub use crypto::{ServerKeys, ServerPublicKey, SessionKey, DEFAULT_RSA_BITS};
pub use error::{ProtocolError, Result};
pub use group::{DhGroup, DhKeypair};
pub use handshake::{AuthState, ClientHandshake, ClientState, ServerHandshake};
pub use messages::{Envelope, HandshakeMessage, ServerReply, SessionPayload, SessionRequest};
pub use puzzle::{solve as solve_puzzle, Puzzle};
pub use registry::{Channel, NonceHistory, Session, SessionRegistry};
pub use server::{Outbound, Rendezvous, RendezvousServer, ServerConfig};
pub use ticket::{open_ticket, Introduction, TalkGrant};
pub use transport::Datagram;
