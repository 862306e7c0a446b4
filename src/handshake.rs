//! # Three-Message Password Handshake
//!
//! Client and server state machines for the puzzle-gated, verifier-augmented
//! Diffie-Hellman exchange. Neither side touches a socket here: every step
//! consumes a decoded message and returns the bytes or reply to send.
//!
//! ```text
//! Client                                   Server
//!   | --- Asym{NowOnline} ----------------> |  issue puzzle, store target t
//!   | <-- Quiz{challenge, digest} --------- |
//!   |   solve puzzle, fresh DH keypair      |
//!   | --- Asym{QuizResponse{x, A}} -------> |  check x == t, fresh DH keypair,
//!   |                                       |  S = A^b, gpowbw = B^v
//!   | <-- InitiateSecret{H256, B} --------- |
//!   |   S = B^a, gpowbw = B^pw_secret       |
//!   |   check H256, send H384               |
//!   | --- Asym{Complete{H384}} -----------> |  check H384, promote to session
//! ```
//!
//! `H256` and `H384` are computed over the fixed-width encodings of `gpowbw`
//! and `S`. The session key is derived from the fixed-width `S`.
//!
//! ## Failure handling
//!
//! Every verification failure on the server deletes the pending record and
//! returns an error that the caller turns into "no reply". The one exception
//! is an unknown username at the quiz-response step: the record is left for
//! the periodic reaper, so the timing of that path does not differ from a
//! solved puzzle waiting for `complete`.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use num_bigint::BigUint;
use subtle::ConstantTimeEq;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::config::VerifierStore;
use crate::crypto::{client_confirmation, server_proof, ServerPublicKey, SessionKey, CONFIRMATION_LEN};
use crate::error::ProtocolError;
use crate::group::{DhGroup, DhKeypair};
use crate::messages::{encode, Envelope, HandshakeMessage, ServerReply};
use crate::puzzle::{self, Puzzle};

// ============================================================================
// Client
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Init,
    HelloSent,
    PuzzleSolving,
    ResponseSent,
    SecretPending,
    Established,
    Failed,
}

/// Client side of one login attempt. A new attempt needs a new instance.
pub struct ClientHandshake {
    user: String,
    group: DhGroup,
    server_key: ServerPublicKey,
    password_secret: BigUint,
    keypair: Option<DhKeypair>,
    state: ClientState,
}

impl ClientHandshake {
    pub fn new(group: DhGroup, server_key: ServerPublicKey, user: &str, password: &str, salt: &[u8]) -> Self {
        let password_secret = group.password_secret(password.as_bytes(), salt);
        Self {
            user: user.to_owned(),
            group,
            server_key,
            password_secret,
            keypair: None,
            state: ClientState::Init,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    fn expect_state(&self, expected: ClientState) -> Result<(), ProtocolError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedState("client handshake out of order"))
        }
    }

    fn seal(&self, message: &HandshakeMessage) -> Result<Vec<u8>, ProtocolError> {
        let sealed = self.server_key.seal(&encode(message)?)?;
        encode(&Envelope::Asym { user: self.user.clone(), message: sealed })
    }

    /// Build the `now-online` datagram.
    pub fn hello(&mut self) -> Result<Vec<u8>, ProtocolError> {
        self.expect_state(ClientState::Init)?;
        let bytes = self.seal(&HandshakeMessage::NowOnline { user: self.user.clone() })?;
        self.state = ClientState::HelloSent;
        Ok(bytes)
    }

    /// Solve the puzzle and build the `quiz-response` datagram.
    pub fn on_quiz(&mut self, challenge: &[u8], digest: &[u8; 32]) -> Result<Vec<u8>, ProtocolError> {
        self.expect_state(ClientState::HelloSent)?;
        self.state = ClientState::PuzzleSolving;

        let answer = match puzzle::solve(challenge, digest) {
            Ok(answer) => answer,
            Err(e) => {
                self.state = ClientState::Failed;
                return Err(e);
            }
        };
        trace!(user = %self.user, answer, "puzzle solved");

        let keypair = self.group.generate_keypair();
        let bytes = self.seal(&HandshakeMessage::QuizResponse {
            answer,
            pub_key: self.group.encode(keypair.public()),
        })?;
        self.keypair = Some(keypair);
        self.state = ClientState::ResponseSent;
        Ok(bytes)
    }

    /// Check the server's proof, then build the `complete` datagram and
    /// derive the session key.
    pub fn on_initiate_secret(&mut self, pub_key: &[u8], hash: &[u8; 32]) -> Result<(Vec<u8>, SessionKey), ProtocolError> {
        self.expect_state(ClientState::ResponseSent)?;
        self.state = ClientState::SecretPending;

        match self.finish(pub_key, hash) {
            Ok(done) => {
                self.state = ClientState::Established;
                self.keypair = None;
                debug!(user = %self.user, "handshake established");
                Ok(done)
            }
            Err(e) => {
                self.state = ClientState::Failed;
                self.keypair = None;
                Err(e)
            }
        }
    }

    fn finish(&self, pub_key: &[u8], hash: &[u8; 32]) -> Result<(Vec<u8>, SessionKey), ProtocolError> {
        let keypair = self
            .keypair
            .as_ref()
            .ok_or(ProtocolError::UnexpectedState("no client keypair"))?;
        let server_public = self.group.decode_public(pub_key)?;

        let secret = Zeroizing::new(self.group.encode(&self.group.shared_secret(keypair, &server_public)?));
        let gpowbw = Zeroizing::new(
            self.group
                .encode(&self.group.weighted_power(&server_public, &self.password_secret)),
        );

        let expected = server_proof(&gpowbw, &secret);
        if !bool::from(expected[..].ct_eq(&hash[..])) {
            return Err(ProtocolError::AuthenticationFailed);
        }

        let confirmation = client_confirmation(&gpowbw, &secret);
        let bytes = self.seal(&HandshakeMessage::Complete { hash: confirmation.to_vec() })?;
        Ok((bytes, SessionKey::derive(&secret)))
    }
}

impl std::fmt::Debug for ClientHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandshake")
            .field("user", &self.user)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Server
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    /// Puzzle issued, waiting for `quiz-response`.
    QuizIssued,
    /// Puzzle solved and proof sent, waiting for `complete`.
    ResponseVerified,
}

/// Server-side state of one in-flight login attempt.
pub struct AuthRecord {
    puzzle_target: i64,
    solved: bool,
    shared_secret: Option<Zeroizing<Vec<u8>>>,
    confirmation: Option<[u8; CONFIRMATION_LEN]>,
    created_at: Instant,
}

impl AuthRecord {
    fn new(puzzle_target: i64) -> Self {
        Self {
            puzzle_target,
            solved: false,
            shared_secret: None,
            confirmation: None,
            created_at: Instant::now(),
        }
    }

    pub fn state(&self) -> AuthState {
        if self.confirmation.is_some() {
            AuthState::ResponseVerified
        } else {
            AuthState::QuizIssued
        }
    }

    pub fn puzzle_solved(&self) -> bool {
        self.solved
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl std::fmt::Debug for AuthRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRecord")
            .field("state", &self.state())
            .field("solved", &self.solved)
            .field("age", &self.age())
            .finish_non_exhaustive()
    }
}

/// Pending login attempts keyed by username, bounded and TTL-reaped.
pub struct ServerHandshake {
    group: DhGroup,
    records: LruCache<String, AuthRecord>,
    ttl: Duration,
}

impl ServerHandshake {
    pub fn new(group: DhGroup, capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            group,
            records: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn group(&self) -> &DhGroup {
        &self.group
    }

    /// Number of in-flight attempts, including expired ones not yet reaped.
    pub fn pending(&self) -> usize {
        self.records.len()
    }

    pub fn record(&self, user: &str) -> Option<&AuthRecord> {
        self.records.peek(user)
    }

    /// Issue a fresh puzzle, discarding any earlier attempt by `user`.
    pub fn on_now_online(&mut self, user: &str) -> Result<ServerReply, ProtocolError> {
        let puzzle = Puzzle::issue()?;
        self.start(user, puzzle)
    }

    fn start(&mut self, user: &str, puzzle: Puzzle) -> Result<ServerReply, ProtocolError> {
        if let Some((evicted, _)) = self.records.push(user.to_owned(), AuthRecord::new(puzzle.target))
            && evicted != user
        {
            debug!(user = %evicted, "pending handshake evicted at capacity");
        }
        trace!(user = %user, "puzzle issued");
        Ok(ServerReply::Quiz {
            challenge: puzzle.challenge,
            answer: puzzle.digest,
        })
    }

    fn live_record(&mut self, user: &str) -> Result<&mut AuthRecord, ProtocolError> {
        let expired = match self.records.peek(user) {
            None => return Err(ProtocolError::UnexpectedState("no pending handshake")),
            Some(record) => record.created_at.elapsed() >= self.ttl,
        };
        if expired {
            self.records.pop(user);
            return Err(ProtocolError::UnexpectedState("pending handshake expired"));
        }
        self.records
            .get_mut(user)
            .ok_or(ProtocolError::UnexpectedState("no pending handshake"))
    }

    /// Verify the puzzle answer and answer with the server's proof.
    pub fn on_quiz_response<V>(
        &mut self,
        user: &str,
        answer: i64,
        pub_key: &[u8],
        verifiers: &V,
    ) -> Result<ServerReply, ProtocolError>
    where
        V: VerifierStore + ?Sized,
    {
        let group = self.group.clone();
        let record = self.live_record(user)?;
        if record.solved {
            return Err(ProtocolError::UnexpectedState("puzzle already answered"));
        }
        if answer != record.puzzle_target {
            self.records.pop(user);
            return Err(ProtocolError::PuzzleRejected);
        }
        // A bad key leaves the puzzle open for a corrected response.
        let client_public = group.decode_public(pub_key)?;
        record.solved = true;

        let keypair = group.generate_keypair();
        let secret = Zeroizing::new(group.encode(&group.shared_secret(&keypair, &client_public)?));

        let Some(verifier) = verifiers.verifier(user) else {
            record.shared_secret = Some(secret);
            return Err(ProtocolError::UnknownUser);
        };
        let gpowbw = Zeroizing::new(group.encode(&group.weighted_power(keypair.public(), &verifier)));

        let proof = server_proof(&gpowbw, &secret);
        record.confirmation = Some(client_confirmation(&gpowbw, &secret));
        record.shared_secret = Some(secret);

        Ok(ServerReply::InitiateSecret {
            hash: proof,
            pub_key: group.encode(keypair.public()),
        })
    }

    /// Check the client's confirmation. On success the record is consumed
    /// and the session key returned for promotion.
    pub fn on_complete(&mut self, user: &str, hash: &[u8]) -> Result<SessionKey, ProtocolError> {
        let record = self.live_record(user)?;
        let Some(expected) = record.confirmation else {
            return Err(ProtocolError::UnexpectedState("handshake not ready to complete"));
        };
        let matches = bool::from(expected[..].ct_eq(hash));

        let record = self
            .records
            .pop(user)
            .ok_or(ProtocolError::UnexpectedState("no pending handshake"))?;
        if !matches {
            return Err(ProtocolError::AuthenticationFailed);
        }
        let secret = record
            .shared_secret
            .ok_or(ProtocolError::UnexpectedState("no shared secret"))?;
        Ok(SessionKey::derive(&secret))
    }

    /// Drop every attempt older than the TTL. Returns how many were removed.
    pub fn reap_expired(&mut self) -> usize {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|(_, record)| record.created_at.elapsed() >= self.ttl)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &expired {
            self.records.pop(user);
        }
        expired.len()
    }
}
