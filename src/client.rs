//! # Client Driver
//!
//! Runs a [`ClientHandshake`] over a [`Datagram`] socket, then exposes the
//! post-login operations: listing users, requesting introductions, logging
//! out, and receiving pushes (disconnect notices and forwarded tickets).
//!
//! Every receive is bounded by `recv_timeout`. Since the server answers
//! failures with silence, a wrong request shows up as
//! [`ProtocolError::Timeout`].
//!
//! Datagrams that arrive while waiting for a specific response but are not
//! that response are kept (up to a bound) and returned later by
//! [`Client::next_inbound`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::crypto::{random_nonce, SessionKey};
use crate::error::ProtocolError;
use crate::handshake::ClientHandshake;
use crate::messages::{decode, open_payload, seal_request, ServerReply, SessionPayload, SessionRequest};
use crate::registry::{now_ms, NonceHistory};
use crate::ticket::{Introduction, TalkGrant};
use crate::transport::{recv_with_timeout, send_with_retry, Datagram, DEFAULT_SEND_RETRIES};

/// Unsolicited datagrams held while waiting for a response.
const MAX_STASHED: usize = 64;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub recv_timeout: Duration,
    pub send_retries: u32,
    /// Freshness window for pushes and tickets.
    pub nonce_window: Duration,
    pub max_nonces: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(5),
            send_retries: DEFAULT_SEND_RETRIES,
            nonce_window: Duration::from_secs(120),
            max_nonces: 10_000,
        }
    }
}

/// Something that arrived without being asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The server ended this session.
    Disconnected,
    /// A peer forwarded a ticket.
    Introduction(Introduction),
}

pub struct Client<T: Datagram = UdpSocket> {
    socket: T,
    server: SocketAddr,
    user: String,
    key: SessionKey,
    config: ClientConfig,
    pushes: NonceHistory,
    stash: VecDeque<(Vec<u8>, SocketAddr)>,
}

impl<T: Datagram> Client<T> {
    /// Run the three-message handshake and return an established client.
    pub async fn connect(
        socket: T,
        server: SocketAddr,
        mut handshake: ClientHandshake,
        config: ClientConfig,
    ) -> Result<Self, ProtocolError> {
        let mut stash = VecDeque::new();

        send_with_retry(&socket, &handshake.hello()?, server, config.send_retries).await?;
        let (challenge, digest) = await_server(&socket, server, config.recv_timeout, &mut stash, |reply| match reply {
            ServerReply::Quiz { challenge, answer } => Some((challenge.clone(), *answer)),
            _ => None,
        })
        .await?;

        let response = handshake.on_quiz(&challenge, &digest)?;
        send_with_retry(&socket, &response, server, config.send_retries).await?;
        let (pub_key, hash) = await_server(&socket, server, config.recv_timeout, &mut stash, |reply| match reply {
            ServerReply::InitiateSecret { hash, pub_key } => Some((pub_key.clone(), *hash)),
            _ => None,
        })
        .await?;

        let (complete, key) = handshake.on_initiate_secret(&pub_key, &hash)?;
        send_with_retry(&socket, &complete, server, config.send_retries).await?;
        info!(user = %handshake.user(), server = %server, "logged in");

        let capacity = NonZeroUsize::new(config.max_nonces).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            socket,
            server,
            user: handshake.user().to_owned(),
            key,
            pushes: NonceHistory::new(config.nonce_window, capacity),
            config,
            stash,
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        Ok(self.socket.local_addr()?)
    }

    async fn send_request(&self, request: &SessionRequest) -> Result<(), ProtocolError> {
        let bytes = seal_request(&self.key, &self.user, request)?;
        send_with_retry(&self.socket, &bytes, self.server, self.config.send_retries).await
    }

    /// Wait for a sealed server payload accepted by `select`, stashing the rest.
    async fn await_payload<R>(&mut self, mut select: impl FnMut(&SessionPayload) -> Option<R>) -> Result<R, ProtocolError> {
        let deadline = Instant::now() + self.config.recv_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProtocolError::Timeout);
            }
            let (bytes, from) = recv_with_timeout(&self.socket, remaining).await?;
            let accepted = (from == self.server)
                .then(|| self.open_sealed(&bytes).ok())
                .flatten()
                .and_then(|payload| select(&payload));
            match accepted {
                Some(result) => return Ok(result),
                None => self.stash_datagram(bytes, from),
            }
        }
    }

    fn open_sealed(&self, bytes: &[u8]) -> Result<SessionPayload, ProtocolError> {
        match decode::<ServerReply>(bytes)? {
            ServerReply::Sealed { message, iv } => open_payload(&self.key, &message, &iv),
            _ => Err(ProtocolError::Malformed("expected a sealed payload")),
        }
    }

    fn stash_datagram(&mut self, bytes: Vec<u8>, from: SocketAddr) {
        if self.stash.len() == MAX_STASHED {
            self.stash.pop_front();
        }
        self.stash.push_back((bytes, from));
    }

    /// Ask the server who is online.
    pub async fn list_users(&mut self) -> Result<Vec<String>, ProtocolError> {
        let nonce = random_nonce()?;
        self.send_request(&SessionRequest::List { nonce, issued_at_ms: now_ms() })
            .await?;
        let expected = nonce.wrapping_add(1);
        self.await_payload(|payload| match payload {
            SessionPayload::Users { users, nonce } if *nonce == expected => Some(users.clone()),
            _ => None,
        })
        .await
    }

    /// Ask the server to introduce us to `peer`, then forward the ticket.
    ///
    /// Returns the grant so the caller can talk to the peer with its key.
    pub async fn talk_to(&mut self, peer: &str) -> Result<TalkGrant, ProtocolError> {
        let nonce = random_nonce()?;
        self.send_request(&SessionRequest::Talk {
            user: peer.to_owned(),
            nonce,
            issued_at_ms: now_ms(),
        })
        .await?;

        let expected = nonce.wrapping_add(1);
        let payload = self
            .await_payload(|payload| match payload {
                SessionPayload::Grant { nonce, .. } if *nonce == expected => Some(payload.clone()),
                _ => None,
            })
            .await?;
        let grant = TalkGrant::from_payload(payload, nonce)?;

        send_with_retry(&self.socket, &grant.delivery()?, grant.address, self.config.send_retries).await?;
        debug!(user = %self.user, peer = %peer, address = %grant.address, "ticket forwarded");
        Ok(grant)
    }

    /// Log out and wait for the server to confirm.
    pub async fn disconnect(mut self) -> Result<(), ProtocolError> {
        self.send_request(&SessionRequest::Disconnect { nonce: random_nonce()?, issued_at_ms: now_ms() })
            .await?;
        let (nonce, issued_at_ms) = self
            .await_payload(|payload| match payload {
                SessionPayload::Disconnect { nonce, issued_at_ms } => Some((*nonce, *issued_at_ms)),
                _ => None,
            })
            .await?;
        self.pushes.check_and_record(nonce, issued_at_ms, now_ms())?;
        info!(user = %self.user, "logged out");
        Ok(())
    }

    /// Next pushed notice or forwarded ticket.
    pub async fn next_inbound(&mut self) -> Result<Inbound, ProtocolError> {
        loop {
            let (bytes, from) = match self.stash.pop_front() {
                Some(stashed) => stashed,
                None => recv_with_timeout(&self.socket, self.config.recv_timeout).await?,
            };
            match self.handle_inbound(&bytes) {
                Ok(inbound) => return Ok(inbound),
                Err(e) => trace!(from = %from, error = %e, "ignoring datagram"),
            }
        }
    }

    /// Decode one pushed datagram, checking its nonce against the push history.
    pub fn handle_inbound(&mut self, bytes: &[u8]) -> Result<Inbound, ProtocolError> {
        match self.open_sealed(bytes)? {
            SessionPayload::Disconnect { nonce, issued_at_ms } => {
                self.pushes.check_and_record(nonce, issued_at_ms, now_ms())?;
                info!(user = %self.user, "disconnected by server");
                Ok(Inbound::Disconnected)
            }
            payload @ SessionPayload::TalkTo { .. } => {
                let intro = Introduction::from_payload(payload)?;
                self.pushes
                    .check_and_record(intro.nonce, intro.issued_at_ms, now_ms())?;
                info!(user = %self.user, peer = %intro.peer, address = %intro.address, "introduction received");
                Ok(Inbound::Introduction(intro))
            }
            _ => Err(ProtocolError::UnexpectedState("unsolicited response")),
        }
    }
}

/// Wait until `server` sends a reply accepted by `select`, stashing
/// anything else. The whole wait is bounded by `timeout`.
async fn await_server<T, R>(
    socket: &T,
    server: SocketAddr,
    timeout: Duration,
    stash: &mut VecDeque<(Vec<u8>, SocketAddr)>,
    mut select: impl FnMut(&ServerReply) -> Option<R>,
) -> Result<R, ProtocolError>
where
    T: Datagram + ?Sized,
{
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProtocolError::Timeout);
        }
        let (bytes, from) = recv_with_timeout(socket, remaining).await?;
        if from == server
            && let Ok(reply) = decode::<ServerReply>(&bytes)
            && let Some(selected) = select(&reply)
        {
            return Ok(selected);
        }
        if stash.len() == MAX_STASHED {
            stash.pop_front();
        }
        stash.push_back((bytes, from));
    }
}

impl<T: Datagram> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("user", &self.user)
            .field("server", &self.server)
            .field("stashed", &self.stash.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerifierTable;
    use crate::crypto::test_server_keys;
    use crate::group::DhGroup;
    use crate::messages::{encode, seal_payload};
    use crate::server::{Rendezvous, RendezvousServer, ServerConfig};

    const SALT: &[u8] = b"salt";

    async fn start_server() -> RendezvousServer {
        let group = DhGroup::modp_1536();
        let mut table = VerifierTable::new();
        table.enroll(&group, SALT, "alice", "secret");
        table.enroll(&group, SALT, "bob", "hunter2");
        let config = ServerConfig::default();
        let engine = Rendezvous::new(&config, group, test_server_keys().clone(), table);
        RendezvousServer::bind("127.0.0.1:0", engine, &config).await.unwrap()
    }

    fn config() -> ClientConfig {
        ClientConfig { recv_timeout: Duration::from_secs(3), ..ClientConfig::default() }
    }

    async fn login(server: &RendezvousServer, user: &str, password: &str) -> Result<Client, ProtocolError> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let handshake = ClientHandshake::new(
            DhGroup::modp_1536(),
            test_server_keys().public().clone(),
            user,
            password,
            SALT,
        );
        Client::connect(socket, server.local_addr(), handshake, config()).await
    }

    #[tokio::test]
    async fn test_connect_and_list() {
        let server = start_server().await;
        let mut alice = login(&server, "alice", "secret").await.unwrap();

        assert_eq!(alice.list_users().await.unwrap(), vec!["alice".to_string()]);
        assert_eq!(server.sessions().await, vec!["alice".to_string()]);
        server.quit().await;
    }

    #[tokio::test]
    async fn test_wrong_password_is_authentication_failure() {
        let server = start_server().await;
        let err = login(&server, "alice", "nope").await.unwrap_err();
        assert_eq!(err, ProtocolError::AuthenticationFailed);
        assert_eq!(err.to_string(), "invalid username or password");
        server.quit().await;
    }

    #[tokio::test]
    async fn test_disconnect_removes_session() {
        let server = start_server().await;
        let alice = login(&server, "alice", "secret").await.unwrap();

        alice.disconnect().await.unwrap();
        assert!(server.sessions().await.is_empty());
        server.quit().await;
    }

    #[tokio::test]
    async fn test_connect_times_out_despite_unrelated_server_traffic() {
        let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let fake_addr = fake.local_addr().unwrap();
        let junk = encode(&ServerReply::Sealed { message: vec![0; 32], iv: [0; 12] }).unwrap();
        let chatter = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (_, client) = fake.recv_from(&mut buf).await.unwrap();
            loop {
                let _ = fake.send_to(&junk, client).await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let handshake = ClientHandshake::new(
            DhGroup::modp_1536(),
            test_server_keys().public().clone(),
            "alice",
            "secret",
            SALT,
        );
        let config = ClientConfig { recv_timeout: Duration::from_secs(1), ..ClientConfig::default() };
        let result = tokio::time::timeout(
            Duration::from_secs(4),
            Client::connect(socket, fake_addr, handshake, config),
        )
        .await
        .expect("connect must give up within its receive timeout");

        assert_eq!(result.unwrap_err(), ProtocolError::Timeout);
        chatter.abort();
    }

    #[tokio::test]
    async fn test_replayed_push_is_rejected() {
        let server = start_server().await;
        let mut alice = login(&server, "alice", "secret").await.unwrap();

        let notice = seal_payload(&alice.key, &SessionPayload::Disconnect { nonce: 77, issued_at_ms: now_ms() }).unwrap();
        let bytes = encode(&notice).unwrap();
        assert_eq!(alice.handle_inbound(&bytes).unwrap(), Inbound::Disconnected);
        assert_eq!(alice.handle_inbound(&bytes), Err(ProtocolError::ReplayDetected));
        server.quit().await;
    }

    #[tokio::test]
    async fn test_push_under_foreign_key_is_rejected() {
        let server = start_server().await;
        let mut alice = login(&server, "alice", "secret").await.unwrap();

        let other = SessionKey::generate().unwrap();
        let notice = seal_payload(&other, &SessionPayload::Disconnect { nonce: 1, issued_at_ms: now_ms() }).unwrap();
        assert_eq!(
            alice.handle_inbound(&encode(&notice).unwrap()),
            Err(ProtocolError::Decryption)
        );
        server.quit().await;
    }
}
