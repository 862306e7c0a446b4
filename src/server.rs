//! # Rendezvous Server
//!
//! Two layers:
//!
//! - [`Rendezvous`]: the protocol engine. It owns pending handshakes, the
//!   session registry and every nonce history, and turns one inbound datagram
//!   into zero or more outbound datagrams. It never touches a socket.
//! - [`RendezvousServer`]: a cheap-to-clone handle to an actor task that owns
//!   the socket and the engine, so every state mutation is serialized.
//!
//! ## Dispatch
//!
//! | Envelope | Payload | Effect |
//! |----------|---------|--------|
//! | `Asym` | `NowOnline` | new puzzle, earlier attempt discarded |
//! | `Asym` | `QuizResponse` | puzzle checked, server proof returned |
//! | `Asym` | `Complete` | confirmation checked, session installed |
//! | `Sym` | `List` | sorted usernames, nonce + 1 |
//! | `Sym` | `Talk` | introduction ticket and grant |
//! | `Sym` | `Disconnect` | session removed, disconnect notice returned |
//!
//! Any failure drops the datagram without a reply.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::VerifierStore;
use crate::crypto::{random_nonce, ServerKeys, SessionKey, IV_LEN};
use crate::error::ProtocolError;
use crate::group::DhGroup;
use crate::handshake::ServerHandshake;
use crate::messages::{
    decode, encode, seal_payload, Envelope, HandshakeMessage, ServerReply, SessionPayload, SessionRequest,
    MAX_DATAGRAM_SIZE,
};
use crate::registry::{now_ms, Channel, ReplayGuard, Session, SessionRegistry};
use crate::ticket::mint_introduction;
use crate::transport::{send_with_retry, DEFAULT_SEND_RETRIES};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// How long a login attempt may stay pending.
    pub auth_timeout: Duration,
    /// Freshness window for nonce-tagged requests.
    pub nonce_window: Duration,
    pub max_pending_auth: usize,
    /// Bound on remembered nonces for each user on each channel.
    pub max_nonces: usize,
    pub cleanup_interval: Duration,
    pub send_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(30),
            nonce_window: Duration::from_secs(120),
            max_pending_auth: 10_000,
            max_nonces: 1_000,
            cleanup_interval: Duration::from_secs(10),
            send_retries: DEFAULT_SEND_RETRIES,
        }
    }
}

// ============================================================================
// Protocol Engine
// ============================================================================

/// A datagram the engine wants sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

impl Outbound {
    fn reply(to: SocketAddr, reply: &ServerReply) -> Result<Self, ProtocolError> {
        Ok(Self { to, bytes: encode(reply)? })
    }
}

pub struct Rendezvous<V> {
    keys: ServerKeys,
    handshakes: ServerHandshake,
    sessions: SessionRegistry,
    replay: ReplayGuard,
    verifiers: V,
}

impl<V: VerifierStore> Rendezvous<V> {
    pub fn new(config: &ServerConfig, group: DhGroup, keys: ServerKeys, verifiers: V) -> Self {
        let pending_cap = NonZeroUsize::new(config.max_pending_auth).unwrap_or(NonZeroUsize::MIN);
        let nonce_cap = NonZeroUsize::new(config.max_nonces).unwrap_or(NonZeroUsize::MIN);
        Self {
            keys,
            handshakes: ServerHandshake::new(group, pending_cap, config.auth_timeout),
            sessions: SessionRegistry::new(),
            replay: ReplayGuard::new(config.nonce_window, nonce_cap),
            verifiers,
        }
    }

    /// Process one datagram. Failures are logged and produce no output.
    pub fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) -> Vec<Outbound> {
        match self.dispatch(bytes, from) {
            Ok(out) => out,
            Err(e) => {
                debug!(from = %from, error = %e, "dropping datagram");
                Vec::new()
            }
        }
    }

    fn dispatch(&mut self, bytes: &[u8], from: SocketAddr) -> Result<Vec<Outbound>, ProtocolError> {
        let envelope = decode::<Envelope>(bytes)?;
        // Usernames are case-insensitive everywhere past this point.
        let user = envelope.user().to_lowercase();
        match envelope {
            Envelope::Asym { message, .. } => self.on_handshake(&user, &message, from),
            Envelope::Sym { message, iv, .. } => self.on_request(&user, &message, &iv, from),
        }
    }

    fn on_handshake(&mut self, user: &str, sealed: &[u8], from: SocketAddr) -> Result<Vec<Outbound>, ProtocolError> {
        let message: HandshakeMessage = decode(&self.keys.open(sealed)?)?;
        match message {
            HandshakeMessage::NowOnline { user: claimed } => {
                if claimed.to_lowercase() != user {
                    return Err(ProtocolError::Malformed("envelope user does not match payload"));
                }
                let reply = self.handshakes.on_now_online(user)?;
                debug!(user = %user, from = %from, "now-online");
                Ok(vec![Outbound::reply(from, &reply)?])
            }
            HandshakeMessage::QuizResponse { answer, pub_key } => {
                let reply = self
                    .handshakes
                    .on_quiz_response(user, answer, &pub_key, &self.verifiers)?;
                debug!(user = %user, from = %from, "puzzle accepted");
                Ok(vec![Outbound::reply(from, &reply)?])
            }
            HandshakeMessage::Complete { hash } => {
                let key = self.handshakes.on_complete(user, &hash)?;
                self.promote(user, key, from)
            }
        }
    }

    /// Install a new session, first telling any previous holder it is gone.
    fn promote(&mut self, user: &str, key: SessionKey, address: SocketAddr) -> Result<Vec<Outbound>, ProtocolError> {
        let now = now_ms();
        let mut out = Vec::new();
        if let Some(old) = self.sessions.get(user) {
            info!(user = %user, old = %old.address, new = %address, "evicting previous session");
            out.push(disconnect_notice(&old.key, old.address, now)?);
        }
        self.replay.forget(user);
        self.sessions.install(
            user,
            Session {
                key,
                address,
                established_at_ms: now,
            },
        );
        info!(user = %user, address = %address, sessions = self.sessions.len(), "session established");
        Ok(out)
    }

    fn on_request(
        &mut self,
        user: &str,
        sealed: &[u8],
        iv: &[u8; IV_LEN],
        from: SocketAddr,
    ) -> Result<Vec<Outbound>, ProtocolError> {
        let session = self.sessions.get(user).ok_or(ProtocolError::NoSession)?;
        let request: SessionRequest = decode(&session.key.open(iv, sealed)?)?;

        let now = now_ms();
        let channel = match request {
            SessionRequest::List { .. } => Channel::List,
            SessionRequest::Talk { .. } => Channel::Talk,
            SessionRequest::Disconnect { .. } => Channel::Disconnect,
        };
        self.replay
            .check(channel, user, request.nonce(), request.issued_at_ms(), now)?;

        match request {
            SessionRequest::List { nonce, .. } => {
                let payload = SessionPayload::Users {
                    users: self.sessions.users(),
                    nonce: nonce.wrapping_add(1),
                };
                let reply = seal_payload(&session.key, &payload)?;
                debug!(user = %user, "list served");
                Ok(vec![Outbound::reply(from, &reply)?])
            }
            SessionRequest::Talk { user: target, nonce, .. } => {
                let target = target.to_lowercase();
                let Some(target_session) = self.sessions.get(&target) else {
                    debug!(user = %user, target = %target, "introduction target has no session");
                    return Err(ProtocolError::NoSession);
                };
                let reply = mint_introduction(user, session, target_session, nonce, now)?;
                info!(user = %user, target = %target, "introduction granted");
                Ok(vec![Outbound::reply(from, &reply)?])
            }
            SessionRequest::Disconnect { .. } => {
                let removed = self.sessions.remove(user).ok_or(ProtocolError::NoSession)?;
                self.replay.forget(user);
                info!(user = %user, sessions = self.sessions.len(), "session closed by client");
                Ok(vec![disconnect_notice(&removed.key, from, now)?])
            }
        }
    }

    /// Reap expired handshakes and nonces.
    pub fn cleanup(&mut self) {
        let reaped = self.handshakes.reap_expired();
        let expired = self.replay.expire(now_ms());
        if reaped > 0 || expired > 0 {
            debug!(reaped, expired, nonces = self.replay.len(), "cleanup");
        }
    }

    /// Registered usernames, sorted.
    pub fn sessions(&self) -> Vec<String> {
        self.sessions.users()
    }

    pub fn session(&self, user: &str) -> Option<&Session> {
        self.sessions.get(user)
    }

    pub fn pending_auth(&self) -> usize {
        self.handshakes.pending()
    }
}

fn disconnect_notice(key: &SessionKey, to: SocketAddr, now: u64) -> Result<Outbound, ProtocolError> {
    let payload = SessionPayload::Disconnect {
        nonce: random_nonce()?,
        issued_at_ms: now,
    };
    Outbound::reply(to, &seal_payload(key, &payload)?)
}

// ============================================================================
// Actor Commands
// ============================================================================

enum ServerCommand {
    Sessions { reply: oneshot::Sender<Vec<String>> },
    PendingAuth { reply: oneshot::Sender<usize> },
    Quit,
}

// ============================================================================
// RendezvousServer Handle (cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct RendezvousServer {
    cmd_tx: mpsc::Sender<ServerCommand>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for RendezvousServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl RendezvousServer {
    /// Bind a UDP socket and spawn the server actor on it.
    pub async fn bind<V>(addr: &str, engine: Rendezvous<V>, config: &ServerConfig) -> Result<Self>
    where
        V: VerifierStore + Send + 'static,
    {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        Self::spawn(socket, engine, config)
    }

    pub fn spawn<V>(socket: UdpSocket, engine: Rendezvous<V>, config: &ServerConfig) -> Result<Self>
    where
        V: VerifierStore + Send + 'static,
    {
        let local_addr = socket.local_addr().context("socket has no local address")?;
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let actor = ServerActor {
            socket,
            engine,
            cleanup_interval: config.cleanup_interval,
            send_retries: config.send_retries,
        };
        tokio::spawn(actor.run(cmd_rx));
        info!(addr = %local_addr, "rendezvous server started");

        Ok(Self { cmd_tx, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Usernames with a live session.
    pub async fn sessions(&self) -> Vec<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(ServerCommand::Sessions { reply: reply_tx }).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Login attempts still waiting for their next message.
    pub async fn pending_auth(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(ServerCommand::PendingAuth { reply: reply_tx }).await.is_err() {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(ServerCommand::Quit).await;
    }
}

// ============================================================================
// Server Actor (owns socket and engine, processes datagrams sequentially)
// ============================================================================

struct ServerActor<V> {
    socket: UdpSocket,
    engine: Rendezvous<V>,
    cleanup_interval: Duration,
    send_retries: u32,
}

impl<V: VerifierStore> ServerActor<V> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ServerCommand>) {
        let mut cleanup_interval = tokio::time::interval(self.cleanup_interval);
        cleanup_interval.tick().await;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ServerCommand::Sessions { reply }) => {
                            let _ = reply.send(self.engine.sessions());
                        }
                        Some(ServerCommand::PendingAuth { reply }) => {
                            let _ = reply.send(self.engine.pending_auth());
                        }
                        Some(ServerCommand::Quit) | None => {
                            debug!("rendezvous actor shutting down");
                            break;
                        }
                    }
                }

                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            let outbound = self.engine.handle_datagram(&buf[..len], from);
                            send_all(&self.socket, outbound, self.send_retries).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "receive failed");
                        }
                    }
                }

                _ = cleanup_interval.tick() => {
                    self.engine.cleanup();
                }
            }
        }
    }

}

async fn send_all(socket: &UdpSocket, outbound: Vec<Outbound>, retries: u32) {
    for datagram in outbound {
        if let Err(e) = send_with_retry(socket, &datagram.bytes, datagram.to, retries).await {
            warn!(to = %datagram.to, error = %e, "dropping reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerifierTable;
    use crate::crypto::test_server_keys;
    use crate::handshake::{ClientHandshake, ClientState};
    use crate::messages::{open_payload, seal_request};
    use crate::ticket::{open_ticket, TalkGrant};

    const SALT: &[u8] = b"salt";

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn engine() -> Rendezvous<VerifierTable> {
        engine_with(&ServerConfig::default())
    }

    fn engine_with(config: &ServerConfig) -> Rendezvous<VerifierTable> {
        let group = DhGroup::modp_1536();
        let mut table = VerifierTable::new();
        table.enroll(&group, SALT, "alice", "secret");
        table.enroll(&group, SALT, "bob", "hunter2");
        Rendezvous::new(config, group, test_server_keys().clone(), table)
    }

    fn single(out: Vec<Outbound>) -> Outbound {
        assert_eq!(out.len(), 1, "expected exactly one datagram, got {:?}", out);
        out.into_iter().next().unwrap()
    }

    /// Drive a full handshake through the engine; returns the client's key
    /// and whatever the engine emitted on completion.
    fn login(
        engine: &mut Rendezvous<VerifierTable>,
        user: &str,
        password: &str,
        from: SocketAddr,
    ) -> Result<(SessionKey, Vec<Outbound>), ProtocolError> {
        let mut client = ClientHandshake::new(
            DhGroup::modp_1536(),
            test_server_keys().public().clone(),
            user,
            password,
            SALT,
        );

        let quiz = single(engine.handle_datagram(&client.hello()?, from));
        let ServerReply::Quiz { challenge, answer } = decode(&quiz.bytes)? else {
            panic!("expected quiz");
        };
        let response = client.on_quiz(&challenge, &answer)?;

        let out = engine.handle_datagram(&response, from);
        if out.is_empty() {
            return Err(ProtocolError::UnknownUser);
        }
        let ServerReply::InitiateSecret { hash, pub_key } = decode(&single(out).bytes)? else {
            panic!("expected initiate secret");
        };
        let (complete, key) = client.on_initiate_secret(&pub_key, &hash)?;
        assert_eq!(client.state(), ClientState::Established);
        Ok((key, engine.handle_datagram(&complete, from)))
    }

    fn request(engine: &mut Rendezvous<VerifierTable>, key: &SessionKey, user: &str, req: &SessionRequest, from: SocketAddr) -> Vec<Outbound> {
        engine.handle_datagram(&seal_request(key, user, req).unwrap(), from)
    }

    fn open(key: &SessionKey, out: &Outbound) -> SessionPayload {
        let ServerReply::Sealed { message, iv } = decode(&out.bytes).unwrap() else {
            panic!("expected sealed reply");
        };
        open_payload(key, &message, &iv).unwrap()
    }

    #[test]
    fn test_login_installs_session() {
        let mut engine = engine();
        let (key, out) = login(&mut engine, "alice", "secret", addr(5001)).unwrap();

        assert!(out.is_empty());
        let session = engine.session("alice").unwrap();
        assert_eq!(session.key, key);
        assert_eq!(session.address, addr(5001));
        assert_eq!(engine.pending_auth(), 0);
    }

    #[test]
    fn test_wrong_password_leaves_no_session() {
        let mut engine = engine();
        assert_eq!(
            login(&mut engine, "alice", "wrong", addr(5001)).unwrap_err(),
            ProtocolError::AuthenticationFailed
        );
        assert!(engine.sessions().is_empty());
    }

    #[test]
    fn test_unknown_user_gets_no_reply() {
        let mut engine = engine();
        assert_eq!(
            login(&mut engine, "mallory", "secret", addr(5001)).unwrap_err(),
            ProtocolError::UnknownUser
        );
        assert_eq!(engine.pending_auth(), 1);
    }

    #[test]
    fn test_list_returns_sorted_users_and_incremented_nonce() {
        let mut engine = engine();
        let (bob_key, _) = login(&mut engine, "bob", "hunter2", addr(5002)).unwrap();
        let (alice_key, _) = login(&mut engine, "alice", "secret", addr(5001)).unwrap();

        let req = SessionRequest::List { nonce: 41, issued_at_ms: now_ms() };
        let reply = single(request(&mut engine, &alice_key, "alice", &req, addr(5001)));
        assert_eq!(reply.to, addr(5001));
        assert_eq!(
            open(&alice_key, &reply),
            SessionPayload::Users { users: vec!["alice".into(), "bob".into()], nonce: 42 }
        );

        let req = SessionRequest::List { nonce: 7, issued_at_ms: now_ms() };
        let reply = single(request(&mut engine, &bob_key, "bob", &req, addr(5002)));
        assert!(matches!(open(&bob_key, &reply), SessionPayload::Users { nonce: 8, .. }));
    }

    #[test]
    fn test_replayed_request_is_dropped() {
        let mut engine = engine();
        let (key, _) = login(&mut engine, "alice", "secret", addr(5001)).unwrap();

        let datagram = seal_request(&key, "alice", &SessionRequest::List { nonce: 1, issued_at_ms: now_ms() }).unwrap();
        assert_eq!(engine.handle_datagram(&datagram, addr(5001)).len(), 1);
        assert!(engine.handle_datagram(&datagram, addr(5001)).is_empty());
    }

    #[test]
    fn test_stale_request_is_dropped() {
        let mut engine = engine();
        let (key, _) = login(&mut engine, "alice", "secret", addr(5001)).unwrap();

        let stale = now_ms() - 10 * 60 * 1000;
        let req = SessionRequest::List { nonce: 1, issued_at_ms: stale };
        assert!(request(&mut engine, &key, "alice", &req, addr(5001)).is_empty());
    }

    #[test]
    fn test_relogin_evicts_with_single_disconnect_notice() {
        let mut engine = engine();
        let (old_key, _) = login(&mut engine, "alice", "secret", addr(5001)).unwrap();
        let (new_key, out) = login(&mut engine, "alice", "secret", addr(6001)).unwrap();

        let notice = single(out);
        assert_eq!(notice.to, addr(5001));
        assert!(matches!(open(&old_key, &notice), SessionPayload::Disconnect { .. }));
        assert_eq!(engine.session("alice").unwrap().address, addr(6001));

        // Traffic under the old key no longer decrypts.
        let req = SessionRequest::List { nonce: 5, issued_at_ms: now_ms() };
        assert!(request(&mut engine, &old_key, "alice", &req, addr(5001)).is_empty());
        assert_eq!(request(&mut engine, &new_key, "alice", &req, addr(6001)).len(), 1);
    }

    #[test]
    fn test_full_nonce_history_does_not_block_other_users() {
        let mut engine = engine_with(&ServerConfig { max_nonces: 4, ..ServerConfig::default() });
        let (bob_key, _) = login(&mut engine, "bob", "hunter2", addr(5002)).unwrap();
        let (alice_key, _) = login(&mut engine, "alice", "secret", addr(5001)).unwrap();

        for nonce in 0..4 {
            let req = SessionRequest::List { nonce, issued_at_ms: now_ms() };
            assert_eq!(request(&mut engine, &bob_key, "bob", &req, addr(5002)).len(), 1);
        }
        let req = SessionRequest::List { nonce: 4, issued_at_ms: now_ms() };
        assert!(request(&mut engine, &bob_key, "bob", &req, addr(5002)).is_empty());

        let req = SessionRequest::List { nonce: 1_000, issued_at_ms: now_ms() };
        assert_eq!(request(&mut engine, &alice_key, "alice", &req, addr(5001)).len(), 1);
    }

    #[test]
    fn test_usernames_are_case_insensitive() {
        let mut engine = engine();
        let (old_key, _) = login(&mut engine, "ALICE", "secret", addr(5001)).unwrap();
        assert_eq!(engine.sessions(), vec!["alice".to_string()]);

        let (new_key, out) = login(&mut engine, "alice", "secret", addr(6001)).unwrap();
        assert!(matches!(open(&old_key, &single(out)), SessionPayload::Disconnect { .. }));
        assert_eq!(engine.sessions(), vec!["alice".to_string()]);

        let (bob_key, _) = login(&mut engine, "bob", "hunter2", addr(5002)).unwrap();
        let req = SessionRequest::Talk { user: "Alice".into(), nonce: 11, issued_at_ms: now_ms() };
        let reply = single(request(&mut engine, &bob_key, "Bob", &req, addr(5002)));
        let grant = TalkGrant::from_payload(open(&bob_key, &reply), 11).unwrap();
        assert_eq!(grant.address, addr(6001));
        assert_eq!(open_ticket(&new_key, &grant.ticket, &grant.ticket_iv).unwrap().peer, "bob");
    }

    #[test]
    fn test_talk_mints_ticket_for_peer() {
        let mut engine = engine();
        let (alice_key, _) = login(&mut engine, "alice", "secret", addr(5001)).unwrap();
        let (bob_key, _) = login(&mut engine, "bob", "hunter2", addr(5002)).unwrap();

        let req = SessionRequest::Talk { user: "bob".into(), nonce: 99, issued_at_ms: now_ms() };
        let reply = single(request(&mut engine, &alice_key, "alice", &req, addr(5001)));
        let grant = TalkGrant::from_payload(open(&alice_key, &reply), 99).unwrap();
        assert_eq!(grant.address, addr(5002));

        let intro = open_ticket(&bob_key, &grant.ticket, &grant.ticket_iv).unwrap();
        assert_eq!(intro.peer, "alice");
        assert_eq!(intro.address, addr(5001));
        assert_eq!(intro.key, grant.key);
    }

    #[test]
    fn test_talk_to_unsessioned_user_is_rejected() {
        let mut engine = engine();
        let (alice_key, _) = login(&mut engine, "alice", "secret", addr(5001)).unwrap();

        let req = SessionRequest::Talk { user: "bob".into(), nonce: 1, issued_at_ms: now_ms() };
        assert!(request(&mut engine, &alice_key, "alice", &req, addr(5001)).is_empty());
    }

    #[test]
    fn test_requests_without_session_are_dropped() {
        let mut engine = engine();
        let key = SessionKey::generate().unwrap();
        let req = SessionRequest::List { nonce: 1, issued_at_ms: now_ms() };
        assert!(request(&mut engine, &key, "alice", &req, addr(5001)).is_empty());
    }

    #[test]
    fn test_disconnect_removes_session_and_confirms() {
        let mut engine = engine();
        let (key, _) = login(&mut engine, "alice", "secret", addr(5001)).unwrap();

        let req = SessionRequest::Disconnect { nonce: 3, issued_at_ms: now_ms() };
        let notice = single(request(&mut engine, &key, "alice", &req, addr(5001)));
        assert!(matches!(open(&key, &notice), SessionPayload::Disconnect { .. }));
        assert!(engine.sessions().is_empty());
    }

    #[test]
    fn test_garbage_datagrams_are_ignored() {
        let mut engine = engine();
        assert!(engine.handle_datagram(b"", addr(1)).is_empty());
        assert!(engine.handle_datagram(&[0xFF; 64], addr(1)).is_empty());

        let bogus = encode(&Envelope::Asym { user: "alice".into(), message: vec![0; 128] }).unwrap();
        assert!(engine.handle_datagram(&bogus, addr(1)).is_empty());
    }

    #[tokio::test]
    async fn test_actor_reports_state_and_quits() {
        let server = RendezvousServer::bind("127.0.0.1:0", engine(), &ServerConfig::default())
            .await
            .unwrap();
        assert!(server.sessions().await.is_empty());
        assert_eq!(server.pending_auth().await, 0);

        server.quit().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.sessions().await.is_empty());
    }
}
