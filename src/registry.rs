//! # Session Registry and Replay Protection
//!
//! The server's long-lived state after a handshake completes:
//!
//! - [`SessionRegistry`]: username → (session key, address)
//! - [`ReplayGuard`]: one [`NonceHistory`] per [`Channel`] and user
//!
//! ## Nonce freshness
//!
//! Every sealed request or push carries `(nonce, issued_at_ms)`. A message is
//! accepted only when `issued_at_ms` is within the freshness window of the
//! receiver's clock and the nonce has not been recorded on that channel.
//! Recorded nonces are retained for twice the window. Anything old enough to
//! have been expired already fails the freshness check, so a nonce is never
//! accepted twice on the same channel.
//!
//! When a history is full of entries that are still inside their retention
//! period, new messages are rejected rather than evicting live entries.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use tracing::trace;

use crate::crypto::SessionKey;
use crate::error::ProtocolError;

/// Milliseconds since the Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Clone, Debug)]
pub struct Session {
    pub key: SessionKey,
    pub address: SocketAddr,
    pub established_at_ms: u64,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session, returning the one it replaced.
    pub fn install(&mut self, user: &str, session: Session) -> Option<Session> {
        self.sessions.insert(user.to_owned(), session)
    }

    pub fn get(&self, user: &str) -> Option<&Session> {
        self.sessions.get(user)
    }

    pub fn remove(&mut self, user: &str) -> Option<Session> {
        self.sessions.remove(user)
    }

    pub fn contains(&self, user: &str) -> bool {
        self.sessions.contains_key(user)
    }

    /// Registered usernames in ascending order.
    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.sessions.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// ============================================================================
// Nonce History
// ============================================================================

/// Independent replay domains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    List,
    Talk,
    Disconnect,
    /// Server-to-client pushes and forwarded tickets, checked by the client.
    Push,
}

#[derive(Debug)]
pub struct NonceHistory {
    /// nonce → time it was recorded. Never promoted, so LRU order is
    /// insertion order.
    seen: LruCache<u64, u64>,
    window_ms: u64,
}

impl NonceHistory {
    pub fn new(window: Duration, capacity: NonZeroUsize) -> Self {
        Self {
            seen: LruCache::new(capacity),
            window_ms: window.as_millis() as u64,
        }
    }

    fn retention_ms(&self) -> u64 {
        self.window_ms.saturating_mul(2)
    }

    fn is_fresh(&self, issued_at_ms: u64, now_ms: u64) -> bool {
        now_ms.abs_diff(issued_at_ms) < self.window_ms
    }

    /// Accept `nonce` once, if it was issued inside the freshness window.
    pub fn check_and_record(&mut self, nonce: u64, issued_at_ms: u64, now_ms: u64) -> Result<(), ProtocolError> {
        if !self.is_fresh(issued_at_ms, now_ms) {
            trace!(nonce, issued_at_ms, now_ms, "stale nonce");
            return Err(ProtocolError::ReplayDetected);
        }
        if self.seen.contains(&nonce) {
            trace!(nonce, "nonce already recorded");
            return Err(ProtocolError::ReplayDetected);
        }
        if self.seen.len() == self.seen.cap().get() {
            self.expire(now_ms);
            if self.seen.len() == self.seen.cap().get() {
                return Err(ProtocolError::Capacity);
            }
        }
        self.seen.put(nonce, now_ms);
        Ok(())
    }

    /// Drop entries whose retention period has elapsed.
    pub fn expire(&mut self, now_ms: u64) -> usize {
        let retention = self.retention_ms();
        let mut expired = 0;
        while let Some((_, &recorded)) = self.seen.peek_lru()
            && recorded.saturating_add(retention) <= now_ms
        {
            self.seen.pop_lru();
            expired += 1;
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// One nonce history per `(channel, user)`, created on first use.
///
/// Each user fills only their own histories, so a full table rejects that
/// user's requests and nobody else's.
#[derive(Debug)]
pub struct ReplayGuard {
    histories: HashMap<(Channel, String), NonceHistory>,
    window: Duration,
    capacity: NonZeroUsize,
}

impl ReplayGuard {
    /// `capacity` bounds each user's history on each channel.
    pub fn new(window: Duration, capacity: NonZeroUsize) -> Self {
        Self {
            histories: HashMap::new(),
            window,
            capacity,
        }
    }

    pub fn check(
        &mut self,
        channel: Channel,
        user: &str,
        nonce: u64,
        issued_at_ms: u64,
        now_ms: u64,
    ) -> Result<(), ProtocolError> {
        let (window, capacity) = (self.window, self.capacity);
        self.histories
            .entry((channel, user.to_owned()))
            .or_insert_with(|| NonceHistory::new(window, capacity))
            .check_and_record(nonce, issued_at_ms, now_ms)
    }

    /// Drop every history held for `user`. Called when its session key
    /// changes, since requests under the old key no longer decrypt.
    pub fn forget(&mut self, user: &str) {
        self.histories.retain(|(_, owner), _| owner != user);
    }

    /// Expire old nonces and drop histories left empty.
    pub fn expire(&mut self, now_ms: u64) -> usize {
        let expired = self.histories.values_mut().map(|h| h.expire(now_ms)).sum();
        self.histories.retain(|_, history| !history.is_empty());
        expired
    }

    /// Total recorded nonces across all users and channels.
    pub fn len(&self) -> usize {
        self.histories.values().map(NonceHistory::len).sum()
    }
}
