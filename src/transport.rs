//! # Datagram Transport
//!
//! The protocol only needs "send these bytes to that address" and "give me
//! the next datagram and who sent it". [`Datagram`] captures exactly that so
//! the server and client can run over `tokio::net::UdpSocket` in production
//! and over in-memory fakes in tests.
//!
//! The channel is unreliable and the protocol adds no retransmission. The
//! only retry is local: a send that fails at the socket level is retried
//! with exponential backoff before surfacing [`ProtocolError::Transport`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

use crate::error::ProtocolError;
use crate::messages::MAX_DATAGRAM_SIZE;

/// Default number of retries after a failed send.
pub const DEFAULT_SEND_RETRIES: u32 = 3;

/// Base delay between send retries (doubles each attempt).
const SEND_BASE_DELAY_MS: u64 = 100;

/// Ceiling on a single backoff sleep.
const SEND_MAX_DELAY_MS: u64 = 5_000;

#[async_trait]
pub trait Datagram: Send + Sync {
    async fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Datagram for UdpSocket {
    async fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, bytes, to).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Send `bytes` to `to`, retrying socket errors up to `retries` times.
pub async fn send_with_retry<T>(socket: &T, bytes: &[u8], to: SocketAddr, retries: u32) -> Result<(), ProtocolError>
where
    T: Datagram + ?Sized,
{
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(ProtocolError::Malformed("datagram exceeds size limit"));
    }

    let mut attempt = 0;
    loop {
        match socket.send_to(bytes, to).await {
            Ok(_) => {
                trace!(to = %to, len = bytes.len(), "datagram sent");
                return Ok(());
            }
            Err(e) => {
                attempt += 1;
                if attempt > retries {
                    warn!(to = %to, error = %e, attempts = attempt, "send failed");
                    return Err(ProtocolError::Transport(e.to_string()));
                }
                let delay = retry_delay(attempt);
                trace!(to = %to, error = %e, attempt, delay_ms = delay.as_millis() as u64, "send failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Backoff before retry `attempt` (1-based): doubles from the base delay,
/// capped at [`SEND_MAX_DELAY_MS`].
fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(SEND_BASE_DELAY_MS.saturating_mul(factor).min(SEND_MAX_DELAY_MS))
}

/// Receive one datagram, giving up after `timeout`.
pub async fn recv_with_timeout<T>(socket: &T, timeout: Duration) -> Result<(Vec<u8>, SocketAddr), ProtocolError>
where
    T: Datagram + ?Sized,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let (len, from) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| ProtocolError::Timeout)??;
    buf.truncate(len);
    Ok((buf, from))
}
