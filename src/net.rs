//! Deadlines and address helpers for the blocking network calls.

use crate::{Error, Result};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Awaits `fut`, failing with [`Error::Timeout`] once `deadline` elapses.
///
/// `None` waits forever, which is what a measurement over an unreliable link
/// gets unless the caller opts into a bound.
pub async fn with_deadline<F, T, E>(deadline: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    Error: From<E>,
{
    match deadline {
        None => Ok(fut.await?),
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout(limit)),
        },
    }
}

/// Listening address for a server: `0.0.0.0:<port>` unless a bind address is set.
pub fn listen_addr(bind_addr: Option<IpAddr>, port: u16) -> SocketAddr {
    SocketAddr::new(bind_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), port)
}

/// Wildcard local address of the same family as `peer`, ephemeral port.
pub fn local_addr_for(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Resolves `host:port` to the first address the resolver returns.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::Connection(format!("Cannot resolve {}:{}", host, port)))
}
