//! Socket options of reactor streams and listeners.
//!
//! A reactor serves a single protocol family, so IPv6 listeners are bound
//! v6-only and never accept mapped IPv4 peers.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// Pending-connection queue length of listeners.
const LISTEN_BACKLOG: i32 = 128;

/// Keepalive probing of idle peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Delay between probes.
    pub interval: Duration,
}

/// Options applied to every socket a reactor opens or accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub nodelay: bool,
    /// TCP keepalive, `None` to leave it off. Default: 60s idle, 10s interval.
    pub keepalive: Option<KeepaliveConfig>,
    /// `SO_REUSEADDR` on listeners. Off on Windows, where it allows port
    /// hijacking.
    pub reuse_address: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(KeepaliveConfig {
                idle: Duration::from_secs(60),
                interval: Duration::from_secs(10),
            }),
            reuse_address: !cfg!(windows),
        }
    }
}

impl SocketConfig {
    /// Configure a connected or accepted stream.
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        if let Some(keepalive) = self.keepalive {
            let params = TcpKeepalive::new()
                .with_time(keepalive.idle)
                .with_interval(keepalive.interval);
            SockRef::from(stream).set_tcp_keepalive(&params)?;
        }
        Ok(())
    }

    /// Bind a non-blocking listener on `addr`. Requires an entered tokio
    /// runtime.
    pub fn bind(&self, addr: SocketAddr) -> std::io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(self.reuse_address)?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        TcpListener::from_std(socket.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_pair(config: &SocketConfig) -> (TcpStream, TcpStream) {
        let listener = config.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_default_options_reach_the_stream() {
        let config = SocketConfig::default();
        let (client, server) = connected_pair(&config).await;
        config.apply(&client).unwrap();
        config.apply(&server).unwrap();

        assert!(client.nodelay().unwrap());
        assert!(SockRef::from(&server).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_keepalive_can_be_disabled() {
        let config = SocketConfig {
            nodelay: false,
            keepalive: None,
            ..SocketConfig::default()
        };
        let (client, _server) = connected_pair(&config).await;
        config.apply(&client).unwrap();

        assert!(!client.nodelay().unwrap());
        assert!(!SockRef::from(&client).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_ipv6_listener_is_v6_only() {
        let config = SocketConfig::default();
        let Ok(listener) = config.bind("[::1]:0".parse().unwrap()) else {
            // No IPv6 loopback on this host.
            return;
        };
        assert!(listener.local_addr().unwrap().is_ipv6());
        assert!(SockRef::from(&listener).only_v6().unwrap());
    }
}
