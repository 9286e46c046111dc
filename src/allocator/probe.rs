//! Live bind probes against the host socket layer.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, UdpSocket};
use tracing::trace;

/// Checks whether a port is free on the host right now.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_free(&self, port: u16) -> bool;
}

/// Probe that briefly binds TCP and UDP sockets on the configured address.
///
/// Game traffic is UDP and the admin console is TCP, so a port only counts as
/// free when both binds succeed.
#[derive(Debug, Clone)]
pub struct SocketProbe {
    bind_address: IpAddr,
}

impl SocketProbe {
    pub fn new(bind_address: IpAddr) -> Self {
        Self { bind_address }
    }
}

#[async_trait]
impl PortProbe for SocketProbe {
    async fn is_free(&self, port: u16) -> bool {
        let addr = SocketAddr::new(self.bind_address, port);

        let tcp = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                trace!("TCP bind on {} failed: {}", addr, e);
                return false;
            }
        };

        let udp_free = match UdpSocket::bind(addr).await {
            Ok(_) => true,
            Err(e) => {
                trace!("UDP bind on {} failed: {}", addr, e);
                false
            }
        };

        drop(tcp);
        udp_free
    }
}

/// Probe that reports a fixed set of ports as taken by foreign processes.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct StaticProbe {
    taken: std::sync::Mutex<std::collections::HashSet<u16>>,
}

#[cfg(test)]
impl StaticProbe {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_taken(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            taken: std::sync::Mutex::new(ports.into_iter().collect()),
        }
    }

    pub(crate) fn occupy(&self, port: u16) {
        if let Ok(mut taken) = self.taken.lock() {
            taken.insert(port);
        }
    }
}

#[cfg(test)]
#[async_trait]
impl PortProbe for StaticProbe {
    async fn is_free(&self, port: u16) -> bool {
        self.taken
            .lock()
            .map(|taken| !taken.contains(&port))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::net::Ipv4Addr;

    #[tokio::test]
    #[serial]
    async fn test_socket_probe_detects_bound_port() {
        let holder = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let probe = SocketProbe::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(!probe.is_free(port).await);

        drop(holder);
        assert!(probe.is_free(port).await);
    }

    #[tokio::test]
    async fn test_static_probe() {
        let probe = StaticProbe::with_taken([7777]);
        assert!(!probe.is_free(7777).await);
        assert!(probe.is_free(7778).await);

        probe.occupy(7778);
        assert!(!probe.is_free(7778).await);
    }
}
