use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::error::{HarnessError, Result};

/// Hands out free local TCP ports for the projects under test.
///
/// The port is found by binding port 0 and reading back what the OS picked;
/// the socket is closed again before the port is returned so the project
/// can bind it itself.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    bind_address: IpAddr,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl PortAllocator {
    pub fn new(bind_address: IpAddr) -> Self {
        Self { bind_address }
    }

    pub fn bind_address(&self) -> IpAddr {
        self.bind_address
    }

    /// Reserves and immediately releases an ephemeral port.
    pub fn allocate(&self) -> Result<u16> {
        let domain = match self.bind_address {
            IpAddr::V4(_) => Domain::IPV4,
            IpAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::new(self.bind_address, 0).into())?;

        let port = socket
            .local_addr()?
            .as_socket()
            .map(|addr| addr.port())
            .ok_or_else(|| HarnessError::Config("bound socket has no inet address".into()))?;

        debug!("Allocated local port {}", port);
        Ok(port)
    }

    /// The socket address the project will listen on for `port`.
    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind_address, port)
    }
}
