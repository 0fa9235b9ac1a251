//! Socket creation and address handling.
//!
//! Listeners and datagram sockets are built through socket2 so address-family
//! behaviour (IPV6_V6ONLY) and buffer sizes are explicit on every platform.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info};

/// Address family preference for socket creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    /// IPv4 only (bind to 0.0.0.0)
    V4Only,
    /// IPv6 only (bind to :: with IPV6_V6ONLY=true)
    V6Only,
    /// Accept both (bind to :: with IPV6_V6ONLY=false)
    #[default]
    DualStack,
}

impl std::str::FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "4" | "v4" | "ipv4" | "v4only" | "ipv4-only" => Ok(Self::V4Only),
            "6" | "v6" | "ipv6" | "v6only" | "ipv6-only" => Ok(Self::V6Only),
            "dual" | "dualstack" | "dual-stack" | "both" => Ok(Self::DualStack),
            _ => Err(format!("Invalid address family: {}", s)),
        }
    }
}

impl AddressFamily {
    /// Wildcard bind address for this family
    pub fn bind_addr(&self, port: u16) -> SocketAddr {
        match self {
            Self::V4Only => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            Self::V6Only | Self::DualStack => {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
            }
        }
    }

    /// Listening address: an explicit bind IP wins over the family wildcard.
    pub fn listen_addr(&self, bind: Option<IpAddr>, port: u16) -> SocketAddr {
        match bind {
            Some(ip) => SocketAddr::new(ip, port),
            None => self.bind_addr(port),
        }
    }

    pub fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Self::V4Only => addr.is_ipv4(),
            Self::V6Only => addr.is_ipv6(),
            Self::DualStack => true,
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V4Only => write!(f, "IPv4"),
            Self::V6Only => write!(f, "IPv6"),
            Self::DualStack => write!(f, "dual-stack"),
        }
    }
}

fn bound_socket(
    addr: SocketAddr,
    family: AddressFamily,
    ty: Type,
    protocol: Protocol,
) -> io::Result<Socket> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, ty, Some(protocol))?;
    socket.set_reuse_address(true)?;

    if addr.is_ipv6() {
        // IPV6_V6ONLY: true = IPv6 only, false = dual-stack
        let v6only = family == AddressFamily::V6Only;
        socket.set_only_v6(v6only)?;
        debug!("Set IPV6_V6ONLY={} for {} mode", v6only, family);
    }

    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

pub fn create_tcp_listener(addr: SocketAddr, family: AddressFamily) -> io::Result<TcpListener> {
    let socket = bound_socket(addr, family, Type::STREAM, Protocol::TCP)?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)?;

    info!("TCP listening on {} ({})", addr, family);
    Ok(listener)
}

pub fn create_udp_socket(
    addr: SocketAddr,
    family: AddressFamily,
    recv_buffer: Option<usize>,
) -> io::Result<UdpSocket> {
    let socket = bound_socket(addr, family, Type::DGRAM, Protocol::UDP)?;
    if let Some(size) = recv_buffer
        && let Err(e) = socket.set_recv_buffer_size(size)
    {
        debug!("Failed to set UDP receive buffer to {}: {}", size, e);
    }

    let std_socket: std::net::UdpSocket = socket.into();
    let udp = UdpSocket::from_std(std_socket)?;

    info!("UDP listening on {} ({})", addr, family);
    Ok(udp)
}

/// Create an unconnected UDP socket matching the family of `remote`.
pub fn create_udp_socket_for_remote(remote: SocketAddr) -> io::Result<UdpSocket> {
    let bind_addr = if remote.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    let socket = Socket::new(Domain::for_address(remote), Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SockAddr::from(bind_addr))?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Apply send/receive buffer sizes to a connected stream. Failures are logged,
/// the kernel keeps its defaults.
pub fn set_socket_buffers(stream: &TcpStream, size: usize) {
    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_send_buffer_size(size) {
        debug!("Failed to set send buffer to {}: {}", size, e);
    }
    if let Err(e) = sock.set_recv_buffer_size(size) {
        debug!("Failed to set receive buffer to {}: {}", size, e);
    }
}

/// Resolve a hostname to addresses, filtered by address family preference
pub fn resolve_host(host: &str, port: u16, family: AddressFamily) -> io::Result<Vec<SocketAddr>> {
    // Zone IDs (fe80::1%eth0) are not representable in SocketAddr
    let host_for_lookup = host.split('%').next().unwrap_or(host);

    let addrs: Vec<SocketAddr> = (host_for_lookup, port).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        ));
    }

    let filtered: Vec<SocketAddr> = addrs.into_iter().filter(|a| family.accepts(a)).collect();
    if filtered.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("No {} addresses found for host: {}", family, host),
        ));
    }

    Ok(filtered)
}

/// Connect to the first reachable resolved address.
pub async fn connect_tcp(
    host: &str,
    port: u16,
    family: AddressFamily,
) -> io::Result<(TcpStream, SocketAddr)> {
    let addrs = resolve_host(host, port, family)?;

    let mut last_err = None;
    for addr in addrs {
        debug!("Trying to connect to {}", addr);
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!("Connected to {}", addr);
                return Ok((stream, addr));
            }
            Err(e) => {
                debug!("Failed to connect to {}: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotConnected, "No addresses to connect to")
    }))
}

/// Convert IPv4-mapped IPv6 to IPv4 if applicable
pub fn normalize_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

/// Normalize an IP address for comparison.
///
/// Converts IPv4-mapped IPv6 addresses (::ffff:x.x.x.x) to their IPv4 form so
/// the same client keys identically whether it arrived over dual-stack or not.
pub fn normalize_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        IpAddr::V4(_) => addr,
    }
}
