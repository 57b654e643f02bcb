use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Read timeout of the receive threads; bounds how long `Pinger::close` waits
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receive buffer requested from the kernel (best effort)
const RECV_BUFFER_SIZE: usize = 1024 * 1024;

/// Socket with metadata about type (for DGRAM-aware parsing)
#[derive(Debug)]
pub struct SocketInfo {
    pub socket: Socket,
    /// True if SOCK_DGRAM (no IP header in received packets)
    pub is_dgram: bool,
}

impl SocketInfo {
    /// Whether received packets start with an IP header
    ///
    /// Only raw IPv4 sockets deliver one; raw ICMPv6 and datagram sockets
    /// hand over the bare ICMP message.
    pub fn has_ip_header(&self, ipv6: bool) -> bool {
        !self.is_dgram && !ipv6
    }
}

/// Create a raw ICMP socket
pub fn create_raw_icmp_socket(ipv6: bool) -> io::Result<Socket> {
    let (domain, protocol) = if ipv6 {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))?;
    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
    Ok(socket)
}

/// Create an unprivileged ICMP socket (SOCK_DGRAM)
///
/// Needs `net.ipv4.ping_group_range` to include the caller's group on Linux.
pub fn create_dgram_icmp_socket(ipv6: bool) -> io::Result<Socket> {
    let (domain, protocol) = if ipv6 {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(protocol))?;
    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
    Ok(socket)
}

/// Open the send/receive socket for one address family, bound to `bind`
///
/// Prefers RAW, falls back to DGRAM for unprivileged ICMP. A datagram socket
/// is bound with port = `identifier`: the kernel stamps the bound port into
/// the Echo identifier field, so replies still correlate.
pub fn create_icmp_socket(bind: IpAddr, identifier: u16) -> io::Result<SocketInfo> {
    let ipv6 = bind.is_ipv6();

    let info = match create_raw_icmp_socket(ipv6) {
        Ok(socket) => {
            socket.bind(&SockAddr::from(SocketAddr::new(bind, 0)))?;
            SocketInfo {
                socket,
                is_dgram: false,
            }
        }
        Err(raw_err) => {
            tracing::debug!(
                "raw ICMPv{} socket unavailable ({}), trying datagram socket",
                if ipv6 { 6 } else { 4 },
                raw_err
            );
            let socket = create_dgram_icmp_socket(ipv6)?;
            socket.bind(&SockAddr::from(SocketAddr::new(bind, identifier)))?;
            SocketInfo {
                socket,
                is_dgram: true,
            }
        }
    };

    if let Err(e) = info.socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        tracing::warn!("could not set receive buffer to 1MB: {}", e);
    }

    // Allows probing broadcast destinations in sweeps
    if !ipv6 {
        info.socket.set_broadcast(true)?;
    }

    Ok(info)
}

/// Apply a firewall mark (SO_MARK) to outgoing packets
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn set_mark(socket: &Socket, mark: u32) -> io::Result<()> {
    socket.set_mark(mark)
}

/// Apply a firewall mark (SO_MARK) to outgoing packets
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn set_mark(_socket: &Socket, _mark: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_MARK is only supported on Linux",
    ))
}

/// Send ICMP packet to target
pub fn send_icmp(socket: &Socket, packet: &[u8], target: IpAddr) -> io::Result<usize> {
    let addr = SocketAddr::new(target, 0);
    socket.send_to(packet, &SockAddr::from(addr))
}

/// Receive one packet; returns its length and source address
pub fn recv_icmp(socket: &Socket, buffer: &mut [u8]) -> io::Result<(usize, IpAddr)> {
    // SAFETY: MaybeUninit<u8> has the layout of u8, and recv_from never
    // writes uninitialized bytes into the buffer.
    let uninit = unsafe { &mut *(buffer as *mut [u8] as *mut [MaybeUninit<u8>]) };
    let (len, addr) = socket.recv_from(uninit)?;
    let source = addr
        .as_socket()
        .map(|sa| sa.ip().to_canonical())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP source address"))?;
    Ok((len, source))
}

/// Whether a receive error only means no packet arrived within the poll interval
pub fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
