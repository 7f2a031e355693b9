use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::net::{TcpListener, TcpStream, UdpSocket};
use socket2::{Domain, Protocol, Socket, Type};

use crate::options::Options;

/// Which wire protocol a listener speaks. `spec.md` §3 lists `tcp`, `tcp4`,
/// `tcp6`, `udp`, ... — we normalize those down to the two kernel socket
/// kinds this crate actually drives differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn parse(s: &str) -> io::Result<Network> {
        match s {
            "tcp" | "tcp4" | "tcp6" => Ok(Network::Tcp),
            "udp" | "udp4" | "udp6" => Ok(Network::Udp),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network {other:?}"),
            )),
        }
    }

    pub fn is_udp(self) -> bool {
        matches!(self, Network::Udp)
    }
}

/// A bound, not-yet-registered kernel socket. Owns the listener's `fd`
/// (`spec.md` §3) and the address it reports to `lnaddr`.
pub enum Listener {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

impl Listener {
    pub fn fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Udp(l) => l.as_raw_fd(),
        }
    }

    pub fn network(&self) -> Network {
        match self {
            Listener::Tcp(_) => Network::Tcp,
            Listener::Udp(_) => Network::Udp,
        }
    }

    pub fn lnaddr(&self) -> io::Result<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr(),
            Listener::Udp(l) => l.local_addr(),
        }
    }

    pub fn close(self) {
        drop(self);
    }

    /// `accept4` the listener's backlog once. Only meaningful for TCP;
    /// called repeatedly by the accept path until `WouldBlock` (`spec.md`
    /// §4.6 step 1: "drain the accept queue").
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        match self {
            Listener::Tcp(l) => l.accept(),
            Listener::Udp(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "accept called on a UDP listener",
            )),
        }
    }

    /// Receives one datagram. Only meaningful for UDP.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self {
            Listener::Udp(u) => u.recv_from(buf),
            Listener::Tcp(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "recv_from called on a TCP listener",
            )),
        }
    }

    /// Sends one datagram back out the shared UDP socket.
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        match self {
            Listener::Udp(u) => u.send_to(buf, target),
            Listener::Tcp(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "send_to called on a TCP listener",
            )),
        }
    }

    /// Re-bind a fresh socket at the same address with `SO_REUSEPORT`, for
    /// distributed-mode loops after the first (`spec.md` §4.2).
    pub fn try_clone_reuse_port(&self) -> io::Result<Listener> {
        let addr = self.lnaddr()?;
        match self {
            Listener::Tcp(_) => init_listener_inner(Network::Tcp, addr, true, None, None),
            Listener::Udp(_) => init_listener_inner(Network::Udp, addr, true, None, None),
        }
    }
}

/// Constructs and binds a listener per `spec.md` §6 ("Listener operations
/// consumed: ... constructor `init_listener(network, addr, options)`").
pub fn init_listener(network: &str, addr: SocketAddr, options: &Options) -> io::Result<Listener> {
    let net = Network::parse(network)?;
    init_listener_inner(
        net,
        addr,
        options.reuse_port,
        options.socket_recv_buffer,
        options.socket_send_buffer,
    )
}

fn init_listener_inner(
    net: Network,
    addr: SocketAddr,
    reuse_port: bool,
    recv_buf: Option<usize>,
    send_buf: Option<usize>,
) -> io::Result<Listener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let (ty, proto) = match net {
        Network::Tcp => (Type::STREAM, Protocol::TCP),
        Network::Udp => (Type::DGRAM, Protocol::UDP),
    };

    let socket = Socket::new(domain, ty, Some(proto))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    if let Some(n) = recv_buf {
        socket.set_recv_buffer_size(n)?;
    }
    if let Some(n) = send_buf {
        socket.set_send_buffer_size(n)?;
    }

    socket.bind(&addr.into())?;
    if matches!(net, Network::Tcp) {
        socket.listen(1024)?;
    }

    match net {
        Network::Tcp => {
            let std_listener: std::net::TcpListener = socket.into();
            Ok(Listener::Tcp(TcpListener::from_std(std_listener)))
        }
        Network::Udp => {
            let std_socket: std::net::UdpSocket = socket.into();
            Ok(Listener::Udp(UdpSocket::from_std(std_socket)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_parse_normalizes_variants() {
        assert_eq!(Network::parse("tcp").unwrap(), Network::Tcp);
        assert_eq!(Network::parse("tcp6").unwrap(), Network::Tcp);
        assert_eq!(Network::parse("udp4").unwrap(), Network::Udp);
        assert!(Network::parse("sctp").is_err());
    }

    #[test]
    fn init_listener_binds_ephemeral_tcp_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let opts = Options::default();
        let listener = init_listener("tcp", addr, &opts).unwrap();
        let bound = listener.lnaddr().unwrap();
        assert_eq!(bound.ip(), addr.ip());
        assert!(bound.port() > 0);
    }

    #[test]
    fn init_listener_binds_ephemeral_udp_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let opts = Options::default();
        let listener = init_listener("udp", addr, &opts).unwrap();
        assert_eq!(listener.network(), Network::Udp);
    }
}
