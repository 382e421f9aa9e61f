use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, TcpListener, ToSocketAddrs, UdpSocket},
    os::fd::{AsFd, AsRawFd, OwnedFd, RawFd},
    sync::Mutex,
};

use socket2::{Domain, Socket, Type};

use crate::utils::dup_cloexec;

const LISTEN_TCP_KIND: &str = "listen-tcp";
const LISTEN_UDP_KIND: &str = "listen-udp";
const CONNECT_TCP_KIND: &str = "connect-tcp";

const LISTEN_BACKLOG: i32 = 128;

/// Named file descriptors shared between generations.
///
/// Descriptors received from the previous generation sit in `inherited`
/// until a `listen_*`/`connect_*` call claims them by name, which moves
/// them to `used`; freshly created sockets land in `used` directly. Only
/// `used` entries are handed to a successor, and only as duplicates: the
/// socket the application holds is never touched by the registry.
///
/// A name lives in at most one of the two maps, moves from inherited to
/// used at most once per generation, and every entry stays open until the
/// registry closes it (unclaimed inherited fds at readiness, used fds when
/// the generation ends).
pub struct Registry {
    maps: Mutex<Maps>,
    reuseport: bool,
}

struct Maps {
    inherited: HashMap<String, OwnedFd>,
    used: HashMap<String, OwnedFd>,
}

impl Maps {
    /// Takes the inherited entry for `key`, leaving a close-on-exec
    /// duplicate under `used`. The returned fd becomes the application's
    /// socket. A duplication failure leaves the entry where it was.
    fn claim(&mut self, key: &str) -> io::Result<Option<OwnedFd>> {
        let Some(fd) = self.inherited.remove(key) else {
            return Ok(None);
        };
        match dup_cloexec(fd.as_raw_fd()) {
            Ok(dup) => {
                self.used.insert(key.to_string(), dup);
                Ok(Some(fd))
            }
            Err(e) => {
                self.inherited.insert(key.to_string(), fd);
                Err(e)
            }
        }
    }

    fn register(&mut self, key: String, fd: RawFd) -> io::Result<()> {
        if self.used.contains_key(&key) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd name {key} is already registered"),
            ));
        }
        let dup = dup_cloexec(fd)?;
        self.used.insert(key, dup);
        Ok(())
    }
}

impl Registry {
    pub(crate) fn new(inherited: HashMap<String, OwnedFd>, reuseport: bool) -> Self {
        Self {
            maps: Mutex::new(Maps {
                inherited,
                used: HashMap::new(),
            }),
            reuseport,
        }
    }

    /// Returns a TCP listener inherited from the previous generation, or
    /// binds a new one.
    ///
    /// `network` and `addr` are taken literally to form the name the
    /// listener is tracked (and inherited) under, so successive
    /// generations must ask with the same strings.
    pub fn listen_tcp(&self, network: &str, addr: &str) -> io::Result<TcpListener> {
        let key = format!("{LISTEN_TCP_KIND}:{network}:{addr}");
        let mut maps = self.maps.lock().unwrap();

        if let Some(fd) = maps.claim(&key)? {
            log::debug!("inheriting listener {key}");
            return Ok(TcpListener::from(fd));
        }

        log::debug!("binding new listener {key}");
        let target = resolve(addr)?;
        let socket = Socket::new(Domain::for_address(target), Type::STREAM, None)?;
        if self.reuseport {
            enable_reuse(&socket)?;
        }
        socket.bind(&target.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        maps.register(key, socket.as_raw_fd())?;
        Ok(socket.into())
    }

    /// Returns a UDP socket inherited from the previous generation, or
    /// binds a new one. Same naming contract as [`Registry::listen_tcp`].
    pub fn listen_udp(&self, network: &str, addr: &str) -> io::Result<UdpSocket> {
        let key = format!("{LISTEN_UDP_KIND}:{network}:{addr}");
        let mut maps = self.maps.lock().unwrap();

        if let Some(fd) = maps.claim(&key)? {
            log::debug!("inheriting packet socket {key}");
            return Ok(UdpSocket::from(fd));
        }

        log::debug!("binding new packet socket {key}");
        let target = resolve(addr)?;
        let socket = Socket::new(Domain::for_address(target), Type::DGRAM, None)?;
        if self.reuseport {
            enable_reuse(&socket)?;
        }
        socket.bind(&target.into())?;
        maps.register(key, socket.as_raw_fd())?;
        Ok(socket.into())
    }

    /// Returns an inherited client connection, or calls `factory` to open a
    /// new one and registers it for the next handover.
    ///
    /// This is how long-lived outbound connections (a database session, an
    /// upstream control channel) survive upgrades: register them under a
    /// caller-chosen `key` and the successor gets the same socket back
    /// without the factory running.
    pub fn connect_tcp<C, F>(
        &self,
        network: &str,
        addr: &str,
        key: &str,
        factory: F,
    ) -> io::Result<C>
    where
        C: AsFd + From<OwnedFd>,
        F: FnOnce(&str, &str) -> io::Result<C>,
    {
        let key = format!("{CONNECT_TCP_KIND}:{network}:{addr}:{key}");
        let mut maps = self.maps.lock().unwrap();

        if let Some(fd) = maps.claim(&key)? {
            log::debug!("inheriting connection {key}");
            return Ok(C::from(fd));
        }

        let conn = factory(network, addr)?;
        // A registration failure drops `conn` on the way out, closing the
        // fd the factory just opened.
        maps.register(key, conn.as_fd().as_raw_fd())?;
        Ok(conn)
    }

    /// The used set, for handing to a child. The returned fds stay owned by
    /// the registry; the launcher duplicates them into the child's fd table
    /// at exec time.
    pub(crate) fn snapshot(&self) -> Vec<(String, RawFd)> {
        let maps = self.maps.lock().unwrap();
        maps.used
            .iter()
            .map(|(key, fd)| (key.clone(), fd.as_raw_fd()))
            .collect()
    }

    /// Discards every inherited fd nothing claimed. Called once the
    /// application has declared readiness.
    pub(crate) fn close_inherited(&self) {
        let mut maps = self.maps.lock().unwrap();
        if !maps.inherited.is_empty() {
            log::debug!("closing {} unclaimed inherited fds", maps.inherited.len());
        }
        maps.inherited.clear();
    }

    /// Closes every used fd; the generation is over.
    pub(crate) fn close_used(&self) {
        let mut maps = self.maps.lock().unwrap();
        log::debug!("closing {} used fds", maps.used.len());
        maps.used.clear();
    }

    #[cfg(test)]
    pub(crate) fn has_inherited(&self, key: &str) -> bool {
        self.maps.lock().unwrap().inherited.contains_key(key)
    }

    #[cfg(test)]
    pub(crate) fn has_used(&self, key: &str) -> bool {
        self.maps.lock().unwrap().used.contains_key(key)
    }

    #[cfg(test)]
    pub(crate) fn counts(&self) -> (usize, usize) {
        let maps = self.maps.lock().unwrap();
        (maps.inherited.len(), maps.used.len())
    }
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("can't resolve listen address {addr}"),
        )
    })
}

/// Address and port reuse for hot listener groups. The listening fd itself
/// stays inheritable across the exec so the kernel keeps the reuseport
/// group together between generations.
fn enable_reuse(socket: &Socket) -> io::Result<()> {
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_cloexec(false)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpStream,
    };

    use super::*;

    fn empty() -> HashMap<String, OwnedFd> {
        HashMap::new()
    }

    fn inherited_entry<F: AsRawFd>(key: &str, socket: &F) -> HashMap<String, OwnedFd> {
        let mut map = HashMap::new();
        map.insert(key.to_string(), dup_cloexec(socket.as_raw_fd()).unwrap());
        map
    }

    #[test]
    fn fresh_listener_is_registered_for_handover() {
        let registry = Registry::new(empty(), false);
        let listener = registry.listen_tcp("tcp", "127.0.0.1:0").unwrap();
        assert!(listener.local_addr().unwrap().port() != 0);
        assert!(registry.has_used("listen-tcp:tcp:127.0.0.1:0"));
        assert_eq!(registry.counts(), (0, 1));
    }

    #[test]
    fn inherited_listener_is_claimed_exactly_once() {
        let original = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = original.local_addr().unwrap();
        let key = format!("listen-tcp:tcp:{addr}");

        let registry = Registry::new(inherited_entry(&key, &original), false);
        // The registry's duplicate keeps the port bound on its own.
        drop(original);

        let listener = registry.listen_tcp("tcp", &addr.to_string()).unwrap();
        assert_eq!(listener.local_addr().unwrap(), addr);
        assert!(!registry.has_inherited(&key));
        assert!(registry.has_used(&key));

        // Asking again must not find the consumed entry; the attempt to
        // bind a replacement collides with the still-open listener.
        let err = registry.listen_tcp("tcp", &addr.to_string()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn second_bind_fails_without_reuseport() {
        let registry = Registry::new(empty(), false);
        let first = registry.listen_tcp("tcp", "127.0.0.1:0").unwrap();
        let addr = first.local_addr().unwrap();

        let err = registry
            .listen_tcp("tcp4", &addr.to_string())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn reuseport_allows_parallel_binds() {
        let registry = Registry::new(empty(), true);
        let first = registry.listen_tcp("tcp", "127.0.0.1:0").unwrap();
        let addr = first.local_addr().unwrap();

        let second = registry.listen_tcp("tcp4", &addr.to_string()).unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);
    }

    #[test]
    fn registering_the_same_name_twice_is_refused() {
        let registry = Registry::new(empty(), false);
        let _first = registry.listen_tcp("tcp", "127.0.0.1:0").unwrap();

        // Port 0 binds again without conflict, so it is the name collision
        // that gets reported.
        let err = registry.listen_tcp("tcp", "127.0.0.1:0").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn inherited_udp_socket_keeps_its_binding() {
        let original = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = original.local_addr().unwrap();
        let key = format!("listen-udp:udp:{addr}");

        let registry = Registry::new(inherited_entry(&key, &original), false);
        drop(original);

        let socket = registry.listen_udp("udp", &addr.to_string()).unwrap();
        assert_eq!(socket.local_addr().unwrap(), addr);
        assert_eq!(registry.counts(), (0, 1));
    }

    #[test]
    fn fresh_udp_socket_binds_and_registers() {
        let registry = Registry::new(empty(), false);
        let socket = registry.listen_udp("udp", "127.0.0.1:0").unwrap();
        assert!(socket.local_addr().unwrap().port() != 0);
        assert!(registry.has_used("listen-udp:udp:127.0.0.1:0"));
    }

    #[test]
    fn connect_tcp_runs_the_factory_when_nothing_was_inherited() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let registry = Registry::new(empty(), false);
        let mut called = false;
        let conn: TcpStream = registry
            .connect_tcp("tcp", "upstream:5432", "primary", |network, _| {
                called = true;
                assert_eq!(network, "tcp");
                TcpStream::connect(addr)
            })
            .unwrap();

        assert!(called);
        assert_eq!(conn.peer_addr().unwrap(), addr);
        assert!(registry.has_used("connect-tcp:tcp:upstream:5432:primary"));
    }

    #[test]
    fn connect_tcp_prefers_the_inherited_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (mut server_end, _) = listener.accept().unwrap();

        let key = "connect-tcp:tcp:upstream:5432:primary";
        let registry = Registry::new(inherited_entry(key, &client), false);
        drop(client);

        let mut conn: TcpStream = registry
            .connect_tcp("tcp", "upstream:5432", "primary", |_, _| {
                panic!("factory must not run for an inherited connection")
            })
            .unwrap();

        // Same socket: bytes written on the claimed end arrive at the peer
        // the previous generation was talking to.
        conn.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server_end.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert!(!registry.has_inherited(key));
        assert!(registry.has_used(key));
    }

    #[test]
    fn close_inherited_releases_unclaimed_fds() {
        let original = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = original.local_addr().unwrap();
        let key = format!("listen-tcp:tcp:{addr}");

        let registry = Registry::new(inherited_entry(&key, &original), false);
        drop(original);
        assert!(TcpListener::bind(addr).is_err());

        registry.close_inherited();
        assert_eq!(registry.counts(), (0, 0));
        assert!(TcpListener::bind(addr).is_ok());
    }

    #[test]
    fn close_used_releases_registered_fds() {
        let registry = Registry::new(empty(), false);
        let listener = registry.listen_tcp("tcp", "127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        drop(listener);
        assert!(TcpListener::bind(addr).is_err());

        registry.close_used();
        assert!(TcpListener::bind(addr).is_ok());
    }
}
