// Listener ownership module
// Binds a fresh reusable listener or recovers the one inherited from the previous generation
#![allow(unsafe_code)]

use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use super::tls;
use crate::error::{Error, Result};

/// Descriptor slot carrying the listening socket into a restarted process
pub const LISTEN_FD: RawFd = 3;

/// Accept queue length for freshly bound listeners
const BACKLOG: i32 = 1024;

/// Certificate chain and private key, both PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// The listening TCP socket owned by this generation.
///
/// Created exactly once per generation, by [`acquire`]. The serving engine
/// accepts on a duplicate from [`ListenerHandle::tokio_listener`]; the
/// spawner duplicates the descriptor into the next generation.
#[derive(Debug)]
pub struct ListenerHandle {
    addr: SocketAddr,
    socket: Socket,
    inherited: bool,
    tls: Option<TlsPaths>,
}

/// Bind `addr`, or recover the inherited socket from [`LISTEN_FD`] when
/// `recover` is set. Never both.
pub fn acquire(addr: SocketAddr, recover: bool, tls: Option<TlsPaths>) -> Result<ListenerHandle> {
    let socket = if recover {
        recover_inherited(LISTEN_FD)?
    } else {
        create_reusable_socket(addr).map_err(|source| Error::Bind { addr, source })?
    };

    let local = socket
        .local_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .ok_or_else(|| Error::Inherit {
            fd: socket.as_raw_fd(),
            reason: "socket has no inet local address".to_string(),
        })?;

    if recover && local.port() != addr.port() {
        tracing::warn!(
            configured = %addr,
            inherited = %local,
            "inherited listener is bound to a different address than configured"
        );
    }

    Ok(ListenerHandle {
        addr: local,
        socket,
        inherited: recover,
        tls,
    })
}

impl ListenerHandle {
    /// Address the socket is actually bound to
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub const fn is_inherited(&self) -> bool {
        self.inherited
    }

    pub const fn tls_paths(&self) -> Option<&TlsPaths> {
        self.tls.as_ref()
    }

    /// Duplicate the descriptor into a tokio listener for the accept loop.
    pub fn tokio_listener(&self) -> Result<TcpListener> {
        let dup = self.socket.try_clone()?;
        let std_listener: std::net::TcpListener = dup.into();
        Ok(TcpListener::from_std(std_listener)?)
    }

    /// Another handle on the same underlying socket.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            addr: self.addr,
            socket: self.socket.try_clone()?,
            inherited: self.inherited,
            tls: self.tls.clone(),
        })
    }

    /// Load the TLS acceptor when certificate paths are configured.
    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        self.tls.as_ref().map(tls::load_acceptor).transpose()
    }
}

impl AsRawFd for ListenerHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl AsFd for ListenerHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

/// Create a listening socket with `SO_REUSEADDR` enabled.
///
/// Only sockets left in `TIME_WAIT` may share the address. `SO_REUSEPORT`
/// stays off, so a second instance started next to a live one fails with
/// [`Error::Bind`]; generations share the listener by inheritance instead.
fn create_reusable_socket(addr: SocketAddr) -> std::io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket)
}

/// Take ownership of the socket in `fd` and check it is a listening TCP socket.
fn recover_inherited(fd: RawFd) -> Result<Socket> {
    let inherit_err = |reason: String| Error::Inherit { fd, reason };

    // SAFETY: F_GETFD only reads descriptor flags and accepts any integer.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(inherit_err(format!(
            "descriptor is not open: {}",
            std::io::Error::last_os_error()
        )));
    }

    // SAFETY: the descriptor is open and the recovery slot is reserved for the
    // inherited listener, so nothing else in this process owns it.
    let socket = Socket::from(unsafe { OwnedFd::from_raw_fd(fd) });

    let ty = socket
        .r#type()
        .map_err(|e| inherit_err(format!("not a socket: {e}")))?;
    if ty != Type::STREAM {
        return Err(inherit_err(format!("expected a stream socket, found {ty:?}")));
    }

    if !is_listening(&socket).map_err(|e| inherit_err(format!("cannot query socket state: {e}")))? {
        return Err(inherit_err("socket is not listening".to_string()));
    }

    socket.set_nonblocking(true)?;
    socket.set_cloexec(true)?;
    Ok(socket)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn is_listening(socket: &Socket) -> std::io::Result<bool> {
    let mut value: libc::c_int = 0;
    let mut len = libc::socklen_t::try_from(std::mem::size_of::<libc::c_int>())
        .unwrap_or(libc::socklen_t::MAX);
    // SAFETY: `value` and `len` point to live storage of the advertised size.
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            std::ptr::addr_of_mut!(value).cast(),
            &mut len,
        )
    };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(value != 0)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn is_listening(_socket: &Socket) -> std::io::Result<bool> {
    Ok(true)
}
