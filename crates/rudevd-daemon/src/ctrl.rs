//! Administrative control socket.
//!
//! A SEQPACKET socket under the runtime directory, one command per
//! connection. Peer credentials gate access; malformed payloads are
//! logged and dropped, never fatal. The `EXIT` command's connection is
//! retained so the caller blocks until the drain completes.

use std::fs;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::sys::socket::{
    accept4, bind, connect, getsockopt, listen, recv, send, socket, sockopt, AddressFamily,
    Backlog, MsgFlags, SockFlag, SockType, UnixAddr,
};
use nix::unistd::Uid;
use tracing::{debug, warn};

use rudevd_core::ctrl::ControlCommand;

/// Largest accepted control datagram.
const CTRL_MSG_MAX: usize = 4096;

/// Control-socket setup failure.
#[derive(Debug, thiserror::Error)]
pub enum CtrlError {
    /// Creating, binding or listening failed.
    #[error("error initializing control socket: {0}")]
    Setup(#[source] nix::Error),
    /// Adjusting the socket file failed.
    #[error("error preparing control socket file: {0}")]
    SocketFile(#[from] std::io::Error),
}

/// Server side of the control socket.
#[derive(Debug)]
pub struct ControlPlane {
    listener: OwnedFd,
    /// Connection retained by `EXIT` to block the caller until shutdown.
    exit_conn: Option<OwnedFd>,
    /// Socket file to unlink on drop; `None` when the fd was adopted.
    socket_path: Option<PathBuf>,
}

impl ControlPlane {
    /// Bind the control socket at the given path, replacing a stale one.
    ///
    /// # Errors
    ///
    /// Returns [`CtrlError`] when the socket cannot be bound; this is a
    /// fatal initialization error for the daemon.
    pub fn bind_at(path: &Path) -> Result<Self, CtrlError> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(CtrlError::Setup)?;
        let addr = UnixAddr::new(path).map_err(CtrlError::Setup)?;
        bind(fd.as_raw_fd(), &addr).map_err(CtrlError::Setup)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        let backlog = Backlog::new(4).map_err(CtrlError::Setup)?;
        listen(&fd, backlog).map_err(CtrlError::Setup)?;

        Ok(Self {
            listener: fd,
            exit_conn: None,
            socket_path: Some(path.to_path_buf()),
        })
    }

    /// Adopt a listening socket handed over by the service manager. The
    /// reactor requires it non-blocking.
    #[must_use]
    pub fn from_owned(fd: OwnedFd) -> Self {
        let _ = nix::fcntl::fcntl(
            fd.as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        );
        Self {
            listener: fd,
            exit_conn: None,
            socket_path: None,
        }
    }

    /// Accept one pending connection and read its command.
    ///
    /// Returns `None` when no connection is pending or the message was
    /// rejected; rejection reasons are logged, never raised.
    pub fn accept_command(&mut self) -> Option<(ControlCommand, OwnedFd)> {
        let conn = self.accept()?;

        match getsockopt(&conn, sockopt::PeerCredentials) {
            Ok(creds) => {
                let uid = Uid::from_raw(creds.uid());
                if !uid.is_root() && uid != Uid::effective() {
                    warn!(uid = creds.uid(), "control message from unauthorized uid, ignoring");
                    return None;
                }
            }
            Err(e) => {
                warn!(error = %e, "could not read control peer credentials, ignoring");
                return None;
            }
        }

        // No waiting here: the reactor must not stall on a slow client.
        // A connection whose datagram has not arrived yet is treated
        // like any other message-less connection and dropped.
        let mut buf = [0u8; CTRL_MSG_MAX];
        let len = match recv(conn.as_raw_fd(), &mut buf, MsgFlags::MSG_DONTWAIT) {
            Ok(len) => len,
            Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {
                warn!("control connection sent no message, ignoring");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "failed to receive control message");
                return None;
            }
        };

        match ControlCommand::decode(&buf[..len]) {
            Ok(cmd) => {
                debug!(?cmd, "control message received");
                Some((cmd, conn))
            }
            Err(e) => {
                warn!(error = %e, "ignoring control message");
                None
            }
        }
    }

    /// Keep the `EXIT` caller's connection open until shutdown.
    pub fn retain_exit_connection(&mut self, conn: OwnedFd) {
        self.exit_conn = Some(conn);
    }

    #[allow(unsafe_code)]
    fn accept(&self) -> Option<OwnedFd> {
        match accept4(
            self.listener.as_raw_fd(),
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        ) {
            // SAFETY: accept4 returned a fresh descriptor we exclusively
            // own.
            Ok(raw) => Some(unsafe { OwnedFd::from_raw_fd(raw) }),
            Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => None,
            Err(e) => {
                warn!(error = %e, "failed to accept control connection");
                None
            }
        }
    }
}

impl AsRawFd for ControlPlane {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl AsFd for ControlPlane {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        // Dropping the retained connection is what finally unblocks an
        // exit caller.
        self.exit_conn.take();
        if let Some(path) = &self.socket_path {
            let _ = fs::remove_file(path);
        }
    }
}

/// Client for the control socket; used by the admin tooling and tests.
#[derive(Debug)]
pub struct ControlClient {
    fd: OwnedFd,
}

impl ControlClient {
    /// Connect to the control socket.
    ///
    /// # Errors
    ///
    /// Returns [`CtrlError::Setup`] when the connection fails.
    pub fn connect(path: &Path) -> Result<Self, CtrlError> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(CtrlError::Setup)?;
        let addr = UnixAddr::new(path).map_err(CtrlError::Setup)?;
        connect(fd.as_raw_fd(), &addr).map_err(CtrlError::Setup)?;
        Ok(Self { fd })
    }

    /// Send one command.
    ///
    /// # Errors
    ///
    /// Returns [`CtrlError::Setup`] when the send fails.
    pub fn send_command(&self, cmd: &ControlCommand) -> Result<(), CtrlError> {
        send(
            self.fd.as_raw_fd(),
            &cmd.encode(),
            MsgFlags::MSG_NOSIGNAL,
        )
        .map_err(CtrlError::Setup)?;
        Ok(())
    }
}
