//! Kernel uevent reception and subscriber multicast.
//!
//! The kernel publishes device notifications on the `kobject_uevent`
//! netlink family, multicast group 1, as `action@devpath` followed by
//! NUL-separated `KEY=VALUE` properties. Processed devices go back out on
//! group 2 for subscribers, in the same text format.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::sys::socket::{
    bind, recvfrom, sendto, setsockopt, socket, sockopt, AddressFamily, MsgFlags, NetlinkAddr,
    SockFlag, SockProtocol, SockType,
};
use tracing::{debug, warn};

use rudevd_core::device::{Device, Devnum};
use rudevd_core::exec::{DeviceSource, ProcessedEventSink, SinkError, SourceError};

/// Multicast group the kernel sends uevents to.
const GROUP_KERNEL: u32 = 1;
/// Multicast group subscribers listen on for processed devices.
const GROUP_SUBSCRIBERS: u32 = 2;

/// Receive buffer requested for the uevent socket. Coldplug storms can
/// queue far more than the default socket buffer holds.
const RECV_BUF_SIZE: usize = 128 * 1024 * 1024;

/// Largest uevent datagram we accept.
const UEVENT_MSG_MAX: usize = 8 * 1024;

/// Netlink setup failure.
#[derive(Debug, thiserror::Error)]
pub enum NetlinkError {
    /// Creating or binding the socket failed.
    #[error("error initializing netlink socket: {0}")]
    Setup(#[source] nix::Error),
}

/// Kernel uevent socket; the broker's inbound device source.
#[derive(Debug)]
pub struct UeventSocket {
    fd: OwnedFd,
}

impl UeventSocket {
    /// Open and bind the kernel uevent socket.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkError::Setup`] when the socket cannot be created
    /// or bound.
    pub fn open() -> Result<Self, NetlinkError> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(NetlinkError::Setup)?;

        // Forcing past rmem_max needs CAP_NET_ADMIN; fall back to the
        // clamped variant when unprivileged.
        if setsockopt(&fd, sockopt::RcvBufForce, &RECV_BUF_SIZE).is_err() {
            let _ = setsockopt(&fd, sockopt::RcvBuf, &RECV_BUF_SIZE);
        }

        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, GROUP_KERNEL)).map_err(NetlinkError::Setup)?;
        Ok(Self { fd })
    }

    /// Adopt an already-bound socket handed over by the service manager.
    /// The reactor requires it non-blocking.
    #[must_use]
    pub fn from_owned(fd: OwnedFd) -> Self {
        let _ = nix::fcntl::fcntl(
            fd.as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        );
        Self { fd }
    }
}

impl AsRawFd for UeventSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for UeventSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl DeviceSource for UeventSocket {
    fn receive(&mut self) -> Result<Option<Device>, SourceError> {
        let mut buf = vec![0u8; UEVENT_MSG_MAX];
        let (len, addr) = match recvfrom::<NetlinkAddr>(self.fd.as_raw_fd(), &mut buf) {
            Ok(r) => r,
            Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => return Ok(None),
            Err(e) => return Err(SourceError::Receive(std::io::Error::from(e))),
        };

        // Only pid 0, the kernel itself, may feed the queue.
        if let Some(addr) = addr {
            if addr.pid() != 0 {
                return Err(SourceError::Invalid(format!(
                    "uevent from unexpected sender pid {}",
                    addr.pid()
                )));
            }
        }

        parse_uevent(&buf[..len]).map(Some)
    }
}

/// Parse a kernel-format uevent datagram.
///
/// # Errors
///
/// Returns [`SourceError::Invalid`] for datagrams that do not carry the
/// `action@devpath` header, a `SEQNUM` or a `SUBSYSTEM`.
pub fn parse_uevent(buf: &[u8]) -> Result<Device, SourceError> {
    // Messages from the userspace side of the protocol start with a magic
    // string instead of the kernel header; those are not ours to queue.
    if buf.starts_with(b"libudev\0") {
        return Err(SourceError::Invalid("userspace-formatted uevent".into()));
    }

    let mut parts = buf.split(|b| *b == 0);
    let header = parts
        .next()
        .and_then(|h| std::str::from_utf8(h).ok())
        .ok_or_else(|| SourceError::Invalid("unreadable uevent header".into()))?;
    let (action, devpath) = header
        .split_once('@')
        .ok_or_else(|| SourceError::Invalid(format!("invalid uevent header '{header}'")))?;
    if action.is_empty() || !devpath.starts_with('/') {
        return Err(SourceError::Invalid(format!(
            "invalid uevent header '{header}'"
        )));
    }

    let mut builder = Device::builder(0, action, devpath);
    let mut seqnum = None;
    let mut major = None;
    let mut minor = None;

    for part in parts {
        let Ok(part) = std::str::from_utf8(part) else {
            continue;
        };
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key {
            "SEQNUM" => seqnum = value.parse::<u64>().ok(),
            "SUBSYSTEM" => builder = builder.subsystem(value),
            "DEVTYPE" => builder = builder.devtype(value),
            "MAJOR" => major = value.parse::<u32>().ok(),
            "MINOR" => minor = value.parse::<u32>().ok(),
            "IFINDEX" => builder = builder.ifindex(value.parse().unwrap_or(0)),
            "DEVPATH_OLD" => builder = builder.devpath_old(value),
            "DEVNAME" => {
                let devnode = if value.starts_with('/') {
                    value.to_string()
                } else {
                    format!("/dev/{value}")
                };
                builder = builder.devnode(devnode);
            }
            "ACTION" | "DEVPATH" => {}
            _ => builder = builder.property(key, value),
        }
    }

    let seqnum =
        seqnum.ok_or_else(|| SourceError::Invalid(format!("uevent without SEQNUM: '{header}'")))?;
    if let (Some(major), Some(minor)) = (major, minor) {
        builder = builder.devnum(Devnum::new(major, minor));
    }

    let mut device = builder.build();
    device.seqnum = seqnum;
    if device.subsystem.is_empty() {
        return Err(SourceError::Invalid(format!(
            "uevent without SUBSYSTEM: '{header}'"
        )));
    }
    Ok(device)
}

/// Serialize a device in the kernel text format for subscribers.
#[must_use]
pub fn format_uevent(device: &Device) -> Vec<u8> {
    let mut out = Vec::with_capacity(512);
    let mut push = |s: &str| {
        out.extend_from_slice(s.as_bytes());
        out.push(0);
    };

    push(&format!("{}@{}", device.action, device.devpath));
    push(&format!("ACTION={}", device.action));
    push(&format!("DEVPATH={}", device.devpath));
    push(&format!("SUBSYSTEM={}", device.subsystem));
    push(&format!("SEQNUM={}", device.seqnum));
    if let Some(devtype) = &device.devtype {
        push(&format!("DEVTYPE={devtype}"));
    }
    if !device.devnum.is_zero() {
        push(&format!("MAJOR={}", device.devnum.major));
        push(&format!("MINOR={}", device.devnum.minor));
    }
    if device.ifindex != 0 {
        push(&format!("IFINDEX={}", device.ifindex));
    }
    if let Some(old) = &device.devpath_old {
        push(&format!("DEVPATH_OLD={old}"));
    }
    if let Some(devnode) = &device.devnode {
        push(&format!("DEVNAME={}", devnode.display()));
    }
    for (key, value) in &device.properties {
        push(&format!("{key}={value}"));
    }
    out
}

/// Multicast sender for processed devices; the broker's outbound sink.
///
/// One instance is shared between the broker (re-forwarding events of
/// failed workers) and every worker. Datagram sends are atomic, so the
/// shared descriptor needs no further coordination.
#[derive(Debug)]
pub struct NetlinkSink {
    fd: OwnedFd,
}

impl NetlinkSink {
    /// Open a send-only uevent socket.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkError::Setup`] when the socket cannot be created.
    pub fn open() -> Result<Self, NetlinkError> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(NetlinkError::Setup)?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0)).map_err(NetlinkError::Setup)?;
        Ok(Self { fd })
    }
}

impl ProcessedEventSink for NetlinkSink {
    fn publish(&self, device: &Device) -> Result<(), SinkError> {
        let payload = format_uevent(device);
        let dest = NetlinkAddr::new(0, GROUP_SUBSCRIBERS);
        match sendto(self.fd.as_raw_fd(), &payload, &dest, MsgFlags::empty()) {
            Ok(_) => {
                debug!(seqnum = device.seqnum, "device published");
                Ok(())
            }
            // No subscriber is listening; nothing to deliver.
            Err(nix::errno::Errno::ESRCH | nix::errno::Errno::ECONNREFUSED) => Ok(()),
            Err(e) => {
                warn!(seqnum = device.seqnum, error = %e, "failed to publish device");
                Err(SinkError::Send(std::io::Error::from(e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_uevent() -> Vec<u8> {
        let mut buf = Vec::new();
        for part in [
            "add@/devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda",
            "ACTION=add",
            "DEVPATH=/devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda",
            "SUBSYSTEM=block",
            "DEVTYPE=disk",
            "DEVNAME=sda",
            "MAJOR=8",
            "MINOR=0",
            "SEQNUM=4711",
            "ID_SERIAL=deadbeef",
        ] {
            buf.extend_from_slice(part.as_bytes());
            buf.push(0);
        }
        buf
    }

    #[test]
    fn test_parse_kernel_uevent() {
        let device = parse_uevent(&sample_uevent()).unwrap();

        assert_eq!(device.seqnum, 4711);
        assert_eq!(device.action, "add");
        assert_eq!(device.subsystem, "block");
        assert_eq!(device.devtype.as_deref(), Some("disk"));
        assert_eq!(device.sysname, "sda");
        assert_eq!(device.devnum, Devnum::new(8, 0));
        assert_eq!(device.devnode.as_deref(), Some(std::path::Path::new("/dev/sda")));
        assert_eq!(device.property("ID_SERIAL"), Some("deadbeef"));
    }

    #[test]
    fn test_parse_rejects_missing_seqnum() {
        let buf = b"add@/devices/a\0ACTION=add\0SUBSYSTEM=mem\0".to_vec();
        assert!(matches!(
            parse_uevent(&buf),
            Err(SourceError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_rejects_missing_subsystem() {
        let buf = b"add@/devices/a\0SEQNUM=1\0".to_vec();
        assert!(parse_uevent(&buf).is_err());
    }

    #[test]
    fn test_parse_rejects_userspace_magic() {
        let buf = b"libudev\0\x01\x02".to_vec();
        assert!(parse_uevent(&buf).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage_header() {
        assert!(parse_uevent(b"not a header\0SEQNUM=1\0").is_err());
        assert!(parse_uevent(b"add@relative/path\0SEQNUM=1\0").is_err());
    }

    #[test]
    fn test_format_parse_roundtrip() {
        let device = parse_uevent(&sample_uevent()).unwrap();
        let formatted = format_uevent(&device);
        let back = parse_uevent(&formatted).unwrap();
        assert_eq!(back, device);
    }
}
