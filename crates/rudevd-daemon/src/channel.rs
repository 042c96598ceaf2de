//! Message transports between the broker and its workers.
//!
//! Two channels exist per worker population:
//!
//! - a per-worker SEQPACKET pair over which the broker unicasts one
//!   device at a time to that worker;
//! - one shared DGRAM pair over which every worker reports completion
//!   with a zero-length datagram. `SO_PASSCRED` is enabled on the read
//!   end so the kernel-attested sender pid, not the payload, identifies
//!   the worker.

use std::io::IoSliceMut;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::sys::socket::{
    recv, recvmsg, send, setsockopt, socketpair, sockopt, AddressFamily, ControlMessageOwned,
    MsgFlags, SockFlag, SockType, UnixCredentials,
};
use rudevd_core::device::Device;

/// Upper bound on one serialized device message.
const DEVICE_MSG_MAX: usize = 64 * 1024;

/// Transport failure on a broker/worker channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Creating or configuring a socket failed.
    #[error("failed to set up channel: {0}")]
    Setup(#[source] nix::Error),
    /// Sending failed; the peer is treated as broken.
    #[error("failed to send on channel: {0}")]
    Send(#[source] nix::Error),
    /// Receiving failed.
    #[error("failed to receive on channel: {0}")]
    Receive(#[source] nix::Error),
    /// The payload did not decode as a device.
    #[error("invalid device payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    /// The device serialized beyond the message bound.
    #[error("device message of {0} bytes exceeds the channel bound")]
    Oversized(usize),
}

/// Create the unicast device channel for one worker.
///
/// The broker keeps the [`DeviceSender`]; the forked child keeps the
/// [`DeviceReceiver`] and closes the sender it inherited.
///
/// # Errors
///
/// Returns [`ChannelError::Setup`] when the socketpair cannot be created.
pub fn device_channel() -> Result<(DeviceSender, DeviceReceiver), ChannelError> {
    let (parent, child) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(ChannelError::Setup)?;
    Ok((DeviceSender { fd: parent }, DeviceReceiver { fd: child }))
}

/// Broker-side end of a worker's unicast device channel.
#[derive(Debug)]
pub struct DeviceSender {
    fd: OwnedFd,
}

impl DeviceSender {
    /// Send one device to the worker.
    ///
    /// # Errors
    ///
    /// A send failure means the worker did not accept the message; the
    /// caller kills the worker and leaves the event queued.
    pub fn send(&self, device: &Device) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(device)?;
        if payload.len() > DEVICE_MSG_MAX {
            return Err(ChannelError::Oversized(payload.len()));
        }
        // MSG_NOSIGNAL: a worker that died with the channel open must
        // surface as a send error, not a SIGPIPE.
        send(
            self.fd.as_raw_fd(),
            &payload,
            MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
        )
        .map_err(ChannelError::Send)?;
        Ok(())
    }
}

impl AsRawFd for DeviceSender {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for DeviceSender {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Worker-side end of the unicast device channel.
#[derive(Debug)]
pub struct DeviceReceiver {
    fd: OwnedFd,
}

impl DeviceReceiver {
    /// Receive the next device, or `None` once the broker closed its end.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport or decode failure.
    pub fn receive(&self) -> Result<Option<Device>, ChannelError> {
        let mut buf = vec![0u8; DEVICE_MSG_MAX];
        let len = recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty())
            .map_err(ChannelError::Receive)?;
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&buf[..len])?))
    }
}

impl AsRawFd for DeviceReceiver {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for DeviceReceiver {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Create the shared completion channel.
///
/// # Errors
///
/// Returns [`ChannelError::Setup`] when the socketpair cannot be created
/// or credential passing cannot be enabled.
pub fn completion_channel() -> Result<(CompletionReader, CompletionWriter), ChannelError> {
    let (read_end, write_end) = socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(ChannelError::Setup)?;
    setsockopt(&read_end, sockopt::PassCred, &true).map_err(ChannelError::Setup)?;
    Ok((
        CompletionReader { fd: read_end },
        CompletionWriter { fd: write_end },
    ))
}

/// One received completion datagram, before validation.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Kernel-attested pid of the sender, if credentials were attached.
    pub pid: Option<i32>,
    /// Payload size; anything but zero is invalid.
    pub payload_len: usize,
}

/// Broker-side read end of the completion channel.
#[derive(Debug)]
pub struct CompletionReader {
    fd: OwnedFd,
}

impl CompletionReader {
    /// Receive one completion datagram, or `None` when none is pending.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Receive`] on transport failure.
    pub fn receive(&self) -> Result<Option<Completion>, ChannelError> {
        let mut payload = [0u8; 8];
        let mut iov = [IoSliceMut::new(&mut payload)];
        let mut cmsg = cmsg_space!(UnixCredentials);

        let msg = match recvmsg::<()>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => msg,
            Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => return Ok(None),
            Err(e) => return Err(ChannelError::Receive(e)),
        };

        let mut pid = None;
        let cmsgs = msg.cmsgs().map_err(ChannelError::Receive)?;
        for cmsg in cmsgs {
            if let ControlMessageOwned::ScmCredentials(creds) = cmsg {
                pid = Some(creds.pid());
            }
        }

        Ok(Some(Completion {
            pid,
            payload_len: msg.bytes,
        }))
    }
}

impl AsRawFd for CompletionReader {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for CompletionReader {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Worker-side write end of the completion channel.
#[derive(Debug)]
pub struct CompletionWriter {
    fd: OwnedFd,
}

impl CompletionWriter {
    /// Report completion of the current event. The datagram is empty; the
    /// socket credentials carry the worker identity.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Send`] on transport failure.
    pub fn notify(&self) -> Result<(), ChannelError> {
        send(self.fd.as_raw_fd(), &[], MsgFlags::empty()).map_err(ChannelError::Send)?;
        Ok(())
    }
}

impl AsRawFd for CompletionWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for CompletionWriter {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudevd_core::device::Devnum;

    #[test]
    fn test_device_roundtrip_over_channel() {
        let (sender, receiver) = device_channel().unwrap();
        let device = Device::builder(12, "add", "/devices/pci0000:00/sda")
            .subsystem("block")
            .devnum(Devnum::new(8, 0))
            .devnode("/dev/sda")
            .build();

        sender.send(&device).unwrap();
        let received = receiver.receive().unwrap().unwrap();
        assert_eq!(received, device);
    }

    #[test]
    fn test_receiver_sees_close() {
        let (sender, receiver) = device_channel().unwrap();
        drop(sender);
        assert!(receiver.receive().unwrap().is_none());
    }

    #[test]
    fn test_completion_carries_sender_pid() {
        let (reader, writer) = completion_channel().unwrap();
        writer.notify().unwrap();

        let completion = reader.receive().unwrap().unwrap();
        assert_eq!(completion.payload_len, 0);
        assert_eq!(completion.pid, Some(std::process::id() as i32));
    }

    #[test]
    fn test_completion_reader_does_not_block() {
        let (reader, _writer) = completion_channel().unwrap();
        assert!(reader.receive().unwrap().is_none());
    }
}
