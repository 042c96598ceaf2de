//! Body of a forked worker process.
//!
//! A worker shares the broker's address-space image at spawn and from then
//! on communicates only over its unicast device channel and the shared
//! completion socket. The broker's view of the worker's event stays
//! authoritative until the completion datagram arrives.

use std::fs;
use std::os::fd::RawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use fs2::FileExt;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::Signal;
use nix::sys::signalfd::{SfdFlags, SigSet, SignalFd};
use tracing::{debug, error, warn};

use rudevd_core::device::Device;
use rudevd_core::exec::{DevicePersistence, ExecTimeouts, ProcessedEventSink, RuleExecutor};
use rudevd_core::properties::PropertiesSet;

use crate::channel::{CompletionWriter, DeviceReceiver};
use crate::inotify::NodeWatch;

/// Everything a worker needs besides its channels; assembled by the
/// broker and inherited by the child across fork.
#[derive(Clone)]
pub struct WorkerHarness {
    /// Compiled rule set captured at spawn; replaced workers pick up
    /// reloaded rules.
    pub rules: Arc<dyn RuleExecutor>,
    /// Subscriber transport for processed devices.
    pub sink: Arc<dyn ProcessedEventSink>,
    /// Persistent device-record handle.
    pub persistence: Arc<dyn DevicePersistence>,
    /// Shared device-node watch facility.
    pub watch: Arc<NodeWatch>,
    /// Per-event execution limits.
    pub timeouts: ExecTimeouts,
}

impl std::fmt::Debug for WorkerHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHarness")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

const TOKEN_SIGNAL: u64 = 0;
const TOKEN_DEVICE: u64 = 1;

/// Run the worker loop; never returns.
///
/// Entered directly after `fork()` in the child. The child releases the
/// broker-only descriptors it inherited, sets up its own signal handling
/// and multiplexer, then processes the initial device and every further
/// one the broker unicasts to it.
pub fn child_main(
    receiver: &DeviceReceiver,
    notifier: &CompletionWriter,
    initial: Device,
    harness: &WorkerHarness,
    properties: &PropertiesSet,
    parent_fds: &[RawFd],
) -> ! {
    // Raw close is correct here: the owning values still live in the
    // child's copy of the heap, but the child leaves via _exit and never
    // runs their drops.
    for &fd in parent_fds {
        let _ = nix::unistd::close(fd);
    }

    // Route every signal through a fresh descriptor owned by this
    // process. The mask is normally inherited blocked from the broker;
    // setting it again keeps the worker correct on its own.
    if let Err(e) = nix::sys::signal::sigprocmask(
        nix::sys::signal::SigmaskHow::SIG_SETMASK,
        Some(&SigSet::all()),
        None,
    ) {
        error!(error = %e, "error blocking signals in worker");
        child_exit(1);
    }
    let mut signal_fd = match SignalFd::with_flags(
        &SigSet::all(),
        SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC,
    ) {
        Ok(fd) => fd,
        Err(e) => {
            error!(error = %e, "error creating worker signalfd");
            child_exit(1);
        }
    };

    let epoll = match Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC) {
        Ok(epoll) => epoll,
        Err(e) => {
            error!(error = %e, "error creating worker epoll");
            child_exit(1);
        }
    };
    let registered = epoll
        .add(
            &signal_fd,
            EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_SIGNAL),
        )
        .and_then(|()| {
            epoll.add(receiver, EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_DEVICE))
        });
    if let Err(e) = registered {
        error!(error = %e, "failed to add fds to worker epoll");
        child_exit(1);
    }

    // Die with the broker.
    if let Err(e) = nix::sys::prctl::set_pdeathsig(Signal::SIGTERM) {
        warn!(error = %e, "failed to set parent-death signal");
    }

    // Only the broker is shielded from the OOM killer.
    let _ = fs::write("/proc/self/oom_score_adj", "0");

    let mut device = initial;
    loop {
        handle_device(&mut device, harness, properties);

        debug!(seqnum = device.seqnum, "event processed");
        if let Err(e) = notifier.notify() {
            error!(
                seqnum = device.seqnum,
                error = %e,
                "failed to send result to main daemon"
            );
        }

        device = match wait_for_device(&epoll, &mut signal_fd, receiver) {
            Some(next) => next,
            None => child_exit(0),
        };
    }
}

/// Execute rules for one device, honoring the node-lock protocol.
fn handle_device(device: &mut Device, harness: &WorkerHarness, properties: &PropertiesSet) {
    debug!(seqnum = device.seqnum, "event running");

    // A shared lock on the device node establishes device ownership
    // against external exclusive holders; when one of those holds the
    // node we skip the whole rule run for this event.
    let _node_lock = match lock_device_node(device) {
        NodeLock::Acquired(file) => Some(file),
        NodeLock::NotNeeded => None,
        NodeLock::Contended(path) => {
            debug!(
                node = %path.display(),
                seqnum = device.seqnum,
                "device node locked externally, skipping event handling"
            );
            return;
        }
    };

    let outcome = match harness.rules.apply(device, properties, &harness.timeouts) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(seqnum = device.seqnum, error = %e, "rule application failed");
            rudevd_core::exec::RuleOutcome::default()
        }
    };
    if let Err(e) = harness.rules.run_programs(device, &harness.timeouts) {
        warn!(seqnum = device.seqnum, error = %e, "rule programs failed");
    }

    if outcome.watch {
        if let Err(e) = harness.watch.begin(device) {
            warn!(seqnum = device.seqnum, error = %e, "failed to begin node watch");
        }
        if let Err(e) = harness.persistence.record_update(device) {
            warn!(seqnum = device.seqnum, error = %e, "failed to update device record");
        }
    }

    if let Err(e) = harness.sink.publish(device) {
        warn!(seqnum = device.seqnum, error = %e, "failed to publish device");
    }
}

enum NodeLock {
    Acquired(fs::File),
    NotNeeded,
    Contended(PathBuf),
}

/// Take the shared advisory lock for block-device events that need one.
fn lock_device_node(device: &Device) -> NodeLock {
    let Some(path) = lock_node_path(device) else {
        return NodeLock::NotNeeded;
    };
    let file = match fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_CLOEXEC | libc::O_NOFOLLOW | libc::O_NONBLOCK)
        .open(&path)
    {
        Ok(file) => file,
        // No node to lock is no reason to skip the event.
        Err(_) => return NodeLock::NotNeeded,
    };
    match file.try_lock_shared() {
        Ok(()) => NodeLock::Acquired(file),
        Err(_) => NodeLock::Contended(path),
    }
}

/// The node to lock, if this event takes one: block-device non-removals
/// that are neither device-mapper nor md, locking the whole-disk node
/// when the event is for a partition.
fn lock_node_path(device: &Device) -> Option<PathBuf> {
    if device.action == "remove" || !device.is_block() {
        return None;
    }
    if device.sysname.starts_with("dm-") || device.sysname.starts_with("md") {
        return None;
    }
    if device.is_partition() {
        // Partitions sit below their disk in sysfs, so the parent
        // directory names the whole-disk node.
        let disk = device.syspath.parent()?.file_name()?;
        Some(PathBuf::from("/dev").join(disk))
    } else {
        device.devnode.clone()
    }
}

/// Block until the broker unicasts another device or SIGTERM arrives.
fn wait_for_device(
    epoll: &Epoll,
    signal_fd: &mut SignalFd,
    receiver: &DeviceReceiver,
) -> Option<Device> {
    let mut events = [EpollEvent::empty(); 4];
    loop {
        let count = match epoll.wait(&mut events, EpollTimeout::NONE) {
            Ok(count) => count,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!(error = %e, "worker failed to poll");
                return None;
            }
        };

        for event in &events[..count] {
            match event.data() {
                TOKEN_DEVICE => match receiver.receive() {
                    Ok(Some(device)) => return Some(device),
                    // Broker closed the channel; nothing more will come.
                    Ok(None) => return None,
                    Err(e) => {
                        error!(error = %e, "worker failed to receive device");
                        return None;
                    }
                },
                TOKEN_SIGNAL => {
                    while let Ok(Some(siginfo)) = signal_fd.read_signal() {
                        if siginfo.ssi_signo == Signal::SIGTERM as u32 {
                            return None;
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// Terminate the child without unwinding into broker-owned state.
#[allow(unsafe_code)]
fn child_exit(code: i32) -> ! {
    // SAFETY: _exit only terminates the calling process; skipping
    // destructors is intended because everything owned here is either
    // shared with the broker or cleaned up by the kernel.
    unsafe { libc::_exit(code) }
}
