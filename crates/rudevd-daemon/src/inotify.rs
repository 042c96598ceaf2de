//! Device-node watches and "change" synthesis.
//!
//! Workers arrange a close-after-write watch on device nodes when rules
//! ask for one. The inotify descriptor is created by the broker before any
//! worker is forked, so watches added by a worker surface in the broker's
//! reactor. The descriptor-to-device mapping is kept as small records on
//! the filesystem because the add happens in the child process while the
//! event arrives in the parent.

use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use rudevd_core::device::Device;

use crate::paths::RuntimeDirs;

/// Watch facility failure.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Underlying inotify or filesystem failure.
    #[error("watch error: {0}")]
    Io(#[from] io::Error),
    /// The device carries no node to watch.
    #[error("device {0} has no device node to watch")]
    NoDevnode(String),
}

/// One raw inotify notification.
#[derive(Debug, Clone, Copy)]
pub struct WatchEvent {
    /// Watch descriptor the notification belongs to.
    pub wd: i32,
    /// Raw event mask.
    pub mask: u32,
}

impl WatchEvent {
    /// A watched node was closed after being opened for writing.
    #[must_use]
    pub fn is_close_write(&self) -> bool {
        self.mask & libc::IN_CLOSE_WRITE != 0
    }

    /// The watch was removed (node deleted or unmounted).
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.mask & libc::IN_IGNORED != 0
    }
}

/// Shared per-device-node inotify facility.
#[derive(Debug)]
pub struct NodeWatch {
    fd: OwnedFd,
    dirs: RuntimeDirs,
}

impl NodeWatch {
    /// Create the inotify instance and the watch-record directory.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Io`] when the instance cannot be created.
    #[allow(unsafe_code)]
    pub fn init(dirs: RuntimeDirs) -> Result<Self, WatchError> {
        // SAFETY: inotify_init1 takes no pointers; a negative return is
        // mapped to an error below and the descriptor is owned
        // immediately.
        let raw = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: raw is a live descriptor we exclusively own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        fs::create_dir_all(dirs.watch_dir())?;
        Ok(Self { fd, dirs })
    }

    /// Begin watching the device's node for close-after-write.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::NoDevnode`] for node-less devices and
    /// [`WatchError::Io`] when the watch cannot be added.
    #[allow(unsafe_code)]
    pub fn begin(&self, device: &Device) -> Result<(), WatchError> {
        let devnode = device
            .devnode
            .as_ref()
            .ok_or_else(|| WatchError::NoDevnode(device.devpath.clone()))?;
        let c_path = std::ffi::CString::new(devnode.as_os_str().as_encoded_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        // SAFETY: c_path is a valid NUL-terminated string that outlives
        // the call; the descriptor is owned by self.
        let wd = unsafe {
            libc::inotify_add_watch(self.fd.as_raw_fd(), c_path.as_ptr(), libc::IN_CLOSE_WRITE)
        };
        if wd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let payload = serde_json::to_vec(device).map_err(io::Error::other)?;
        fs::write(self.record_path(wd), payload)?;
        debug!(wd, devnode = %devnode.display(), "watch started");
        Ok(())
    }

    /// Stop a watch and drop its record.
    #[allow(unsafe_code)]
    pub fn end(&self, wd: i32) {
        // SAFETY: removing an already-removed descriptor fails with
        // EINVAL, which is harmless here.
        unsafe {
            libc::inotify_rm_watch(self.fd.as_raw_fd(), wd);
        }
        let _ = fs::remove_file(self.record_path(wd));
        debug!(wd, "watch ended");
    }

    /// Resolve a notification back to the watched device.
    #[must_use]
    pub fn lookup(&self, wd: i32) -> Option<Device> {
        let payload = fs::read(self.record_path(wd)).ok()?;
        serde_json::from_slice(&payload).ok()
    }

    /// Re-establish watches recorded by a previous daemon instance.
    ///
    /// Descriptors do not survive a restart, so each surviving record is
    /// re-added (receiving a fresh descriptor) and the stale record
    /// dropped.
    pub fn restore(&self) {
        let Ok(entries) = fs::read_dir(self.dirs.watch_dir()) else {
            return;
        };
        for entry in entries.flatten() {
            let Ok(payload) = fs::read(entry.path()) else {
                continue;
            };
            let _ = fs::remove_file(entry.path());
            let Ok(device) = serde_json::from_slice::<Device>(&payload) else {
                continue;
            };
            if let Err(e) = self.begin(&device) {
                debug!(devpath = %device.devpath, error = %e, "could not restore watch");
            }
        }
    }

    /// Read all pending notifications.
    #[must_use]
    #[allow(unsafe_code)]
    pub fn drain(&self) -> Vec<WatchEvent> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            // SAFETY: buf is a valid writable buffer of the stated
            // length for the whole call.
            let len = unsafe {
                libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if len > 0 {
                #[allow(clippy::cast_sign_loss)]
                parse_events(&buf[..len as usize], &mut out);
                continue;
            }
            if len == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN | libc::EINTR) => {}
                _ => warn!(error = %err, "failed to read inotify events"),
            }
            break;
        }
        out
    }

    fn record_path(&self, wd: i32) -> PathBuf {
        self.dirs.watch_dir().join(wd.to_string())
    }
}

impl AsRawFd for NodeWatch {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for NodeWatch {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Decode packed `inotify_event` records from a read buffer.
fn parse_events(mut buf: &[u8], out: &mut Vec<WatchEvent>) {
    // Each record is a 16-byte header (wd, mask, cookie, len) followed by
    // len bytes of name.
    while buf.len() >= 16 {
        let wd = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let mask = u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let len = u32::from_ne_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;
        out.push(WatchEvent { wd, mask });
        let advance = 16 + len;
        if buf.len() < advance {
            break;
        }
        buf = &buf[advance..];
    }
}

/// Synthesize a "change" uevent for a closed-after-write device node.
///
/// For whole disks the partition table is re-read first: when that
/// succeeds on a partitioned disk, the kernel emits its own change and
/// partition events and nothing needs synthesizing here. Otherwise the
/// device (and each of its partitions) gets `change` written to its
/// `uevent` attribute, which makes the kernel emit an ordinary uevent
/// that flows back through the normal queue.
pub fn synthesize_change(device: &Device) {
    if device.is_block()
        && device.devtype.as_deref() == Some("disk")
        && !device.sysname.starts_with("dm-")
    {
        let part_table_read = device
            .devnode
            .as_deref()
            .is_some_and(reread_partition_table);
        let partitions = partitions_of(&device.syspath);

        if part_table_read && !partitions.is_empty() {
            return;
        }

        debug!(devpath = %device.devpath, "synthesizing 'change'");
        write_change(&device.syspath);
        for partition in partitions {
            debug!(partition = %partition.display(), "synthesizing partition 'change'");
            write_change(&partition);
        }
        return;
    }

    debug!(devpath = %device.devpath, "synthesizing 'change'");
    write_change(&device.syspath);
}

nix::ioctl_none!(blkrrpart, 0x12, 95);

/// Try to re-read the partition table. Succeeds only while no one else
/// holds the device open.
#[allow(unsafe_code)]
fn reread_partition_table(devnode: &Path) -> bool {
    let file = match fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_CLOEXEC | libc::O_NOFOLLOW | libc::O_NONBLOCK)
        .open(devnode)
    {
        Ok(file) => file,
        Err(_) => return false,
    };
    if file.try_lock_exclusive().is_err() {
        return false;
    }
    // SAFETY: the descriptor is valid for the duration of the call and
    // BLKRRPART takes no argument.
    let result = unsafe { blkrrpart(file.as_raw_fd()) };
    let _ = file.unlock();
    result.is_ok()
}

/// Sysfs directories of the disk's partitions.
#[must_use]
pub fn partitions_of(syspath: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(syspath) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.join("partition").is_file())
        .collect();
    out.sort();
    out
}

fn write_change(syspath: &Path) {
    let path = syspath.join("uevent");
    if let Err(e) = fs::write(&path, "change") {
        warn!(path = %path.display(), error = %e, "failed to write uevent attribute");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn watch_fixture() -> (tempfile::TempDir, NodeWatch) {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = RuntimeDirs::at(tmp.path().join("udev"));
        dirs.ensure().unwrap();
        let watch = NodeWatch::init(dirs).unwrap();
        (tmp, watch)
    }

    fn node_device(tmp: &tempfile::TempDir, name: &str) -> Device {
        let node = tmp.path().join(name);
        fs::write(&node, b"").unwrap();
        Device::builder(1, "add", format!("/devices/virtual/{name}"))
            .subsystem("mem")
            .devnode(node)
            .build()
    }

    #[test]
    fn test_close_write_is_reported() {
        let (tmp, watch) = watch_fixture();
        let device = node_device(&tmp, "node0");
        watch.begin(&device).unwrap();

        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(device.devnode.as_ref().unwrap())
            .unwrap();
        file.write_all(b"x").unwrap();
        drop(file);

        let events = watch.drain();
        assert!(events.iter().any(WatchEvent::is_close_write));

        let wd = events[0].wd;
        let resolved = watch.lookup(wd).unwrap();
        assert_eq!(resolved.devpath, device.devpath);
    }

    #[test]
    fn test_end_removes_record() {
        let (tmp, watch) = watch_fixture();
        let device = node_device(&tmp, "node1");
        watch.begin(&device).unwrap();

        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(device.devnode.as_ref().unwrap())
            .unwrap();
        file.write_all(b"x").unwrap();
        drop(file);
        let events = watch.drain();
        let wd = events[0].wd;

        watch.end(wd);
        assert!(watch.lookup(wd).is_none());
    }

    #[test]
    fn test_begin_requires_devnode() {
        let (_tmp, watch) = watch_fixture();
        let device = Device::builder(1, "add", "/devices/nodeless").build();
        assert!(matches!(
            watch.begin(&device),
            Err(WatchError::NoDevnode(_))
        ));
    }

    #[test]
    fn test_partitions_of_scans_sysfs_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = tmp.path().join("sda");
        fs::create_dir_all(disk.join("sda1")).unwrap();
        fs::create_dir_all(disk.join("sda2")).unwrap();
        fs::create_dir_all(disk.join("queue")).unwrap();
        fs::write(disk.join("sda1/partition"), "1").unwrap();
        fs::write(disk.join("sda2/partition"), "2").unwrap();

        let partitions = partitions_of(&disk);
        assert_eq!(partitions.len(), 2);
        assert!(partitions[0].ends_with("sda1"));
        assert!(partitions[1].ends_with("sda2"));
    }
}
