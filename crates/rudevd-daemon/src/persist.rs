//! Filesystem-backed device records and tag indices.
//!
//! Records live under `<run>/data/<id>`, tag links under
//! `<run>/tags/<tag>/<id>`. Workers refresh records while handling an
//! event; the broker deletes them when a worker dies mid-event so stale
//! state never outlives a failed rule run.

use std::fs;

use tracing::debug;

use rudevd_core::device::Device;
use rudevd_core::exec::{DevicePersistence, PersistError};

use crate::paths::RuntimeDirs;

/// Stable record id of a device: `b<maj>:<min>` for block nodes,
/// `c<maj>:<min>` for character nodes, `n<ifindex>` for network
/// interfaces, `+<subsystem>:<sysname>` otherwise.
#[must_use]
pub fn device_id(device: &Device) -> String {
    if !device.devnum.is_zero() {
        let kind = if device.is_block() { 'b' } else { 'c' };
        format!("{kind}{}", device.devnum)
    } else if device.ifindex != 0 {
        format!("n{}", device.ifindex)
    } else {
        format!("+{}:{}", device.subsystem, device.sysname)
    }
}

/// Device-record handle rooted in the runtime directory.
#[derive(Debug, Clone)]
pub struct FsPersistence {
    dirs: RuntimeDirs,
}

impl FsPersistence {
    /// Create a handle over the given runtime layout.
    #[must_use]
    pub fn new(dirs: RuntimeDirs) -> Self {
        Self { dirs }
    }

    fn tags_of(device: &Device) -> Vec<String> {
        device
            .property("TAGS")
            .map(|tags| {
                tags.split(':')
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl DevicePersistence for FsPersistence {
    fn record_update(&self, device: &Device) -> Result<(), PersistError> {
        let id = device_id(device);
        let path = self.dirs.data_dir().join(&id);
        let payload = serde_json::to_vec(device).map_err(std::io::Error::other)?;
        fs::write(&path, payload)?;
        debug!(id, "device record updated");
        Ok(())
    }

    fn record_delete(&self, device: &Device) -> Result<(), PersistError> {
        let id = device_id(device);
        let path = self.dirs.data_dir().join(&id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(id, "device record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn tag_untag(&self, device: &Device) -> Result<(), PersistError> {
        let id = device_id(device);
        for tag in Self::tags_of(device) {
            let link = self.dirs.tags_dir().join(&tag).join(&id);
            let _ = fs::remove_file(link);
        }
        Ok(())
    }
}
