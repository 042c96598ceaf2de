//! Device snapshot taken from a kernel uevent.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Major/minor pair identifying a device node.
///
/// [`Devnum::ZERO`] means the event does not refer to a device node at all;
/// the scheduler never considers a zero devnum for dependency analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Devnum {
    /// Major number.
    pub major: u32,
    /// Minor number.
    pub minor: u32,
}

impl Devnum {
    /// The "not a device node" value.
    pub const ZERO: Self = Self { major: 0, minor: 0 };

    /// Create a devnum from a major/minor pair.
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Whether this is the "not a device node" value.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.major == 0 && self.minor == 0
    }
}

impl std::fmt::Display for Devnum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// One kernel device notification, captured at reception time.
///
/// The broker treats the snapshot as immutable; only the rule executor in a
/// worker amends it (symlink lists, renamed interface names and the like)
/// before it is published to subscribers. The type is serializable because
/// it crosses the unicast channel between the broker and its workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Kernel sequence number; the sole authoritative ordering.
    pub seqnum: u64,
    /// Event action ("add", "change", "remove", "move", ...).
    pub action: String,
    /// Device path within the kernel device tree, e.g. `/devices/pci0000:00/...`.
    pub devpath: String,
    /// Previous device path if this event renames the device.
    pub devpath_old: Option<String>,
    /// Kernel subsystem ("block", "net", "usb", ...).
    pub subsystem: String,
    /// Device type within the subsystem ("disk", "partition", ...), if any.
    pub devtype: Option<String>,
    /// Last component of the device path.
    pub sysname: String,
    /// Device-node number; zero when the event carries no node.
    pub devnum: Devnum,
    /// Network-interface index; zero for non-network devices.
    pub ifindex: u32,
    /// Path of the device node under `/dev`, if any.
    pub devnode: Option<PathBuf>,
    /// Absolute sysfs path of the device.
    pub syspath: PathBuf,
    /// Remaining uevent properties, key to value.
    pub properties: BTreeMap<String, String>,
}

impl Device {
    /// Create a builder seeded with the mandatory uevent fields.
    #[must_use]
    pub fn builder(seqnum: u64, action: impl Into<String>, devpath: impl Into<String>) -> DeviceBuilder {
        DeviceBuilder::new(seqnum, action.into(), devpath.into())
    }

    /// Whether the device belongs to the block subsystem.
    #[must_use]
    pub fn is_block(&self) -> bool {
        self.subsystem == "block"
    }

    /// Whether this is a partition of a block device.
    #[must_use]
    pub fn is_partition(&self) -> bool {
        self.devtype.as_deref() == Some("partition")
    }

    /// A property by key, if present.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Builder for [`Device`].
#[derive(Debug)]
pub struct DeviceBuilder {
    seqnum: u64,
    action: String,
    devpath: String,
    devpath_old: Option<String>,
    subsystem: String,
    devtype: Option<String>,
    devnum: Devnum,
    ifindex: u32,
    devnode: Option<PathBuf>,
    properties: BTreeMap<String, String>,
}

impl DeviceBuilder {
    fn new(seqnum: u64, action: String, devpath: String) -> Self {
        Self {
            seqnum,
            action,
            devpath,
            devpath_old: None,
            subsystem: String::new(),
            devtype: None,
            devnum: Devnum::ZERO,
            ifindex: 0,
            devnode: None,
            properties: BTreeMap::new(),
        }
    }

    /// Set the previous device path of a rename event.
    #[must_use]
    pub fn devpath_old(mut self, devpath_old: impl Into<String>) -> Self {
        self.devpath_old = Some(devpath_old.into());
        self
    }

    /// Set the subsystem.
    #[must_use]
    pub fn subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = subsystem.into();
        self
    }

    /// Set the device type.
    #[must_use]
    pub fn devtype(mut self, devtype: impl Into<String>) -> Self {
        self.devtype = Some(devtype.into());
        self
    }

    /// Set the device-node number.
    #[must_use]
    pub fn devnum(mut self, devnum: Devnum) -> Self {
        self.devnum = devnum;
        self
    }

    /// Set the network-interface index.
    #[must_use]
    pub fn ifindex(mut self, ifindex: u32) -> Self {
        self.ifindex = ifindex;
        self
    }

    /// Set the device-node path.
    #[must_use]
    pub fn devnode(mut self, devnode: impl Into<PathBuf>) -> Self {
        self.devnode = Some(devnode.into());
        self
    }

    /// Add a uevent property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Build the device snapshot.
    #[must_use]
    pub fn build(self) -> Device {
        let sysname = self
            .devpath
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let syspath = PathBuf::from(format!("/sys{}", self.devpath));
        Device {
            seqnum: self.seqnum,
            action: self.action,
            devpath: self.devpath,
            devpath_old: self.devpath_old,
            subsystem: self.subsystem,
            devtype: self.devtype,
            sysname,
            devnum: self.devnum,
            ifindex: self.ifindex,
            devnode: self.devnode,
            syspath,
            properties: self.properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_derives_sysname_and_syspath() {
        let dev = Device::builder(7, "add", "/devices/pci0000:00/sda")
            .subsystem("block")
            .devnum(Devnum::new(8, 0))
            .build();

        assert_eq!(dev.sysname, "sda");
        assert_eq!(dev.syspath, PathBuf::from("/sys/devices/pci0000:00/sda"));
        assert!(dev.is_block());
        assert!(!dev.is_partition());
    }

    #[test]
    fn test_devnum_zero() {
        assert!(Devnum::ZERO.is_zero());
        assert!(!Devnum::new(8, 1).is_zero());
        assert_eq!(Devnum::new(8, 1).to_string(), "8:1");
    }

    #[test]
    fn test_device_roundtrips_through_json() {
        let dev = Device::builder(42, "change", "/devices/virtual/net/eth0")
            .subsystem("net")
            .ifindex(3)
            .property("INTERFACE", "eth0")
            .build();

        let bytes = serde_json::to_vec(&dev).unwrap();
        let back: Device = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, dev);
    }
}
