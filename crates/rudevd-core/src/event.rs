//! Pending device change tracked by the broker.

use std::time::Instant;

use crate::device::{Device, Devnum};

/// Scheduling state of a pending event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    /// Waiting in the queue for admission.
    Queued,
    /// Handed to a worker, not yet completed.
    Running,
}

/// One pending device change.
///
/// The dependency keys (`devpath`, `devnum`, `ifindex`, ...) are copied out
/// of the device at insertion time and never change. `kernel_device` keeps
/// the unamended kernel snapshot so it can be re-forwarded to subscribers
/// if the owning worker fails.
#[derive(Debug)]
pub struct Event {
    /// Kernel sequence number; also the queue key.
    pub seqnum: u64,
    /// Device path, the primary dependency key.
    pub devpath: String,
    /// Previous device path of a rename event.
    pub devpath_old: Option<String>,
    /// Device-node number; zero when not a node.
    pub devnum: Devnum,
    /// Block/character disambiguation for shared devnums.
    pub is_block: bool,
    /// Network-interface index; zero for non-network devices.
    pub ifindex: u32,
    /// Scheduling state.
    pub state: EventState,
    /// Lowest-seqnum earlier event known to block this one; zero when unknown.
    pub delaying_seqnum: u64,
    /// Pid of the worker owning this event while `Running`.
    pub worker: Option<i32>,
    /// Dispatch timestamp, used by the timeout sweep.
    pub start_time: Option<Instant>,
    /// Whether the "taking a long time" warning was already emitted.
    pub warned: bool,
    /// The device handed to the worker.
    pub device: Device,
    /// Unamended kernel snapshot, re-forwarded on worker failure.
    pub kernel_device: Device,
}

impl Event {
    /// Capture a new queued event from a received device.
    #[must_use]
    pub fn new(device: Device) -> Self {
        let kernel_device = device.clone();
        Self {
            seqnum: device.seqnum,
            devpath: device.devpath.clone(),
            devpath_old: device.devpath_old.clone(),
            devnum: device.devnum,
            is_block: device.is_block(),
            ifindex: device.ifindex,
            state: EventState::Queued,
            delaying_seqnum: 0,
            worker: None,
            start_time: None,
            warned: false,
            device,
            kernel_device,
        }
    }

    /// Mark the event as running under the given worker.
    pub fn attach(&mut self, worker_pid: i32, now: Instant) {
        self.state = EventState::Running;
        self.worker = Some(worker_pid);
        self.start_time = Some(now);
        self.warned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_event_is_queued() {
        let dev = Device::builder(10, "add", "/devices/a").build();
        let event = Event::new(dev);

        assert_eq!(event.seqnum, 10);
        assert_eq!(event.state, EventState::Queued);
        assert_eq!(event.delaying_seqnum, 0);
        assert!(event.worker.is_none());
        assert!(event.start_time.is_none());
    }

    #[test]
    fn test_attach_marks_running() {
        let dev = Device::builder(10, "add", "/devices/a").build();
        let mut event = Event::new(dev);
        event.warned = true;

        event.attach(4321, Instant::now());

        assert_eq!(event.state, EventState::Running);
        assert_eq!(event.worker, Some(4321));
        assert!(event.start_time.is_some());
        assert!(!event.warned);
    }
}
