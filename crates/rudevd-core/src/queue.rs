//! Ordered queue of pending events and the dependency analysis that
//! decides which of them may be handed to workers.

use std::time::Instant;

use tracing::debug;

use crate::device::Device;
use crate::event::{Event, EventState};

/// Insertion failure.
#[derive(Debug, thiserror::Error)]
pub enum InsertError {
    /// The queue could not grow; the kernel event is lost.
    #[error("out of memory growing the event queue")]
    OutOfMemory,
}

/// Ordered list of pending events.
///
/// Events are kept in insertion order, which equals seqnum order because
/// the kernel assigns sequence numbers monotonically. Duplicate seqnums
/// would be a kernel bug and are not defended against.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Vec<Event>,
}

impl EventQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Append a received device to the tail of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`InsertError::OutOfMemory`] when the backing store cannot
    /// grow; the caller logs and drops the event.
    pub fn insert(&mut self, device: Device) -> Result<u64, InsertError> {
        self.events
            .try_reserve(1)
            .map_err(|_| InsertError::OutOfMemory)?;

        let event = Event::new(device);
        let seqnum = event.seqnum;
        debug!(
            seqnum,
            action = %event.device.action,
            subsystem = %event.device.subsystem,
            "event queued"
        );
        self.events.push(event);
        Ok(seqnum)
    }

    /// Whether the queue holds no events at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events in the queue, regardless of state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Borrow an event by seqnum.
    #[must_use]
    pub fn get(&self, seqnum: u64) -> Option<&Event> {
        self.index_of(seqnum).map(|idx| &self.events[idx])
    }

    /// Mutably borrow an event by seqnum.
    pub fn get_mut(&mut self, seqnum: u64) -> Option<&mut Event> {
        self.index_of(seqnum).map(move |idx| &mut self.events[idx])
    }

    /// Remove and return an event by seqnum.
    pub fn remove(&mut self, seqnum: u64) -> Option<Event> {
        self.index_of(seqnum).map(|idx| self.events.remove(idx))
    }

    /// Remove all events matching the state filter; `None` removes
    /// everything. Returns the number of events removed.
    pub fn cleanup(&mut self, filter: Option<EventState>) -> usize {
        let before = self.events.len();
        match filter {
            Some(state) => self.events.retain(|e| e.state != state),
            None => self.events.clear(),
        }
        before - self.events.len()
    }

    /// Mark an event as dispatched to a worker.
    pub fn mark_running(&mut self, seqnum: u64, worker_pid: i32, now: Instant) {
        if let Some(event) = self.get_mut(seqnum) {
            event.attach(worker_pid, now);
        }
    }

    /// Seqnums of all queued events that are not blocked by an earlier
    /// event, in seqnum order.
    ///
    /// A blocked event does not shadow later independent events; the scan
    /// always continues to the tail so disjoint device subtrees proceed in
    /// parallel.
    pub fn runnable(&mut self) -> Vec<u64> {
        let mut out = Vec::new();
        for idx in 0..self.events.len() {
            let (earlier, rest) = self.events.split_at_mut(idx);
            let event = &mut rest[0];
            if event.state != EventState::Queued {
                continue;
            }
            if is_blocked(earlier, event) {
                continue;
            }
            out.push(event.seqnum);
        }
        out
    }

    fn index_of(&self, seqnum: u64) -> Option<usize> {
        self.events.binary_search_by_key(&seqnum, |e| e.seqnum).ok()
    }
}

/// Whether any of `earlier` (all lower seqnums, in order) blocks `event`.
///
/// The first blocker found is memoized in `event.delaying_seqnum` so that
/// subsequent scans skip everything below it: the queue drains in order,
/// so once the memoized entry is gone no lower-seqnum entry can have
/// appeared to replace it.
fn is_blocked(earlier: &[Event], event: &mut Event) -> bool {
    for candidate in earlier {
        // Entries below the memoized blocker were ruled out by an earlier
        // scan and cannot block us now.
        if candidate.seqnum < event.delaying_seqnum {
            continue;
        }

        // The memoized blocker is still in the queue.
        if candidate.seqnum == event.delaying_seqnum {
            return true;
        }

        // Same device node.
        if !event.devnum.is_zero()
            && event.devnum == candidate.devnum
            && event.is_block == candidate.is_block
        {
            event.delaying_seqnum = candidate.seqnum;
            return true;
        }

        // Same network interface.
        if event.ifindex != 0 && event.ifindex == candidate.ifindex {
            event.delaying_seqnum = candidate.seqnum;
            return true;
        }

        // The candidate carries our previous name.
        if event
            .devpath_old
            .as_deref()
            .is_some_and(|old| candidate.devpath == old)
        {
            event.delaying_seqnum = candidate.seqnum;
            return true;
        }

        // Devpath containment: identical, ancestor or descendant paths
        // serialize; everything else is independent.
        let ours = event.devpath.as_bytes();
        let theirs = candidate.devpath.as_bytes();
        let common = ours.len().min(theirs.len());
        if ours[..common] != theirs[..common] {
            continue;
        }

        if ours.len() == theirs.len() {
            // Identical devpath; node numbers or ifindex may have been
            // reassigned to an unrelated device in the meantime.
            if !event.devnum.is_zero()
                && (event.devnum != candidate.devnum || event.is_block != candidate.is_block)
            {
                continue;
            }
            if event.ifindex != 0 && event.ifindex != candidate.ifindex {
                continue;
            }
            event.delaying_seqnum = candidate.seqnum;
            return true;
        }

        // The candidate is an ancestor of ours.
        if ours.get(common) == Some(&b'/') {
            event.delaying_seqnum = candidate.seqnum;
            return true;
        }

        // The candidate is a descendant of ours.
        if theirs.get(common) == Some(&b'/') {
            event.delaying_seqnum = candidate.seqnum;
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, Devnum};

    fn device(seqnum: u64, devpath: &str) -> Device {
        Device::builder(seqnum, "add", devpath).build()
    }

    fn block_device(seqnum: u64, devpath: &str, devnum: Devnum) -> Device {
        Device::builder(seqnum, "add", devpath)
            .subsystem("block")
            .devnum(devnum)
            .build()
    }

    #[test]
    fn test_insert_keeps_seqnum_order() {
        let mut queue = EventQueue::new();
        queue.insert(device(10, "/devices/a")).unwrap();
        queue.insert(device(11, "/devices/b")).unwrap();

        assert_eq!(queue.len(), 2);
        assert!(queue.get(10).is_some());
        assert!(queue.get(11).is_some());
        assert!(queue.get(12).is_none());
    }

    #[test]
    fn test_same_devpath_serializes() {
        let mut queue = EventQueue::new();
        queue.insert(device(10, "/devices/pci/a")).unwrap();
        queue.insert(device(11, "/devices/pci/a")).unwrap();

        assert_eq!(queue.runnable(), vec![10]);

        // Dispatch 10; 11 stays blocked while 10 is running.
        queue.mark_running(10, 100, Instant::now());
        assert_eq!(queue.runnable(), Vec::<u64>::new());

        // Completion of 10 unblocks 11.
        queue.remove(10);
        assert_eq!(queue.runnable(), vec![11]);
    }

    #[test]
    fn test_ancestor_blocks_descendant() {
        let mut queue = EventQueue::new();
        queue
            .insert(block_device(10, "/devices/pci", Devnum::new(8, 0)))
            .unwrap();
        queue
            .insert(block_device(11, "/devices/pci/a", Devnum::new(8, 1)))
            .unwrap();

        assert_eq!(queue.runnable(), vec![10]);
        queue.remove(10);
        assert_eq!(queue.runnable(), vec![11]);
    }

    #[test]
    fn test_descendant_blocks_ancestor() {
        let mut queue = EventQueue::new();
        queue.insert(device(10, "/devices/pci/a")).unwrap();
        queue.insert(device(11, "/devices/pci")).unwrap();

        assert_eq!(queue.runnable(), vec![10]);
    }

    #[test]
    fn test_sibling_prefix_is_independent() {
        // "/devices/pci" is a string prefix of "/devices/pcie" but not a
        // path ancestor; the events must not serialize.
        let mut queue = EventQueue::new();
        queue.insert(device(10, "/devices/pci")).unwrap();
        queue.insert(device(11, "/devices/pcie")).unwrap();

        assert_eq!(queue.runnable(), vec![10, 11]);
    }

    #[test]
    fn test_rename_blocks_on_old_name() {
        let mut queue = EventQueue::new();
        queue.insert(device(10, "/devices/x")).unwrap();
        queue
            .insert(
                Device::builder(11, "move", "/devices/y")
                    .devpath_old("/devices/x")
                    .build(),
            )
            .unwrap();

        assert_eq!(queue.runnable(), vec![10]);
        queue.remove(10);
        assert_eq!(queue.runnable(), vec![11]);
    }

    #[test]
    fn test_shared_devnum_serializes_within_subsystem_kind() {
        let mut queue = EventQueue::new();
        queue
            .insert(block_device(10, "/devices/a", Devnum::new(8, 0)))
            .unwrap();
        queue
            .insert(block_device(11, "/devices/b", Devnum::new(8, 0)))
            .unwrap();
        // Character device sharing the devnum is independent of the block
        // ones.
        queue
            .insert(
                Device::builder(12, "add", "/devices/c")
                    .subsystem("tty")
                    .devnum(Devnum::new(8, 0))
                    .build(),
            )
            .unwrap();

        assert_eq!(queue.runnable(), vec![10, 12]);
    }

    #[test]
    fn test_shared_ifindex_serializes() {
        let mut queue = EventQueue::new();
        queue
            .insert(
                Device::builder(10, "add", "/devices/net/a")
                    .subsystem("net")
                    .ifindex(4)
                    .build(),
            )
            .unwrap();
        queue
            .insert(
                Device::builder(11, "move", "/devices/net/b")
                    .subsystem("net")
                    .ifindex(4)
                    .build(),
            )
            .unwrap();

        assert_eq!(queue.runnable(), vec![10]);
    }

    #[test]
    fn test_independent_events_all_runnable() {
        let mut queue = EventQueue::new();
        queue.insert(device(10, "/devices/a")).unwrap();
        queue.insert(device(11, "/devices/b")).unwrap();

        assert_eq!(queue.runnable(), vec![10, 11]);
    }

    #[test]
    fn test_blocked_event_does_not_shadow_later_independent_event() {
        let mut queue = EventQueue::new();
        queue.insert(device(10, "/devices/a")).unwrap();
        queue.insert(device(11, "/devices/a")).unwrap();
        queue.insert(device(12, "/devices/b")).unwrap();

        assert_eq!(queue.runnable(), vec![10, 12]);
    }

    #[test]
    fn test_memoized_blocker_short_circuits() {
        let mut queue = EventQueue::new();
        queue.insert(device(10, "/devices/a")).unwrap();
        queue.insert(device(11, "/devices/a")).unwrap();

        assert_eq!(queue.runnable(), vec![10]);
        assert_eq!(queue.get(11).unwrap().delaying_seqnum, 10);

        // Re-scan with the memoized blocker still present.
        assert_eq!(queue.runnable(), vec![10]);
    }

    #[test]
    fn test_memoization_is_sound_after_blocker_leaves() {
        // 11 is blocked by 10; once 10 is gone nothing at or below seqnum
        // 10 may still block 11.
        let mut queue = EventQueue::new();
        queue.insert(device(9, "/devices/b")).unwrap();
        queue.insert(device(10, "/devices/a")).unwrap();
        queue.insert(device(11, "/devices/a")).unwrap();

        let runnable = queue.runnable();
        assert!(runnable.contains(&9));
        assert!(runnable.contains(&10));
        assert_eq!(queue.get(11).unwrap().delaying_seqnum, 10);

        queue.remove(10);
        assert!(queue.runnable().contains(&11));
    }

    #[test]
    fn test_cleanup_filters_by_state() {
        let mut queue = EventQueue::new();
        queue.insert(device(10, "/devices/a")).unwrap();
        queue.insert(device(11, "/devices/b")).unwrap();
        queue.mark_running(10, 100, Instant::now());

        let removed = queue.cleanup(Some(EventState::Queued));
        assert_eq!(removed, 1);
        assert!(queue.get(10).is_some());
        assert!(queue.get(11).is_none());

        let removed = queue.cleanup(None);
        assert_eq!(removed, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_running_event_still_blocks() {
        let mut queue = EventQueue::new();
        queue.insert(device(10, "/devices/a")).unwrap();
        queue.insert(device(11, "/devices/a/b")).unwrap();
        queue.mark_running(10, 100, Instant::now());

        assert_eq!(queue.runnable(), Vec::<u64>::new());
    }
}
