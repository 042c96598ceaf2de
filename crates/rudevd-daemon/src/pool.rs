//! Worker records and the pool managing their lifecycle.
//!
//! Workers are forked from the broker, reused while idle, killed on
//! timeout or reload and reaped on exit. The pool owns the worker map and
//! the shared completion channel; the event queue stays with the broker,
//! with cross-links kept as plain keys (pid one way, seqnum the other).

use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Instant;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, error, warn};

use rudevd_core::event::Event;
use rudevd_core::properties::PropertiesSet;

use crate::channel::{
    completion_channel, device_channel, ChannelError, Completion, CompletionReader,
    CompletionWriter, DeviceSender,
};
use crate::worker::{child_main, WorkerHarness};

/// Lifecycle state of one worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Executing rules for its attached event.
    Running,
    /// Waiting for another device.
    Idle,
    /// Sent a termination signal; never reassigned.
    Killed,
}

/// Broker-side record of one worker process.
#[derive(Debug)]
pub struct Worker {
    pid: Pid,
    state: WorkerState,
    channel: DeviceSender,
    event: Option<u64>,
}

impl Worker {
    /// The worker's process id.
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Seqnum of the attached event, if any.
    #[must_use]
    pub fn event(&self) -> Option<u64> {
        self.event
    }
}

/// Outcome of a dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The event was handed to a worker.
    Dispatched,
    /// Every worker is busy and the pool is at its cap; the event stays
    /// queued.
    AtCapacity,
    /// Spawning a worker failed; the event stays queued.
    SpawnFailed,
}

/// Default worker cap: a base of eight plus two per CPU.
#[must_use]
pub fn default_children_max() -> usize {
    let cpus = std::thread::available_parallelism().map_or(0, std::num::NonZeroUsize::get);
    8 + cpus * 2
}

/// The pool of worker processes.
#[derive(Debug)]
pub struct WorkerPool {
    workers: HashMap<Pid, Worker>,
    children_max: usize,
    completion_rx: CompletionReader,
    completion_tx: CompletionWriter,
}

impl WorkerPool {
    /// Create an empty pool with the given cap.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when the completion channel cannot be
    /// created.
    pub fn new(children_max: usize) -> Result<Self, ChannelError> {
        let (completion_rx, completion_tx) = completion_channel()?;
        Ok(Self {
            workers: HashMap::new(),
            children_max,
            completion_rx,
            completion_tx,
        })
    }

    /// Descriptor the reactor polls for completion datagrams.
    #[must_use]
    pub fn completion_fd(&self) -> RawFd {
        self.completion_rx.as_raw_fd()
    }

    /// Read end of the completion channel, for multiplexer registration.
    #[must_use]
    pub fn completion_reader(&self) -> &CompletionReader {
        &self.completion_rx
    }

    /// Number of live workers, any state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no workers exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// The worker cap.
    #[must_use]
    pub fn children_max(&self) -> usize {
        self.children_max
    }

    /// Update the worker cap; existing workers are not culled.
    pub fn set_children_max(&mut self, children_max: usize) {
        debug!(children_max, "children_max updated");
        self.children_max = children_max;
    }

    /// Hand an event to an idle worker, or fork a new one below the cap.
    pub fn dispatch(
        &mut self,
        event: &mut Event,
        harness: &WorkerHarness,
        properties: &PropertiesSet,
        parent_fds: &[RawFd],
    ) -> DispatchOutcome {
        for worker in self.workers.values_mut() {
            if worker.state != WorkerState::Idle {
                continue;
            }
            match worker.channel.send(&event.device) {
                Ok(()) => {
                    attach(worker, event);
                    return DispatchOutcome::Dispatched;
                }
                Err(e) => {
                    // A worker that cannot take a message is broken; the
                    // event waits for the next dispatch pass.
                    error!(
                        pid = worker.pid.as_raw(),
                        error = %e,
                        "worker did not accept message, killing it"
                    );
                    let _ = kill(worker.pid, Signal::SIGKILL);
                    worker.state = WorkerState::Killed;
                }
            }
        }

        if self.workers.len() >= self.children_max {
            if self.children_max > 1 {
                debug!(
                    children_max = self.children_max,
                    "maximum number of children reached"
                );
            }
            return DispatchOutcome::AtCapacity;
        }

        self.spawn(event, harness, properties, parent_fds)
    }

    /// Fork a new worker seeded with the event's device.
    #[allow(unsafe_code)]
    fn spawn(
        &mut self,
        event: &mut Event,
        harness: &WorkerHarness,
        properties: &PropertiesSet,
        parent_fds: &[RawFd],
    ) -> DispatchOutcome {
        let (sender, receiver) = match device_channel() {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "failed to create worker channel");
                return DispatchOutcome::SpawnFailed;
            }
        };

        // Descriptors the child must not keep: broker-only fds supplied
        // by the reactor, the completion read end, every live worker's
        // channel, and its own channel's send end.
        let mut close_fds: Vec<RawFd> = parent_fds.to_vec();
        close_fds.push(self.completion_rx.as_raw_fd());
        close_fds.extend(self.workers.values().map(|w| w.channel.as_raw_fd()));
        close_fds.push(sender.as_raw_fd());

        let device = event.device.clone();

        // SAFETY: the broker is single-threaded by construction (one
        // reactor, no runtime threads), so fork() duplicates the only
        // thread and the child continues from a consistent image.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                child_main(
                    &receiver,
                    &self.completion_tx,
                    device,
                    harness,
                    properties,
                    &close_fds,
                );
            }
            Ok(ForkResult::Parent { child }) => {
                drop(receiver);
                let mut worker = Worker {
                    pid: child,
                    state: WorkerState::Running,
                    channel: sender,
                    event: None,
                };
                attach(&mut worker, event);
                debug!(
                    seqnum = event.seqnum,
                    pid = child.as_raw(),
                    "forked new worker"
                );
                self.workers.insert(child, worker);
                DispatchOutcome::Dispatched
            }
            Err(e) => {
                error!(error = %e, "fork of worker failed");
                DispatchOutcome::SpawnFailed
            }
        }
    }

    /// Receive one pending completion datagram.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure.
    pub fn recv_completion(&self) -> Result<Option<Completion>, ChannelError> {
        self.completion_rx.receive()
    }

    /// Process a completion message; returns the seqnum of the event the
    /// broker must now free.
    ///
    /// Messages without kernel credentials, with a payload, or from pids
    /// the pool does not track are dropped. A repeated completion for an
    /// already-idle worker is a warned no-op.
    pub fn on_completion(&mut self, completion: Completion) -> Option<u64> {
        let Some(pid) = completion.pid.filter(|pid| *pid > 0) else {
            warn!("ignoring worker message without valid PID");
            return None;
        };
        if completion.payload_len != 0 {
            warn!(
                size = completion.payload_len,
                "ignoring worker message with invalid size"
            );
            return None;
        }
        let Some(worker) = self.workers.get_mut(&Pid::from_raw(pid)) else {
            debug!(pid, "worker returned, but is no longer tracked");
            return None;
        };

        if worker.state != WorkerState::Killed {
            worker.state = WorkerState::Idle;
        }

        match worker.event.take() {
            Some(seqnum) => Some(seqnum),
            None => {
                warn!(pid, "repeated completion message from idle worker");
                None
            }
        }
    }

    /// Remove a reaped worker, returning its record (with the event link
    /// still set) for the broker's failure handling.
    pub fn on_child_exit(&mut self, pid: Pid) -> Option<Worker> {
        self.workers.remove(&pid)
    }

    /// Send SIGTERM to every worker not already killed.
    pub fn kill_all(&mut self) {
        for worker in self.workers.values_mut() {
            if worker.state == WorkerState::Killed {
                continue;
            }
            worker.state = WorkerState::Killed;
            let _ = kill(worker.pid, Signal::SIGTERM);
        }
    }

    /// Sweep idle workers; used when the queue is empty to bound the
    /// process count.
    pub fn kill_idle(&mut self) {
        debug!("cleanup idle workers");
        for worker in self.workers.values_mut() {
            if worker.state != WorkerState::Idle {
                continue;
            }
            worker.state = WorkerState::Killed;
            let _ = kill(worker.pid, Signal::SIGTERM);
        }
    }

    /// Kill one hung worker with SIGKILL.
    pub fn kill_worker(&mut self, pid: Pid) {
        if let Some(worker) = self.workers.get_mut(&pid) {
            worker.state = WorkerState::Killed;
            let _ = kill(pid, Signal::SIGKILL);
        }
    }

    /// Running workers and their attached events, for the timeout sweep.
    #[must_use]
    pub fn running(&self) -> Vec<(Pid, u64)> {
        self.workers
            .values()
            .filter(|w| w.state == WorkerState::Running)
            .filter_map(|w| w.event.map(|seqnum| (w.pid, seqnum)))
            .collect()
    }

    /// Look up a worker by pid.
    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&Worker> {
        self.workers.get(&pid)
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(
        &mut self,
        pid: i32,
        state: WorkerState,
        event: Option<u64>,
    ) -> crate::channel::DeviceReceiver {
        let (sender, receiver) = device_channel().unwrap();
        self.workers.insert(
            Pid::from_raw(pid),
            Worker {
                pid: Pid::from_raw(pid),
                state,
                channel: sender,
                event,
            },
        );
        receiver
    }
}

/// Pair a worker with an event: both sides of the link, one timestamp.
fn attach(worker: &mut Worker, event: &mut Event) {
    debug_assert!(worker.event.is_none());
    debug_assert!(event.worker.is_none());
    worker.state = WorkerState::Running;
    worker.event = Some(event.seqnum);
    event.attach(worker.pid.as_raw(), Instant::now());
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudevd_core::device::Device;
    use rudevd_core::event::EventState;

    // Beyond any real pid_max, so stray kill() calls cannot land.
    const FAKE_PID: i32 = 900_000_001;

    fn completion(pid: Option<i32>, payload_len: usize) -> Completion {
        Completion { pid, payload_len }
    }

    fn event(seqnum: u64) -> Event {
        Event::new(Device::builder(seqnum, "add", "/devices/a").build())
    }

    #[test]
    fn test_completion_requires_credentials() {
        let mut pool = WorkerPool::new(4).unwrap();
        pool.insert_for_test(FAKE_PID, WorkerState::Running, Some(7));

        assert_eq!(pool.on_completion(completion(None, 0)), None);
        assert_eq!(pool.get(Pid::from_raw(FAKE_PID)).unwrap().event(), Some(7));
    }

    #[test]
    fn test_completion_rejects_payload() {
        let mut pool = WorkerPool::new(4).unwrap();
        pool.insert_for_test(FAKE_PID, WorkerState::Running, Some(7));

        assert_eq!(pool.on_completion(completion(Some(FAKE_PID), 3)), None);
    }

    #[test]
    fn test_completion_from_unknown_pid_dropped() {
        let mut pool = WorkerPool::new(4).unwrap();
        assert_eq!(pool.on_completion(completion(Some(FAKE_PID), 0)), None);
    }

    #[test]
    fn test_completion_frees_event_and_idles_worker() {
        let mut pool = WorkerPool::new(4).unwrap();
        pool.insert_for_test(FAKE_PID, WorkerState::Running, Some(7));

        assert_eq!(pool.on_completion(completion(Some(FAKE_PID), 0)), Some(7));
        let worker = pool.get(Pid::from_raw(FAKE_PID)).unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(worker.event(), None);
    }

    #[test]
    fn test_repeated_completion_is_noop() {
        let mut pool = WorkerPool::new(4).unwrap();
        pool.insert_for_test(FAKE_PID, WorkerState::Running, Some(7));

        assert_eq!(pool.on_completion(completion(Some(FAKE_PID), 0)), Some(7));
        assert_eq!(pool.on_completion(completion(Some(FAKE_PID), 0)), None);
        assert_eq!(
            pool.get(Pid::from_raw(FAKE_PID)).unwrap().state(),
            WorkerState::Idle
        );
    }

    #[test]
    fn test_killed_worker_stays_killed_on_completion() {
        let mut pool = WorkerPool::new(4).unwrap();
        pool.insert_for_test(FAKE_PID, WorkerState::Killed, Some(7));

        assert_eq!(pool.on_completion(completion(Some(FAKE_PID), 0)), Some(7));
        assert_eq!(
            pool.get(Pid::from_raw(FAKE_PID)).unwrap().state(),
            WorkerState::Killed
        );
    }

    #[test]
    fn test_dispatch_reuses_idle_worker() {
        let mut pool = WorkerPool::new(4).unwrap();
        let receiver = pool.insert_for_test(FAKE_PID, WorkerState::Idle, None);

        let mut ev = event(11);
        let outcome = dispatch_for_test(&mut pool, &mut ev);
        assert_eq!(outcome, DispatchOutcome::Dispatched);
        assert_eq!(ev.state, EventState::Running);
        assert_eq!(ev.worker, Some(FAKE_PID));

        let delivered = receiver.receive().unwrap().unwrap();
        assert_eq!(delivered.seqnum, 11);
    }

    #[test]
    fn test_dispatch_at_capacity_leaves_event_queued() {
        let mut pool = WorkerPool::new(1).unwrap();
        pool.insert_for_test(FAKE_PID, WorkerState::Running, Some(5));

        let mut ev = event(11);
        let outcome = dispatch_for_test(&mut pool, &mut ev);
        assert_eq!(outcome, DispatchOutcome::AtCapacity);
        assert_eq!(ev.state, EventState::Queued);
        assert!(ev.worker.is_none());
    }

    #[test]
    fn test_dispatch_kills_broken_idle_worker() {
        let mut pool = WorkerPool::new(1).unwrap();
        let receiver = pool.insert_for_test(FAKE_PID, WorkerState::Idle, None);
        drop(receiver); // channel peer gone; sends must fail

        let mut ev = event(11);
        let outcome = dispatch_for_test(&mut pool, &mut ev);
        // The broken worker still counts against the cap, so the event
        // waits for the reap.
        assert_eq!(outcome, DispatchOutcome::AtCapacity);
        assert_eq!(
            pool.get(Pid::from_raw(FAKE_PID)).unwrap().state(),
            WorkerState::Killed
        );
        assert_eq!(ev.state, EventState::Queued);
    }

    #[test]
    fn test_kill_all_and_kill_idle_transitions() {
        let mut pool = WorkerPool::new(4).unwrap();
        pool.insert_for_test(FAKE_PID, WorkerState::Idle, None);
        pool.insert_for_test(FAKE_PID + 1, WorkerState::Running, Some(5));

        pool.kill_idle();
        assert_eq!(
            pool.get(Pid::from_raw(FAKE_PID)).unwrap().state(),
            WorkerState::Killed
        );
        assert_eq!(
            pool.get(Pid::from_raw(FAKE_PID + 1)).unwrap().state(),
            WorkerState::Running
        );

        pool.kill_all();
        assert_eq!(
            pool.get(Pid::from_raw(FAKE_PID + 1)).unwrap().state(),
            WorkerState::Killed
        );
    }

    #[test]
    fn test_reap_removes_worker() {
        let mut pool = WorkerPool::new(4).unwrap();
        pool.insert_for_test(FAKE_PID, WorkerState::Killed, Some(7));

        let worker = pool.on_child_exit(Pid::from_raw(FAKE_PID)).unwrap();
        assert_eq!(worker.event(), Some(7));
        assert!(pool.is_empty());
        assert!(pool.on_child_exit(Pid::from_raw(FAKE_PID)).is_none());
    }

    #[test]
    fn test_running_lists_only_running_workers() {
        let mut pool = WorkerPool::new(4).unwrap();
        pool.insert_for_test(FAKE_PID, WorkerState::Running, Some(5));
        pool.insert_for_test(FAKE_PID + 1, WorkerState::Idle, None);

        let running = pool.running();
        assert_eq!(running, vec![(Pid::from_raw(FAKE_PID), 5)]);
    }

    /// Dispatch without reaching the fork path; tests cap and idle-reuse
    /// behavior only.
    fn dispatch_for_test(pool: &mut WorkerPool, event: &mut Event) -> DispatchOutcome {
        use crate::inotify::NodeWatch;
        use crate::paths::RuntimeDirs;
        use crate::rules::PassthroughRules;
        use std::sync::Arc;

        struct NullSink;
        impl rudevd_core::exec::ProcessedEventSink for NullSink {
            fn publish(&self, _: &Device) -> Result<(), rudevd_core::exec::SinkError> {
                Ok(())
            }
        }
        struct NullPersistence;
        impl rudevd_core::exec::DevicePersistence for NullPersistence {
            fn record_update(&self, _: &Device) -> Result<(), rudevd_core::exec::PersistError> {
                Ok(())
            }
            fn record_delete(&self, _: &Device) -> Result<(), rudevd_core::exec::PersistError> {
                Ok(())
            }
            fn tag_untag(&self, _: &Device) -> Result<(), rudevd_core::exec::PersistError> {
                Ok(())
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let dirs = RuntimeDirs::at(tmp.path().join("udev"));
        dirs.ensure().unwrap();
        let harness = WorkerHarness {
            rules: Arc::new(PassthroughRules),
            sink: Arc::new(NullSink),
            persistence: Arc::new(NullPersistence),
            watch: Arc::new(NodeWatch::init(dirs).unwrap()),
            timeouts: rudevd_core::exec::ExecTimeouts::default(),
        };
        pool.dispatch(event, &harness, &PropertiesSet::new(), &[])
    }
}
