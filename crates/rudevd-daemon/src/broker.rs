//! Shared daemon state and the per-source handlers.
//!
//! All mutable state - the event queue, the worker pool, the global
//! properties and the mode flags - lives in one [`Broker`] value owned by
//! the reactor. Handlers never let an error escape their frame; each one
//! logs and returns so the loop keeps serving the other sources.

use std::fs;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use rudevd_core::ctrl::ControlCommand;
use rudevd_core::event::EventState;
use rudevd_core::exec::{
    DevicePersistence, DeviceSource, ExecTimeouts, ProcessedEventSink, RuleExecutor, RuleLoader,
};
use rudevd_core::properties::PropertiesSet;
use rudevd_core::queue::EventQueue;

use crate::channel::ChannelError;
use crate::inotify::NodeWatch;
use crate::logctl::LogControl;
use crate::paths::RuntimeDirs;
use crate::pool::WorkerPool;
use crate::worker::WorkerHarness;

/// The collaborator set the broker is wired to.
pub struct Collaborators {
    /// Rule-set loader.
    pub loader: Box<dyn RuleLoader>,
    /// Subscriber transport.
    pub sink: Arc<dyn ProcessedEventSink>,
    /// Persistent device-record handle.
    pub persistence: Arc<dyn DevicePersistence>,
    /// Device-node watch facility.
    pub watch: Arc<NodeWatch>,
}

/// Broker tunables fixed at startup.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Worker cap.
    pub children_max: usize,
    /// Per-event execution limits.
    pub timeouts: ExecTimeouts,
    /// Runtime directory layout.
    pub dirs: RuntimeDirs,
}

/// What the reactor should do with the connection a control command
/// arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlDisposition {
    /// Close it; the command is done.
    Done,
    /// Keep it open until shutdown completes.
    RetainConnection,
}

/// Shared state of the event broker.
pub struct Broker {
    pub(crate) queue: EventQueue,
    pub(crate) pool: WorkerPool,
    properties: PropertiesSet,
    rules: Option<Arc<dyn RuleExecutor>>,
    loader: Box<dyn RuleLoader>,
    sink: Arc<dyn ProcessedEventSink>,
    persistence: Arc<dyn DevicePersistence>,
    watch: Arc<NodeWatch>,
    timeouts: ExecTimeouts,
    dirs: RuntimeDirs,
    log: LogControl,
    /// Dispatch paused by `STOP_EXEC_QUEUE`; inserts continue.
    pub(crate) stop_exec_queue: bool,
    /// Rule reload requested; processed at the top of the loop.
    pub(crate) reload: bool,
    /// Shutdown requested by signal or control.
    pub(crate) exiting: bool,
}

impl Broker {
    /// Assemble the broker.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when the worker completion channel cannot
    /// be created.
    pub fn new(
        collaborators: Collaborators,
        options: BrokerOptions,
        log: LogControl,
    ) -> Result<Self, ChannelError> {
        let pool = WorkerPool::new(options.children_max)?;
        Ok(Self {
            queue: EventQueue::new(),
            pool,
            properties: PropertiesSet::new(),
            rules: None,
            loader: collaborators.loader,
            sink: collaborators.sink,
            persistence: collaborators.persistence,
            watch: collaborators.watch,
            timeouts: options.timeouts,
            dirs: options.dirs,
            log,
            stop_exec_queue: false,
            reload: false,
            exiting: false,
        })
    }

    /// Compile the rule set before entering the loop; failure here is a
    /// fatal initialization error.
    ///
    /// # Errors
    ///
    /// Returns the loader's error unchanged.
    pub fn load_rules(&mut self) -> Result<(), rudevd_core::exec::ExecError> {
        self.rules = Some(self.loader.load()?);
        Ok(())
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_exiting(&self) -> bool {
        self.exiting
    }

    /// Request shutdown.
    pub fn request_exit(&mut self) {
        self.exiting = true;
    }

    /// Request a rule reload.
    pub fn request_reload(&mut self) {
        self.reload = true;
    }

    /// Whether neither events nor workers exist.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.pool.is_empty()
    }

    /// Number of events in the queue, any state.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Number of live workers, any state.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.pool.len()
    }

    /// The shared watch facility.
    #[must_use]
    pub fn watch(&self) -> &Arc<NodeWatch> {
        &self.watch
    }

    /// Drain the device source into the queue.
    pub fn on_uevent(&mut self, source: &mut dyn DeviceSource) {
        loop {
            match source.receive() {
                Ok(Some(device)) => {
                    if let Err(e) = self.queue.insert(device) {
                        error!(error = %e, "dropping device event");
                    }
                }
                Ok(None) => break,
                Err(rudevd_core::exec::SourceError::Invalid(reason)) => {
                    debug!(reason, "ignoring invalid device message");
                }
                Err(e) => {
                    error!(error = %e, "failed to receive device");
                    break;
                }
            }
        }
    }

    /// Drain worker completion messages and free the finished events.
    pub fn on_worker_results(&mut self) {
        loop {
            match self.pool.recv_completion() {
                Ok(Some(completion)) => {
                    if let Some(seqnum) = self.pool.on_completion(completion) {
                        self.queue.remove(seqnum);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to receive worker message");
                    break;
                }
            }
        }
    }

    /// Admission pass: hand every unblocked queued event to a worker.
    ///
    /// Rules are re-read lazily here after a reload dropped them; while
    /// they cannot be read, events stay queued.
    pub fn start_queue(&mut self, parent_fds: &[RawFd]) {
        if self.queue.is_empty() || self.stop_exec_queue || self.exiting {
            return;
        }

        if self.rules.is_none() {
            match self.loader.load() {
                Ok(rules) => self.rules = Some(rules),
                Err(e) => {
                    error!(error = %e, "error reading rules");
                    return;
                }
            }
        }
        let Some(rules) = self.rules.clone() else {
            return;
        };

        let harness = WorkerHarness {
            rules,
            sink: Arc::clone(&self.sink),
            persistence: Arc::clone(&self.persistence),
            watch: Arc::clone(&self.watch),
            timeouts: self.timeouts,
        };

        for seqnum in self.queue.runnable() {
            let Some(event) = self.queue.get_mut(seqnum) else {
                continue;
            };
            self.pool
                .dispatch(event, &harness, &self.properties, parent_fds);
        }
    }

    /// Reap exited workers. A worker that died mid-event gets its device
    /// record deleted and the unamended kernel event re-forwarded so
    /// subscribers still observe the seqnum.
    pub fn reap_children(&mut self) {
        loop {
            let status = match waitpid(Some(Pid::from_raw(-1)), Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => status,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            };
            match status {
                WaitStatus::StillAlive => break,
                WaitStatus::Exited(pid, 0) => {
                    debug!(pid = pid.as_raw(), "worker exited");
                    self.remove_worker(pid, true);
                }
                WaitStatus::Exited(pid, code) => {
                    warn!(pid = pid.as_raw(), code, "worker exited with return code");
                    self.remove_worker(pid, false);
                }
                WaitStatus::Signaled(pid, signal, _) => {
                    warn!(pid = pid.as_raw(), signal = %signal, "worker terminated by signal");
                    self.remove_worker(pid, false);
                }
                WaitStatus::Stopped(pid, _) => {
                    info!(pid = pid.as_raw(), "worker stopped");
                    break;
                }
                WaitStatus::Continued(pid) => {
                    info!(pid = pid.as_raw(), "worker continued");
                    break;
                }
                _ => {}
            }
        }
    }

    fn remove_worker(&mut self, pid: Pid, clean: bool) {
        let Some(worker) = self.pool.on_child_exit(pid) else {
            warn!(pid = pid.as_raw(), "worker is unknown, ignoring");
            return;
        };

        let Some(seqnum) = worker.event() else {
            return;
        };

        if !clean {
            if let Some(event) = self.queue.get(seqnum) {
                error!(
                    pid = pid.as_raw(),
                    devpath = %event.devpath,
                    "worker failed while handling device"
                );
                if let Err(e) = self.persistence.record_delete(&event.kernel_device) {
                    warn!(error = %e, "failed to delete device record");
                }
                if let Err(e) = self.persistence.tag_untag(&event.kernel_device) {
                    warn!(error = %e, "failed to untag device");
                }
                // Forward the kernel event without amending it.
                if let Err(e) = self.sink.publish(&event.kernel_device) {
                    warn!(error = %e, "failed to re-forward kernel event");
                }
            }
        }

        self.queue.remove(seqnum);
    }

    /// Apply one administrative command.
    pub fn on_ctrl(&mut self, cmd: ControlCommand) -> CtrlDisposition {
        match cmd {
            ControlCommand::SetLogLevel(priority) => {
                self.log.set_priority(priority);
                self.pool.kill_all();
            }
            ControlCommand::StopExecQueue => {
                self.stop_exec_queue = true;
            }
            ControlCommand::StartExecQueue => {
                self.stop_exec_queue = false;
            }
            ControlCommand::Reload => {
                self.reload = true;
            }
            ControlCommand::SetEnv(assignment) => {
                match self.properties.apply_assignment(&assignment) {
                    Ok(()) => debug!(assignment, "global property updated"),
                    Err(e) => error!(error = %e, "invalid property assignment"),
                }
                self.pool.kill_all();
            }
            ControlCommand::SetMaxChildren(n) => {
                self.pool.set_children_max(n as usize);
            }
            ControlCommand::Ping => {
                // Queue state is honest here: the reactor answers pings
                // only after draining uevents and inotify.
                debug!("control ping received");
            }
            ControlCommand::Exit => {
                self.exiting = true;
                return CtrlDisposition::RetainConnection;
            }
        }
        CtrlDisposition::Done
    }

    /// Kill all workers and drop the compiled rules; they are re-read on
    /// the next dispatch pass.
    pub fn handle_reload(&mut self) {
        if !self.reload {
            return;
        }
        info!("reloading rules, killing workers");
        self.pool.kill_all();
        self.rules = None;
        self.reload = false;
    }

    /// Poll rule staleness; sets the reload flag when the on-disk rules
    /// changed.
    pub fn check_rules_stale(&mut self) {
        if self.rules.is_some() && self.loader.stale() {
            self.reload = true;
        }
    }

    /// Warn about long-running events and kill workers past the fatal
    /// timeout.
    pub fn sweep_timeouts(&mut self, now: Instant) {
        for (pid, seqnum) in self.pool.running() {
            let Some(event) = self.queue.get_mut(seqnum) else {
                continue;
            };
            let Some(start) = event.start_time else {
                continue;
            };
            let elapsed = now.saturating_duration_since(start);
            if elapsed > self.timeouts.event_timeout {
                error!(
                    pid = pid.as_raw(),
                    seqnum,
                    devpath = %event.devpath,
                    "worker timeout, killing it"
                );
                self.pool.kill_worker(pid);
            } else if elapsed > self.timeouts.warn_timeout && !event.warned {
                warn!(
                    pid = pid.as_raw(),
                    seqnum,
                    devpath = %event.devpath,
                    "worker is taking a long time"
                );
                event.warned = true;
            }
        }
    }

    /// Purge queued events during the shutdown drain; running ones finish
    /// or are reaped.
    pub fn purge_queued(&mut self) {
        let removed = self.queue.cleanup(Some(EventState::Queued));
        if removed > 0 {
            debug!(removed, "queued events discarded");
        }
    }

    /// Kill every worker (reload, shutdown, property change).
    pub fn kill_workers(&mut self) {
        self.pool.kill_all();
    }

    /// Sweep idle workers once the queue is empty.
    pub fn kill_idle_workers(&mut self) {
        if self.queue.is_empty() {
            self.pool.kill_idle();
        }
    }

    /// Mirror queue occupancy in the settle marker file.
    pub fn update_queue_marker(&self) {
        let marker = self.dirs.queue_marker();
        if self.queue.is_empty() {
            match fs::remove_file(&marker) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(error = %e, "could not remove queue marker"),
            }
        } else if let Err(e) = fs::write(&marker, b"") {
            warn!(error = %e, "could not touch queue marker");
        }
    }

    /// Completion-channel descriptor for the reactor.
    #[must_use]
    pub fn completion_fd(&self) -> RawFd {
        self.pool.completion_fd()
    }

    /// Drop state that holds the control connection open; called right
    /// before process exit.
    pub fn final_cleanup(&self) {
        let _ = fs::remove_file(self.dirs.queue_marker());
    }
}
