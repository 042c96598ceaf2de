//! The single-threaded reactor.
//!
//! One level-triggered epoll instance multiplexes the five sources. Each
//! iteration processes readiness in a fixed order that the correctness of
//! the settle protocol depends on: worker results before new dispatch (so
//! freshly idle workers are visible), signals before rule reload, and
//! control only after inotify-synthesized uevents have been queued.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{sigprocmask, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SigSet, SignalFd};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, CtrlDisposition};
use crate::ctrl::ControlPlane;
use crate::inotify::synthesize_change;
use crate::netlink::UeventSocket;

const TOKEN_WORKER: u64 = 0;
const TOKEN_UEVENT: u64 = 1;
const TOKEN_SIGNAL: u64 = 2;
const TOKEN_INOTIFY: u64 = 3;
const TOKEN_CTRL: u64 = 4;

/// Epoll timeout while events or workers exist; doubles as the cadence of
/// the idle-worker and hang sweeps.
const BUSY_TIMEOUT_MS: u16 = 3_000;
/// Ceiling on the shutdown drain.
const DRAIN_TIMEOUT_MS: u16 = 30_000;
/// Minimum spacing of rule staleness checks.
const RULES_CHECK_INTERVAL: Duration = Duration::from_secs(3);

/// Reactor setup failure; fatal at initialization.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// Signal mask or signalfd setup failed.
    #[error("error creating signalfd: {0}")]
    Signal(#[source] nix::Error),
    /// Epoll creation or registration failed.
    #[error("error creating epoll: {0}")]
    Epoll(#[source] nix::Error),
}

/// Top-level lifecycle of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Initialization in progress.
    Starting,
    /// Serving events.
    Running,
    /// Shutdown requested; draining workers.
    Draining,
    /// Drain complete.
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// The reactor owning the broker and the five event sources.
pub struct Reactor {
    epoll: Epoll,
    signal_fd: SignalFd,
    uevent: UeventSocket,
    ctrl: ControlPlane,
    broker: Broker,
    state: SupervisorState,
    /// Broker-only descriptors a forked worker must close.
    parent_fds: Vec<RawFd>,
    last_rules_check: Option<Instant>,
}

impl Reactor {
    /// Block all signals, create the multiplexer and register the five
    /// sources.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError`] when the signalfd or epoll cannot be set
    /// up; both are fatal initialization errors.
    pub fn new(
        broker: Broker,
        uevent: UeventSocket,
        ctrl: ControlPlane,
    ) -> Result<Self, ReactorError> {
        // Every signal is routed through the signalfd; workers inherit
        // the blocked mask and create their own descriptor.
        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), None)
            .map_err(ReactorError::Signal)?;
        let signal_fd = SignalFd::with_flags(
            &SigSet::all(),
            SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC,
        )
        .map_err(ReactorError::Signal)?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(ReactorError::Epoll)?;
        epoll
            .add(
                broker.pool.completion_reader(),
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_WORKER),
            )
            .map_err(ReactorError::Epoll)?;
        epoll
            .add(&uevent, EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_UEVENT))
            .map_err(ReactorError::Epoll)?;
        epoll
            .add(
                &signal_fd,
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_SIGNAL),
            )
            .map_err(ReactorError::Epoll)?;
        epoll
            .add(
                broker.watch().as_ref(),
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_INOTIFY),
            )
            .map_err(ReactorError::Epoll)?;
        epoll
            .add(&ctrl, EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_CTRL))
            .map_err(ReactorError::Epoll)?;

        let parent_fds = vec![
            epoll.0.as_raw_fd(),
            signal_fd.as_raw_fd(),
            uevent.as_raw_fd(),
            ctrl.as_raw_fd(),
        ];

        Ok(Self {
            epoll,
            signal_fd,
            uevent,
            ctrl,
            broker,
            state: SupervisorState::Starting,
            parent_fds,
            last_rules_check: None,
        })
    }

    /// Run until the drain completes; returns cleanly on a finished or
    /// forced drain.
    pub fn run(&mut self) {
        self.state = SupervisorState::Running;
        info!(state = %self.state, "event broker running");

        let mut events = [EpollEvent::empty(); 8];
        loop {
            if self.broker.is_exiting() && self.state == SupervisorState::Running {
                self.enter_drain();
            }
            if self.state == SupervisorState::Draining && self.broker.is_idle() {
                self.state = SupervisorState::Stopped;
                break;
            }

            let timeout = if self.state == SupervisorState::Draining {
                EpollTimeout::from(DRAIN_TIMEOUT_MS)
            } else if self.broker.is_idle() {
                EpollTimeout::NONE
            } else {
                EpollTimeout::from(BUSY_TIMEOUT_MS)
            };

            // Tell settle whether we are busy before blocking.
            self.broker.update_queue_marker();

            let count = match self.epoll.wait(&mut events, timeout) {
                Ok(count) => count,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "epoll wait failed");
                    continue;
                }
            };

            if count == 0 {
                if self.state == SupervisorState::Draining {
                    error!("timeout, giving up waiting for workers to finish");
                    break;
                }
                self.broker.kill_idle_workers();
                self.broker.sweep_timeouts(Instant::now());
            }

            let mut is_worker = false;
            let mut is_uevent = false;
            let mut is_signal = false;
            let mut is_inotify = false;
            let mut is_ctrl = false;
            for event in &events[..count] {
                if !event.events().contains(EpollFlags::EPOLLIN) {
                    continue;
                }
                match event.data() {
                    TOKEN_WORKER => is_worker = true,
                    TOKEN_UEVENT => is_uevent = true,
                    TOKEN_SIGNAL => is_signal = true,
                    TOKEN_INOTIFY => is_inotify = true,
                    TOKEN_CTRL => is_ctrl = true,
                    _ => {}
                }
            }

            // Check for changed rules, every three seconds at most.
            let now = Instant::now();
            if self
                .last_rules_check
                .is_none_or(|last| now.duration_since(last) > RULES_CHECK_INTERVAL)
            {
                self.broker.check_rules_stale();
                self.last_rules_check = Some(now);
            }
            self.broker.handle_reload();

            // Completions first: newly idle workers must be visible to
            // the dispatch pass below.
            if is_worker {
                self.broker.on_worker_results();
            }
            if is_uevent {
                self.broker.on_uevent(&mut self.uevent);
            }
            self.broker.start_queue(&self.parent_fds);

            if is_signal {
                self.drain_signals();
            }

            // Shutting down; the sources below are not served anymore.
            if self.broker.is_exiting() {
                continue;
            }

            if is_inotify {
                self.handle_inotify();
            }

            // Refresh the marker before answering control, so a ping
            // observes the queue state including any events the inotify
            // handler just synthesized.
            self.broker.update_queue_marker();

            if is_ctrl {
                self.handle_ctrl();
            }
        }

        info!(state = %self.state, "event broker stopped");
        self.broker.final_cleanup();
    }

    /// Whether the drain finished on its own rather than by force.
    #[must_use]
    pub fn drained_cleanly(&self) -> bool {
        self.state == SupervisorState::Stopped
    }

    /// Close the sources of new events and discard what is already
    /// buffered; running workers get their termination signal.
    fn enter_drain(&mut self) {
        info!("shutting down, draining workers");
        let _ = self.epoll.delete(&self.ctrl);
        let _ = self.epoll.delete(&self.uevent);
        let _ = self.epoll.delete(self.broker.watch().as_ref());
        self.broker.purge_queued();
        self.broker.kill_workers();
        self.state = SupervisorState::Draining;
        info!(state = %self.state, "drain started");
    }

    fn drain_signals(&mut self) {
        while let Ok(Some(siginfo)) = self.signal_fd.read_signal() {
            let signal = i32::try_from(siginfo.ssi_signo)
                .ok()
                .and_then(|n| Signal::try_from(n).ok());
            match signal {
                Some(Signal::SIGINT | Signal::SIGTERM) => {
                    info!(signal = siginfo.ssi_signo, "termination requested");
                    self.broker.request_exit();
                }
                Some(Signal::SIGHUP) => {
                    info!("reload requested");
                    self.broker.request_reload();
                }
                Some(Signal::SIGCHLD) => {
                    self.broker.reap_children();
                }
                _ => {}
            }
        }
    }

    fn handle_inotify(&mut self) {
        let watch = Arc::clone(self.broker.watch());
        for event in watch.drain() {
            if event.is_close_write() {
                let Some(device) = watch.lookup(event.wd) else {
                    continue;
                };
                debug!(wd = event.wd, devpath = %device.devpath, "watched node closed");
                synthesize_change(&device);
                // The synthesized "change" must be queued before any
                // pending control ping is answered.
                self.broker.on_uevent(&mut self.uevent);
            } else if event.is_ignored() {
                watch.end(event.wd);
            }
        }
    }

    fn handle_ctrl(&mut self) {
        while let Some((cmd, conn)) = self.ctrl.accept_command() {
            if self.broker.on_ctrl(cmd) == CtrlDisposition::RetainConnection {
                // Keep the caller blocked until we actually exit.
                self.ctrl.retain_exit_connection(conn);
            }
        }
    }
}
