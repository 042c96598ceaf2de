//! rudevd-daemon - Device-Event Broker Daemon Library
//!
//! This library provides the daemon side of rudevd: the single-threaded
//! reactor multiplexing the five event sources (kernel uevents, worker
//! results, signals, device-node inotify, control socket), the pool of
//! forked worker processes, and the administrative control plane.
//!
//! # Modules
//!
//! - [`broker`]: shared daemon state and the per-source handlers
//! - [`reactor`]: epoll loop, timeout policy and shutdown drain
//! - [`pool`]: worker records, dispatch, reaping and timeout sweeps
//! - [`worker`]: the forked child body executing rules per device
//! - [`channel`]: unicast device channel and credentialed completion socket
//! - [`ctrl`]: SEQPACKET control-socket server and client
//! - [`inotify`]: device-node watches and "change" synthesis
//! - [`netlink`]: kernel uevent source and subscriber multicast sink
//! - [`persist`]: filesystem device-record handle
//! - [`rules`]: rule-set loader with staleness detection

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod broker;
pub mod channel;
pub mod ctrl;
pub mod inotify;
pub mod logctl;
pub mod netlink;
pub mod paths;
pub mod persist;
pub mod pool;
pub mod reactor;
pub mod rules;
pub mod worker;

pub use broker::Broker;
pub use paths::RuntimeDirs;
pub use reactor::Reactor;
