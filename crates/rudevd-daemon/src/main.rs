//! rudevd - device-event management daemon.
//!
//! Receives kernel uevents over netlink, applies the rule set to each
//! event in forked worker processes, and multicasts processed devices to
//! subscribers. Causally related events are serialized by kernel seqnum;
//! independent events run in parallel up to the worker cap.
//!
//! # Fork safety
//!
//! Both daemonization and worker spawning rely on `fork()`. The broker is
//! strictly single-threaded - a synchronous `main`, one reactor, no
//! runtime threads - so every fork duplicates the only thread and the
//! child continues from a consistent image. Nothing here may spawn a
//! thread.

use std::env;
use std::fs;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, fork, setsid, ForkResult, Uid};
use tracing::{info, warn};

use rudevd_core::exec::{ExecTimeouts, ResolveNames};
use rudevd_daemon::broker::{Broker, BrokerOptions, Collaborators};
use rudevd_daemon::ctrl::ControlPlane;
use rudevd_daemon::inotify::NodeWatch;
use rudevd_daemon::logctl::LogControl;
use rudevd_daemon::netlink::{NetlinkSink, UeventSocket};
use rudevd_daemon::persist::FsPersistence;
use rudevd_daemon::pool::default_children_max;
use rudevd_daemon::reactor::Reactor;
use rudevd_daemon::rules::{default_rules_dirs, FileRuleLoader};
use rudevd_daemon::RuntimeDirs;

/// rudevd - manages device events
#[derive(Parser, Debug)]
#[command(name = "rudevd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Detach and run in the background
    #[arg(long)]
    daemon: bool,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    /// Maximum number of worker processes
    #[arg(long, value_name = "INT")]
    children_max: Option<usize>,

    /// Seconds to delay before executing each rule program
    #[arg(long, value_name = "SECONDS")]
    exec_delay: Option<u64>,

    /// Seconds to wait before terminating an event
    #[arg(long, value_name = "SECONDS")]
    event_timeout: Option<u64>,

    /// When to resolve users and groups (early, late or never)
    #[arg(long, value_name = "WHEN", default_value = "early")]
    resolve_names: ResolveNames,
}

/// Knobs read from the kernel command line; they override CLI flags.
#[derive(Debug, Default)]
struct KernelArgs {
    log_priority: Option<i32>,
    children_max: Option<usize>,
    exec_delay: Option<u64>,
    event_timeout: Option<u64>,
}

/// Parse `udev.*` knobs (optionally `rd.`-prefixed) from the kernel
/// command line; invalid values are logged and ignored.
fn parse_kernel_cmdline(cmdline: &str) -> KernelArgs {
    let mut out = KernelArgs::default();
    for token in cmdline.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        let key = key.strip_prefix("rd.").unwrap_or(key);
        let Some(key) = key.strip_prefix("udev.") else {
            continue;
        };
        match key {
            "log-priority" => match value.parse() {
                Ok(prio) => out.log_priority = Some(prio),
                Err(_) => warn!(value, "invalid udev.log-priority ignored"),
            },
            "children-max" => match value.parse() {
                Ok(n) => out.children_max = Some(n),
                Err(_) => warn!(value, "invalid udev.children-max ignored"),
            },
            "exec-delay" => match value.parse() {
                Ok(secs) => out.exec_delay = Some(secs),
                Err(_) => warn!(value, "invalid udev.exec-delay ignored"),
            },
            "event-timeout" => match value.parse() {
                Ok(secs) => out.event_timeout = Some(secs),
                Err(_) => warn!(value, "invalid udev.event-timeout ignored"),
            },
            _ => {}
        }
    }
    out
}

/// Sockets handed over by the service manager, if any.
struct ActivatedSockets {
    ctrl: OwnedFd,
    netlink: OwnedFd,
}

/// Adopt listen fds per the socket-activation protocol: exactly one
/// AF_UNIX SEQPACKET socket and one AF_NETLINK RAW socket, anything else
/// fails the adoption.
#[allow(unsafe_code)]
fn activated_sockets() -> Option<ActivatedSockets> {
    const LISTEN_FDS_START: RawFd = 3;

    let pid: u32 = env::var("LISTEN_PID").ok()?.parse().ok()?;
    if pid != std::process::id() {
        return None;
    }
    let count: RawFd = env::var("LISTEN_FDS").ok()?.parse().ok()?;
    if count <= 0 {
        return None;
    }

    let mut ctrl = None;
    let mut netlink = None;
    for fd in LISTEN_FDS_START..LISTEN_FDS_START + count {
        match (socket_int_opt(fd, libc::SO_DOMAIN)?, socket_int_opt(fd, libc::SO_TYPE)?) {
            (libc::AF_UNIX, libc::SOCK_SEQPACKET) if ctrl.is_none() => ctrl = Some(fd),
            (libc::AF_NETLINK, libc::SOCK_RAW) if netlink.is_none() => netlink = Some(fd),
            _ => return None,
        }
    }

    match (ctrl, netlink) {
        (Some(ctrl), Some(netlink)) => {
            info!(ctrl, netlink, "using sockets from service manager");
            // SAFETY: the listen-fds protocol transfers ownership of
            // these descriptors to us; nothing else closes them.
            Some(unsafe {
                ActivatedSockets {
                    ctrl: OwnedFd::from_raw_fd(ctrl),
                    netlink: OwnedFd::from_raw_fd(netlink),
                }
            })
        }
        _ => None,
    }
}

/// Read one integer socket option.
#[allow(unsafe_code)]
fn socket_int_opt(fd: RawFd, opt: libc::c_int) -> Option<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value and len describe a valid, properly sized out buffer
    // for an integer socket option.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            std::ptr::addr_of_mut!(value).cast(),
            &mut len,
        )
    };
    (rc == 0).then_some(value)
}

/// Detach from the controlling terminal.
///
/// Must run before the reactor exists: `fork()` is only sound here
/// because the process is still single-threaded, and the reactor's
/// signalfd must be created in the daemon child, not the parent.
#[allow(unsafe_code)]
fn daemonize() -> anyhow::Result<()> {
    // SAFETY: single-threaded at this point; no reactor, no signalfd, no
    // worker pool exists yet. The parent exits immediately.
    match unsafe { fork() }.context("fork of daemon failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("setsid failed")?;

    if let Ok(null) = fs::OpenOptions::new().read(true).write(true).open("/dev/null") {
        use std::os::fd::AsRawFd;
        // SAFETY: dup2 onto the standard descriptors with a valid source
        // descriptor; errors only leave the previous descriptor in place.
        unsafe {
            libc::dup2(null.as_raw_fd(), libc::STDIN_FILENO);
            libc::dup2(null.as_raw_fd(), libc::STDOUT_FILENO);
            libc::dup2(null.as_raw_fd(), libc::STDERR_FILENO);
        }
    }

    // The broker shields itself from the OOM killer; workers restore
    // their exposure after fork.
    let _ = fs::write("/proc/self/oom_score_adj", "-1000");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log = LogControl::init(args.debug);

    let kernel_args = fs::read_to_string("/proc/cmdline")
        .map(|cmdline| parse_kernel_cmdline(&cmdline))
        .unwrap_or_default();
    if !args.debug {
        if let Some(priority) = kernel_args.log_priority {
            log.set_priority(priority);
        }
    }

    if !Uid::effective().is_root() {
        anyhow::bail!("root privileges required");
    }

    chdir(Path::new("/")).context("could not change dir to /")?;
    umask(Mode::from_bits_truncate(0o022));

    let dirs = RuntimeDirs::system();
    dirs.ensure().context("could not create runtime directory")?;

    if args.daemon {
        daemonize()?;
    }

    let children_max = kernel_args
        .children_max
        .or(args.children_max)
        .unwrap_or_else(default_children_max);
    let event_timeout = kernel_args
        .event_timeout
        .or(args.event_timeout)
        .unwrap_or(180);
    let exec_delay = kernel_args.exec_delay.or(args.exec_delay).unwrap_or(0);
    let timeouts = ExecTimeouts::from_event_timeout(Duration::from_secs(event_timeout))
        .with_exec_delay(Duration::from_secs(exec_delay));

    // Take over the service manager's sockets when offered, otherwise
    // create our own.
    let (uevent, ctrl) = match activated_sockets() {
        Some(sockets) => (
            UeventSocket::from_owned(sockets.netlink),
            ControlPlane::from_owned(sockets.ctrl),
        ),
        None => (
            UeventSocket::open().context("error initializing netlink socket")?,
            ControlPlane::bind_at(&dirs.control_socket())
                .context("error initializing control socket")?,
        ),
    };
    let sink = Arc::new(NetlinkSink::open().context("error initializing subscriber socket")?);

    let watch = Arc::new(
        NodeWatch::init(dirs.clone()).context("error initializing inotify")?,
    );
    watch.restore();

    let collaborators = Collaborators {
        loader: Box::new(FileRuleLoader::new(default_rules_dirs(), args.resolve_names)),
        sink,
        persistence: Arc::new(FsPersistence::new(dirs.clone())),
        watch,
    };
    let options = BrokerOptions {
        children_max,
        timeouts,
        dirs,
    };

    let mut broker =
        Broker::new(collaborators, options, log).context("error creating worker channel")?;
    broker.load_rules().context("error reading rules")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        children_max, "starting device-event broker"
    );

    let mut reactor = Reactor::new(broker, uevent, ctrl)?;
    reactor.run();

    if !reactor.drained_cleanly() {
        warn!("shutdown drain was forced");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_cmdline_knobs() {
        let args = parse_kernel_cmdline(
            "quiet udev.log-priority=7 rd.udev.children-max=4 udev.event-timeout=30 other=1",
        );
        assert_eq!(args.log_priority, Some(7));
        assert_eq!(args.children_max, Some(4));
        assert_eq!(args.event_timeout, Some(30));
        assert_eq!(args.exec_delay, None);
    }

    #[test]
    fn test_kernel_cmdline_ignores_invalid_values() {
        let args = parse_kernel_cmdline("udev.children-max=lots udev.event-timeout=-3");
        assert_eq!(args.children_max, None);
        assert_eq!(args.event_timeout, None);
    }

    #[test]
    fn test_kernel_cmdline_ignores_foreign_keys() {
        let args = parse_kernel_cmdline("systemd.unit=rescue udev_children-max=4 udevX.y=1");
        assert_eq!(args.children_max, None);
        assert_eq!(args.log_priority, None);
    }
}
