//! Tracing setup with a runtime-adjustable threshold.

use tracing::info;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;

/// Handle to the global log filter.
///
/// The control plane's `SET_LOG_LEVEL` swaps the filter at runtime;
/// workers forked afterwards inherit the new threshold, which is why the
/// command also kills the current workers.
pub struct LogControl {
    handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl LogControl {
    /// Install the global subscriber and return the control handle.
    ///
    /// `debug` starts the filter at debug level; otherwise `RUST_LOG`
    /// applies with an info default.
    #[must_use]
    pub fn init(debug: bool) -> Self {
        let filter = if debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        };
        let (layer, handle) = reload::Layer::new(filter);
        tracing_subscriber::registry()
            .with(layer)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
        Self {
            handle: Some(handle),
        }
    }

    /// A handle that controls nothing, for tests that install their own
    /// subscriber.
    #[must_use]
    pub fn disabled() -> Self {
        Self { handle: None }
    }

    /// Apply a syslog-style priority as the new threshold.
    pub fn set_priority(&self, priority: i32) {
        let directive = match priority {
            i32::MIN..=3 => "error",
            4 => "warn",
            5 | 6 => "info",
            _ => "debug",
        };
        self.reload(directive);
        info!(priority, directive, "log threshold updated");
    }

    /// Raise the threshold to debug.
    pub fn set_debug(&self) {
        self.reload("debug");
    }

    fn reload(&self, directive: &str) {
        if let Some(handle) = &self.handle {
            let _ = handle.reload(EnvFilter::new(directive));
        }
    }
}

impl std::fmt::Debug for LogControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogControl")
            .field("active", &self.handle.is_some())
            .finish()
    }
}
