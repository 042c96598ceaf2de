//! Trait seams through which the broker reaches its collaborators.
//!
//! The rule compiler/interpreter, the subscriber transport and the device
//! database live outside this crate. The broker and its workers only see
//! the capability set below.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::device::Device;
use crate::properties::PropertiesSet;

/// Per-event execution limits handed to rule execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecTimeouts {
    /// Fatal limit; the worker is killed beyond it.
    pub event_timeout: Duration,
    /// Warning limit; one log line per event beyond it.
    pub warn_timeout: Duration,
    /// Artificial delay before each spawned rule program.
    pub exec_delay: Duration,
}

impl ExecTimeouts {
    /// Build from a fatal timeout; the warning threshold is one third of
    /// it, never zero.
    #[must_use]
    pub fn from_event_timeout(event_timeout: Duration) -> Self {
        let mut warn_timeout = event_timeout / 3;
        if warn_timeout.is_zero() {
            warn_timeout = Duration::from_micros(1);
        }
        Self {
            event_timeout,
            warn_timeout,
            exec_delay: Duration::ZERO,
        }
    }

    /// Set the per-program execution delay.
    #[must_use]
    pub fn with_exec_delay(mut self, exec_delay: Duration) -> Self {
        self.exec_delay = exec_delay;
        self
    }
}

impl Default for ExecTimeouts {
    fn default() -> Self {
        Self::from_event_timeout(Duration::from_secs(180))
    }
}

/// When rule execution resolves user and group names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolveNames {
    /// At rule compilation.
    #[default]
    Early,
    /// At rule execution.
    Late,
    /// Not at all.
    Never,
}

impl FromStr for ResolveNames {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "early" => Ok(Self::Early),
            "late" => Ok(Self::Late),
            "never" => Ok(Self::Never),
            other => Err(format!(
                "resolve-names must be early, late or never, not '{other}'"
            )),
        }
    }
}

/// Failure inside rule execution or loading.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The rule set could not be read.
    #[error("error reading rules: {0}")]
    Load(#[source] std::io::Error),
    /// A rule program or built-in failed.
    #[error("rule execution failed: {0}")]
    Execution(String),
}

/// Failure publishing a processed device.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The subscriber transport rejected the send.
    #[error("failed to publish device: {0}")]
    Send(#[source] std::io::Error),
}

/// Failure touching the persistent device database.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Filesystem-level failure.
    #[error("device database error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure receiving from the device-event source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Transport-level receive failure.
    #[error("failed to receive device: {0}")]
    Receive(#[source] std::io::Error),
    /// The message did not parse as a device event.
    #[error("invalid device message: {0}")]
    Invalid(String),
}

/// What rule execution asked the broker to do afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleOutcome {
    /// Rules requested a close-after-write watch on the device node.
    pub watch: bool,
}

/// Compiled-rule interpreter applied by workers.
pub trait RuleExecutor: Send + Sync {
    /// Apply matching rules to the device, amending it in place.
    ///
    /// # Errors
    ///
    /// Execution failures are transient per-event errors; the caller logs
    /// them and treats the event as processed.
    fn apply(
        &self,
        device: &mut Device,
        properties: &PropertiesSet,
        timeouts: &ExecTimeouts,
    ) -> Result<RuleOutcome, ExecError>;

    /// Run the programs collected by `apply`.
    ///
    /// # Errors
    ///
    /// Same contract as [`RuleExecutor::apply`].
    fn run_programs(&self, device: &Device, timeouts: &ExecTimeouts) -> Result<(), ExecError>;
}

/// Source of compiled rule sets with staleness detection.
pub trait RuleLoader: Send + Sync {
    /// Compile (or re-read) the rule set.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Load`] when the rule files cannot be read.
    fn load(&self) -> Result<Arc<dyn RuleExecutor>, ExecError>;

    /// Whether the on-disk rules changed since the last [`RuleLoader::load`].
    fn stale(&self) -> bool;
}

/// Outbound transport for processed (or, on worker failure, unprocessed)
/// devices.
pub trait ProcessedEventSink: Send + Sync {
    /// Publish one device to subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the transport rejects the send.
    fn publish(&self, device: &Device) -> Result<(), SinkError>;
}

/// Handle to the persistent device database.
pub trait DevicePersistence: Send + Sync {
    /// Write or refresh the device record.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] on filesystem failure.
    fn record_update(&self, device: &Device) -> Result<(), PersistError>;

    /// Delete the device record.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] on filesystem failure.
    fn record_delete(&self, device: &Device) -> Result<(), PersistError>;

    /// Remove the device from all tag indices.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] on filesystem failure.
    fn tag_untag(&self, device: &Device) -> Result<(), PersistError>;
}

/// Inbound source of kernel device events.
pub trait DeviceSource {
    /// Receive the next pending device, or `None` when the source would
    /// block.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] on transport failure; invalid messages are
    /// reported so the caller can drop them individually.
    fn receive(&mut self) -> Result<Option<Device>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warn_timeout_is_a_third() {
        let t = ExecTimeouts::from_event_timeout(Duration::from_secs(180));
        assert_eq!(t.warn_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_warn_timeout_never_zero() {
        let t = ExecTimeouts::from_event_timeout(Duration::ZERO);
        assert!(!t.warn_timeout.is_zero());
    }

    #[test]
    fn test_resolve_names_parses() {
        assert_eq!("early".parse::<ResolveNames>().unwrap(), ResolveNames::Early);
        assert_eq!("late".parse::<ResolveNames>().unwrap(), ResolveNames::Late);
        assert_eq!("never".parse::<ResolveNames>().unwrap(), ResolveNames::Never);
        assert!("sometimes".parse::<ResolveNames>().is_err());
    }
}
