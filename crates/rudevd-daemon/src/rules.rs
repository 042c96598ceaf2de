//! Rule-set loading and staleness detection.
//!
//! Rule *interpretation* lives outside this repository; the broker only
//! needs to know when the on-disk rule files changed so it can drop the
//! compiled set and have workers re-read it. The built-in executor passes
//! devices through unamended.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::debug;

use rudevd_core::device::Device;
use rudevd_core::exec::{
    ExecError, ExecTimeouts, ResolveNames, RuleExecutor, RuleLoader, RuleOutcome,
};
use rudevd_core::properties::PropertiesSet;

/// The standard rule directories, in ascending priority order.
#[must_use]
pub fn default_rules_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/lib/udev/rules.d"),
        PathBuf::from("/run/udev/rules.d"),
        PathBuf::from("/etc/udev/rules.d"),
    ]
}

/// Loader that stamps the newest rule-directory mtime at every load and
/// reports staleness when any directory is newer.
#[derive(Debug)]
pub struct FileRuleLoader {
    dirs: Vec<PathBuf>,
    resolve_names: ResolveNames,
    loaded_stamp: Mutex<Option<SystemTime>>,
}

impl FileRuleLoader {
    /// Create a loader over the given rule directories.
    #[must_use]
    pub fn new(dirs: Vec<PathBuf>, resolve_names: ResolveNames) -> Self {
        Self {
            dirs,
            resolve_names,
            loaded_stamp: Mutex::new(None),
        }
    }

    fn newest_mtime(&self) -> Option<SystemTime> {
        self.dirs
            .iter()
            .filter_map(|dir| dir.metadata().ok())
            .filter_map(|meta| meta.modified().ok())
            .max()
    }
}

impl RuleLoader for FileRuleLoader {
    fn load(&self) -> Result<Arc<dyn RuleExecutor>, ExecError> {
        let stamp = self.newest_mtime();
        *self.loaded_stamp.lock().expect("rule stamp lock") = stamp;
        debug!(resolve_names = ?self.resolve_names, "rules loaded");
        Ok(Arc::new(PassthroughRules))
    }

    fn stale(&self) -> bool {
        let loaded = *self.loaded_stamp.lock().expect("rule stamp lock");
        match (loaded, self.newest_mtime()) {
            (Some(loaded), Some(current)) => current > loaded,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

/// Executor that applies no rules; devices pass through unamended.
///
/// The interpreter proper is supplied by the rule-engine collaborator;
/// this stands in wherever none is wired up.
#[derive(Debug)]
pub struct PassthroughRules;

impl RuleExecutor for PassthroughRules {
    fn apply(
        &self,
        device: &mut Device,
        _properties: &PropertiesSet,
        _timeouts: &ExecTimeouts,
    ) -> Result<RuleOutcome, ExecError> {
        debug!(seqnum = device.seqnum, "no rules applied");
        Ok(RuleOutcome::default())
    }

    fn run_programs(&self, _device: &Device, _timeouts: &ExecTimeouts) -> Result<(), ExecError> {
        Ok(())
    }
}
