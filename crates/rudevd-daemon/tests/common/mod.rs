//! Shared fixtures for the daemon integration tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rudevd_core::device::Device;
use rudevd_core::exec::{
    DevicePersistence, ExecTimeouts, PersistError, ProcessedEventSink, ResolveNames, SinkError,
};
use rudevd_daemon::broker::{Broker, BrokerOptions, Collaborators};
use rudevd_daemon::inotify::NodeWatch;
use rudevd_daemon::logctl::LogControl;
use rudevd_daemon::rules::FileRuleLoader;
use rudevd_daemon::RuntimeDirs;

/// Sink recording published seqnums in memory.
#[derive(Default)]
pub struct MemorySink {
    pub published: Mutex<Vec<u64>>,
}

impl ProcessedEventSink for MemorySink {
    fn publish(&self, device: &Device) -> Result<(), SinkError> {
        self.published.lock().unwrap().push(device.seqnum);
        Ok(())
    }
}

/// Persistence handle that accepts everything.
pub struct NullPersistence;

impl DevicePersistence for NullPersistence {
    fn record_update(&self, _: &Device) -> Result<(), PersistError> {
        Ok(())
    }
    fn record_delete(&self, _: &Device) -> Result<(), PersistError> {
        Ok(())
    }
    fn tag_untag(&self, _: &Device) -> Result<(), PersistError> {
        Ok(())
    }
}

/// A broker wired to in-memory collaborators under a tempdir.
pub fn broker_fixture(children_max: usize) -> (tempfile::TempDir, RuntimeDirs, Broker) {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = RuntimeDirs::at(tmp.path().join("udev"));
    dirs.ensure().unwrap();

    let collaborators = Collaborators {
        loader: Box::new(FileRuleLoader::new(
            vec![PathBuf::from("/nonexistent/rules.d")],
            ResolveNames::Early,
        )),
        sink: Arc::new(MemorySink::default()),
        persistence: Arc::new(NullPersistence),
        watch: Arc::new(NodeWatch::init(dirs.clone()).unwrap()),
    };
    let options = BrokerOptions {
        children_max,
        timeouts: ExecTimeouts::from_event_timeout(Duration::from_secs(180)),
        dirs: dirs.clone(),
    };
    let broker = Broker::new(collaborators, options, LogControl::disabled()).unwrap();
    (tmp, dirs, broker)
}
