//! # rudevd-core
//!
//! Core library for rudevd - a device-event management daemon.
//!
//! This crate provides the broker-side building blocks that are independent
//! of any file descriptor or process handling: the device snapshot taken
//! from a kernel uevent, the pending-event queue with its dependency
//! analysis, the administrative command codec, and the trait seams through
//! which the broker reaches its collaborators (rule execution, event
//! publication, device-record persistence).
//!
//! ## Scheduling model
//!
//! Events are totally ordered by their kernel sequence number. Two events
//! are dependent when they touch the same device node, the same network
//! interface, the same device path, an ancestor/descendant path, or when
//! one renames the other. Dependent events execute in strict seqnum order;
//! independent events may run concurrently. [`queue::EventQueue`]
//! implements this relation and the memoized scan that keeps the admission
//! pass cheap.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ctrl;
pub mod device;
pub mod event;
pub mod exec;
pub mod properties;
pub mod queue;

pub use ctrl::ControlCommand;
pub use device::{Device, Devnum};
pub use event::{Event, EventState};
pub use exec::{
    DevicePersistence, DeviceSource, ExecTimeouts, ProcessedEventSink, ResolveNames, RuleExecutor,
    RuleLoader, RuleOutcome,
};
pub use properties::PropertiesSet;
pub use queue::EventQueue;
