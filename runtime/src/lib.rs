//! Resource registry and service lifecycle runtime.
//!
//! Resources (queues, storage) are registered by name and acquired through
//! `usageType:resourceName` bindings; services run in dedicated threads with
//! an observable lifecycle and a shutdown phase, so the entry point knows
//! whether an interrupt is safe.

mod error_log;
mod registry;
mod service;

pub use error_log::{ErrorEntry, ErrorLog};
pub use registry::{ContextRef, QueueResource, Resource, ResourceRegistry, UsageType};
pub use service::{Lifecycle, ServiceCommand, ServiceHandle, ServiceState, ShutdownPhase};
