//! instance-lifecycle: Orchestrate a single cloud instance and its data volume
//!
//! The instance moves between running, stopped (volume kept) and hibernated
//! (volume deleted, data kept in a snapshot). Workflows that move it are
//! serialized by a system-wide action lock and built from bounded polling
//! waits against the compute, command, parameter-store and DNS planes.

pub mod backend;
pub mod command;
pub mod config;
pub mod error;
pub mod instance;
pub mod lock;
pub mod poll;
pub mod probe;
pub mod types;
pub mod volume;
pub mod workflow;

pub use backend::{CommandChannel, ComputeApi, DnsUpdater, ParameterStore};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use lock::{LocalLock, LockManager, ParameterStoreLock};
pub use probe::{classify, Observation, StateProbe};
pub use types::{ActionLockRecord, BackupName, InstanceDescriptor, PowerState, ServerState};
pub use workflow::{Backends, Orchestrator, WorkflowResponse};
