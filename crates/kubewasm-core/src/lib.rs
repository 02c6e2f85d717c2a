//! kubewasm-core — data model and pure logic shared by the Wasm scheduler
//! plugin host.
//!
//! Nothing in this crate touches the sandbox. It provides the scheduler
//! object model, stage statuses and their packed encodings, cluster
//! events, the wire codecs used across the guest boundary, the framework
//! plugin traits, and configuration parsing.

pub mod config;
pub mod event;
pub mod framework;
pub mod source;
pub mod status;
pub mod types;
pub mod wire;

pub use config::{ConfigError, LogSeverity, PluginConfig};
pub use event::{ActionType, ClusterEvent, ResourceKind};
pub use source::{ModuleSource, SourceError};
pub use status::{Code, NominatingMode, Status};
pub use types::*;
