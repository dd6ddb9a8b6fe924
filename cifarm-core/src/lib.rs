//! CIFarm Core Library
//!
//! Provisioning of a Jenkins build farm from one JSON document: a master
//! container, Linux agent containers, native Windows agents and per-job
//! web-server containers, wired together with ssh trust.

pub mod config;
pub mod connection;
pub mod docker;
pub mod error;
pub mod hooks;
pub mod jenkins;
pub mod observability;
pub mod orchestrator;
pub mod paths;
pub mod ports;
pub mod settings;
pub mod trust;

// Re-export commonly used items
pub use config::{ConfigData, ConfigParser};
pub use connection::{ConnectionPool, RemoteHost};
pub use error::{FarmError, Result};
pub use hooks::HookConfigData;
pub use observability::init as init_observability;
pub use orchestrator::Orchestrator;
pub use settings::Settings;
