//! Error types for cifarm.
//!
//! All errors use `thiserror` so callers get proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cifarm operations.
pub type Result<T> = std::result::Result<T, FarmError>;

/// Main error type for cifarm.
#[derive(Error, Debug)]
pub enum FarmError {
    // Config document errors
    #[error("Missing or empty key '{key}' in {context}")]
    MissingKey { key: String, context: String },

    #[error("Invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("Invalid settings: {reason}")]
    InvalidSettings { reason: String },

    #[error("File read error: {path}: {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // Remote host errors
    #[error("Failed to connect to host {machine_id} ({host}): {reason}")]
    ConnectionFailed { machine_id: String, host: String, reason: String },

    #[error("Command \"{command}\" executed on host {machine_id} returned error code {exit_code}")]
    RemoteCommandFailed {
        machine_id: String,
        command: String,
        exit_code: i32,
        stdout: Vec<String>,
        stderr: Vec<String>,
    },

    #[error("Failed to copy {source_path} to {target_path} on host {machine_id}: {reason}")]
    TransferFailed { machine_id: String, source_path: String, target_path: String, reason: String },

    #[error("Unknown host: {machine_id}")]
    UnknownHost { machine_id: String },

    #[error("Unknown container: {name}")]
    UnknownContainer { name: String },

    // Jenkins errors
    #[error("Jenkins server at {url} did not come online within {waited_secs} seconds")]
    ServerNotOnline { url: String, waited_secs: u64 },

    #[error("Request to {url} failed: {reason}")]
    RestRequestFailed { url: String, reason: String },

    // I/O errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FarmError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        FarmError::ConfigInvalid { reason: reason.into() }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FarmError::IoError { path: path.into(), source }
    }
}
