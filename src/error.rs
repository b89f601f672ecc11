//! Error types for the command provider

use std::time::Duration;
use thiserror::Error;

/// Command provider error types
#[derive(Error, Debug)]
pub enum CommandError {
    /// Dial or authentication kept failing until the dial-error limit was reached
    #[error("unable to connect to {target} after {attempts} attempt(s): {cause}")]
    Connection {
        target: String,
        attempts: u32,
        cause: String,
    },

    /// The server presented a host key other than the configured one
    #[error("host key mismatch for {host}: expected {expected}, got {actual}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    /// Credentials were rejected or could not be loaded
    #[error("authentication failed for {user}@{host}: {message}")]
    Authentication {
        host: String,
        user: String,
        message: String,
    },

    /// Script exited with a non-zero status
    #[error("command exited with code {exit_code}")]
    Execution {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// Working directory was absent at execution time
    #[error("working directory does not exist: {path}")]
    MissingDirectory { path: String },

    /// Output collection could not walk the working directory
    #[error("failed to collect outputs under {path}: {message}")]
    Collection { path: String, message: String },

    /// A copy resource could not read its source or write the remote files
    #[error("copy failed at {path}: {message}")]
    Copy { path: String, message: String },

    /// Glob pattern failed to compile
    #[error("invalid glob pattern '{pattern}': {message}")]
    InvalidGlob { pattern: String, message: String },

    /// Call was cancelled while a script was running
    #[error("command cancelled")]
    Cancelled { stdout: String, stderr: String },

    /// Call deadline elapsed while a script was running
    #[error("command timed out after {after:?}")]
    Timeout {
        after: Duration,
        stdout: String,
        stderr: String,
    },

    /// Process could not be started
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// SSH protocol errors after the session was established
    #[error("SSH error on {host}: {message}")]
    Ssh { host: String, message: String },

    /// A replacement was created but the old resource could not be deleted
    #[error("replacement of '{name}' succeeded but deleting the old resource failed: {source}")]
    ReplaceCleanup {
        name: String,
        #[source]
        source: Box<CommandError>,
    },

    /// Invalid configuration or request
    #[error("Validation error: {0}")]
    Validation(String),

    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// YAML size exceeded limit
    #[error("Resource YAML exceeds 1MB limit (size: {0} bytes)")]
    YamlSizeExceeded(usize),

    /// Invalid resource name format
    #[error("Invalid resource name '{name}': only alphanumeric, underscore, and dash allowed (max {max} characters)")]
    InvalidResourceName { name: String, max: usize },

    /// JSON (de)serialization of persisted state
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommandError {
    /// Captured output carried by the error, if the script got far enough to produce any.
    pub fn output(&self) -> Option<(&str, &str)> {
        match self {
            CommandError::Execution { stdout, stderr, .. }
            | CommandError::Cancelled { stdout, stderr }
            | CommandError::Timeout { stdout, stderr, .. } => Some((stdout, stderr)),
            CommandError::ReplaceCleanup { source, .. } => source.output(),
            _ => None,
        }
    }

    /// Exit code of a failed script.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Execution { exit_code, .. } => Some(*exit_code),
            CommandError::ReplaceCleanup { source, .. } => source.exit_code(),
            _ => None,
        }
    }
}

/// Result type alias using CommandError
pub type Result<T> = std::result::Result<T, CommandError>;
