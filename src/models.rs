//! Core data models for command resources

use crate::diff::DiffOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// Input validation limits
pub const MAX_YAML_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_RESOURCE_COUNT: usize = 1_000;
pub const MAX_RESOURCE_NAME_LEN: usize = 64;

/// Environment variable carrying the previous run's stdout.
pub const PREVIOUS_STDOUT_ENV: &str = "PULUMI_COMMAND_STDOUT";
/// Environment variable carrying the previous run's stderr.
pub const PREVIOUS_STDERR_ENV: &str = "PULUMI_COMMAND_STDERR";

/// One SSH endpoint: the target host or a bastion in front of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// PEM/OpenSSH encoded private key contents (not a path)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_socket_path: Option<String>,
    /// Expected server key; either an `authorized_keys` style line or bare base64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key: Option<String>,
    /// Maximum failed dials before giving up; -1 retries until cancelled
    #[serde(default = "default_dial_error_limit")]
    pub dial_error_limit: i32,
    /// Seconds allowed per dial attempt; 0 means no limit
    #[serde(default = "default_per_dial_timeout")]
    pub per_dial_timeout: u32,
}

impl Endpoint {
    /// Endpoint with all defaults applied
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: default_user(),
            password: None,
            private_key: None,
            private_key_password: None,
            agent_socket_path: None,
            host_key: None,
            dial_error_limit: default_dial_error_limit(),
            per_dial_timeout: default_per_dial_timeout(),
        }
    }

    /// `host:port` as used for dialing and in error messages
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

fn default_dial_error_limit() -> i32 {
    10
}

fn default_per_dial_timeout() -> u32 {
    15
}

/// Remote connection: a target endpoint, optionally reached through a bastion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSpec {
    #[serde(flatten)]
    pub target: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Endpoint>,
}

impl ConnectionSpec {
    pub fn new(target: Endpoint) -> Self {
        Self {
            target,
            proxy: None,
        }
    }
}

/// Which captured streams are echoed to the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Logging {
    Stdout,
    Stderr,
    #[default]
    StdoutAndStderr,
    None,
}

impl Logging {
    pub fn logs_stdout(self) -> bool {
        matches!(self, Logging::Stdout | Logging::StdoutAndStderr)
    }

    pub fn logs_stderr(self) -> bool {
        matches!(self, Logging::Stderr | Logging::StdoutAndStderr)
    }
}

/// An opaque, caller-defined value whose change forces replacement.
///
/// Equality is structural. Numbers compare by value, so `1` and `1.0` are
/// the same trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trigger(pub serde_json::Value);

impl PartialEq for Trigger {
    fn eq(&self, other: &Self) -> bool {
        values_equal(&self.0, &other.0)
    }
}

impl From<serde_json::Value> for Trigger {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

fn values_equal(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    use serde_json::Value;

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if x == y {
                return true;
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Desired configuration of a command resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,
    #[serde(default = "default_true")]
    pub add_previous_output_in_env: bool,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asset_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archive_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionSpec>,
}

impl Default for CommandSpec {
    fn default() -> Self {
        Self {
            create: None,
            update: None,
            delete: None,
            dir: None,
            environment: BTreeMap::new(),
            interpreter: None,
            stdin: None,
            triggers: Vec::new(),
            add_previous_output_in_env: default_true(),
            logging: Logging::default(),
            asset_paths: Vec::new(),
            archive_paths: Vec::new(),
            connection: None,
        }
    }
}

impl CommandSpec {
    /// Local command running `create`, with every other field defaulted
    pub fn local(create: impl Into<String>) -> Self {
        Self {
            create: Some(create.into()),
            ..Default::default()
        }
    }

    pub fn is_remote(&self) -> bool {
        self.connection.is_some()
    }
}

fn default_true() -> bool {
    true
}

/// Stateless one-shot local command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asset_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archive_paths: Vec<String>,
}

/// One captured file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Path relative to the working directory, `/` separated
    pub path: String,
    /// Absolute location on the host at capture time
    pub source: String,
    pub sha256: String,
    pub size: u64,
}

/// A bundle of captured files keyed by relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    pub assets: BTreeMap<String, Asset>,
    /// Digest over the sorted `(path, sha256)` pairs
    pub sha256: String,
}

/// Result of running one script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Everything a successful create/update produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutputs {
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub assets: BTreeMap<String, Asset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<Archive>,
}

/// Persisted state of one resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    pub id: String,
    pub inputs: CommandSpec,
    pub outputs: CommandOutputs,
}

/// Local file or directory uploaded by a copy resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CopySource {
    /// A single regular file
    Asset(String),
    /// A directory (or a single file); a trailing `/` copies the contents only
    Archive(String),
}

impl CopySource {
    pub fn path(&self) -> &str {
        match self {
            CopySource::Asset(path) | CopySource::Archive(path) => path,
        }
    }
}

/// Desired configuration of a copy resource.
///
/// Any trigger change replaces the resource. A changed source, remote path
/// or destination host uploads again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopySpec {
    pub connection: ConnectionSpec,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub source: CopySource,
    pub remote_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,
}

/// Persisted state of one copy resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyState {
    pub id: String,
    pub inputs: CopySpec,
    /// Digest of the source contents at the last upload
    pub source_sha256: String,
}

/// State of a stored resource of either kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StoredState {
    Command(ResourceState),
    Copy(CopyState),
}

impl StoredState {
    pub fn id(&self) -> &str {
        match self {
            StoredState::Command(state) => &state.id,
            StoredState::Copy(state) => &state.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoredState::Command(_) => "command",
            StoredState::Copy(_) => "copy",
        }
    }

    pub fn into_command(self) -> Option<ResourceState> {
        match self {
            StoredState::Command(state) => Some(state),
            StoredState::Copy(_) => None,
        }
    }

    pub fn into_copy(self) -> Option<CopyState> {
        match self {
            StoredState::Copy(state) => Some(state),
            StoredState::Command(_) => None,
        }
    }
}

/// A named resource as declared in a resource file.
///
/// With a `copy` block the resource uploads files and every command field
/// must be left unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    pub name: String,
    #[serde(flatten)]
    pub spec: CommandSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy: Option<CopySpec>,
    #[serde(default)]
    pub options: DiffOptions,
}

impl ResourceDeclaration {
    /// Command resource with default options
    pub fn command(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            copy: None,
            options: DiffOptions::default(),
        }
    }

    /// Copy resource with default options
    pub fn copy(name: impl Into<String>, copy: CopySpec) -> Self {
        Self {
            name: name.into(),
            spec: CommandSpec::default(),
            copy: Some(copy),
            options: DiffOptions::default(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.copy.is_some() || self.spec.is_remote()
    }
}

/// Top-level resource file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub resources: Vec<ResourceDeclaration>,
}

/// Lifecycle call kinds recorded in the operation history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

impl OperationKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationKind::Create),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

/// Operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Running => write!(f, "running"),
            OperationStatus::Success => write!(f, "success"),
            OperationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One entry of the operation history
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub id: i64,
    pub resource_name: String,
    pub operation: OperationKind,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
}
