//! Copy resources: upload a local file or directory to a remote host
//!
//! Uploads go over SFTP on a session from the [`SshConnector`], so dialing,
//! retries, bastion hops and host-key checks behave exactly as for remote
//! commands.
//!
//! Destination handling follows `cp -r`:
//!
//! | source | destination is a directory | destination missing | destination is a file |
//! |--------|----------------------------|---------------------|-----------------------|
//! | file   | `dest/<name>`              | `dest`              | `dest` (overwritten)  |
//! | dir    | `dest/<name>/...`          | `dest/<name>/...`   | error                 |
//! | dir/   | `dest/...`                 | `dest/...`          | error                 |
//!
//! Deleting a copy resource leaves the uploaded files in place.

use crate::collector::{to_slash_path, OutputCollector};
use crate::connector::SshConnector;
use crate::context::CallContext;
use crate::diff::{DiffOptions, ReplaceOrder};
use crate::error::{CommandError, Result};
use crate::lifecycle::{new_resource_id, validate_connection};
use crate::metrics::ProviderMetrics;
use crate::models::{CopySource, CopySpec, CopyState};
use crate::transport::ssh::SFTP_NO_SUCH_FILE;
use async_trait::async_trait;
use ssh2::{ErrorCode, Sftp};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// What a remote path currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    File,
    Dir,
}

/// The remote filesystem operations an upload needs
pub trait RemoteFs {
    /// `None` when nothing exists at `path`
    fn kind(&self, path: &str) -> io::Result<Option<RemoteKind>>;

    fn mkdir(&self, path: &str) -> io::Result<()>;

    /// Create or truncate `path` and fill it from `contents`
    fn write_file(&self, path: &str, contents: &mut dyn Read) -> io::Result<u64>;
}

impl RemoteFs for Sftp {
    fn kind(&self, path: &str) -> io::Result<Option<RemoteKind>> {
        match self.stat(Path::new(path)) {
            Ok(stat) if stat.is_dir() => Ok(Some(RemoteKind::Dir)),
            Ok(_) => Ok(Some(RemoteKind::File)),
            Err(e) if e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn mkdir(&self, path: &str) -> io::Result<()> {
        Sftp::mkdir(self, Path::new(path), 0o755).map_err(io::Error::from)
    }

    fn write_file(&self, path: &str, contents: &mut dyn Read) -> io::Result<u64> {
        let mut remote = self.create(Path::new(path))?;
        io::copy(contents, &mut remote)
    }
}

/// What one upload wrote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Remote path the source landed at
    pub destination: String,
    pub files: usize,
    pub bytes: u64,
}

fn copy_error(path: impl fmt::Display, message: impl fmt::Display) -> CommandError {
    CommandError::Copy {
        path: path.to_string(),
        message: message.to_string(),
    }
}

fn join_remote(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

fn ensure_dir(fs: &dyn RemoteFs, path: &str) -> Result<()> {
    match fs.kind(path).map_err(|e| copy_error(path, e))? {
        Some(RemoteKind::Dir) => Ok(()),
        Some(RemoteKind::File) => Err(copy_error(path, "exists and is not a directory")),
        None => fs.mkdir(path).map_err(|e| copy_error(path, e)),
    }
}

fn upload_file(
    fs: &dyn RemoteFs,
    local: &Path,
    remote: &str,
    report: &mut UploadReport,
) -> Result<()> {
    let mut file = File::open(local).map_err(|e| copy_error(local.display(), e))?;
    let written = fs
        .write_file(remote, &mut file)
        .map_err(|e| copy_error(remote, e))?;
    debug!("Uploaded {} -> {} ({} bytes)", local.display(), remote, written);
    report.files += 1;
    report.bytes += written;
    Ok(())
}

/// Upload `source` to `remote_path`, checking `stop` between files.
pub fn upload_tree(
    fs: &dyn RemoteFs,
    source: &Path,
    remote_path: &str,
    stop: &AtomicBool,
) -> Result<UploadReport> {
    let metadata = std::fs::metadata(source).map_err(|e| copy_error(source.display(), e))?;
    let existing = fs
        .kind(remote_path)
        .map_err(|e| copy_error(remote_path, e))?;
    let name = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());

    let mut report = UploadReport::default();

    if !metadata.is_dir() {
        let destination = match (existing, name) {
            (Some(RemoteKind::Dir), Some(name)) => join_remote(remote_path, &name),
            _ => remote_path.to_string(),
        };
        upload_file(fs, source, &destination, &mut report)?;
        report.destination = destination;
        return Ok(report);
    }

    ensure_dir(fs, remote_path)?;
    let contents_only = source.as_os_str().to_string_lossy().ends_with('/');
    report.destination = match name {
        Some(name) if !contents_only => {
            let target = join_remote(remote_path, &name);
            ensure_dir(fs, &target)?;
            target
        }
        _ => remote_path.to_string(),
    };

    for entry in WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        if stop.load(Ordering::SeqCst) {
            return Err(CommandError::Cancelled {
                stdout: String::new(),
                stderr: String::new(),
            });
        }

        let entry = entry.map_err(|e| copy_error(source.display(), e))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| copy_error(entry.path().display(), e))?;
        let remote = join_remote(&report.destination, &to_slash_path(relative));

        if entry.file_type().is_dir() {
            ensure_dir(fs, &remote)?;
        } else if entry.file_type().is_file() {
            upload_file(fs, entry.path(), &remote, &mut report)?;
        } else {
            debug!("Skipping {}: not a regular file", entry.path().display());
        }
    }

    Ok(report)
}

/// Uploads a copy resource's source to its remote host
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Upload: Send + Sync {
    async fn upload(&self, spec: &CopySpec, ctx: &CallContext) -> Result<UploadReport>;
}

#[async_trait]
impl Upload for SshConnector {
    async fn upload(&self, spec: &CopySpec, ctx: &CallContext) -> Result<UploadReport> {
        let session = self.connect(&spec.connection, ctx).await?;
        let source = PathBuf::from(spec.source.path());
        let remote_path = spec.remote_path.clone();
        let stop = Arc::new(AtomicBool::new(false));

        let job = tokio::task::spawn_blocking({
            let stop = stop.clone();
            move || {
                let mut session = session;
                let result = match session.session.sftp() {
                    Ok(sftp) => upload_tree(&sftp, &source, &remote_path, &stop),
                    Err(e) => Err(CommandError::Ssh {
                        host: session.host.clone(),
                        message: format!("sftp: {}", e),
                    }),
                };
                session.disconnect();
                result
            }
        });
        tokio::pin!(job);

        let mut timed_out = false;
        let joined = tokio::select! {
            joined = &mut job => joined,
            _ = ctx.cancelled() => {
                stop.store(true, Ordering::SeqCst);
                job.await
            }
            _ = ctx.deadline_elapsed() => {
                timed_out = true;
                stop.store(true, Ordering::SeqCst);
                job.await
            }
        };

        let outcome = joined.map_err(|e| copy_error(&spec.remote_path, e))?;
        match outcome {
            Err(CommandError::Cancelled { stdout, stderr }) if timed_out => {
                Err(CommandError::Timeout {
                    after: ctx.timeout().unwrap_or_default(),
                    stdout,
                    stderr,
                })
            }
            other => other,
        }
    }
}

/// Copy inputs tracked for changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyField {
    /// Source path, kind or contents
    Source,
    RemotePath,
    /// Target host or port
    Destination,
    /// Credentials, timeouts or the proxy
    Connection,
}

impl CopyField {
    fn triggers_upload(self) -> bool {
        !matches!(self, CopyField::Connection)
    }
}

impl fmt::Display for CopyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyField::Source => write!(f, "source"),
            CopyField::RemotePath => write!(f, "remotePath"),
            CopyField::Destination => write!(f, "destination"),
            CopyField::Connection => write!(f, "connection"),
        }
    }
}

/// What a copy call has to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyAction {
    Create,
    NoOp,
    /// Upload again into the same resource
    Upload,
    /// Record the new inputs; the remote files stay as they are
    Refresh,
    Replace { order: ReplaceOrder },
}

impl fmt::Display for CopyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyAction::Create => write!(f, "create"),
            CopyAction::NoOp => write!(f, "no-op"),
            CopyAction::Upload => write!(f, "upload"),
            CopyAction::Refresh => write!(f, "update"),
            CopyAction::Replace {
                order: ReplaceOrder::CreateBeforeDelete,
            } => write!(f, "replace"),
            CopyAction::Replace {
                order: ReplaceOrder::DeleteBeforeCreate,
            } => write!(f, "replace (delete first)"),
        }
    }
}

/// Resolved copy action with the fields behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyPlan {
    pub action: CopyAction,
    pub changed: Vec<CopyField>,
}

impl CopyPlan {
    pub fn has_changes(&self) -> bool {
        self.action != CopyAction::NoOp
    }
}

/// Classify the action needed to move from `previous` to `desired`.
///
/// `source_sha256` is the digest of the source as it is now; `None` means
/// it could not be read (yet) and counts as changed.
pub fn resolve_copy(
    previous: Option<&CopyState>,
    desired: &CopySpec,
    source_sha256: Option<&str>,
    options: &DiffOptions,
) -> CopyPlan {
    let Some(previous) = previous else {
        return CopyPlan {
            action: CopyAction::Create,
            changed: Vec::new(),
        };
    };
    let old = &previous.inputs;

    let mut changed = Vec::new();
    if old.source != desired.source || source_sha256 != Some(previous.source_sha256.as_str()) {
        changed.push(CopyField::Source);
    }
    if old.remote_path != desired.remote_path {
        changed.push(CopyField::RemotePath);
    }
    if old.connection.target.address() != desired.connection.target.address() {
        changed.push(CopyField::Destination);
    } else if old.connection != desired.connection {
        changed.push(CopyField::Connection);
    }

    let action = if old.triggers != desired.triggers {
        CopyAction::Replace {
            order: if options.delete_before_replace {
                ReplaceOrder::DeleteBeforeCreate
            } else {
                ReplaceOrder::CreateBeforeDelete
            },
        }
    } else if changed.iter().any(|field| field.triggers_upload()) {
        CopyAction::Upload
    } else if changed.is_empty() {
        CopyAction::NoOp
    } else {
        CopyAction::Refresh
    };

    CopyPlan { action, changed }
}

/// Check a copy configuration before any work is done
pub fn validate_copy_spec(spec: &CopySpec) -> Result<()> {
    if spec.source.path().trim().is_empty() {
        return Err(CommandError::Validation(
            "copy source path cannot be empty".to_string(),
        ));
    }
    if spec.remote_path.trim().is_empty() {
        return Err(CommandError::Validation(
            "copy remotePath cannot be empty".to_string(),
        ));
    }
    validate_connection(&spec.connection)
}

/// Orchestrates create/update/delete calls for copy resources
#[derive(Clone)]
pub struct CopyLifecycle {
    uploader: Arc<dyn Upload>,
    collector: OutputCollector,
    metrics: Option<ProviderMetrics>,
}

impl CopyLifecycle {
    /// Lifecycle uploading over real SSH connections
    pub fn new() -> Self {
        Self::with_uploader(Arc::new(SshConnector::new()))
    }

    pub fn with_uploader(uploader: Arc<dyn Upload>) -> Self {
        Self {
            uploader,
            collector: OutputCollector::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ProviderMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Digest of the source as it is on disk now
    pub fn source_digest(&self, spec: &CopySpec) -> Result<String> {
        let path = Path::new(spec.source.path());
        if matches!(spec.source, CopySource::Asset(_)) && path.is_dir() {
            return Err(copy_error(
                path.display(),
                "an asset source must be a file; use archive for directories",
            ));
        }
        self.collector.digest_path(path)
    }

    /// Classify the action needed to reach `desired`
    pub fn diff(
        &self,
        previous: Option<&CopyState>,
        desired: &CopySpec,
        options: &DiffOptions,
    ) -> CopyPlan {
        let digest = self.source_digest(desired).ok();
        let plan = resolve_copy(previous, desired, digest.as_deref(), options);
        debug!("Copy diff resolved to {} (changed: {:?})", plan.action, plan.changed);
        plan
    }

    /// Upload the source of a new copy resource named `name`
    pub async fn create(&self, name: &str, spec: &CopySpec, ctx: &CallContext) -> Result<CopyState> {
        validate_copy_spec(spec)?;
        let id = new_resource_id(name);

        if ctx.dry_run {
            return Ok(CopyState {
                id,
                inputs: spec.clone(),
                source_sha256: self.source_digest(spec).unwrap_or_default(),
            });
        }

        let source_sha256 = self.source_digest(spec)?;
        self.upload("create", spec, ctx).await?;

        info!("Created {}", id);
        Ok(CopyState {
            id,
            inputs: spec.clone(),
            source_sha256,
        })
    }

    /// Upload again when the source, remote path or destination changed
    pub async fn update(
        &self,
        previous: &CopyState,
        desired: &CopySpec,
        ctx: &CallContext,
    ) -> Result<CopyState> {
        validate_copy_spec(desired)?;

        let digest = if ctx.dry_run {
            self.source_digest(desired).ok()
        } else {
            Some(self.source_digest(desired)?)
        };
        let plan = resolve_copy(
            Some(previous),
            desired,
            digest.as_deref(),
            &DiffOptions::default(),
        );

        if plan.changed.iter().any(|field| field.triggers_upload()) && !ctx.dry_run {
            self.upload("update", desired, ctx).await?;
        } else {
            debug!("{}: nothing to upload", previous.id);
        }

        info!("Updated {}", previous.id);
        Ok(CopyState {
            id: previous.id.clone(),
            inputs: desired.clone(),
            source_sha256: digest.unwrap_or_else(|| previous.source_sha256.clone()),
        })
    }

    /// Forget a copy resource; the remote files are not removed
    pub async fn delete(&self, previous: &CopyState, _ctx: &CallContext) -> Result<()> {
        info!(
            "Deleted {}; {} on {} is left in place",
            previous.id,
            previous.inputs.remote_path,
            previous.inputs.connection.target.address()
        );
        Ok(())
    }

    async fn upload(&self, operation: &str, spec: &CopySpec, ctx: &CallContext) -> Result<UploadReport> {
        if let Some(metrics) = &self.metrics {
            metrics.inc_active_operations();
        }
        let start = Instant::now();
        let result = self.uploader.upload(spec, ctx).await;

        if let Some(metrics) = &self.metrics {
            metrics.dec_active_operations();
            let status = if result.is_ok() { "success" } else { "failed" };
            metrics.record_operation(operation, status, start.elapsed().as_secs_f64());
        }

        match &result {
            Ok(report) => info!(
                "Uploaded {} file(s), {} bytes to {}:{}",
                report.files,
                report.bytes,
                spec.connection.target.address(),
                report.destination
            ),
            Err(e) => warn!("{} upload failed: {}", operation, e),
        }
        result
    }
}

impl Default for CopyLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
