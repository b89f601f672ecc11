//! Lifecycle orchestration for command resources
//!
//! [`CommandLifecycle`] answers the engine's Diff/Create/Update/Delete calls
//! for one resource instance at a time:
//!
//! 1. obtain a transport (local host, or an SSH session from the [`Dial`]er)
//! 2. run the script selected for the call, with the previous run's output
//!    exported when `addPreviousOutputInEnv` is set
//! 3. collect assets and archives (local commands only)
//! 4. return the new [`ResourceState`]
//!
//! A failing call returns an error and no state, so the caller keeps whatever
//! it had persisted before. Failed scripts are not retried.

use crate::collector::OutputCollector;
use crate::connector::{Dial, SshConnector};
use crate::context::CallContext;
use crate::diff::{self, DiffOptions, DiffPlan};
use crate::error::{CommandError, Result};
use crate::executor;
use crate::glob::RuleSet;
use crate::metrics::ProviderMetrics;
use crate::models::{CommandOutputs, CommandSpec, ConnectionSpec, ResourceState, RunSpec};
use crate::transport::{LocalTransport, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Check a desired configuration before any work is done
pub fn validate_spec(spec: &CommandSpec) -> Result<()> {
    if spec.is_remote() && (!spec.asset_paths.is_empty() || !spec.archive_paths.is_empty()) {
        return Err(CommandError::Validation(
            "assetPaths and archivePaths are only supported for local commands".to_string(),
        ));
    }
    if let Some(interpreter) = &spec.interpreter {
        if interpreter.is_empty() {
            return Err(CommandError::Validation(
                "interpreter must not be empty".to_string(),
            ));
        }
    }
    if let Some(connection) = &spec.connection {
        validate_connection(connection)?;
    }
    RuleSet::parse(&spec.asset_paths)?;
    RuleSet::parse(&spec.archive_paths)?;
    Ok(())
}

/// Check the target and proxy endpoints of a connection
pub fn validate_connection(connection: &ConnectionSpec) -> Result<()> {
    for endpoint in std::iter::once(&connection.target).chain(connection.proxy.as_ref()) {
        if endpoint.host.trim().is_empty() {
            return Err(CommandError::Validation(
                "connection host cannot be empty".to_string(),
            ));
        }
        if endpoint.dial_error_limit < -1 {
            return Err(CommandError::Validation(format!(
                "dialErrorLimit must be -1 or greater, got {}",
                endpoint.dial_error_limit
            )));
        }
    }
    Ok(())
}

/// New resource identifier: the name followed by 8 random hex characters
pub fn new_resource_id(name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}{}", name, &suffix[..8])
}

/// Orchestrates create/update/delete calls for command resources
#[derive(Clone)]
pub struct CommandLifecycle {
    dialer: Arc<dyn Dial>,
    local: LocalTransport,
    collector: OutputCollector,
    metrics: Option<ProviderMetrics>,
}

impl CommandLifecycle {
    /// Lifecycle dialing real SSH connections
    pub fn new() -> Self {
        Self::with_dialer(Arc::new(SshConnector::new()))
    }

    pub fn with_dialer(dialer: Arc<dyn Dial>) -> Self {
        Self {
            dialer,
            local: LocalTransport::new(),
            collector: OutputCollector::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ProviderMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Classify the action needed to reach `desired`
    pub fn diff(
        &self,
        previous: Option<&ResourceState>,
        desired: &CommandSpec,
        options: &DiffOptions,
    ) -> DiffPlan {
        let plan = diff::resolve(previous, desired, options);
        debug!(
            "Diff resolved to {} (changed: {:?}, replace reasons: {:?})",
            plan.action, plan.changed, plan.replace_reasons
        );
        plan
    }

    /// Create a new resource instance named `name`
    pub async fn create(
        &self,
        name: &str,
        spec: &CommandSpec,
        ctx: &CallContext,
    ) -> Result<ResourceState> {
        validate_spec(spec)?;
        let id = new_resource_id(name);

        if ctx.dry_run {
            return Ok(ResourceState {
                id,
                inputs: spec.clone(),
                outputs: CommandOutputs::default(),
            });
        }

        let outputs = match &spec.create {
            Some(script) => self.perform("create", spec, script, None, true, ctx).await?,
            None => CommandOutputs::default(),
        };

        info!("Created {}", id);
        Ok(ResourceState {
            id,
            inputs: spec.clone(),
            outputs,
        })
    }

    /// Update `previous` in place, running `update` or else `create`
    pub async fn update(
        &self,
        previous: &ResourceState,
        desired: &CommandSpec,
        ctx: &CallContext,
    ) -> Result<ResourceState> {
        validate_spec(desired)?;

        let script = desired.update.as_ref().or(desired.create.as_ref());
        let outputs = match script {
            Some(_) if ctx.dry_run => previous.outputs.clone(),
            Some(script) => {
                self.perform("update", desired, script, Some(&previous.outputs), true, ctx)
                    .await?
            }
            None => {
                debug!("{} has no update or create script; keeping outputs", previous.id);
                previous.outputs.clone()
            }
        };

        info!("Updated {}", previous.id);
        Ok(ResourceState {
            id: previous.id.clone(),
            inputs: desired.clone(),
            outputs,
        })
    }

    /// Delete `previous`, running its `delete` script if it has one
    pub async fn delete(&self, previous: &ResourceState, ctx: &CallContext) -> Result<()> {
        if ctx.dry_run {
            return Ok(());
        }
        let Some(script) = &previous.inputs.delete else {
            debug!("{} has no delete script", previous.id);
            return Ok(());
        };

        self.perform(
            "delete",
            &previous.inputs,
            script,
            Some(&previous.outputs),
            false,
            ctx,
        )
        .await?;
        info!("Deleted {}", previous.id);
        Ok(())
    }

    /// Run a local command statelessly
    pub async fn run(&self, spec: &RunSpec, ctx: &CallContext) -> Result<CommandOutputs> {
        let as_command = CommandSpec {
            create: Some(spec.command.clone()),
            dir: spec.dir.clone(),
            environment: spec.environment.clone(),
            interpreter: spec.interpreter.clone(),
            stdin: spec.stdin.clone(),
            add_previous_output_in_env: false,
            logging: spec.logging,
            asset_paths: spec.asset_paths.clone(),
            archive_paths: spec.archive_paths.clone(),
            ..Default::default()
        };
        validate_spec(&as_command)?;
        self.perform("run", &as_command, &spec.command, None, true, ctx)
            .await
    }

    async fn perform(
        &self,
        operation: &str,
        spec: &CommandSpec,
        script: &str,
        previous: Option<&CommandOutputs>,
        collect: bool,
        ctx: &CallContext,
    ) -> Result<CommandOutputs> {
        if let Some(metrics) = &self.metrics {
            metrics.inc_active_operations();
        }
        let start = Instant::now();
        let result = self
            .perform_inner(spec, script, previous, collect, ctx)
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.dec_active_operations();
            let status = if result.is_ok() { "success" } else { "failed" };
            metrics.record_operation(operation, status, start.elapsed().as_secs_f64());
        }
        if let Err(e) = &result {
            warn!("{} failed: {}", operation, e);
        }
        result
    }

    async fn perform_inner(
        &self,
        spec: &CommandSpec,
        script: &str,
        previous: Option<&CommandOutputs>,
        collect: bool,
        ctx: &CallContext,
    ) -> Result<CommandOutputs> {
        let request = executor::build_request(spec, script, previous);

        let result = match &spec.connection {
            Some(connection) => {
                let remote = self.dialer.dial(connection, ctx).await?;
                let result = executor::execute(remote.as_ref(), &request, ctx).await;
                remote.close().await;
                result?
            }
            None => executor::execute(&self.local, &request, ctx).await?,
        };

        let mut outputs = CommandOutputs {
            stdout: result.stdout,
            stderr: result.stderr,
            ..Default::default()
        };

        if collect && !spec.is_remote() {
            let wants_outputs = !spec.asset_paths.is_empty() || !spec.archive_paths.is_empty();
            if wants_outputs {
                let dir = match &spec.dir {
                    Some(dir) => PathBuf::from(dir),
                    None => std::env::current_dir()?,
                };
                let collector = self.collector.clone();
                let assets = spec.asset_paths.clone();
                let archive = spec.archive_paths.clone();
                let collected = tokio::task::spawn_blocking(move || {
                    collector.collect(&dir, assets.as_slice(), archive.as_slice())
                })
                .await
                .map_err(|e| CommandError::Collection {
                    path: spec.dir.clone().unwrap_or_else(|| ".".to_string()),
                    message: e.to_string(),
                })??;
                outputs.assets = collected.assets;
                outputs.archive = collected.archive;
            }
        }

        Ok(outputs)
    }
}

impl Default for CommandLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MockDial;
    use crate::models::{ConnectionSpec, Endpoint, ExecutionResult};
    use crate::transport::MockTransport;
    use std::sync::Mutex;

    fn remote_spec(create: &str) -> CommandSpec {
        CommandSpec {
            connection: Some(ConnectionSpec::new(Endpoint::new("10.0.0.9"))),
            ..CommandSpec::local(create)
        }
    }

    /// Dialer whose transports record every request and print `stdout`
    fn recording_dialer(stdout: &'static str, seen: Arc<Mutex<Vec<crate::transport::RunRequest>>>) -> MockDial {
        let mut dialer = MockDial::new();
        dialer.expect_dial().returning(move |_, _| {
            let seen = seen.clone();
            let mut transport = MockTransport::new();
            transport.expect_describe().return_const("mock".to_string());
            transport.expect_close().return_const(());
            transport.expect_run().returning(move |request, _| {
                seen.lock().unwrap().push(request.clone());
                Ok(ExecutionResult {
                    stdout: stdout.to_string(),
                    ..Default::default()
                })
            });
            Ok(Box::new(transport))
        });
        dialer
    }

    #[test]
    fn test_resource_id_format() {
        let id = new_resource_id("web");
        assert_eq!(id.len(), 11);
        assert!(id.starts_with("web"));
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_resource_id("web"), id);
    }

    #[test]
    fn test_validate_rejects_remote_assets() {
        let mut spec = remote_spec("echo");
        spec.asset_paths = vec!["*.txt".to_string()];
        assert!(matches!(
            validate_spec(&spec),
            Err(CommandError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_globs_and_interpreter() {
        let mut spec = CommandSpec::local("echo");
        spec.archive_paths = vec!["[".to_string()];
        assert!(matches!(
            validate_spec(&spec),
            Err(CommandError::InvalidGlob { .. })
        ));

        let mut spec = CommandSpec::local("echo");
        spec.interpreter = Some(vec![]);
        assert!(validate_spec(&spec).is_err());
    }

    #[tokio::test]
    async fn test_remote_create_and_chained_update() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let lifecycle = CommandLifecycle::with_dialer(Arc::new(recording_dialer("v1", seen.clone())));
        let ctx = CallContext::background();

        let state = lifecycle.create("srv", &remote_spec("deploy"), &ctx).await.unwrap();
        assert_eq!(state.outputs.stdout, "v1");
        assert!(state.id.starts_with("srv"));

        let mut desired = remote_spec("deploy --again");
        desired.environment.insert("A".to_string(), "1".to_string());
        let updated = lifecycle.update(&state, &desired, &ctx).await.unwrap();
        assert_eq!(updated.id, state.id);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].previous_output.is_empty());
        assert_eq!(seen[1].script, "deploy --again");
        assert_eq!(
            seen[1].previous_output,
            vec![("PULUMI_COMMAND_STDOUT".to_string(), "v1".to_string())]
        );
        assert_eq!(seen[1].environment["A"], "1");
    }

    #[tokio::test]
    async fn test_connection_failure_runs_nothing() {
        let mut dialer = MockDial::new();
        dialer.expect_dial().times(1).returning(|_, _| {
            Err(CommandError::Connection {
                target: "10.0.0.9:22".to_string(),
                attempts: 10,
                cause: "no route to host".to_string(),
            })
        });
        let lifecycle = CommandLifecycle::with_dialer(Arc::new(dialer));

        let err = lifecycle
            .create("srv", &remote_spec("deploy"), &CallContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Connection { attempts: 10, .. }));
    }

    #[tokio::test]
    async fn test_remote_failure_closes_session_and_keeps_output() {
        let mut dialer = MockDial::new();
        dialer.expect_dial().returning(|_, _| {
            let mut transport = MockTransport::new();
            transport.expect_describe().return_const("mock".to_string());
            transport.expect_close().times(1).return_const(());
            transport.expect_run().returning(|_, _| {
                Ok(ExecutionResult {
                    stdout: "half".to_string(),
                    stderr: "disk full".to_string(),
                    exit_code: 1,
                })
            });
            Ok(Box::new(transport))
        });
        let lifecycle = CommandLifecycle::with_dialer(Arc::new(dialer));

        let err = lifecycle
            .create("srv", &remote_spec("deploy"), &CallContext::background())
            .await
            .unwrap_err();
        assert_eq!(err.output(), Some(("half", "disk full")));
    }

    #[tokio::test]
    async fn test_dry_run_never_dials() {
        let mut dialer = MockDial::new();
        dialer.expect_dial().times(0);
        let lifecycle = CommandLifecycle::with_dialer(Arc::new(dialer));
        let ctx = CallContext::background().with_dry_run(true);

        let state = lifecycle.create("srv", &remote_spec("deploy"), &ctx).await.unwrap();
        assert_eq!(state.outputs, CommandOutputs::default());

        let previous = ResourceState {
            outputs: CommandOutputs {
                stdout: "kept".to_string(),
                ..Default::default()
            },
            ..state
        };
        let updated = lifecycle
            .update(&previous, &remote_spec("deploy v2"), &ctx)
            .await
            .unwrap();
        assert_eq!(updated.outputs.stdout, "kept");
        assert_eq!(updated.inputs.create.as_deref(), Some("deploy v2"));

        lifecycle.delete(&previous, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_without_scripts_keeps_outputs() {
        let mut dialer = MockDial::new();
        dialer.expect_dial().times(0);
        let lifecycle = CommandLifecycle::with_dialer(Arc::new(dialer));

        let previous = ResourceState {
            id: "x12345678".to_string(),
            inputs: CommandSpec::default(),
            outputs: CommandOutputs {
                stdout: "old".to_string(),
                ..Default::default()
            },
        };
        let desired = CommandSpec {
            delete: Some("cleanup".to_string()),
            connection: Some(ConnectionSpec::new(Endpoint::new("h"))),
            ..Default::default()
        };
        let updated = lifecycle
            .update(&previous, &desired, &CallContext::background())
            .await
            .unwrap();
        assert_eq!(updated.outputs.stdout, "old");
        assert_eq!(updated.inputs, desired);
    }

    #[tokio::test]
    async fn test_delete_without_script_is_noop() {
        let mut dialer = MockDial::new();
        dialer.expect_dial().times(0);
        let lifecycle = CommandLifecycle::with_dialer(Arc::new(dialer));
        let state = ResourceState {
            id: "x12345678".to_string(),
            inputs: remote_spec("deploy"),
            outputs: CommandOutputs::default(),
        };
        lifecycle
            .delete(&state, &CallContext::background())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_metrics_record_outcomes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let metrics = ProviderMetrics::new().unwrap();
        let lifecycle = CommandLifecycle::with_dialer(Arc::new(recording_dialer("ok", seen)))
            .with_metrics(metrics.clone());

        lifecycle
            .create("srv", &remote_spec("deploy"), &CallContext::background())
            .await
            .unwrap();

        let text = metrics.gather().unwrap();
        assert!(text.contains(
            "command_lifecycle_operations_total{operation=\"create\",status=\"success\"} 1"
        ));
        assert!(text.contains("command_active_operations 0"));
    }
}
