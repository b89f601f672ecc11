//! CLI interface for the command provider

use crate::connector::SshConnector;
use crate::context::{CallContext, CancelHandle};
use crate::copy::{CopyAction, CopyLifecycle};
use crate::diff::Action;
use crate::engine::{ApplySummary, Engine, PlannedAction, PlannedChange};
use crate::error::CommandError;
use crate::lifecycle::CommandLifecycle;
use crate::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use crate::metrics::ProviderMetrics;
use crate::models::{CommandOutputs, Logging, RunSpec, StoredState};
use crate::parser::parse_resource_file;
use crate::state::StateManager;
use crate::templates;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Run shell commands locally or over SSH as managed, stateful resources
#[derive(Parser, Debug)]
#[command(name = "command-provider")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run shell commands locally or over SSH as managed resources", long_about = None)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json", global = true)]
    pub log_format: String,

    /// Database path for resource state
    #[arg(long, default_value = "command-provider.db", global = true)]
    pub db_path: PathBuf,

    /// Write Prometheus metrics to this file when the command finishes
    #[arg(long, global = true)]
    pub metrics_file: Option<PathBuf>,

    /// Deadline in seconds for each lifecycle call
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create, update, replace or delete resources to match a resource file
    Apply {
        /// Path to resource YAML file
        file: PathBuf,
    },

    /// Show what apply would do without running anything
    Preview {
        /// Path to resource YAML file
        file: PathBuf,
    },

    /// Delete stored resources, newest first
    Destroy {
        /// Only delete the resources declared in this file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Validate a resource file
    Validate {
        /// Path to resource YAML file
        file: PathBuf,
    },

    /// Inspect stored resource state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Show lifecycle call history
    History {
        /// Resource name (optional, shows all if not specified)
        name: Option<String>,

        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Run a local command once, without keeping state
    Run {
        /// Working directory
        #[arg(short, long)]
        dir: Option<String>,

        /// Environment variable (KEY=VALUE), repeatable
        #[arg(short, long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,

        /// Data written to the command's stdin
        #[arg(long)]
        stdin: Option<String>,

        /// Asset glob rule, repeatable (prefix with ! to exclude)
        #[arg(long = "asset")]
        asset_paths: Vec<String>,

        /// Script to run
        #[arg(last = true, required = true)]
        script: Vec<String>,
    },

    /// Generate example resource YAML templates
    Template {
        /// Template type (omit to list available templates)
        #[arg(short = 't', long = "type")]
        template_type: Option<TemplateType>,

        /// Write output to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// List stored resources
    List,

    /// Print the stored state of a resource as JSON
    Show {
        name: String,
    },

    /// Export the captured archive of a resource as a tar file
    Archive {
        name: String,

        /// Output tar file
        #[arg(short, long)]
        output: PathBuf,
    },
}

/// Available template types for the `template` subcommand.
#[derive(Debug, Clone, ValueEnum)]
pub enum TemplateType {
    /// Single local command
    Minimal,
    /// Local lifecycle scripts with asset capture
    Local,
    /// Remote command over SSH
    Ssh,
    /// Remote command through a bastion host
    Proxy,
    /// SFTP uploads followed by a reload
    Copy,
    /// Local and remote resources with replace options
    Full,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Cancel `handle` on Ctrl-C
fn cancel_on_interrupt(handle: CancelHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling the running command");
            handle.cancel();
        }
    })
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        let config = LogConfig {
            level: LogLevel::from(self.log_level.as_str()),
            format: LogFormat::from(self.log_format.as_str()),
        };

        init_logging(&config)
    }

    /// Execute the CLI command.
    ///
    /// Returns the process exit code: `0`, or the exit status of a failed
    /// `run` script.
    pub async fn execute(&self) -> anyhow::Result<i32> {
        let metrics = ProviderMetrics::new()?;

        let result = match &self.command {
            Commands::Apply { file } => self.apply(file, &metrics).await.map(|_| 0),
            Commands::Preview { file } => self.preview(file, &metrics).await.map(|_| 0),
            Commands::Destroy { file } => {
                self.destroy(file.as_deref(), &metrics).await.map(|_| 0)
            }
            Commands::Validate { file } => self.validate(file).map(|_| 0),
            Commands::State { command } => self.handle_state_command(command).map(|_| 0),
            Commands::History { name, limit } => {
                self.show_history(name.as_deref(), *limit).map(|_| 0)
            }
            Commands::Run {
                dir,
                env,
                stdin,
                asset_paths,
                script,
            } => {
                let spec = RunSpec {
                    command: script.join(" "),
                    dir: dir.clone(),
                    environment: env.iter().cloned().collect(),
                    stdin: stdin.clone(),
                    logging: Logging::None,
                    asset_paths: asset_paths.clone(),
                    ..Default::default()
                };
                self.run_command(&spec, &metrics).await
            }
            Commands::Template {
                template_type,
                output,
            } => self
                .handle_template(template_type.as_ref(), output.as_ref())
                .map(|_| 0),
        };

        if let Some(path) = &self.metrics_file {
            std::fs::write(path, metrics.gather()?)?;
            info!("Metrics written to {}", path.display());
        }

        result
    }

    fn call_context(&self) -> (CallContext, CancelHandle) {
        let (ctx, handle) = CallContext::new();
        match self.timeout {
            Some(secs) => (ctx.with_timeout(Duration::from_secs(secs)), handle),
            None => (ctx, handle),
        }
    }

    fn lifecycle(&self, metrics: &ProviderMetrics) -> CommandLifecycle {
        let connector = SshConnector::new().with_metrics(metrics.clone());
        CommandLifecycle::with_dialer(Arc::new(connector)).with_metrics(metrics.clone())
    }

    fn engine(&self, metrics: &ProviderMetrics) -> anyhow::Result<Engine> {
        let state = StateManager::new(&self.db_path)?;
        let interrupted = state.recover_interrupted()?;
        if !interrupted.is_empty() {
            warn!(
                "Marked {} interrupted operation(s) as failed; check the affected hosts",
                interrupted.len()
            );
        }
        let uploader = SshConnector::new().with_metrics(metrics.clone());
        let copier =
            CopyLifecycle::with_uploader(Arc::new(uploader)).with_metrics(metrics.clone());
        Ok(Engine::new(Arc::new(state), self.lifecycle(metrics)).with_copier(copier))
    }

    async fn apply(&self, path: &Path, metrics: &ProviderMetrics) -> anyhow::Result<()> {
        info!("Loading resources from: {:?}", path);
        let file = parse_resource_file(path)?;
        let engine = self.engine(metrics)?;

        let (ctx, handle) = self.call_context();
        let watcher = cancel_on_interrupt(handle);
        let result = engine.apply(&file, &ctx).await;
        watcher.abort();

        match result {
            Ok(summary) => {
                print_summary(&summary);
                Ok(())
            }
            Err(e) => Err(report_failure(e)),
        }
    }

    async fn preview(&self, path: &Path, metrics: &ProviderMetrics) -> anyhow::Result<()> {
        let file = parse_resource_file(path)?;
        let engine = self.engine(metrics)?;
        let (ctx, _handle) = self.call_context();

        let changes = engine.preview(&file, &ctx).await?;
        for change in &changes {
            println!("{}", describe_change(change));
        }

        let pending = changes.iter().filter(|c| !c.is_noop()).count();
        println!();
        println!("{} change(s) pending, {} unchanged", pending, changes.len() - pending);
        Ok(())
    }

    async fn destroy(&self, path: Option<&Path>, metrics: &ProviderMetrics) -> anyhow::Result<()> {
        let only = match path {
            Some(path) => Some(
                parse_resource_file(path)?
                    .resources
                    .into_iter()
                    .map(|r| r.name)
                    .collect::<Vec<_>>(),
            ),
            None => None,
        };
        let engine = self.engine(metrics)?;

        let (ctx, handle) = self.call_context();
        let watcher = cancel_on_interrupt(handle);
        let result = engine.destroy(only.as_deref(), &ctx).await;
        watcher.abort();

        match result {
            Ok(summary) => {
                print_summary(&summary);
                Ok(())
            }
            Err(e) => Err(report_failure(e)),
        }
    }

    /// Validate a resource file without running anything
    fn validate(&self, path: &Path) -> anyhow::Result<()> {
        info!("Validating resource file: {:?}", path);
        let file = parse_resource_file(path)?;

        let copies = file.resources.iter().filter(|r| r.copy.is_some()).count();
        let remote = file
            .resources
            .iter()
            .filter(|r| r.copy.is_none() && r.spec.is_remote())
            .count();
        println!("Resource file is valid");
        println!(
            "Resources: {} ({} local, {} remote, {} copy)",
            file.resources.len(),
            file.resources.len() - remote - copies,
            remote,
            copies
        );
        for resource in &file.resources {
            println!("  - {}", resource.name);
        }
        Ok(())
    }

    fn handle_state_command(&self, command: &StateCommands) -> anyhow::Result<()> {
        let state = StateManager::new(&self.db_path)?;

        match command {
            StateCommands::List => {
                let resources = state.list_resources()?;
                if resources.is_empty() {
                    println!("No resources found");
                    return Ok(());
                }

                println!("{:<30} {:<40} {:<8} {:<20}", "Name", "ID", "Target", "Updated");
                println!("{}", "-".repeat(100));
                for stored in resources {
                    let target = match &stored.state {
                        StoredState::Command(state) if state.inputs.is_remote() => "remote",
                        StoredState::Command(_) => "local",
                        StoredState::Copy(_) => "copy",
                    };
                    let updated = stored
                        .updated_at
                        .with_timezone(&chrono::Local)
                        .format("%Y-%m-%d %H:%M:%S");
                    println!(
                        "{:<30} {:<40} {:<8} {:<20}",
                        stored.name,
                        stored.state.id(),
                        target,
                        updated
                    );
                }
            }
            StateCommands::Show { name } => {
                let resource = state
                    .load_state(name)?
                    .ok_or_else(|| anyhow::anyhow!("No stored state for '{}'", name))?;
                println!("{}", serde_json::to_string_pretty(&resource)?);
            }
            StateCommands::Archive { name, output } => {
                let resource = match state.load_state(name)? {
                    Some(StoredState::Command(resource)) => resource,
                    Some(StoredState::Copy(_)) => {
                        anyhow::bail!("Resource '{}' is a copy resource and has no archive", name)
                    }
                    None => anyhow::bail!("No stored state for '{}'", name),
                };
                let archive = resource
                    .outputs
                    .archive
                    .ok_or_else(|| anyhow::anyhow!("Resource '{}' has no archive", name))?;

                let file = std::fs::File::create(output)?;
                archive.write_tar(std::io::BufWriter::new(file))?;
                println!(
                    "Archive with {} file(s) written to {}",
                    archive.assets.len(),
                    output.display()
                );
            }
        }

        Ok(())
    }

    /// Show lifecycle call history
    fn show_history(&self, name: Option<&str>, limit: usize) -> anyhow::Result<()> {
        let state = StateManager::new(&self.db_path)?;
        let records = state.operation_history(name, limit)?;

        if records.is_empty() {
            println!("No operation history found");
            return Ok(());
        }

        println!(
            "{:<8} {:<24} {:<8} {:<20} {:<10} {:<6} {:<10}",
            "ID", "Resource", "Call", "Started", "Status", "Exit", "Duration"
        );
        println!("{:-<92}", "");

        for record in &records {
            let started = record.started_at.format("%Y-%m-%d %H:%M:%S");
            let duration = record
                .completed_at
                .map(|completed| format_duration((completed - record.started_at).num_seconds()))
                .unwrap_or_else(|| "N/A".to_string());
            let exit = record
                .exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string());

            println!(
                "{:<8} {:<24} {:<8} {:<20} {:<10} {:<6} {:<10}",
                record.id,
                record.resource_name,
                record.operation.to_string(),
                started,
                record.status.to_string(),
                exit,
                duration
            );
            if let Some(message) = &record.error {
                println!("         error: {}", message);
            }
        }

        Ok(())
    }

    /// Run a one-shot command; a failed script yields its exit code
    async fn run_command(&self, spec: &RunSpec, metrics: &ProviderMetrics) -> anyhow::Result<i32> {
        let lifecycle = self.lifecycle(metrics);

        let (ctx, handle) = self.call_context();
        let watcher = cancel_on_interrupt(handle);
        let result = lifecycle.run(spec, &ctx).await;
        watcher.abort();

        match result {
            Ok(outputs) => {
                print_outputs(&outputs);
                Ok(0)
            }
            Err(e) => {
                if let Some((stdout, stderr)) = e.output() {
                    print!("{}", stdout);
                    eprint!("{}", stderr);
                }
                error!("Command failed: {}", e);
                Ok(e.exit_code().unwrap_or(1))
            }
        }
    }

    /// Handle the `template` subcommand.
    fn handle_template(
        &self,
        template_type: Option<&TemplateType>,
        output: Option<&PathBuf>,
    ) -> anyhow::Result<()> {
        let Some(tt) = template_type else {
            println!("Available templates:\n");
            let header_type = "TYPE";
            let header_desc = "DESCRIPTION";
            println!("{header_type:<12} {header_desc}");
            println!("{}", "-".repeat(60));
            for info in templates::list_templates() {
                println!("{:<12} {}", info.name, info.description);
            }
            println!();
            println!("Usage: command-provider template --type <TYPE> [-o <FILE>]");
            return Ok(());
        };

        let type_name = match tt {
            TemplateType::Minimal => "minimal",
            TemplateType::Local => "local",
            TemplateType::Ssh => "ssh",
            TemplateType::Proxy => "proxy",
            TemplateType::Copy => "copy",
            TemplateType::Full => "full",
        };

        let content = templates::get_template(type_name)
            .ok_or_else(|| anyhow::anyhow!("Unknown template type: {}", type_name))?;

        if let Some(path) = output {
            use std::fs::OpenOptions;
            use std::io::Write as _;
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        anyhow::anyhow!(
                            "File '{}' already exists. Remove it first or choose a different name.",
                            path.display()
                        )
                    } else {
                        e.into()
                    }
                })?;
            file.write_all(content.as_bytes())?;
            println!("Template written to {}", path.display());
        } else {
            print!("{content}");
        }

        Ok(())
    }
}

/// One preview line per resource
fn describe_change(change: &PlannedChange) -> String {
    let created = || {
        let id = change
            .preview
            .as_ref()
            .map(|state| state.id())
            .unwrap_or_default();
        format!("+ {} (create {})", change.name, id)
    };

    match &change.action {
        PlannedAction::Delete => format!("- {} (delete: no longer declared)", change.name),
        PlannedAction::KindChange => format!("± {} (replace: resource kind changed)", change.name),
        PlannedAction::Copy(plan) => match plan.action {
            CopyAction::Create => created(),
            CopyAction::NoOp => format!("= {}", change.name),
            CopyAction::Upload | CopyAction::Refresh => format!(
                "~ {} ({}: {})",
                change.name,
                plan.action,
                join(plan.changed.iter())
            ),
            CopyAction::Replace { .. } => {
                format!("± {} ({}: triggers)", change.name, plan.action)
            }
        },
        PlannedAction::Resolved(plan) => match plan.action {
            Action::Create => created(),
            Action::NoOp => format!("= {}", change.name),
            Action::Update { .. } => format!(
                "~ {} ({}: {})",
                change.name,
                plan.action,
                join(plan.changed.iter())
            ),
            Action::Replace { .. } => format!(
                "± {} ({}: {})",
                change.name,
                plan.action,
                join(plan.replace_reasons.iter())
            ),
        },
    }
}

fn join<T: std::fmt::Display>(items: impl Iterator<Item = T>) -> String {
    items.map(|item| item.to_string()).collect::<Vec<_>>().join(", ")
}

fn print_summary(summary: &ApplySummary) {
    for (label, names) in [
        ("Created", &summary.created),
        ("Updated", &summary.updated),
        ("Replaced", &summary.replaced),
        ("Deleted", &summary.deleted),
    ] {
        if !names.is_empty() {
            println!("{:<10} {}", label, names.join(", "));
        }
    }
    println!(
        "{} change(s), {} unchanged",
        summary.total_changes(),
        summary.unchanged.len()
    );
}

fn print_outputs(outputs: &CommandOutputs) {
    print!("{}", outputs.stdout);
    eprint!("{}", outputs.stderr);
    for asset in outputs.assets.values() {
        eprintln!("asset {} ({} bytes, sha256 {})", asset.path, asset.size, asset.sha256);
    }
}

/// Print the captured output of a failed call and turn it into the CLI error
fn report_failure(e: CommandError) -> anyhow::Error {
    if let Some((stdout, stderr)) = e.output() {
        if !stdout.is_empty() {
            eprintln!("--- stdout ---\n{}", stdout.trim_end());
        }
        if !stderr.is_empty() {
            eprintln!("--- stderr ---\n{}", stderr.trim_end());
        }
    }
    error!("Apply stopped: {}", e);
    e.into()
}

/// Format duration in seconds to human-readable string
fn format_duration(seconds: i64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!(
            "{}h {}m {}s",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    }
}
