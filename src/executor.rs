//! Script execution against a transport
//!
//! Builds the [`RunRequest`] for a resource's script, including the
//! previous-output variables, and turns a non-zero exit status into
//! [`CommandError::Execution`] with everything the script printed.

use crate::context::CallContext;
use crate::error::{CommandError, Result};
use crate::models::{
    CommandOutputs, CommandSpec, ExecutionResult, PREVIOUS_STDERR_ENV, PREVIOUS_STDOUT_ENV,
};
use crate::transport::{RunRequest, Transport};
use tracing::{debug, error};

/// Request for running `script` with the settings of `spec`.
///
/// When `spec.add_previous_output_in_env` is set, non-empty stdout/stderr of
/// `previous` are exported as `PULUMI_COMMAND_STDOUT`/`PULUMI_COMMAND_STDERR`.
pub fn build_request(
    spec: &CommandSpec,
    script: &str,
    previous: Option<&CommandOutputs>,
) -> RunRequest {
    let mut previous_output = Vec::new();
    if spec.add_previous_output_in_env {
        if let Some(previous) = previous {
            if !previous.stdout.is_empty() {
                previous_output.push((PREVIOUS_STDOUT_ENV.to_string(), previous.stdout.clone()));
            }
            if !previous.stderr.is_empty() {
                previous_output.push((PREVIOUS_STDERR_ENV.to_string(), previous.stderr.clone()));
            }
        }
    }

    RunRequest {
        script: script.to_string(),
        environment: spec.environment.clone(),
        previous_output,
        dir: spec.dir.clone(),
        stdin: spec.stdin.clone(),
        interpreter: spec.interpreter.clone(),
        logging: spec.logging,
    }
}

/// Run `request` and fail on a non-zero exit status
pub async fn execute(
    transport: &dyn Transport,
    request: &RunRequest,
    ctx: &CallContext,
) -> Result<ExecutionResult> {
    debug!(
        "Running script on {} ({} env vars, {} chained)",
        transport.describe(),
        request.environment.len(),
        request.previous_output.len()
    );

    let result = transport.run(request, ctx).await?;
    if result.exit_code != 0 {
        error!(
            "Command on {} failed with exit code {}",
            transport.describe(),
            result.exit_code
        );
        return Err(CommandError::Execution {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        });
    }
    Ok(result)
}
