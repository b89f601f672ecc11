//! End-to-end lifecycle tests against the local host
//!
//! Tests the complete flow: create → update → delete through real `/bin/sh`
//! processes, with output chaining and file capture.
#![cfg(unix)]

use command_provider::context::CallContext;
use command_provider::diff::{Action, DiffOptions};
use command_provider::error::CommandError;
use command_provider::lifecycle::CommandLifecycle;
use command_provider::models::{CommandSpec, RunSpec};
use std::collections::BTreeSet;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

fn spec_in(dir: &TempDir, create: &str) -> CommandSpec {
    CommandSpec {
        dir: Some(dir.path().to_string_lossy().into_owned()),
        ..CommandSpec::local(create)
    }
}

#[tokio::test]
async fn test_echo_hello() {
    let lifecycle = CommandLifecycle::new();
    let state = lifecycle
        .create("hello", &CommandSpec::local("echo hello"), &CallContext::background())
        .await
        .unwrap();

    assert_eq!(state.outputs.stdout, "hello\n");
    assert_eq!(state.outputs.stderr, "");
    assert!(state.outputs.assets.is_empty());
    assert!(state.outputs.archive.is_none());
}

#[tokio::test]
async fn test_previous_stdout_is_chained_into_update() {
    let lifecycle = CommandLifecycle::new();
    let ctx = CallContext::background();

    let created = lifecycle
        .create("chain", &CommandSpec::local("printf v1"), &ctx)
        .await
        .unwrap();
    assert_eq!(created.outputs.stdout, "v1");

    let mut desired = CommandSpec::local("printf v1");
    desired.update = Some(r#"printf '%s' "${PULUMI_COMMAND_STDOUT-absent}""#.to_string());
    let updated = lifecycle.update(&created, &desired, &ctx).await.unwrap();
    assert_eq!(updated.outputs.stdout, "v1");

    desired.add_previous_output_in_env = false;
    let updated = lifecycle.update(&created, &desired, &ctx).await.unwrap();
    assert_eq!(updated.outputs.stdout, "absent");
}

#[tokio::test]
async fn test_user_environment_and_stdin() {
    let lifecycle = CommandLifecycle::new();
    let mut spec = CommandSpec::local(r#"read line; printf '%s-%s' "$GREETING" "$line""#);
    spec.environment.insert("GREETING".to_string(), "hi".to_string());
    spec.stdin = Some("there\n".to_string());

    let state = lifecycle
        .create("env", &spec, &CallContext::background())
        .await
        .unwrap();
    assert_eq!(state.outputs.stdout, "hi-there");
}

#[tokio::test]
async fn test_glob_rules_select_assets() {
    let dir = TempDir::new().unwrap();
    let mut spec = spec_in(
        &dir,
        "mkdir -p src && echo a > a.txt && echo b > src/b.txt && echo s > src/secret.txt",
    );
    spec.asset_paths = vec!["src/**".to_string(), "!**secret*".to_string()];
    spec.archive_paths = vec!["**/*.txt".to_string()];

    let state = CommandLifecycle::new()
        .create("files", &spec, &CallContext::background())
        .await
        .unwrap();

    let assets: Vec<&str> = state.outputs.assets.keys().map(String::as_str).collect();
    assert_eq!(assets, vec!["src/b.txt"]);
    assert_eq!(state.outputs.assets["src/b.txt"].size, 2);

    let archive = state.outputs.archive.unwrap();
    let archived: BTreeSet<&str> = archive.assets.keys().map(String::as_str).collect();
    assert_eq!(
        archived,
        BTreeSet::from(["a.txt", "src/b.txt", "src/secret.txt"])
    );

    let mut tarball = Vec::new();
    archive.write_tar(&mut tarball).unwrap();
    let mut reader = tar::Archive::new(tarball.as_slice());
    let entries: Vec<String> = reader
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec!["a.txt", "src/b.txt", "src/secret.txt"]);
}

#[tokio::test]
async fn test_failed_create_carries_output() {
    let err = CommandLifecycle::new()
        .create(
            "broken",
            &CommandSpec::local("echo partial; echo oops >&2; exit 3"),
            &CallContext::background(),
        )
        .await
        .unwrap_err();

    match err {
        CommandError::Execution {
            exit_code,
            stdout,
            stderr,
        } => {
            assert_eq!(exit_code, 3);
            assert_eq!(stdout, "partial\n");
            assert_eq!(stderr, "oops\n");
        }
        other => panic!("expected execution error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_directory_fails_fast() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("not-there");
    let spec = CommandSpec {
        dir: Some(missing.to_string_lossy().into_owned()),
        ..CommandSpec::local("touch created")
    };

    let err = CommandLifecycle::new()
        .create("nodir", &spec, &CallContext::background())
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::MissingDirectory { .. }));
    assert!(!missing.exists());
}

#[tokio::test]
async fn test_update_without_update_script_reruns_create() {
    let dir = TempDir::new().unwrap();
    let lifecycle = CommandLifecycle::new();
    let ctx = CallContext::background();

    let mut spec = spec_in(&dir, "echo run >> runs.log");
    spec.delete = Some("echo deleted >> runs.log".to_string());
    let created = lifecycle.create("rerun", &spec, &ctx).await.unwrap();

    spec.environment.insert("VERSION".to_string(), "2".to_string());
    let plan = lifecycle.diff(Some(&created), &spec, &DiffOptions::default());
    assert_eq!(plan.action, Action::Update { rerun_create: true });

    let updated = lifecycle.update(&created, &spec, &ctx).await.unwrap();
    assert_eq!(updated.id, created.id);

    let log = fs::read_to_string(dir.path().join("runs.log")).unwrap();
    assert_eq!(log, "run\nrun\n");
}

#[tokio::test]
async fn test_delete_sees_previous_output() {
    let dir = TempDir::new().unwrap();
    let lifecycle = CommandLifecycle::new();
    let ctx = CallContext::background();

    let mut spec = spec_in(&dir, "printf token-123");
    spec.delete = Some(r#"printf '%s' "$PULUMI_COMMAND_STDOUT" > revoked.txt"#.to_string());

    let state = lifecycle.create("token", &spec, &ctx).await.unwrap();
    lifecycle.delete(&state, &ctx).await.unwrap();

    let revoked = fs::read_to_string(dir.path().join("revoked.txt")).unwrap();
    assert_eq!(revoked, "token-123");
}

#[tokio::test]
async fn test_timeout_keeps_partial_output() {
    let ctx = CallContext::background().with_timeout(Duration::from_millis(300));
    let err = CommandLifecycle::new()
        .create("slow", &CommandSpec::local("echo started; sleep 10"), &ctx)
        .await
        .unwrap_err();

    match err {
        CommandError::Timeout { stdout, .. } => assert_eq!(stdout, "started\n"),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stateless_run() {
    let dir = TempDir::new().unwrap();
    let spec = RunSpec {
        command: "echo report > out.txt && cat out.txt".to_string(),
        dir: Some(dir.path().to_string_lossy().into_owned()),
        asset_paths: vec!["*.txt".to_string()],
        ..Default::default()
    };

    let outputs = CommandLifecycle::new()
        .run(&spec, &CallContext::background())
        .await
        .unwrap();
    assert_eq!(outputs.stdout, "report\n");
    assert!(outputs.assets.contains_key("out.txt"));
}
