//! Diff resolution: decides what a lifecycle call has to do
//!
//! [`resolve`] compares the previous state of a resource with its desired
//! configuration and classifies the required action:
//!
//! 1. No previous state: [`Action::Create`].
//! 2. Any trigger differs by value, position or length: [`Action::Replace`].
//!    Triggers cannot be ignored.
//! 3. A changed field listed in `replaceOnChanges`: [`Action::Replace`].
//! 4. Any other changed field that is not listed in `ignoreChanges`:
//!    [`Action::Update`], which re-runs `create` when no `update` script exists.
//! 5. Otherwise: [`Action::NoOp`].
//!
//! Resolution never fails.

use crate::models::{CommandSpec, ResourceState};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Input fields tracked for changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    Create,
    Update,
    Delete,
    Dir,
    Environment,
    Interpreter,
    Stdin,
    AssetPaths,
    ArchivePaths,
    Connection,
    Logging,
    AddPreviousOutputInEnv,
}

impl Field {
    pub const ALL: [Field; 12] = [
        Field::Create,
        Field::Update,
        Field::Delete,
        Field::Dir,
        Field::Environment,
        Field::Interpreter,
        Field::Stdin,
        Field::AssetPaths,
        Field::ArchivePaths,
        Field::Connection,
        Field::Logging,
        Field::AddPreviousOutputInEnv,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Create => "create",
            Field::Update => "update",
            Field::Delete => "delete",
            Field::Dir => "dir",
            Field::Environment => "environment",
            Field::Interpreter => "interpreter",
            Field::Stdin => "stdin",
            Field::AssetPaths => "assetPaths",
            Field::ArchivePaths => "archivePaths",
            Field::Connection => "connection",
            Field::Logging => "logging",
            Field::AddPreviousOutputInEnv => "addPreviousOutputInEnv",
        }
    }

    fn changed(self, old: &CommandSpec, new: &CommandSpec) -> bool {
        match self {
            Field::Create => old.create != new.create,
            Field::Update => old.update != new.update,
            Field::Delete => old.delete != new.delete,
            Field::Dir => old.dir != new.dir,
            Field::Environment => old.environment != new.environment,
            Field::Interpreter => old.interpreter != new.interpreter,
            Field::Stdin => old.stdin != new.stdin,
            Field::AssetPaths => old.asset_paths != new.asset_paths,
            Field::ArchivePaths => old.archive_paths != new.archive_paths,
            Field::Connection => old.connection != new.connection,
            Field::Logging => old.logging != new.logging,
            Field::AddPreviousOutputInEnv => {
                old.add_previous_output_in_env != new.add_previous_output_in_env
            }
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Caller-supplied resource options that shape the diff
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffOptions {
    /// Fields whose changes never cause an action
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_changes: Vec<Field>,
    /// Fields whose changes force a replacement
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replace_on_changes: Vec<Field>,
    /// Delete the old resource before creating its replacement
    #[serde(default)]
    pub delete_before_replace: bool,
}

/// Sequencing of a replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOrder {
    CreateBeforeDelete,
    DeleteBeforeCreate,
}

/// What a lifecycle call has to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    NoOp,
    /// In-place update; `rerun_create` when no `update` script is defined
    Update { rerun_create: bool },
    Replace { order: ReplaceOrder },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::NoOp => write!(f, "no-op"),
            Action::Update { rerun_create: false } => write!(f, "update"),
            Action::Update { rerun_create: true } => write!(f, "update (re-run create)"),
            Action::Replace {
                order: ReplaceOrder::CreateBeforeDelete,
            } => write!(f, "replace"),
            Action::Replace {
                order: ReplaceOrder::DeleteBeforeCreate,
            } => write!(f, "replace (delete first)"),
        }
    }
}

/// Why a replacement was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceReason {
    Triggers,
    Field(Field),
}

impl fmt::Display for ReplaceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplaceReason::Triggers => write!(f, "triggers"),
            ReplaceReason::Field(field) => write!(f, "{}", field),
        }
    }
}

/// Resolved action with the evidence behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffPlan {
    pub action: Action,
    /// Tracked fields that changed, excluding ignored ones
    pub changed: Vec<Field>,
    pub replace_reasons: Vec<ReplaceReason>,
}

impl DiffPlan {
    pub fn has_changes(&self) -> bool {
        self.action != Action::NoOp
    }
}

/// Classify the action needed to move from `previous` to `desired`.
pub fn resolve(
    previous: Option<&ResourceState>,
    desired: &CommandSpec,
    options: &DiffOptions,
) -> DiffPlan {
    let Some(previous) = previous else {
        return DiffPlan {
            action: Action::Create,
            changed: Vec::new(),
            replace_reasons: Vec::new(),
        };
    };
    let old = &previous.inputs;

    let mut replace_reasons = Vec::new();
    if old.triggers != desired.triggers {
        replace_reasons.push(ReplaceReason::Triggers);
    }

    let changed: Vec<Field> = Field::ALL
        .into_iter()
        .filter(|field| !options.ignore_changes.contains(field))
        .filter(|field| field.changed(old, desired))
        .collect();

    replace_reasons.extend(
        changed
            .iter()
            .filter(|field| options.replace_on_changes.contains(field))
            .map(|field| ReplaceReason::Field(*field)),
    );

    let action = if !replace_reasons.is_empty() {
        Action::Replace {
            order: if options.delete_before_replace {
                ReplaceOrder::DeleteBeforeCreate
            } else {
                ReplaceOrder::CreateBeforeDelete
            },
        }
    } else if changed.is_empty() {
        Action::NoOp
    } else {
        Action::Update {
            rerun_create: desired.update.is_none(),
        }
    };

    DiffPlan {
        action,
        changed,
        replace_reasons,
    }
}
