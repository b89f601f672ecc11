//! Apply driver: reconciles a resource file against the state store
//!
//! Declared resources are processed in file order. Each one is diffed against
//! its stored state and the resulting action is performed through the
//! [`CommandLifecycle`] or, for copy resources, the [`CopyLifecycle`]. State is
//! written only after a call succeeded and every call is recorded in the
//! operation history. Stored resources that are no longer declared are
//! deleted afterwards, newest first.
//!
//! A resource keeps its place in the creation order across updates and
//! replacements. A declaration whose kind differs from the stored one
//! replaces it, deleting the old resource first.
//!
//! The first failing call stops the run.

use crate::context::CallContext;
use crate::copy::{CopyAction, CopyLifecycle, CopyPlan};
use crate::diff::{Action, DiffPlan, ReplaceOrder};
use crate::error::{CommandError, Result};
use crate::lifecycle::CommandLifecycle;
use crate::models::{
    CopyState, OperationKind, OperationStatus, ResourceDeclaration, ResourceFile, ResourceState,
    StoredState,
};
use crate::state::StateManager;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What will happen to one resource
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedAction {
    /// Declared command resource with its resolved diff
    Resolved(DiffPlan),
    /// Declared copy resource with its resolved diff
    Copy(CopyPlan),
    /// Stored as the other kind; deleted, then created anew
    KindChange,
    /// Stored resource that is no longer declared
    Delete,
}

impl PlannedAction {
    pub fn has_changes(&self) -> bool {
        match self {
            PlannedAction::Resolved(plan) => plan.has_changes(),
            PlannedAction::Copy(plan) => plan.has_changes(),
            PlannedAction::KindChange | PlannedAction::Delete => true,
        }
    }
}

/// One entry of a preview
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChange {
    pub name: String,
    pub action: PlannedAction,
    /// Would-be state for creates, updates and replacements
    pub preview: Option<StoredState>,
}

impl PlannedChange {
    pub fn is_noop(&self) -> bool {
        !self.action.has_changes()
    }
}

/// Names of the resources touched by a run, by outcome
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub replaced: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ApplySummary {
    pub fn total_changes(&self) -> usize {
        self.created.len() + self.updated.len() + self.replaced.len() + self.deleted.len()
    }
}

/// Output worth keeping in the operation history
trait RecordedOutput {
    fn recorded_output(&self) -> Option<(&str, &str)>;
}

impl RecordedOutput for ResourceState {
    fn recorded_output(&self) -> Option<(&str, &str)> {
        Some((&self.outputs.stdout, &self.outputs.stderr))
    }
}

impl RecordedOutput for CopyState {
    fn recorded_output(&self) -> Option<(&str, &str)> {
        None
    }
}

impl RecordedOutput for StoredState {
    fn recorded_output(&self) -> Option<(&str, &str)> {
        match self {
            StoredState::Command(state) => state.recorded_output(),
            StoredState::Copy(state) => state.recorded_output(),
        }
    }
}

impl RecordedOutput for () {
    fn recorded_output(&self) -> Option<(&str, &str)> {
        None
    }
}

/// Drives lifecycle calls for a whole resource file
pub struct Engine {
    state: Arc<StateManager>,
    lifecycle: CommandLifecycle,
    copier: CopyLifecycle,
}

impl Engine {
    pub fn new(state: Arc<StateManager>, lifecycle: CommandLifecycle) -> Self {
        Self {
            state,
            lifecycle,
            copier: CopyLifecycle::new(),
        }
    }

    /// Use `copier` for copy resources
    pub fn with_copier(mut self, copier: CopyLifecycle) -> Self {
        self.copier = copier;
        self
    }

    /// Resolve every declared and orphaned resource without running anything
    pub async fn preview(&self, file: &ResourceFile, ctx: &CallContext) -> Result<Vec<PlannedChange>> {
        let ctx = ctx.clone().with_dry_run(true);
        let mut changes = Vec::new();

        for declaration in &file.resources {
            let previous = self.state.load_state(&declaration.name)?;
            let action = self.plan(declaration, previous.as_ref());

            let preview = match (&action, &previous, &declaration.copy) {
                (_, _, _) if !action.has_changes() => None,
                (
                    PlannedAction::Resolved(DiffPlan {
                        action: Action::Update { .. },
                        ..
                    }),
                    Some(StoredState::Command(previous)),
                    None,
                ) => Some(StoredState::Command(
                    self.lifecycle.update(previous, &declaration.spec, &ctx).await?,
                )),
                (
                    PlannedAction::Copy(CopyPlan {
                        action: CopyAction::Upload | CopyAction::Refresh,
                        ..
                    }),
                    Some(StoredState::Copy(previous)),
                    Some(copy),
                ) => Some(StoredState::Copy(self.copier.update(previous, copy, &ctx).await?)),
                _ => Some(self.create_declared(declaration, &ctx).await?),
            };

            changes.push(PlannedChange {
                name: declaration.name.clone(),
                action,
                preview,
            });
        }

        for name in self.orphans(file)? {
            changes.push(PlannedChange {
                name,
                action: PlannedAction::Delete,
                preview: None,
            });
        }

        Ok(changes)
    }

    /// Bring the store in line with `file`
    pub async fn apply(&self, file: &ResourceFile, ctx: &CallContext) -> Result<ApplySummary> {
        info!("Applying {} resource(s)", file.resources.len());
        let mut summary = ApplySummary::default();

        for declaration in &file.resources {
            self.apply_one(declaration, ctx, &mut summary).await?;
        }

        for name in self.orphans(file)? {
            info!("Resource '{}' is no longer declared", name);
            if self.destroy_one(&name, ctx).await? {
                summary.deleted.push(name);
            }
        }

        info!(
            "Apply finished: {} created, {} updated, {} replaced, {} deleted, {} unchanged",
            summary.created.len(),
            summary.updated.len(),
            summary.replaced.len(),
            summary.deleted.len(),
            summary.unchanged.len()
        );
        Ok(summary)
    }

    /// Delete stored resources in reverse order.
    ///
    /// With `only`, just the named resources are deleted (still in reverse of
    /// the given order); otherwise everything in the store, newest first.
    pub async fn destroy(&self, only: Option<&[String]>, ctx: &CallContext) -> Result<ApplySummary> {
        let names: Vec<String> = match only {
            Some(names) => names.to_vec(),
            None => self
                .state
                .list_resources()?
                .into_iter()
                .map(|stored| stored.name)
                .collect(),
        };

        let mut summary = ApplySummary::default();
        for name in names.into_iter().rev() {
            if self.destroy_one(&name, ctx).await? {
                summary.deleted.push(name);
            }
        }

        info!("Destroy finished: {} deleted", summary.deleted.len());
        Ok(summary)
    }

    fn plan(&self, declaration: &ResourceDeclaration, previous: Option<&StoredState>) -> PlannedAction {
        let options = &declaration.options;
        match (&declaration.copy, previous) {
            (Some(copy), None) => PlannedAction::Copy(self.copier.diff(None, copy, options)),
            (Some(copy), Some(StoredState::Copy(previous))) => {
                PlannedAction::Copy(self.copier.diff(Some(previous), copy, options))
            }
            (None, None) => {
                PlannedAction::Resolved(self.lifecycle.diff(None, &declaration.spec, options))
            }
            (None, Some(StoredState::Command(previous))) => PlannedAction::Resolved(
                self.lifecycle.diff(Some(previous), &declaration.spec, options),
            ),
            (_, Some(_)) => PlannedAction::KindChange,
        }
    }

    async fn apply_one(
        &self,
        declaration: &ResourceDeclaration,
        ctx: &CallContext,
        summary: &mut ApplySummary,
    ) -> Result<()> {
        let name = declaration.name.as_str();
        let previous = self.state.load_state(name)?;
        let planned = self.plan(declaration, previous.as_ref());

        match (planned, previous, &declaration.copy) {
            (_, None, _)
            | (
                PlannedAction::Resolved(DiffPlan {
                    action: Action::Create,
                    ..
                }),
                _,
                _,
            )
            | (
                PlannedAction::Copy(CopyPlan {
                    action: CopyAction::Create,
                    ..
                }),
                _,
                _,
            ) => {
                info!("Creating '{}'", name);
                let state = self
                    .tracked(name, OperationKind::Create, self.create_declared(declaration, ctx))
                    .await?;
                self.state.save_state(name, &state)?;
                summary.created.push(name.to_string());
            }
            (planned, Some(_), _) if !planned.has_changes() => {
                summary.unchanged.push(name.to_string());
            }
            (
                PlannedAction::Resolved(DiffPlan {
                    action: Action::Update { rerun_create },
                    changed,
                    ..
                }),
                Some(StoredState::Command(previous)),
                None,
            ) => {
                info!(
                    "Updating '{}' (changed: {:?}{})",
                    name,
                    changed,
                    if rerun_create { ", re-running create" } else { "" }
                );
                let state = self
                    .tracked(
                        name,
                        OperationKind::Update,
                        self.lifecycle.update(&previous, &declaration.spec, ctx),
                    )
                    .await?;
                self.state.save_resource(name, &state)?;
                summary.updated.push(name.to_string());
            }
            (
                PlannedAction::Copy(CopyPlan {
                    action: CopyAction::Upload | CopyAction::Refresh,
                    changed,
                }),
                Some(StoredState::Copy(previous)),
                Some(copy),
            ) => {
                info!("Updating '{}' (changed: {:?})", name, changed);
                let state = self
                    .tracked(name, OperationKind::Update, self.copier.update(&previous, copy, ctx))
                    .await?;
                self.state.save_copy(name, &state)?;
                summary.updated.push(name.to_string());
            }
            (
                PlannedAction::Resolved(DiffPlan {
                    action: Action::Replace { order },
                    replace_reasons,
                    ..
                }),
                Some(previous),
                _,
            ) => {
                info!("Replacing '{}' ({:?}, reasons: {:?})", name, order, replace_reasons);
                self.replace(name, &previous, declaration, order, ctx).await?;
                summary.replaced.push(name.to_string());
            }
            (
                PlannedAction::Copy(CopyPlan {
                    action: CopyAction::Replace { order },
                    ..
                }),
                Some(previous),
                _,
            ) => {
                info!("Replacing '{}' ({:?}, triggers changed)", name, order);
                self.replace(name, &previous, declaration, order, ctx).await?;
                summary.replaced.push(name.to_string());
            }
            (_, Some(previous), _) => {
                info!(
                    "Replacing '{}': stored as a {} resource",
                    name,
                    previous.kind()
                );
                self.replace(name, &previous, declaration, ReplaceOrder::DeleteBeforeCreate, ctx)
                    .await?;
                summary.replaced.push(name.to_string());
            }
        }

        Ok(())
    }

    /// Replace `previous` with a fresh resource; the stored row keeps its
    /// place in the creation order unless the new create fails.
    async fn replace(
        &self,
        name: &str,
        previous: &StoredState,
        declaration: &ResourceDeclaration,
        order: ReplaceOrder,
        ctx: &CallContext,
    ) -> Result<()> {
        match order {
            ReplaceOrder::DeleteBeforeCreate => {
                self.tracked(name, OperationKind::Delete, self.delete_stored(previous, ctx))
                    .await?;

                let created = self
                    .tracked(name, OperationKind::Create, self.create_declared(declaration, ctx))
                    .await;
                match created {
                    Ok(state) => self.state.save_state(name, &state)?,
                    Err(e) => {
                        self.state.remove_resource(name)?;
                        return Err(e);
                    }
                }
            }
            ReplaceOrder::CreateBeforeDelete => {
                let state = self
                    .tracked(name, OperationKind::Create, self.create_declared(declaration, ctx))
                    .await?;
                self.state.save_state(name, &state)?;

                let cleanup = self
                    .tracked(name, OperationKind::Delete, self.delete_stored(previous, ctx))
                    .await;
                if let Err(e) = cleanup {
                    error!("Replacement of '{}' left {} behind", name, previous.id());
                    return Err(CommandError::ReplaceCleanup {
                        name: name.to_string(),
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(())
    }

    /// Delete one stored resource; `Ok(false)` when nothing was stored
    async fn destroy_one(&self, name: &str, ctx: &CallContext) -> Result<bool> {
        let Some(previous) = self.state.load_state(name)? else {
            warn!("No stored state for '{}', nothing to delete", name);
            return Ok(false);
        };

        info!("Deleting '{}' ({})", name, previous.id());
        self.tracked(name, OperationKind::Delete, self.delete_stored(&previous, ctx))
            .await?;
        self.state.remove_resource(name)?;
        Ok(true)
    }

    async fn create_declared(
        &self,
        declaration: &ResourceDeclaration,
        ctx: &CallContext,
    ) -> Result<StoredState> {
        let name = &declaration.name;
        Ok(match &declaration.copy {
            Some(copy) => StoredState::Copy(self.copier.create(name, copy, ctx).await?),
            None => StoredState::Command(self.lifecycle.create(name, &declaration.spec, ctx).await?),
        })
    }

    async fn delete_stored(&self, previous: &StoredState, ctx: &CallContext) -> Result<()> {
        match previous {
            StoredState::Command(state) => self.lifecycle.delete(state, ctx).await,
            StoredState::Copy(state) => self.copier.delete(state, ctx).await,
        }
    }

    /// Stored resources absent from `file`, newest first
    fn orphans(&self, file: &ResourceFile) -> Result<Vec<String>> {
        let declared: HashSet<&str> = file.resources.iter().map(|r| r.name.as_str()).collect();
        Ok(self
            .state
            .list_resources()?
            .into_iter()
            .rev()
            .map(|stored| stored.name)
            .filter(|name| !declared.contains(name.as_str()))
            .collect())
    }

    /// Run `call` and record it in the operation history
    async fn tracked<T, Fut>(&self, name: &str, kind: OperationKind, call: Fut) -> Result<T>
    where
        T: RecordedOutput,
        Fut: Future<Output = Result<T>>,
    {
        let operation_id = self.state.start_operation(name, kind)?;
        let result = call.await;

        match &result {
            Ok(value) => {
                let (stdout, stderr) = value.recorded_output().unzip();
                self.state.finish_operation(
                    operation_id,
                    OperationStatus::Success,
                    Some(0),
                    stdout,
                    stderr,
                    None,
                )?;
            }
            Err(e) => {
                let (stdout, stderr) = e.output().unzip();
                let message = e.to_string();
                self.state.finish_operation(
                    operation_id,
                    OperationStatus::Failed,
                    e.exit_code(),
                    stdout,
                    stderr,
                    Some(&message),
                )?;
                error!("{} of '{}' failed: {}", kind, name, e);
            }
        }

        result
    }
}
