//! The result of a script run: an ordered action list with duplicate
//! and conflict resolution, and the two-phase commit protocol.

use crate::{
    action::{flag_list, Action, ActionExecEnv, DuplicatePolicy, SideEffect},
    error::{ActionError, CommitStatus, ExecError, ExitCode},
};

/// Where an entry is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Planned,
    Executed,
    Failed,
}

/// One entry in the result.
pub struct ActionEntry {
    pub action: Box<dyn Action>,
    pub side_effects: Vec<Box<dyn SideEffect>>,
    /// Source line the action came from.
    pub line: u32,
    pub state: ActionState,
}

/// The ordered set of actions produced by a run.
///
/// Actions are added while the interpreter runs; composition rules are
/// enforced immediately so conflicts surface with both source
/// locations. Committing runs every action's execute hook in order,
/// then every finish hook in reverse order with the overall outcome.
#[derive(Default)]
pub struct ScriptResult {
    entries: Vec<ActionEntry>,
    /// Side effects for the implicit keep, captured at the end of the
    /// interpreter run.
    implicit_side_effects: Vec<Box<dyn SideEffect>>,
}

impl ScriptResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// The planned entries, for inspection.
    pub fn entries(&self) -> &[ActionEntry] {
        &self.entries
    }

    /// Plans an action, enforcing the composition rules:
    ///
    /// 1. a same-def entry with equal context either coalesces or is a
    ///    `DuplicateAction` error, per the def's duplicate policy;
    /// 2. two response-sending actions conflict;
    /// 3. entries already executed by a preceding script report "not an
    ///    error" as a courtesy.
    pub fn add_action(
        &mut self,
        action: Box<dyn Action>,
        side_effects: Vec<Box<dyn SideEffect>>,
        line: u32,
        ehandler: &mut dyn crate::ehandler::ErrorHandler,
    ) -> Result<(), ExecError> {
        let def = action.def();
        for entry in &mut self.entries {
            let other_def = entry.action.def();
            if other_def.name == def.name && action.equals(entry.action.as_ref()) {
                if entry.state == ActionState::Executed {
                    return Ok(());
                }
                match def.duplicates {
                    DuplicatePolicy::Coalesce => {
                        merge_side_effects(&mut entry.side_effects, side_effects);
                        return Ok(());
                    }
                    DuplicatePolicy::Error => {
                        let msg = format!(
                            "duplicate {} action not allowed (previously triggered one was on line {})",
                            def.name, entry.line
                        );
                        ehandler.error(Some(line), format_args!("{msg}"));
                        return Err(ExecError::Runtime(msg));
                    }
                }
            }
            if def.sends_response && other_def.sends_response {
                if entry.state == ActionState::Executed {
                    return Ok(());
                }
                let msg = format!(
                    "{} action conflicts with other action: \
                     the {} action (line {}) also sends a response to the sender",
                    def.name, other_def.name, entry.line
                );
                ehandler.error(Some(line), format_args!("{msg}"));
                return Err(ExecError::Runtime(msg));
            }
        }
        self.entries.push(ActionEntry {
            action,
            side_effects,
            line,
            state: ActionState::Planned,
        });
        Ok(())
    }

    /// Records the side effects the implicit keep would carry.
    pub fn add_implicit_keep(&mut self, side_effects: Vec<Box<dyn SideEffect>>) {
        self.implicit_side_effects = side_effects;
    }

    /// Logs the planned result.
    pub fn print(&self) {
        for entry in &self.entries {
            tracing::debug!(line = entry.line, "planned action: {}", entry.action.describe());
            for se in &entry.side_effects {
                tracing::debug!("  with side effect: {}", se.describe());
            }
        }
        if !self.suppresses_implicit_keep() {
            tracing::debug!("planned action: implicit keep");
        }
    }

    fn suppresses_implicit_keep(&self) -> bool {
        self.entries.iter().any(|e| {
            e.action.def().cancels_keep && matches!(e.state, ActionState::Planned | ActionState::Executed)
        })
    }

    /// Commits the result. Returns the exit code the host sees.
    pub fn commit(&mut self, aenv: &mut ActionExecEnv<'_>) -> ExitCode {
        self.print();

        // Execute phase. The first failure decides the outcome, but the
        // loop keeps going so every finish hook sees a settled state.
        let mut first_error: Option<ActionError> = None;
        for entry in &mut self.entries {
            if entry.state != ActionState::Planned {
                continue;
            }
            let effects = std::mem::take(&mut entry.side_effects);
            let outcome = entry.action.execute(aenv, &effects);
            entry.side_effects = effects;
            match outcome {
                Ok(()) => entry.state = ActionState::Executed,
                Err(err) => {
                    entry.state = ActionState::Failed;
                    aenv.ehandler
                        .error(Some(entry.line), format_args!("{} action failed: {err}", entry.action.def().name));
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        // Implicit keep, unless a committed action replaced delivery or
        // the run already failed.
        let suppressed = self
            .entries
            .iter()
            .any(|e| e.state == ActionState::Executed && e.action.def().cancels_keep);
        if first_error.is_none() && !suppressed {
            if let Err(err) = self.execute_implicit_keep(aenv) {
                aenv.ehandler
                    .error(None, format_args!("implicit keep failed: {err}"));
                first_error = Some(err);
            }
        }

        // Finish phase, reverse insertion order.
        let status = if first_error.is_some() {
            CommitStatus::Failed
        } else {
            CommitStatus::Ok
        };
        for entry in self.entries.iter_mut().rev() {
            entry.action.finish(aenv, status);
        }

        match first_error {
            Some(err) if err.temporary => ExitCode::TempFailure,
            Some(_) => ExitCode::Failed,
            None => {
                let acted = self
                    .entries
                    .iter()
                    .any(|e| e.state == ActionState::Executed && !e.action.def().internal);
                if acted {
                    ExitCode::Ok
                } else {
                    ExitCode::KeepOnly
                }
            }
        }
    }

    fn execute_implicit_keep(&mut self, aenv: &mut ActionExecEnv<'_>) -> Result<(), ActionError> {
        let Some(store) = aenv.env.store else {
            tracing::debug!("implicit keep left to the host (no mail storage)");
            return Ok(());
        };
        let flags = flag_list(&self.implicit_side_effects);
        store
            .store(aenv.env.inbox(), &flags)
            .map_err(|e| {
                if e.temporary {
                    ActionError::temporary(e.to_string())
                } else {
                    ActionError::new(e.to_string())
                }
            })?;
        tracing::info!(mailbox = aenv.env.inbox(), ?flags, "implicit keep");
        Ok(())
    }

    /// Abandons the result after an aborted run: every planned action's
    /// finish hook observes [`CommitStatus::Aborted`] so no deferred
    /// side effect is recorded, then the entries are dropped.
    pub fn abort(&mut self, aenv: &mut ActionExecEnv<'_>) {
        for entry in self.entries.iter_mut().rev() {
            entry.action.finish(aenv, CommitStatus::Aborted);
        }
        self.entries.clear();
        self.implicit_side_effects.clear();
    }
}

fn merge_side_effects(into: &mut Vec<Box<dyn SideEffect>>, from: Vec<Box<dyn SideEffect>>) {
    for se in from {
        match into.iter_mut().find(|e| e.name() == se.name()) {
            Some(existing) => existing.merge(se),
            None => into.push(se),
        }
    }
}
