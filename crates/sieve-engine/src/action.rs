//! Actions and side effects: the deferred, externally visible outcomes
//! a script run accumulates.

use std::any::Any;

use crate::{
    ehandler::ErrorHandler,
    error::{ActionError, CommitStatus},
    runtime::{MessageData, ScriptEnv},
};

/// How a second occurrence of the same action is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Quietly merge into the existing entry.
    Coalesce,
    /// A duplicate is a script error.
    Error,
}

/// Static facts about an action type.
#[derive(Debug)]
pub struct ActionDef {
    pub name: &'static str,
    /// Sends a message back toward the sender; at most one such action
    /// may commit per run.
    pub sends_response: bool,
    /// A successful commit suppresses the implicit keep.
    pub cancels_keep: bool,
    /// Whether the action is an internal bookkeeping entry rather than
    /// a user-visible delivery decision.
    pub internal: bool,
    pub duplicates: DuplicatePolicy,
}

/// Host handles available while actions commit.
pub struct ActionExecEnv<'a> {
    pub msgdata: &'a MessageData<'a>,
    pub env: &'a ScriptEnv<'a>,
    pub ehandler: &'a mut dyn ErrorHandler,
}

/// One planned action.
///
/// `execute` runs during the commit's execute phase; `finish` always
/// runs afterwards, in reverse insertion order, with the overall
/// outcome.
pub trait Action: Send {
    fn def(&self) -> &'static ActionDef;

    fn as_any(&self) -> &dyn Any;

    /// Whether `other` (of the same def) is the same action, for
    /// duplicate handling.
    fn equals(&self, other: &dyn Action) -> bool {
        let _ = other;
        true
    }

    /// One line for the result dump.
    fn describe(&self) -> String;

    /// Performs the action.
    fn execute(
        &mut self,
        aenv: &mut ActionExecEnv<'_>,
        side_effects: &[Box<dyn SideEffect>],
    ) -> Result<(), ActionError>;

    /// Observes the commit outcome. Deferred side effects (duplicate
    /// marks) run here, only on [`CommitStatus::Ok`].
    fn finish(&mut self, aenv: &mut ActionExecEnv<'_>, status: CommitStatus) {
        let _ = (aenv, status);
    }
}

/// A modifier attached to an action (e.g. IMAP flags on a delivery).
pub trait SideEffect: Send {
    fn name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    /// One line for the result dump.
    fn describe(&self) -> String;

    /// Folds another instance (same name) into this one, when the
    /// carrying actions coalesce.
    fn merge(&mut self, other: Box<dyn SideEffect>) {
        let _ = other;
    }

    /// IMAP flags this side effect contributes to a delivery.
    fn flags(&self) -> Option<&[String]> {
        None
    }
}

/// Collects the IMAP flags contributed by a side-effect list.
pub fn flag_list(side_effects: &[Box<dyn SideEffect>]) -> Vec<String> {
    let mut flags = Vec::new();
    for se in side_effects {
        if let Some(fs) = se.flags() {
            for f in fs {
                if !flags.iter().any(|existing: &String| existing.eq_ignore_ascii_case(f)) {
                    flags.push(f.clone());
                }
            }
        }
    }
    flags
}

/// Optional-operand code under which delivery commands carry their
/// side-effect list.
pub(crate) const OPT_SIDE_EFFECTS: u64 = 1;

// --- core actions ---

static KEEP_DEF: ActionDef = ActionDef {
    name: "keep",
    sends_response: false,
    cancels_keep: true,
    internal: false,
    duplicates: DuplicatePolicy::Coalesce,
};

static DISCARD_DEF: ActionDef = ActionDef {
    name: "discard",
    sends_response: false,
    cancels_keep: true,
    internal: false,
    duplicates: DuplicatePolicy::Coalesce,
};

static FILEINTO_DEF: ActionDef = ActionDef {
    name: "fileinto",
    sends_response: false,
    cancels_keep: true,
    internal: false,
    duplicates: DuplicatePolicy::Coalesce,
};

static REDIRECT_DEF: ActionDef = ActionDef {
    name: "redirect",
    sends_response: false,
    cancels_keep: true,
    internal: false,
    duplicates: DuplicatePolicy::Coalesce,
};

/// Explicit `keep`: deliver to the default mailbox.
pub struct KeepAction;

impl Action for KeepAction {
    fn def(&self) -> &'static ActionDef {
        &KEEP_DEF
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        "store message in default mailbox".into()
    }

    fn execute(
        &mut self,
        aenv: &mut ActionExecEnv<'_>,
        side_effects: &[Box<dyn SideEffect>],
    ) -> Result<(), ActionError> {
        let inbox = aenv.env.inbox().to_owned();
        store_into(aenv, &inbox, side_effects)
    }
}

/// `discard`: silently drop the message (by cancelling the implicit
/// keep and doing nothing else).
pub struct DiscardAction;

impl Action for DiscardAction {
    fn def(&self) -> &'static ActionDef {
        &DISCARD_DEF
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        "discard".into()
    }

    fn execute(
        &mut self,
        _aenv: &mut ActionExecEnv<'_>,
        _side_effects: &[Box<dyn SideEffect>],
    ) -> Result<(), ActionError> {
        tracing::debug!("message discarded");
        Ok(())
    }
}

/// `fileinto`: deliver to a named mailbox.
pub struct FileintoAction {
    pub mailbox: String,
}

impl Action for FileintoAction {
    fn def(&self) -> &'static ActionDef {
        &FILEINTO_DEF
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equals(&self, other: &dyn Action) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|o| o.mailbox == self.mailbox)
    }

    fn describe(&self) -> String {
        format!("store message in mailbox `{}`", self.mailbox)
    }

    fn execute(
        &mut self,
        aenv: &mut ActionExecEnv<'_>,
        side_effects: &[Box<dyn SideEffect>],
    ) -> Result<(), ActionError> {
        store_into(aenv, &self.mailbox, side_effects)
    }
}

/// `redirect`: forward the raw message over SMTP.
pub struct RedirectAction {
    pub address: String,
}

impl Action for RedirectAction {
    fn def(&self) -> &'static ActionDef {
        &REDIRECT_DEF
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equals(&self, other: &dyn Action) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|o| o.address.eq_ignore_ascii_case(&self.address))
    }

    fn describe(&self) -> String {
        format!("redirect message to <{}>", self.address)
    }

    fn execute(
        &mut self,
        aenv: &mut ActionExecEnv<'_>,
        _side_effects: &[Box<dyn SideEffect>],
    ) -> Result<(), ActionError> {
        let Some(smtp) = aenv.env.smtp else {
            aenv.ehandler.warning(
                None,
                format_args!("redirect to <{}> has no means to send mail", self.address),
            );
            return Ok(());
        };
        let mut session = smtp
            .open(&self.address, aenv.msgdata.return_path.as_deref())
            .map_err(|e| ActionError::temporary(format!("redirect: {e}")))?;
        aenv.msgdata
            .mail
            .write_to(&mut session)
            .map_err(|e| ActionError::temporary(format!("redirect: {e}")))?;
        session
            .close()
            .map_err(|e| ActionError::temporary(format!("redirect: {e}")))?;
        tracing::info!(address = %self.address, "message redirected");
        Ok(())
    }
}

fn store_into(
    aenv: &mut ActionExecEnv<'_>,
    mailbox: &str,
    side_effects: &[Box<dyn SideEffect>],
) -> Result<(), ActionError> {
    let Some(store) = aenv.env.store else {
        aenv.ehandler.warning(
            None,
            format_args!("no mail storage available, cannot store in `{mailbox}`"),
        );
        return Ok(());
    };
    let flags = flag_list(side_effects);
    store.store(mailbox, &flags).map_err(|e| {
        if e.temporary {
            ActionError::temporary(e.to_string())
        } else {
            ActionError::new(e.to_string())
        }
    })?;
    tracing::info!(mailbox, ?flags, "message stored");
    Ok(())
}
