//! The `duplicate` extension (RFC 7352): detect repeated deliveries of
//! the same message.
//!
//! The test checks the persistent duplicate store, but the matching
//! mark is only written when the whole run commits, so a failed
//! delivery does not swallow the next attempt. Verdicts are cached in
//! the per-message context so chained scripts agree with each other.

use std::{any::Any, sync::Arc};

use sha2::{Digest, Sha256};

use crate::{
    action::{Action, ActionDef, ActionExecEnv, DuplicatePolicy, SideEffect},
    codegen::Generator,
    command::{
        ArgStream, CommandCtx, CommandDef, CommandKind, CommandRegistration, CommandSpec,
        FlagTag, TagActivation, TagDef, ValidatedCommand, ValueTag,
    },
    dump::{DumpError, Dumper},
    error::{ActionError, CodegenError, CommitStatus, ExecError},
    extension::Extension,
    interp::{Interpreter, Operation},
    runtime::unix_now,
    validate::{ArgType, Validator},
};

pub(crate) const EXT_NAME: &str = "duplicate";

const OP_DUPLICATE: u32 = 0;

const OPT_HANDLE: u64 = 1;
const OPT_HEADER: u64 = 2;
const OPT_UNIQUEID: u64 = 3;
const OPT_SECONDS: u64 = 4;
const OPT_LAST: u64 = 5;

/// The `duplicate` extension object, with its tracking periods.
pub struct DuplicateExt {
    /// Expiry applied when the script gives no `:seconds`.
    pub default_period: u64,
    /// Upper bound on `:seconds`.
    pub max_period: u64,
}

impl Default for DuplicateExt {
    fn default() -> Self {
        Self {
            default_period: 12 * 60 * 60,
            max_period: 2 * 24 * 60 * 60,
        }
    }
}

impl Extension for DuplicateExt {
    fn name(&self) -> &'static str {
        EXT_NAME
    }

    fn validator_load(&self, valdtr: &mut Validator<'_>) {
        valdtr.register_command(Arc::new(DuplicateTst));
    }

    fn runtime_load(&self) -> Option<Box<dyn Any + Send>> {
        Some(Box::new(Periods {
            default: self.default_period,
            max: self.max_period,
        }))
    }

    fn operation(&self, code: u32) -> Option<&dyn Operation> {
        match code {
            OP_DUPLICATE => Some(&DuplicateOp),
            _ => None,
        }
    }
}

/// Periods snapshot carried into the interpreter.
struct Periods {
    default: u64,
    max: u64,
}

/// Cached verdicts within one message, keyed like the original: by
/// handle (or its absence) plus the `:last` flag.
#[derive(Default)]
struct DuplicateCache {
    entries: Vec<(Option<String>, bool, bool)>,
}

impl DuplicateCache {
    fn get(&self, handle: Option<&str>, last: bool) -> Option<bool> {
        self.entries
            .iter()
            .find(|(h, l, _)| h.as_deref() == handle && *l == last)
            .map(|(_, _, dup)| *dup)
    }

    fn put(&mut self, handle: Option<String>, last: bool, duplicate: bool) {
        self.entries.push((handle, last, duplicate));
    }
}

struct DuplicateTst;

impl CommandDef for DuplicateTst {
    fn spec(&self) -> &CommandSpec {
        static SPEC: CommandSpec = CommandSpec {
            name: "duplicate",
            kind: CommandKind::Test,
            positional: 0,
            subtests: 0,
            block_allowed: false,
            block_required: false,
        };
        &SPEC
    }

    fn registered(&self, _valdtr: &mut Validator<'_>, reg: &mut CommandRegistration) {
        reg.register_tag(
            Arc::new(ValueTag {
                name: "handle",
                ty: ArgType::String,
            }),
            OPT_HANDLE,
        );
        reg.register_tag(
            Arc::new(ValueTag {
                name: "header",
                ty: ArgType::String,
            }),
            OPT_HEADER,
        );
        reg.register_tag(
            Arc::new(ValueTag {
                name: "uniqueid",
                ty: ArgType::String,
            }),
            OPT_UNIQUEID,
        );
        reg.register_tag(
            Arc::new(ValueTag {
                name: "seconds",
                ty: ArgType::Number,
            }),
            OPT_SECONDS,
        );
        reg.register_tag(Arc::new(FlagTag { name: "last" }), OPT_LAST);
    }

    fn validate(&self, valdtr: &mut Validator<'_>, cmd: &mut CommandCtx) -> bool {
        if cmd.has_tag("header") && cmd.has_tag("uniqueid") {
            let line = cmd.line;
            valdtr.report_error(
                line,
                format_args!("the :header and :uniqueid tags cannot be combined"),
            );
            return false;
        }
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        gen.emit_ext_op(EXT_NAME, OP_DUPLICATE)?;
        gen.generate_arguments(cmd)
    }
}

/// Hash recipe shared with the original implementation: a fixed id,
/// the `:last` marker, the handle (or a default marker), the value.
fn duplicate_hash(handle: Option<&str>, value: &str, last: bool) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"sieve duplicate");
    hasher.update(if last { b"0" } else { b"+" });
    match handle {
        Some(h) => {
            hasher.update(b"h-");
            hasher.update(h.as_bytes());
        }
        None => hasher.update(b"default"),
    }
    hasher.update(value.as_bytes());
    hasher.finalize().into()
}

struct DuplicateOp;

impl Operation for DuplicateOp {
    fn name(&self) -> &'static str {
        "DUPLICATE"
    }

    fn execute(&self, it: &mut Interpreter<'_>) -> Result<(), ExecError> {
        let pc = it.reader().position();
        let mut handle = None;
        let mut header = None;
        let mut uniqueid = None;
        let mut seconds = None;
        let mut last = false;
        while let Some(code) = it.reader().read_opt_code()? {
            match code {
                OPT_HANDLE => handle = Some(it.reader().read_string_operand()?),
                OPT_HEADER => header = Some(it.reader().read_string_operand()?),
                OPT_UNIQUEID => uniqueid = Some(it.reader().read_string_operand()?),
                OPT_SECONDS => seconds = Some(it.reader().read_number_operand()?),
                OPT_LAST => last = true,
                _ => return Err(it.corrupt(pc, "unknown optional operand")),
            }
        }

        if it.script_env().duplicates.is_none() {
            it.runtime_warning(
                None,
                format_args!("duplicate test: duplicate checking not available in this context"),
            );
            it.set_test_result(false);
            return Ok(());
        }

        // The tracked value: a named header, an explicit id, or the
        // message id.
        let value = if let Some(name) = &header {
            it.message().mail.get_first_header(name).unwrap_or(None)
        } else if uniqueid.is_some() {
            uniqueid
        } else {
            it.message().id.clone()
        };
        let Some(value) = value else {
            it.set_test_result(false);
            return Ok(());
        };

        if let Some(cached) = it
            .message_context()
            .entry(EXT_NAME, DuplicateCache::default)
            .and_then(|c| c.get(handle.as_deref(), last))
        {
            it.set_test_result(cached);
            return Ok(());
        }

        let (default_period, max_period) = match it.extension_context_ref::<Periods>(EXT_NAME) {
            Some(p) => (p.default, p.max),
            None => return Err(it.corrupt(pc, "duplicate context missing")),
        };
        let period = seconds.unwrap_or(default_period).min(max_period);

        let hash = duplicate_hash(handle.as_deref(), &value, last);
        let duplicate = match it.script_env().duplicates {
            Some(dups) => dups.check(&hash, it.script_env().username()),
            None => false,
        };

        // Marking is deferred to a successful commit. With :last the
        // window restarts on every delivery, so the mark is placed even
        // for duplicates.
        if !duplicate || last {
            it.add_action(
                Box::new(DuplicateMarkAction {
                    handle: handle.clone(),
                    hash,
                    period,
                }),
                Vec::new(),
                0,
            )?;
        }

        if let Some(cache) = it.message_context().entry(EXT_NAME, DuplicateCache::default) {
            cache.put(handle, last, duplicate);
        }
        it.set_test_result(duplicate);
        Ok(())
    }

    fn dump(&self, d: &mut Dumper<'_, '_>) -> Result<(), DumpError> {
        while let Some(code) = d.reader().read_opt_code()? {
            match code {
                OPT_HANDLE => d.dump_string("handle")?,
                OPT_HEADER => d.dump_string("header")?,
                OPT_UNIQUEID => d.dump_string("uniqueid")?,
                OPT_SECONDS => d.dump_number("seconds")?,
                OPT_LAST => d.write_line(format_args!("last"))?,
                _ => return Err(d.unknown_operand()),
            }
        }
        Ok(())
    }
}

// --- the mark action ---

static DUPLICATE_MARK_DEF: ActionDef = ActionDef {
    name: "duplicate_mark",
    sends_response: false,
    cancels_keep: false,
    internal: true,
    duplicates: DuplicatePolicy::Coalesce,
};

struct DuplicateMarkAction {
    handle: Option<String>,
    hash: [u8; 32],
    period: u64,
}

impl Action for DuplicateMarkAction {
    fn def(&self) -> &'static ActionDef {
        &DUPLICATE_MARK_DEF
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equals(&self, other: &dyn Action) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|o| o.hash == self.hash)
    }

    fn describe(&self) -> String {
        match &self.handle {
            Some(handle) => format!("track duplicate with handle: {handle}"),
            None => "track duplicate".to_owned(),
        }
    }

    fn execute(
        &mut self,
        _aenv: &mut ActionExecEnv<'_>,
        _side_effects: &[Box<dyn SideEffect>],
    ) -> Result<(), ActionError> {
        Ok(())
    }

    fn finish(&mut self, aenv: &mut ActionExecEnv<'_>, status: CommitStatus) {
        if status != CommitStatus::Ok {
            return;
        }
        if let Some(dups) = aenv.env.duplicates {
            let expires = unix_now().saturating_add(self.period);
            dups.mark(&self.hash, aenv.env.username(), expires);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_distinguishes_handle_value_and_last() {
        let base = duplicate_hash(None, "mid-1", false);
        assert_eq!(duplicate_hash(None, "mid-1", false), base);
        assert_ne!(duplicate_hash(Some("h"), "mid-1", false), base);
        assert_ne!(duplicate_hash(None, "mid-2", false), base);
        assert_ne!(duplicate_hash(None, "mid-1", true), base);
    }

    #[test]
    fn cache_keys_on_handle_and_last() {
        let mut cache = DuplicateCache::default();
        cache.put(None, false, true);
        cache.put(Some("h".into()), false, false);
        assert_eq!(cache.get(None, false), Some(true));
        assert_eq!(cache.get(Some("h"), false), Some(false));
        assert_eq!(cache.get(Some("h"), true), None);
        assert_eq!(cache.get(Some("x"), false), None);
    }
}
