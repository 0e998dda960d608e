//! The `imap4flags` extension (RFC 5232): an internal flag set
//! manipulated by `setflag`/`addflag`/`removeflag`, tested by
//! `hasflag`, and attached to deliveries as a side effect.

use std::{any::Any, sync::Arc};

use crate::{
    action::{SideEffect, OPT_SIDE_EFFECTS},
    codegen::Generator,
    command::{
        ArgStream, CommandCtx, CommandDef, CommandKind, CommandRegistration, CommandSpec,
        TagActivation, TagDef, ValidatedCommand,
    },
    dump::{DumpError, Dumper},
    error::{CodegenError, ExecError},
    extension::Extension,
    interp::{Interpreter, Operation},
    match_type::MatchContext,
    tsts::{OPT_COMPARATOR, OPT_MATCH_TYPE},
    validate::{ArgType, Validator},
};

pub(crate) const EXT_NAME: &str = "imap4flags";

const OP_SETFLAG: u32 = 0;
const OP_ADDFLAG: u32 = 1;
const OP_REMOVEFLAG: u32 = 2;
const OP_HASFLAG: u32 = 3;

/// Side-effect code of the flags side effect.
const SE_FLAGS: u32 = 0;

const SYSTEM_FLAGS: [&str; 5] = ["\\Seen", "\\Answered", "\\Flagged", "\\Deleted", "\\Draft"];

/// The `imap4flags` extension object.
pub struct ImapFlagsExt;

impl Extension for ImapFlagsExt {
    fn name(&self) -> &'static str {
        EXT_NAME
    }

    fn validator_load(&self, valdtr: &mut Validator<'_>) {
        valdtr.register_command(Arc::new(FlagCmd {
            spec: flag_cmd_spec("setflag"),
            op: OP_SETFLAG,
        }));
        valdtr.register_command(Arc::new(FlagCmd {
            spec: flag_cmd_spec("addflag"),
            op: OP_ADDFLAG,
        }));
        valdtr.register_command(Arc::new(FlagCmd {
            spec: flag_cmd_spec("removeflag"),
            op: OP_REMOVEFLAG,
        }));
        valdtr.register_command(Arc::new(HasFlagTst));

        // Decorate the delivery commands with an explicit `:flags` tag.
        valdtr.register_tag("keep", Arc::new(FlagsTag), OPT_SIDE_EFFECTS);
        valdtr.register_tag("fileinto", Arc::new(FlagsTag), OPT_SIDE_EFFECTS);
    }

    fn runtime_load(&self) -> Option<Box<dyn Any + Send>> {
        Some(Box::new(FlagsContext::default()))
    }

    fn operation(&self, code: u32) -> Option<&dyn Operation> {
        match code {
            OP_SETFLAG => Some(&SetFlagOp),
            OP_ADDFLAG => Some(&AddFlagOp),
            OP_REMOVEFLAG => Some(&RemoveFlagOp),
            OP_HASFLAG => Some(&HasFlagOp),
            _ => None,
        }
    }

    fn read_side_effect(
        &self,
        code: u32,
        it: &mut Interpreter<'_>,
    ) -> Result<Option<Box<dyn SideEffect>>, ExecError> {
        if code != SE_FLAGS {
            return Ok(None);
        }
        let items = it.reader().read_string_list_operand()?;
        let mut flags = parse_flag_list(&items);
        if flags.is_empty() {
            // An empty explicit list falls back to the internal set.
            if let Some(ctx) = it.extension_context_ref::<FlagsContext>(EXT_NAME) {
                flags = ctx.flags.clone();
            }
        }
        Ok(Some(Box::new(FlagsSideEffect { flags })))
    }

    fn dump_side_effect(&self, code: u32, d: &mut Dumper<'_, '_>) -> Result<bool, DumpError> {
        if code != SE_FLAGS {
            return Ok(false);
        }
        d.dump_string_list("flags")?;
        Ok(true)
    }

    fn delivery_side_effect(&self, it: &Interpreter<'_>) -> Option<Box<dyn SideEffect>> {
        let ctx = it.extension_context_ref::<FlagsContext>(EXT_NAME)?;
        if ctx.flags.is_empty() {
            return None;
        }
        Some(Box::new(FlagsSideEffect {
            flags: ctx.flags.clone(),
        }))
    }
}

/// Per-interpreter flag set.
#[derive(Debug, Default)]
struct FlagsContext {
    flags: Vec<String>,
}

/// IMAP flags attached to a delivery.
#[derive(Debug)]
pub struct FlagsSideEffect {
    pub flags: Vec<String>,
}

impl SideEffect for FlagsSideEffect {
    fn name(&self) -> &'static str {
        "flags"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        format!("add IMAP flags: {}", self.flags.join(" "))
    }

    fn merge(&mut self, other: Box<dyn SideEffect>) {
        if let Some(other) = other.as_any().downcast_ref::<Self>() {
            for flag in &other.flags {
                add_flag(&mut self.flags, flag);
            }
        }
    }

    fn flags(&self) -> Option<&[String]> {
        Some(&self.flags)
    }
}

/// Splits flag-list strings into individual flags, dropping duplicates
/// (IMAP flags are case-insensitive).
fn parse_flag_list(items: &[String]) -> Vec<String> {
    let mut flags = Vec::new();
    for item in items {
        for flag in item.split_ascii_whitespace() {
            add_flag(&mut flags, flag);
        }
    }
    flags
}

fn add_flag(flags: &mut Vec<String>, flag: &str) {
    if !flags.iter().any(|f| f.eq_ignore_ascii_case(flag)) {
        flags.push(flag.to_owned());
    }
}

fn remove_flag(flags: &mut Vec<String>, flag: &str) {
    flags.retain(|f| !f.eq_ignore_ascii_case(flag));
}

/// A system flag must be one of the five RFC 3501 flags a client may
/// store; keywords must be plain atoms.
fn flag_is_valid(flag: &str) -> bool {
    if flag.starts_with('\\') {
        SYSTEM_FLAGS.iter().any(|s| s.eq_ignore_ascii_case(flag))
    } else {
        flag.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '$'))
    }
}

fn checked_flags(it: &mut Interpreter<'_>, items: &[String]) -> Vec<String> {
    let mut flags = parse_flag_list(items);
    flags.retain(|flag| {
        if flag_is_valid(flag) {
            true
        } else {
            it.runtime_warning(None, format_args!("ignored invalid IMAP flag `{flag}`"));
            false
        }
    });
    flags
}

// --- commands ---

fn flag_cmd_spec(name: &'static str) -> CommandSpec {
    CommandSpec {
        name,
        kind: CommandKind::Command,
        positional: 1,
        subtests: 0,
        block_allowed: false,
        block_required: false,
    }
}

/// `setflag`, `addflag`, and `removeflag` share a shape: one flag-list
/// argument and one operation.
struct FlagCmd {
    spec: CommandSpec,
    op: u32,
}

impl CommandDef for FlagCmd {
    fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    fn validate(&self, valdtr: &mut Validator<'_>, cmd: &mut CommandCtx) -> bool {
        if !valdtr.validate_positional_argument(cmd, 0, "flag list", ArgType::StringList) {
            return false;
        }
        cmd.activate(0);
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        gen.emit_ext_op(EXT_NAME, self.op)?;
        gen.positional_operands(cmd)
    }
}

struct HasFlagTst;

impl CommandDef for HasFlagTst {
    fn spec(&self) -> &CommandSpec {
        static SPEC: CommandSpec = CommandSpec {
            name: "hasflag",
            kind: CommandKind::Test,
            positional: 1,
            subtests: 0,
            block_allowed: false,
            block_required: false,
        };
        &SPEC
    }

    fn registered(&self, valdtr: &mut Validator<'_>, reg: &mut CommandRegistration) {
        valdtr.link_comparator_tag(reg, OPT_COMPARATOR);
        valdtr.link_match_type_tags(reg, OPT_MATCH_TYPE);
    }

    fn validate(&self, valdtr: &mut Validator<'_>, cmd: &mut CommandCtx) -> bool {
        if !valdtr.validate_positional_argument(cmd, 0, "flag list", ArgType::StringList) {
            return false;
        }
        cmd.activate(0);
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        gen.emit_ext_op(EXT_NAME, OP_HASFLAG)?;
        gen.generate_arguments(cmd)
    }
}

/// The `:flags <list>` tag on `keep`/`fileinto`, emitted as a flags
/// side effect in the command's optional block.
struct FlagsTag;

impl TagDef for FlagsTag {
    fn name(&self) -> &'static str {
        "flags"
    }

    fn validate(
        &self,
        valdtr: &mut Validator<'_>,
        cmd: &mut CommandCtx,
        act: &mut TagActivation,
        args: &mut ArgStream,
    ) -> bool {
        match valdtr.validate_tag_parameter(cmd, act, args, ArgType::StringList) {
            Some(value) => {
                act.payload = Some(value);
                true
            }
            None => false,
        }
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        _cmd: &ValidatedCommand,
        act: &TagActivation,
    ) -> Result<(), CodegenError> {
        use buggy::bug;
        let Some(sieve_ast::ArgValue::StringList(items)) = &act.payload else {
            bug!(":flags tag without validated payload");
        };
        let Some(idx) = gen.binary().extension_index(EXT_NAME) else {
            return Err(CodegenError::ObjectNotRegistered(EXT_NAME.to_owned()));
        };
        let binary = gen.binary();
        // A side-effect list of one: the flags side effect.
        binary.emit_packed(1);
        binary.emit_object_operand(
            sieve_binary::OperandClass::SideEffect,
            u32::from(idx) + 1,
            SE_FLAGS,
        );
        binary.emit_string_list_operand(items);
        Ok(())
    }
}

// --- operations ---

struct SetFlagOp;

impl Operation for SetFlagOp {
    fn name(&self) -> &'static str {
        "SETFLAG"
    }

    fn execute(&self, it: &mut Interpreter<'_>) -> Result<(), ExecError> {
        let pc = it.reader().position();
        let items = it.reader().read_string_list_operand()?;
        let flags = checked_flags(it, &items);
        let Some(ctx) = it.extension_context::<FlagsContext>(EXT_NAME) else {
            return Err(it.corrupt(pc, "imap4flags context missing"));
        };
        ctx.flags = flags;
        Ok(())
    }

    fn dump(&self, d: &mut Dumper<'_, '_>) -> Result<(), DumpError> {
        d.dump_string_list("flags")
    }
}

struct AddFlagOp;

impl Operation for AddFlagOp {
    fn name(&self) -> &'static str {
        "ADDFLAG"
    }

    fn execute(&self, it: &mut Interpreter<'_>) -> Result<(), ExecError> {
        let pc = it.reader().position();
        let items = it.reader().read_string_list_operand()?;
        let flags = checked_flags(it, &items);
        let Some(ctx) = it.extension_context::<FlagsContext>(EXT_NAME) else {
            return Err(it.corrupt(pc, "imap4flags context missing"));
        };
        for flag in &flags {
            add_flag(&mut ctx.flags, flag);
        }
        Ok(())
    }

    fn dump(&self, d: &mut Dumper<'_, '_>) -> Result<(), DumpError> {
        d.dump_string_list("flags")
    }
}

struct RemoveFlagOp;

impl Operation for RemoveFlagOp {
    fn name(&self) -> &'static str {
        "REMOVEFLAG"
    }

    fn execute(&self, it: &mut Interpreter<'_>) -> Result<(), ExecError> {
        let pc = it.reader().position();
        let items = it.reader().read_string_list_operand()?;
        let flags = checked_flags(it, &items);
        let Some(ctx) = it.extension_context::<FlagsContext>(EXT_NAME) else {
            return Err(it.corrupt(pc, "imap4flags context missing"));
        };
        for flag in &flags {
            remove_flag(&mut ctx.flags, flag);
        }
        Ok(())
    }

    fn dump(&self, d: &mut Dumper<'_, '_>) -> Result<(), DumpError> {
        d.dump_string_list("flags")
    }
}

struct HasFlagOp;

impl Operation for HasFlagOp {
    fn name(&self) -> &'static str {
        "HASFLAG"
    }

    fn execute(&self, it: &mut Interpreter<'_>) -> Result<(), ExecError> {
        let pc = it.reader().position();
        let (cmp, mtch, _) = it.read_match_optionals(pc, false)?;
        let items = it.reader().read_string_list_operand()?;
        let keys = parse_flag_list(&items);

        let current = it
            .extension_context_ref::<FlagsContext>(EXT_NAME)
            .map(|ctx| ctx.flags.clone())
            .unwrap_or_default();

        let mut mctx = MatchContext::begin(mtch.as_ref(), cmp.as_ref(), &keys);
        let mut matched = false;
        for flag in &current {
            if mctx.value(flag) {
                matched = true;
                break;
            }
        }
        let matched = matched || mctx.finish();
        it.set_test_result(matched);
        Ok(())
    }

    fn dump(&self, d: &mut Dumper<'_, '_>) -> Result<(), DumpError> {
        d.dump_match_optionals(false)?;
        d.dump_string_list("flags")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_lists_split_and_dedupe() {
        let flags = parse_flag_list(&["\\Seen \\Answered".into(), "\\seen".into()]);
        assert_eq!(flags, ["\\Seen", "\\Answered"]);
    }

    #[test]
    fn flag_validity() {
        assert!(flag_is_valid("\\Seen"));
        assert!(flag_is_valid("\\answered"));
        assert!(!flag_is_valid("\\Recent"));
        assert!(flag_is_valid("$Junk"));
        assert!(flag_is_valid("custom-keyword"));
        assert!(!flag_is_valid("bad flag(x)"));
    }

    #[test]
    fn side_effect_merge() {
        let mut a = FlagsSideEffect {
            flags: vec!["\\Seen".into()],
        };
        a.merge(Box::new(FlagsSideEffect {
            flags: vec!["\\seen".into(), "\\Flagged".into()],
        }));
        assert_eq!(a.flags, ["\\Seen", "\\Flagged"]);
    }
}
