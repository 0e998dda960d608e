//! The core test commands, plus the `envelope` extension.

use std::sync::Arc;

use sieve_binary::CoreOp;

use crate::{
    codegen::{Generator, JumpList},
    command::{
        ArgStream, CommandCtx, CommandDef, CommandKind, CommandRegistration, CommandSpec,
        TagActivation, TagDef, ValidatedCommand,
    },
    error::CodegenError,
    extension::Extension,
    validate::{ArgType, Validator},
};

/// Optional-operand code for the comparator object.
pub(crate) const OPT_COMPARATOR: u64 = 1;
/// Optional-operand code for the match-type object.
pub(crate) const OPT_MATCH_TYPE: u64 = 2;
/// Optional-operand code for the address-part object.
pub(crate) const OPT_ADDRESS_PART: u64 = 3;

/// Registers the always-available tests.
pub(crate) fn register_core(valdtr: &mut Validator<'_>) {
    let defs: [Arc<dyn CommandDef>; 9] = [
        Arc::new(AddressTst),
        Arc::new(HeaderTst),
        Arc::new(ExistsTst),
        Arc::new(SizeTst),
        Arc::new(TrueTst),
        Arc::new(FalseTst),
        Arc::new(AnyofTst),
        Arc::new(AllofTst),
        Arc::new(NotTst),
    ];
    for def in defs {
        valdtr.register_command(def);
    }
}

/// Validates and activates the `<list> <key-list>` argument pair the
/// match tests share.
fn validate_match_arguments(
    valdtr: &mut Validator<'_>,
    cmd: &mut CommandCtx,
    first: &'static str,
) -> bool {
    if !valdtr.validate_positional_argument(cmd, 0, first, ArgType::StringList) {
        return false;
    }
    cmd.activate(0);
    if !valdtr.validate_positional_argument(cmd, 1, "key list", ArgType::StringList) {
        return false;
    }
    cmd.activate(1);
    true
}

// --- address ---

struct AddressTst;

impl CommandDef for AddressTst {
    fn spec(&self) -> &CommandSpec {
        static SPEC: CommandSpec = CommandSpec {
            name: "address",
            kind: CommandKind::Test,
            positional: 2,
            subtests: 0,
            block_allowed: false,
            block_required: false,
        };
        &SPEC
    }

    fn registered(&self, valdtr: &mut Validator<'_>, reg: &mut CommandRegistration) {
        // Order-independent optional tags.
        valdtr.link_comparator_tag(reg, OPT_COMPARATOR);
        valdtr.link_match_type_tags(reg, OPT_MATCH_TYPE);
        valdtr.link_address_part_tags(reg, OPT_ADDRESS_PART);
    }

    fn validate(&self, valdtr: &mut Validator<'_>, cmd: &mut CommandCtx) -> bool {
        validate_match_arguments(valdtr, cmd, "header list")
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        gen.binary().emit_core_op(CoreOp::Address);
        gen.generate_arguments(cmd)
    }
}

// --- header ---

struct HeaderTst;

impl CommandDef for HeaderTst {
    fn spec(&self) -> &CommandSpec {
        static SPEC: CommandSpec = CommandSpec {
            name: "header",
            kind: CommandKind::Test,
            positional: 2,
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
        validate_match_arguments(valdtr, cmd, "header list")
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        gen.binary().emit_core_op(CoreOp::Header);
        gen.generate_arguments(cmd)
    }
}

// --- exists ---

struct ExistsTst;

impl CommandDef for ExistsTst {
    fn spec(&self) -> &CommandSpec {
        static SPEC: CommandSpec = CommandSpec {
            name: "exists",
            kind: CommandKind::Test,
            positional: 1,
            subtests: 0,
            block_allowed: false,
            block_required: false,
        };
        &SPEC
    }

    fn validate(&self, valdtr: &mut Validator<'_>, cmd: &mut CommandCtx) -> bool {
        if !valdtr.validate_positional_argument(cmd, 0, "header names", ArgType::StringList) {
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
        gen.binary().emit_core_op(CoreOp::Exists);
        gen.positional_operands(cmd)
    }
}

// --- size ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeKind {
    Over,
    Under,
}

struct SizeTst;

impl CommandDef for SizeTst {
    fn spec(&self) -> &CommandSpec {
        static SPEC: CommandSpec = CommandSpec {
            name: "size",
            kind: CommandKind::Test,
            positional: 1,
            subtests: 0,
            block_allowed: false,
            block_required: false,
        };
        &SPEC
    }

    fn registered(&self, _valdtr: &mut Validator<'_>, reg: &mut CommandRegistration) {
        reg.register_tag(Arc::new(SizeTag { kind: SizeKind::Over }), 0);
        reg.register_tag(Arc::new(SizeTag { kind: SizeKind::Under }), 0);
    }

    fn validate(&self, valdtr: &mut Validator<'_>, cmd: &mut CommandCtx) -> bool {
        if cmd.data::<SizeKind>().is_none() {
            let line = cmd.line;
            valdtr.report_error(
                line,
                format_args!("the size test requires either the :over or the :under tag"),
            );
            return false;
        }
        if !valdtr.validate_positional_argument(cmd, 0, "limit", ArgType::Number) {
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
        let op = match cmd.ctx.data::<SizeKind>() {
            Some(SizeKind::Under) => CoreOp::SizeUnder,
            _ => CoreOp::SizeOver,
        };
        gen.binary().emit_core_op(op);
        gen.positional_operands(cmd)
    }
}

struct SizeTag {
    kind: SizeKind,
}

impl TagDef for SizeTag {
    fn name(&self) -> &'static str {
        match self.kind {
            SizeKind::Over => "over",
            SizeKind::Under => "under",
        }
    }

    fn validate(
        &self,
        valdtr: &mut Validator<'_>,
        cmd: &mut CommandCtx,
        act: &mut TagActivation,
        _args: &mut ArgStream,
    ) -> bool {
        if cmd.data::<SizeKind>().is_some() {
            valdtr.report_error(
                act.line,
                format_args!("the :over and :under tags cannot be combined"),
            );
            return false;
        }
        cmd.set_data(self.kind);
        true
    }
}

// --- true / false ---

struct TrueTst;

impl CommandDef for TrueTst {
    fn spec(&self) -> &CommandSpec {
        static SPEC: CommandSpec = CommandSpec {
            name: "true",
            kind: CommandKind::Test,
            positional: 0,
            subtests: 0,
            block_allowed: false,
            block_required: false,
        };
        &SPEC
    }

    fn validate(&self, _valdtr: &mut Validator<'_>, _cmd: &mut CommandCtx) -> bool {
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        _cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        gen.binary().emit_core_op(CoreOp::True);
        Ok(())
    }
}

struct FalseTst;

impl CommandDef for FalseTst {
    fn spec(&self) -> &CommandSpec {
        static SPEC: CommandSpec = CommandSpec {
            name: "false",
            kind: CommandKind::Test,
            positional: 0,
            subtests: 0,
            block_allowed: false,
            block_required: false,
        };
        &SPEC
    }

    fn validate(&self, _valdtr: &mut Validator<'_>, _cmd: &mut CommandCtx) -> bool {
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        _cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        gen.binary().emit_core_op(CoreOp::False);
        Ok(())
    }
}

// --- anyof / allof / not ---

struct AnyofTst;

impl CommandDef for AnyofTst {
    fn spec(&self) -> &CommandSpec {
        static SPEC: CommandSpec = CommandSpec {
            name: "anyof",
            kind: CommandKind::Test,
            positional: 0,
            subtests: -1,
            block_allowed: false,
            block_required: false,
        };
        &SPEC
    }

    fn validate(&self, _valdtr: &mut Validator<'_>, _cmd: &mut CommandCtx) -> bool {
        true
    }

    /// Short-circuits with `JMPTRUE`: once a subtest leaves the test
    /// register true, the remaining subtests are skipped.
    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        let mut end = JumpList::new();
        for (i, test) in cmd.tests.iter().enumerate() {
            gen.test(test)?;
            if i + 1 < cmd.tests.len() {
                gen.binary().emit_core_op(CoreOp::JmpTrue);
                end.add(gen.reserve_jump());
            }
        }
        end.resolve_here(gen)
    }
}

struct AllofTst;

impl CommandDef for AllofTst {
    fn spec(&self) -> &CommandSpec {
        static SPEC: CommandSpec = CommandSpec {
            name: "allof",
            kind: CommandKind::Test,
            positional: 0,
            subtests: -1,
            block_allowed: false,
            block_required: false,
        };
        &SPEC
    }

    fn validate(&self, _valdtr: &mut Validator<'_>, _cmd: &mut CommandCtx) -> bool {
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        let mut end = JumpList::new();
        for (i, test) in cmd.tests.iter().enumerate() {
            gen.test(test)?;
            if i + 1 < cmd.tests.len() {
                gen.binary().emit_core_op(CoreOp::JmpFalse);
                end.add(gen.reserve_jump());
            }
        }
        end.resolve_here(gen)
    }
}

struct NotTst;

impl CommandDef for NotTst {
    fn spec(&self) -> &CommandSpec {
        static SPEC: CommandSpec = CommandSpec {
            name: "not",
            kind: CommandKind::Test,
            positional: 0,
            subtests: 1,
            block_allowed: false,
            block_required: false,
        };
        &SPEC
    }

    fn validate(&self, _valdtr: &mut Validator<'_>, _cmd: &mut CommandCtx) -> bool {
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        for test in &cmd.tests {
            gen.test(test)?;
        }
        gen.binary().emit_core_op(CoreOp::Not);
        Ok(())
    }
}

// --- the envelope extension ---

/// The `envelope` extension (RFC 5228 §5.4): matches envelope parts
/// against the message's delivery data.
pub struct EnvelopeExt;

impl Extension for EnvelopeExt {
    fn name(&self) -> &'static str {
        "envelope"
    }

    fn validator_load(&self, valdtr: &mut Validator<'_>) {
        valdtr.register_command(Arc::new(EnvelopeTst));
    }
}

struct EnvelopeTst;

impl CommandDef for EnvelopeTst {
    fn spec(&self) -> &CommandSpec {
        static SPEC: CommandSpec = CommandSpec {
            name: "envelope",
            kind: CommandKind::Test,
            positional: 2,
            subtests: 0,
            block_allowed: false,
            block_required: false,
        };
        &SPEC
    }

    fn registered(&self, valdtr: &mut Validator<'_>, reg: &mut CommandRegistration) {
        valdtr.link_comparator_tag(reg, OPT_COMPARATOR);
        valdtr.link_match_type_tags(reg, OPT_MATCH_TYPE);
        valdtr.link_address_part_tags(reg, OPT_ADDRESS_PART);
    }

    fn validate(&self, valdtr: &mut Validator<'_>, cmd: &mut CommandCtx) -> bool {
        if !validate_match_arguments(valdtr, cmd, "envelope parts") {
            return false;
        }
        // Parts other than from/to/auth never match anything; say so.
        if let Some(parts) = cmd.string_list_arg(0) {
            let unknown: Vec<String> = parts
                .iter()
                .filter(|p| !matches!(p.to_ascii_lowercase().as_str(), "from" | "to" | "auth"))
                .cloned()
                .collect();
            let line = cmd.line;
            for part in unknown {
                valdtr.report_warning(
                    line,
                    format_args!("unknown envelope part `{part}` never matches"),
                );
            }
        }
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        gen.binary().emit_core_op(CoreOp::Envelope);
        gen.generate_arguments(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_tag_names() {
        assert_eq!(SizeTag { kind: SizeKind::Over }.name(), "over");
        assert_eq!(SizeTag { kind: SizeKind::Under }.name(), "under");
    }
}
