//! The core action and control commands, plus the `fileinto` extension.

use std::sync::Arc;

use buggy::bug;
use sieve_binary::{CoreOp, JumpSlot};

use crate::{
    address::parse_addresses,
    codegen::{Generator, JumpList},
    command::{CommandCtx, CommandDef, CommandKind, CommandSpec, ValidatedCommand},
    error::CodegenError,
    extension::Extension,
    validate::{ArgType, Validator},
};

/// Registers the always-available commands.
pub(crate) fn register_core(valdtr: &mut Validator<'_>) {
    let defs: [Arc<dyn CommandDef>; 8] = [
        Arc::new(IfCmd),
        Arc::new(ElsifCmd),
        Arc::new(ElseCmd),
        Arc::new(RequireCmd),
        Arc::new(StopCmd),
        Arc::new(KeepCmd),
        Arc::new(DiscardCmd),
        Arc::new(RedirectCmd),
    ];
    for def in defs {
        valdtr.register_command(def);
    }
}

// --- control structures ---

struct IfCmd;

static IF_SPEC: CommandSpec = CommandSpec {
    name: "if",
    kind: CommandKind::Command,
    positional: 0,
    subtests: 1,
    block_allowed: true,
    block_required: true,
};

impl CommandDef for IfCmd {
    fn spec(&self) -> &CommandSpec {
        &IF_SPEC
    }

    fn validate(&self, _valdtr: &mut Validator<'_>, _cmd: &mut CommandCtx) -> bool {
        true
    }

    /// Generates the whole `if`/`elsif`/`else` chain: each conditional
    /// branch compiles to its test followed by `JMPFALSE` to the next
    /// branch, and every non-final branch ends with a `JMP` collected
    /// on a jump list that resolves past the chain.
    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        let branches: Vec<&ValidatedCommand> =
            std::iter::once(cmd).chain(cmd.else_branches.iter()).collect();
        let mut chain_end = JumpList::new();
        let mut pending: Option<JumpSlot> = None;

        for (i, branch) in branches.iter().enumerate() {
            if let Some(slot) = pending.take() {
                gen.patch_jump_here(slot)?;
            }
            if branch.ctx.name != "else" {
                let Some(test) = branch.tests.first() else {
                    bug!("conditional branch without a subtest");
                };
                gen.test(test)?;
                gen.binary().emit_core_op(CoreOp::JmpFalse);
                pending = Some(gen.reserve_jump());
            }
            gen.command_block(&branch.block)?;
            if i + 1 < branches.len() {
                gen.binary().emit_core_op(CoreOp::Jmp);
                chain_end.add(gen.reserve_jump());
            }
        }
        if let Some(slot) = pending.take() {
            gen.patch_jump_here(slot)?;
        }
        chain_end.resolve_here(gen)
    }
}

struct ElsifCmd;

static ELSIF_SPEC: CommandSpec = CommandSpec {
    name: "elsif",
    kind: CommandKind::Command,
    positional: 0,
    subtests: 1,
    block_allowed: true,
    block_required: true,
};

impl CommandDef for ElsifCmd {
    fn spec(&self) -> &CommandSpec {
        &ELSIF_SPEC
    }

    fn validate(&self, _valdtr: &mut Validator<'_>, _cmd: &mut CommandCtx) -> bool {
        true
    }

    fn generate(
        &self,
        _gen: &mut Generator<'_>,
        _cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        // Chained branches are generated by the owning `if`.
        bug!("elsif generated outside an if chain");
    }
}

struct ElseCmd;

static ELSE_SPEC: CommandSpec = CommandSpec {
    name: "else",
    kind: CommandKind::Command,
    positional: 0,
    subtests: 0,
    block_allowed: true,
    block_required: true,
};

impl CommandDef for ElseCmd {
    fn spec(&self) -> &CommandSpec {
        &ELSE_SPEC
    }

    fn validate(&self, _valdtr: &mut Validator<'_>, _cmd: &mut CommandCtx) -> bool {
        true
    }

    fn generate(
        &self,
        _gen: &mut Generator<'_>,
        _cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        bug!("else generated outside an if chain");
    }
}

struct RequireCmd;

static REQUIRE_SPEC: CommandSpec = CommandSpec {
    name: "require",
    kind: CommandKind::Command,
    positional: 1,
    subtests: 0,
    block_allowed: false,
    block_required: false,
};

impl CommandDef for RequireCmd {
    fn spec(&self) -> &CommandSpec {
        &REQUIRE_SPEC
    }

    fn validate(&self, valdtr: &mut Validator<'_>, cmd: &mut CommandCtx) -> bool {
        if !valdtr.validate_positional_argument(cmd, 0, "capabilities", ArgType::StringList) {
            return false;
        }
        let line = cmd.line;
        let names = cmd
            .string_list_arg(0)
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        let mut ok = true;
        for name in &names {
            if !valdtr.extension_load(line, name) {
                ok = false;
            }
        }
        ok
    }

    fn generate(
        &self,
        _gen: &mut Generator<'_>,
        _cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        // Requirements live in the binary's extension index, not in
        // code.
        Ok(())
    }
}

struct StopCmd;

static STOP_SPEC: CommandSpec = CommandSpec {
    name: "stop",
    kind: CommandKind::Command,
    positional: 0,
    subtests: 0,
    block_allowed: false,
    block_required: false,
};

impl CommandDef for StopCmd {
    fn spec(&self) -> &CommandSpec {
        &STOP_SPEC
    }

    fn validate(&self, _valdtr: &mut Validator<'_>, _cmd: &mut CommandCtx) -> bool {
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        _cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        gen.binary().emit_core_op(CoreOp::Stop);
        Ok(())
    }
}

// --- action commands ---

struct KeepCmd;

static KEEP_SPEC: CommandSpec = CommandSpec {
    name: "keep",
    kind: CommandKind::Command,
    positional: 0,
    subtests: 0,
    block_allowed: false,
    block_required: false,
};

impl CommandDef for KeepCmd {
    fn spec(&self) -> &CommandSpec {
        &KEEP_SPEC
    }

    fn validate(&self, _valdtr: &mut Validator<'_>, _cmd: &mut CommandCtx) -> bool {
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        gen.emit_action_op(CoreOp::Keep, cmd);
        gen.generate_arguments(cmd)
    }
}

struct DiscardCmd;

static DISCARD_SPEC: CommandSpec = CommandSpec {
    name: "discard",
    kind: CommandKind::Command,
    positional: 0,
    subtests: 0,
    block_allowed: false,
    block_required: false,
};

impl CommandDef for DiscardCmd {
    fn spec(&self) -> &CommandSpec {
        &DISCARD_SPEC
    }

    fn validate(&self, _valdtr: &mut Validator<'_>, _cmd: &mut CommandCtx) -> bool {
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        gen.emit_action_op(CoreOp::Discard, cmd);
        Ok(())
    }
}

struct RedirectCmd;

static REDIRECT_SPEC: CommandSpec = CommandSpec {
    name: "redirect",
    kind: CommandKind::Command,
    positional: 1,
    subtests: 0,
    block_allowed: false,
    block_required: false,
};

impl CommandDef for RedirectCmd {
    fn spec(&self) -> &CommandSpec {
        &REDIRECT_SPEC
    }

    fn validate(&self, valdtr: &mut Validator<'_>, cmd: &mut CommandCtx) -> bool {
        if !valdtr.validate_positional_argument(cmd, 0, "address", ArgType::String) {
            return false;
        }
        cmd.activate(0);
        // A literal address can be rejected at compile time.
        if let Some(address) = cmd.string_arg(0) {
            if parse_addresses(address).is_empty() {
                let (line, address) = (cmd.line, address.to_owned());
                valdtr.report_error(
                    line,
                    format_args!("specified redirect address `{address}` is invalid"),
                );
                return false;
            }
        }
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        gen.emit_action_op(CoreOp::Redirect, cmd);
        gen.positional_operands(cmd)
    }
}

// --- the fileinto extension ---

/// The `fileinto` extension (RFC 5228 §4.1): gated behind `require`
/// even though its operation is a core opcode.
pub struct FileintoExt;

impl Extension for FileintoExt {
    fn name(&self) -> &'static str {
        "fileinto"
    }

    fn validator_load(&self, valdtr: &mut Validator<'_>) {
        valdtr.register_command(Arc::new(FileintoCmd));
    }
}

struct FileintoCmd;

static FILEINTO_SPEC: CommandSpec = CommandSpec {
    name: "fileinto",
    kind: CommandKind::Command,
    positional: 1,
    subtests: 0,
    block_allowed: false,
    block_required: false,
};

impl CommandDef for FileintoCmd {
    fn spec(&self) -> &CommandSpec {
        &FILEINTO_SPEC
    }

    fn validate(&self, valdtr: &mut Validator<'_>, cmd: &mut CommandCtx) -> bool {
        if !valdtr.validate_positional_argument(cmd, 0, "mailbox", ArgType::String) {
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
        gen.emit_action_op(CoreOp::Fileinto, cmd);
        gen.generate_arguments(cmd)
    }
}
