//! Code generation: serializing a validated script into a binary.

use buggy::bug;
use sieve_ast::ArgValue;
use sieve_binary::{Binary, CoreOp, JumpSlot, OperandClass};

use crate::{
    command::{SelectedObject, TagActivation, ValidatedCommand, ValidatedScript},
    error::CodegenError,
};

/// Generates a binary from a validated script.
pub fn generate(script: &ValidatedScript) -> Result<Binary, CodegenError> {
    let mut binary = Binary::new();
    for ext in &script.extensions {
        binary.link_extension(ext)?;
    }
    let mut gen = Generator {
        binary: &mut binary,
        unresolved: 0,
    };
    gen.command_block(&script.commands)?;
    if gen.unresolved != 0 {
        return Err(CodegenError::InternalJumpUnresolved);
    }
    Ok(binary)
}

/// Emission state threaded through the command generate hooks.
pub struct Generator<'a> {
    binary: &'a mut Binary,
    /// Reserved jump slots not yet patched.
    unresolved: usize,
}

impl Generator<'_> {
    /// The binary being written.
    pub fn binary(&mut self) -> &mut Binary {
        self.binary
    }

    /// The next opcode's address.
    pub fn position(&self) -> usize {
        self.binary.position()
    }

    /// Generates a sequence of commands.
    pub fn command_block(&mut self, cmds: &[ValidatedCommand]) -> Result<(), CodegenError> {
        for cmd in cmds {
            cmd.def.generate(self, cmd)?;
        }
        Ok(())
    }

    /// Generates one test expression; afterwards the test register
    /// holds its outcome.
    pub fn test(&mut self, test: &ValidatedCommand) -> Result<(), CodegenError> {
        test.def.generate(self, test)
    }

    /// Reserves a jump offset slot.
    pub fn reserve_jump(&mut self) -> JumpSlot {
        self.unresolved += 1;
        self.binary.reserve_jump()
    }

    /// Patches a reserved slot to jump to `target`.
    pub fn patch_jump(&mut self, slot: JumpSlot, target: usize) -> Result<(), CodegenError> {
        self.unresolved -= 1;
        self.binary.patch_jump(slot, target)?;
        Ok(())
    }

    /// Patches a reserved slot to the current position.
    pub fn patch_jump_here(&mut self, slot: JumpSlot) -> Result<(), CodegenError> {
        let target = self.binary.position();
        self.patch_jump(slot, target)
    }

    /// Emits an extension operation by owner name.
    pub fn emit_ext_op(&mut self, extension: &str, code: u32) -> Result<(), CodegenError> {
        let Some(idx) = self.binary.extension_index(extension) else {
            return Err(CodegenError::ObjectNotRegistered(extension.to_owned()));
        };
        self.binary.emit_ext_op(idx, code);
        Ok(())
    }

    /// Emits an activation's selected object as an object operand.
    pub fn emit_selected_object(&mut self, act: &TagActivation) -> Result<(), CodegenError> {
        let (class, owner, code) = match &act.object {
            Some(SelectedObject::Comparator(c)) => (OperandClass::Comparator, c.owner(), c.code()),
            Some(SelectedObject::MatchType(m)) => (OperandClass::MatchType, m.owner(), m.code()),
            Some(SelectedObject::AddressPart(a)) => {
                (OperandClass::AddressPart, a.owner(), a.code())
            }
            None => bug!("tag activation has no selected object"),
        };
        let owner_tag = match owner {
            None => 0,
            Some(name) => {
                let idx = self
                    .binary
                    .extension_index(name)
                    .ok_or_else(|| CodegenError::ObjectNotRegistered(name.to_owned()))?;
                u32::from(idx) + 1
            }
        };
        self.binary.emit_object_operand(class, owner_tag, code);
        Ok(())
    }

    /// Emits the optional-operand block: every activation with a
    /// non-zero opt code, in activation order, then the terminator.
    pub fn optional_operands(&mut self, cmd: &ValidatedCommand) -> Result<(), CodegenError> {
        for act in &cmd.ctx.activations {
            if act.opt_code == 0 {
                continue;
            }
            self.binary.emit_opt_code(act.opt_code);
            act.tag.generate(self, cmd, act)?;
        }
        self.binary.emit_opt_end();
        Ok(())
    }

    /// Emits the activated positional arguments, in activation order.
    pub fn positional_operands(&mut self, cmd: &ValidatedCommand) -> Result<(), CodegenError> {
        for &index in &cmd.ctx.activated {
            let Some(arg) = cmd.ctx.positional.get(index) else {
                bug!("activated argument index out of range");
            };
            match &arg.value {
                ArgValue::String(s) => self.binary.emit_string_operand(s),
                ArgValue::Number(n) => self.binary.emit_number_operand(*n),
                ArgValue::StringList(items) => self.binary.emit_string_list_operand(items),
                ArgValue::Tag(_) => bug!("tag argument was activated as positional"),
            }
        }
        Ok(())
    }

    /// Emits the standard argument section: the optional block, then
    /// the activated positionals.
    pub fn generate_arguments(&mut self, cmd: &ValidatedCommand) -> Result<(), CodegenError> {
        self.optional_operands(cmd)?;
        self.positional_operands(cmd)
    }

    /// Emits a core operation followed by the source line operand that
    /// action operations carry for runtime error reporting.
    pub fn emit_action_op(&mut self, op: CoreOp, cmd: &ValidatedCommand) {
        self.binary.emit_core_op(op);
        self.binary.emit_packed(u64::from(cmd.ctx.line));
    }
}

/// A set of forward jumps that all land on one target.
#[derive(Default)]
#[must_use = "a jump list must be resolved"]
pub struct JumpList {
    slots: Vec<JumpSlot>,
}

impl JumpList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reserved slot to the list.
    pub fn add(&mut self, slot: JumpSlot) {
        self.slots.push(slot);
    }

    /// Patches every slot to the current position.
    pub fn resolve_here(self, gen: &mut Generator<'_>) -> Result<(), CodegenError> {
        let target = gen.position();
        for slot in self.slots {
            gen.patch_jump(slot, target)?;
        }
        Ok(())
    }
}
