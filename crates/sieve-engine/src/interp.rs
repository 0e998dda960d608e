//! The bytecode interpreter.
//!
//! Execution is strictly sequential over the code bytes; there is no
//! call stack (Sieve has no user procedures). Core opcodes dispatch
//! through one match; extension opcodes resolve through the binary's
//! extension index to the owning extension's [`Operation`] objects.

use std::{any::Any, sync::Arc};

use sieve_binary::{Binary, BinaryReader, CoreOp, Opcode, OperandClass};

use crate::{
    action::{
        Action, DiscardAction, FileintoAction, KeepAction, RedirectAction, SideEffect,
        OPT_SIDE_EFFECTS,
    },
    address::parse_addresses,
    address_part::{AddressPart, AllPart, DomainPart, LocalPart, AP_ALL, AP_DOMAIN, AP_LOCALPART},
    comparator::{AsciiCasemapComparator, Comparator, OctetComparator, CMP_ASCII_CASEMAP, CMP_OCTET},
    dump::{DumpError, Dumper},
    ehandler::ErrorHandler,
    error::ExecError,
    extension::{Extension, ExtensionRegistry},
    match_type::{ContainsMatch, IsMatch, MatchContext, MatchType, MatchesMatch, MT_CONTAINS, MT_IS, MT_MATCHES},
    result::ScriptResult,
    runtime::{MessageContext, MessageData, ScriptEnv},
    tsts::{OPT_ADDRESS_PART, OPT_COMPARATOR, OPT_MATCH_TYPE},
};

/// One extension-contributed VM instruction.
pub trait Operation: Send + Sync {
    /// The mnemonic, as shown by the disassembler.
    fn name(&self) -> &'static str;

    /// Executes the operation. The interpreter's reader is positioned
    /// at the operation's first operand.
    fn execute(&self, it: &mut Interpreter<'_>) -> Result<(), ExecError>;

    /// Disassembles the operation's operands.
    fn dump(&self, d: &mut Dumper<'_, '_>) -> Result<(), DumpError>;
}

/// The runtime state of one script run.
pub struct Interpreter<'r> {
    exts: Vec<Arc<dyn Extension>>,
    ext_contexts: Vec<Option<Box<dyn Any + Send>>>,
    reader: BinaryReader<'r>,
    test: bool,
    stopped: bool,
    msgdata: &'r MessageData<'r>,
    env: &'r ScriptEnv<'r>,
    msgctx: &'r mut MessageContext,
    ehandler: &'r mut dyn ErrorHandler,
    result: ScriptResult,
}

impl<'r> Interpreter<'r> {
    /// Creates an interpreter for a binary, resolving its extension
    /// index against the registry. Fails with
    /// [`ExecError::UnknownExtension`], before executing anything,
    /// when the binary names an extension the registry lacks.
    pub fn new(
        binary: &'r Binary,
        registry: &ExtensionRegistry,
        msgdata: &'r MessageData<'r>,
        env: &'r ScriptEnv<'r>,
        msgctx: &'r mut MessageContext,
        ehandler: &'r mut dyn ErrorHandler,
    ) -> Result<Self, ExecError> {
        let mut exts = Vec::with_capacity(binary.extensions().len());
        for name in binary.extensions() {
            let ext = registry
                .get(name)
                .ok_or_else(|| ExecError::UnknownExtension(name.clone()))?;
            exts.push(ext);
        }
        let ext_contexts = exts.iter().map(|e| e.runtime_load()).collect();
        Ok(Self {
            exts,
            ext_contexts,
            reader: binary.reader(0),
            test: false,
            stopped: false,
            msgdata,
            env,
            msgctx,
            ehandler,
            result: ScriptResult::new(),
        })
    }

    // --- state the operations work with ---

    /// The test-result register.
    pub fn test_result(&self) -> bool {
        self.test
    }

    /// Sets the test-result register.
    pub fn set_test_result(&mut self, value: bool) {
        self.test = value;
    }

    /// The operand reader, positioned at the current operation's next
    /// operand.
    pub fn reader(&mut self) -> &mut BinaryReader<'r> {
        &mut self.reader
    }

    /// The message under delivery.
    pub fn message(&self) -> &MessageData<'r> {
        self.msgdata
    }

    /// The host capabilities for this run.
    pub fn script_env(&self) -> &ScriptEnv<'r> {
        self.env
    }

    /// The per-message context shared across chained script runs.
    pub fn message_context(&mut self) -> &mut MessageContext {
        self.msgctx
    }

    /// The named extension's per-interpreter context.
    pub fn extension_context<T: Any + Send>(&mut self, extension: &str) -> Option<&mut T> {
        let idx = self
            .exts
            .iter()
            .position(|e| e.name() == extension)?;
        self.ext_contexts[idx].as_mut()?.downcast_mut()
    }

    /// Read-only access to the named extension's context.
    pub fn extension_context_ref<T: Any + Send>(&self, extension: &str) -> Option<&T> {
        let idx = self
            .exts
            .iter()
            .position(|e| e.name() == extension)?;
        self.ext_contexts[idx].as_ref()?.downcast_ref()
    }

    /// Plans an action onto the result.
    pub fn add_action(
        &mut self,
        action: Box<dyn Action>,
        side_effects: Vec<Box<dyn SideEffect>>,
        line: u32,
    ) -> Result<(), ExecError> {
        self.result
            .add_action(action, side_effects, line, self.ehandler)
    }

    /// Reports a runtime error at a source line captured at generation
    /// time. The run aborts with the returned error.
    pub fn runtime_error(&mut self, line: u32, message: std::fmt::Arguments<'_>) -> ExecError {
        self.ehandler.error(Some(line), message);
        ExecError::Runtime(message.to_string())
    }

    /// Reports a runtime warning.
    pub fn runtime_warning(&mut self, line: Option<u32>, message: std::fmt::Arguments<'_>) {
        self.ehandler.warning(line, message);
    }

    /// Flags a semantically corrupt binary at the given opcode address.
    pub fn corrupt(&self, pc: usize, what: &str) -> ExecError {
        ExecError::Corrupt {
            pc,
            what: what.to_owned(),
        }
    }

    /// Side effects the loaded extensions attach to delivery actions
    /// (e.g. the imap4flags internal flag set).
    pub fn delivery_side_effects(&self) -> Vec<Box<dyn SideEffect>> {
        self.exts
            .iter()
            .filter_map(|e| e.delivery_side_effect(self))
            .collect()
    }

    /// Consumes the interpreter, handing the accumulated result to the
    /// commit phase.
    pub fn into_result(self) -> ScriptResult {
        self.result
    }

    // --- the main loop ---

    /// Runs the program to completion. On success the result holds the
    /// planned actions and the implicit-keep side effects.
    pub fn run(&mut self) -> Result<(), ExecError> {
        while !self.reader.at_end() && !self.stopped {
            if self.env.aborted() {
                return Err(ExecError::Aborted);
            }
            let pc = self.reader.position();
            match self.reader.read_opcode()? {
                Opcode::Core(op) => {
                    tracing::trace!(pc, op = op.name(), "exec");
                    self.exec_core(op, pc)?;
                }
                Opcode::Ext { ext, code } => {
                    let extension = self
                        .exts
                        .get(usize::from(ext))
                        .cloned()
                        .ok_or_else(|| self.corrupt(pc, "opcode addresses unlinked extension"))?;
                    let Some(op) = extension.operation(code) else {
                        return Err(self.corrupt(pc, "unknown extension operation"));
                    };
                    tracing::trace!(pc, op = op.name(), ext = extension.name(), "exec");
                    op.execute(self)?;
                }
            }
        }
        let side_effects = self.delivery_side_effects();
        self.result.add_implicit_keep(side_effects);
        Ok(())
    }

    fn exec_core(&mut self, op: CoreOp, pc: usize) -> Result<(), ExecError> {
        match op {
            CoreOp::Jmp => {
                let offset = self.reader.read_offset()?;
                self.branch(pc, offset)?;
            }
            CoreOp::JmpTrue => {
                let offset = self.reader.read_offset()?;
                if self.test {
                    self.branch(pc, offset)?;
                }
            }
            CoreOp::JmpFalse => {
                let offset = self.reader.read_offset()?;
                if !self.test {
                    self.branch(pc, offset)?;
                }
            }
            CoreOp::Not => self.test = !self.test,
            CoreOp::True => self.test = true,
            CoreOp::False => self.test = false,
            CoreOp::Stop => self.stopped = true,
            CoreOp::Keep => {
                let line = self.read_source_line()?;
                let mut side_effects = self.read_delivery_optionals(pc)?;
                if side_effects.is_empty() {
                    side_effects = self.delivery_side_effects();
                }
                self.add_action(Box::new(KeepAction), side_effects, line)?;
            }
            CoreOp::Discard => {
                let line = self.read_source_line()?;
                self.add_action(Box::new(DiscardAction), Vec::new(), line)?;
            }
            CoreOp::Redirect => {
                let line = self.read_source_line()?;
                let address = self.reader.read_string_operand()?;
                if parse_addresses(&address).is_empty() {
                    return Err(self.runtime_error(
                        line,
                        format_args!("specified redirect address `{address}` is invalid"),
                    ));
                }
                self.add_action(Box::new(RedirectAction { address }), Vec::new(), line)?;
            }
            CoreOp::Fileinto => {
                let line = self.read_source_line()?;
                let mut side_effects = self.read_delivery_optionals(pc)?;
                let mailbox = self.reader.read_string_operand()?;
                if side_effects.is_empty() {
                    side_effects = self.delivery_side_effects();
                }
                self.add_action(Box::new(FileintoAction { mailbox }), side_effects, line)?;
            }
            CoreOp::Address => self.exec_address(pc)?,
            CoreOp::Header => self.exec_header(pc)?,
            CoreOp::Exists => {
                let names = self.reader.read_string_list_operand()?;
                let all_present = names.iter().all(|name| {
                    self.msgdata
                        .mail
                        .get_first_header(name)
                        .ok()
                        .flatten()
                        .is_some()
                });
                self.test = all_present;
            }
            CoreOp::SizeOver => {
                let limit = self.reader.read_number_operand()?;
                self.test = self.msgdata.mail.get_size() > limit;
            }
            CoreOp::SizeUnder => {
                let limit = self.reader.read_number_operand()?;
                self.test = self.msgdata.mail.get_size() < limit;
            }
            CoreOp::Envelope => self.exec_envelope(pc)?,
        }
        Ok(())
    }

    fn branch(&mut self, pc: usize, offset: i32) -> Result<(), ExecError> {
        let base = self.reader.position() as i64;
        let target = base + i64::from(offset);
        let target = usize::try_from(target)
            .map_err(|_| self.corrupt(pc, "jump before start of program"))?;
        self.reader
            .seek(target)
            .map_err(|_| self.corrupt(pc, "jump beyond end of program"))?;
        Ok(())
    }

    /// Reads the packed source-line operand action operations carry.
    pub fn read_source_line(&mut self) -> Result<u32, ExecError> {
        let raw = self.reader.read_packed()?;
        Ok(u32::try_from(raw).unwrap_or(u32::MAX))
    }

    /// Reads a delivery command's optional block: currently only the
    /// side-effect list.
    fn read_delivery_optionals(
        &mut self,
        pc: usize,
    ) -> Result<Vec<Box<dyn SideEffect>>, ExecError> {
        let mut side_effects = Vec::new();
        while let Some(code) = self.reader.read_opt_code()? {
            if code == OPT_SIDE_EFFECTS {
                side_effects = self.read_side_effect_list(pc)?;
            } else {
                return Err(self.corrupt(pc, "unknown optional operand"));
            }
        }
        Ok(side_effects)
    }

    fn read_side_effect_list(&mut self, pc: usize) -> Result<Vec<Box<dyn SideEffect>>, ExecError> {
        let count = self.reader.read_packed()?;
        let mut side_effects = Vec::new();
        for _ in 0..count {
            let (owner, code) = self
                .reader
                .read_object_operand(OperandClass::SideEffect)?;
            if owner == 0 {
                return Err(self.corrupt(pc, "core owns no side effects"));
            }
            let ext = self
                .exts
                .get(owner as usize - 1)
                .cloned()
                .ok_or_else(|| self.corrupt(pc, "side effect owner not linked"))?;
            match ext.read_side_effect(code, self)? {
                Some(se) => side_effects.push(se),
                None => return Err(self.corrupt(pc, "unknown side effect")),
            }
        }
        Ok(side_effects)
    }

    // --- match-test execution ---

    /// Reads the optional block shared by the address-match tests:
    /// comparator, match type, and (when allowed) address part.
    pub(crate) fn read_match_optionals(
        &mut self,
        pc: usize,
        with_address_part: bool,
    ) -> Result<
        (
            Arc<dyn Comparator>,
            Arc<dyn MatchType>,
            Arc<dyn AddressPart>,
        ),
        ExecError,
    > {
        let mut cmp: Arc<dyn Comparator> = Arc::new(AsciiCasemapComparator);
        let mut mtch: Arc<dyn MatchType> = Arc::new(IsMatch);
        let mut part: Arc<dyn AddressPart> = Arc::new(AllPart);
        while let Some(code) = self.reader.read_opt_code()? {
            match code {
                OPT_COMPARATOR => {
                    let (owner, obj) = self
                        .reader
                        .read_object_operand(OperandClass::Comparator)?;
                    cmp = self.resolve_comparator(pc, owner, obj)?;
                }
                OPT_MATCH_TYPE => {
                    let (owner, obj) = self.reader.read_object_operand(OperandClass::MatchType)?;
                    mtch = self.resolve_match_type(pc, owner, obj)?;
                }
                OPT_ADDRESS_PART if with_address_part => {
                    let (owner, obj) = self
                        .reader
                        .read_object_operand(OperandClass::AddressPart)?;
                    part = self.resolve_address_part(pc, owner, obj)?;
                }
                _ => return Err(self.corrupt(pc, "unknown optional operand")),
            }
        }
        Ok((cmp, mtch, part))
    }

    fn owner_extension(&self, pc: usize, owner: u32) -> Result<&Arc<dyn Extension>, ExecError> {
        self.exts
            .get(owner as usize - 1)
            .ok_or_else(|| self.corrupt(pc, "object owner not linked"))
    }

    fn resolve_comparator(
        &self,
        pc: usize,
        owner: u32,
        code: u32,
    ) -> Result<Arc<dyn Comparator>, ExecError> {
        if owner == 0 {
            return match code {
                CMP_OCTET => Ok(Arc::new(OctetComparator)),
                CMP_ASCII_CASEMAP => Ok(Arc::new(AsciiCasemapComparator)),
                _ => Err(self.corrupt(pc, "unknown core comparator")),
            };
        }
        self.owner_extension(pc, owner)?
            .comparator(code)
            .ok_or_else(|| self.corrupt(pc, "unknown comparator object"))
    }

    fn resolve_match_type(
        &self,
        pc: usize,
        owner: u32,
        code: u32,
    ) -> Result<Arc<dyn MatchType>, ExecError> {
        if owner == 0 {
            return match code {
                MT_IS => Ok(Arc::new(IsMatch)),
                MT_CONTAINS => Ok(Arc::new(ContainsMatch)),
                MT_MATCHES => Ok(Arc::new(MatchesMatch)),
                _ => Err(self.corrupt(pc, "unknown core match type")),
            };
        }
        self.owner_extension(pc, owner)?
            .match_type(code)
            .ok_or_else(|| self.corrupt(pc, "unknown match type object"))
    }

    fn resolve_address_part(
        &self,
        pc: usize,
        owner: u32,
        code: u32,
    ) -> Result<Arc<dyn AddressPart>, ExecError> {
        if owner == 0 {
            return match code {
                AP_ALL => Ok(Arc::new(AllPart)),
                AP_LOCALPART => Ok(Arc::new(LocalPart)),
                AP_DOMAIN => Ok(Arc::new(DomainPart)),
                _ => Err(self.corrupt(pc, "unknown core address part")),
            };
        }
        self.owner_extension(pc, owner)?
            .address_part(code)
            .ok_or_else(|| self.corrupt(pc, "unknown address part object"))
    }

    fn exec_address(&mut self, pc: usize) -> Result<(), ExecError> {
        let (cmp, mtch, part) = self.read_match_optionals(pc, true)?;
        let header_names = self.reader.read_string_list_operand()?;
        let keys = self.reader.read_string_list_operand()?;

        let mut mctx = MatchContext::begin(mtch.as_ref(), cmp.as_ref(), &keys);
        let mut matched = false;
        'headers: for name in &header_names {
            let Ok(values) = self.msgdata.mail.get_headers_utf8(name) else {
                continue;
            };
            for value in &values {
                for addr in parse_addresses(value) {
                    if let Some(projected) = part.extract(&addr) {
                        if mctx.value(&projected) {
                            matched = true;
                            break 'headers;
                        }
                    }
                }
            }
        }
        self.test = matched || mctx.finish();
        Ok(())
    }

    fn exec_header(&mut self, pc: usize) -> Result<(), ExecError> {
        let (cmp, mtch, _) = self.read_match_optionals(pc, false)?;
        let header_names = self.reader.read_string_list_operand()?;
        let keys = self.reader.read_string_list_operand()?;

        let mut mctx = MatchContext::begin(mtch.as_ref(), cmp.as_ref(), &keys);
        let mut matched = false;
        'headers: for name in &header_names {
            let Ok(values) = self.msgdata.mail.get_headers_utf8(name) else {
                continue;
            };
            for value in &values {
                if mctx.value(value) {
                    matched = true;
                    break 'headers;
                }
            }
        }
        self.test = matched || mctx.finish();
        Ok(())
    }

    fn exec_envelope(&mut self, pc: usize) -> Result<(), ExecError> {
        let (cmp, mtch, part) = self.read_match_optionals(pc, true)?;
        let fields = self.reader.read_string_list_operand()?;
        let keys = self.reader.read_string_list_operand()?;

        let mut mctx = MatchContext::begin(mtch.as_ref(), cmp.as_ref(), &keys);
        let mut matched = false;
        'fields: for field in &fields {
            let value = match field.to_ascii_lowercase().as_str() {
                "from" => self.msgdata.return_path.clone(),
                "to" => self.msgdata.to_address.clone(),
                "auth" => self.msgdata.auth_user.clone(),
                _ => None,
            };
            let Some(value) = value else { continue };
            for addr in parse_addresses(&value) {
                if let Some(projected) = part.extract(&addr) {
                    if mctx.value(&projected) {
                        matched = true;
                        break 'fields;
                    }
                }
            }
        }
        self.test = matched || mctx.finish();
        Ok(())
    }
}
