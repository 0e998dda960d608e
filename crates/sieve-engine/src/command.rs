//! Command and tag descriptors: the contract between the validator,
//! the generator, and everything that contributes commands, core or
//! extension.

use std::{any::Any, collections::VecDeque, sync::Arc};

use sieve_ast::{ArgValue, Argument};

use crate::{
    address_part::AddressPart,
    codegen::Generator,
    comparator::Comparator,
    error::CodegenError,
    match_type::MatchType,
    named::Named,
    validate::Validator,
};

/// Whether an identifier names an action/control command or a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Command,
    Test,
}

/// Static facts about a command: its name, kind, and arity.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    pub kind: CommandKind,
    /// Exact positional argument count, or -1 for any.
    pub positional: i32,
    /// Exact subtest count, or -1 for one or more.
    pub subtests: i32,
    pub block_allowed: bool,
    pub block_required: bool,
}

/// A command or test descriptor.
///
/// One object carries the hooks for the whole pipeline: `registered`
/// runs once when the command enters the validator's table (to register
/// its tags), `pre_validate`/`validate` run per occurrence, and
/// `generate` emits the occurrence into the binary.
pub trait CommandDef: Send + Sync {
    fn spec(&self) -> &CommandSpec;

    /// Registers the command's tagged arguments.
    fn registered(&self, valdtr: &mut Validator<'_>, reg: &mut CommandRegistration) {
        let _ = (valdtr, reg);
    }

    /// Runs before the tag loop; typically installs `cmd` data.
    fn pre_validate(&self, valdtr: &mut Validator<'_>, cmd: &mut CommandCtx) -> bool {
        let _ = (valdtr, cmd);
        true
    }

    /// Validates the positional arguments.
    fn validate(&self, valdtr: &mut Validator<'_>, cmd: &mut CommandCtx) -> bool;

    /// Emits the occurrence into the binary.
    fn generate(&self, gen: &mut Generator<'_>, cmd: &ValidatedCommand)
        -> Result<(), CodegenError>;
}

/// A tagged-argument descriptor.
pub trait TagDef: Send + Sync {
    /// The canonical tag name, without the colon.
    fn name(&self) -> &'static str;

    /// Whether this descriptor handles the given tag. Descriptors that
    /// cover a family of tags (the match types, say) consult the
    /// validator's registries.
    fn matches(&self, valdtr: &Validator<'_>, tag: &str) -> bool {
        let _ = valdtr;
        tag == self.name()
    }

    /// Validates the tag, consuming its value argument(s) from `args`
    /// and recording what to emit in `act`.
    fn validate(
        &self,
        valdtr: &mut Validator<'_>,
        cmd: &mut CommandCtx,
        act: &mut TagActivation,
        args: &mut ArgStream,
    ) -> bool;

    /// Emits the operand(s) for an activation with a non-zero opt code.
    /// The opt code itself is emitted by the generator.
    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
        act: &TagActivation,
    ) -> Result<(), CodegenError> {
        let _ = (gen, cmd, act);
        Ok(())
    }
}

/// A command in the validator's table, with the tags registered for it.
pub struct CommandRegistration {
    pub(crate) def: Arc<dyn CommandDef>,
    pub(crate) tags: Vec<RegisteredTag>,
}

pub(crate) struct RegisteredTag {
    pub(crate) def: Arc<dyn TagDef>,
    pub(crate) opt_code: u64,
}

impl CommandRegistration {
    pub(crate) fn new(def: Arc<dyn CommandDef>) -> Self {
        Self {
            def,
            tags: Vec::new(),
        }
    }

    /// Registers a tag with the optional-operand code it emits under.
    /// Code 0 means the tag emits nothing by itself (its effect lands
    /// elsewhere, e.g. in command data).
    pub fn register_tag(&mut self, def: Arc<dyn TagDef>, opt_code: u64) {
        self.tags.push(RegisteredTag { def, opt_code });
    }
}

impl Named for CommandRegistration {
    fn name(&self) -> &str {
        self.def.spec().name
    }
}

/// An object a tag selected for its test, attached to the activation
/// and emitted as an object operand.
#[derive(Clone)]
pub enum SelectedObject {
    Comparator(Arc<dyn Comparator>),
    MatchType(Arc<dyn MatchType>),
    AddressPart(Arc<dyn AddressPart>),
}

/// One validated tag occurrence.
pub struct TagActivation {
    pub(crate) tag: Arc<dyn TagDef>,
    /// The optional-operand code this activation emits under; 0 emits
    /// nothing.
    pub opt_code: u64,
    /// The tag identifier as written (relevant for family tags).
    pub name: String,
    pub line: u32,
    /// The tag's value argument, when it takes one.
    pub payload: Option<ArgValue>,
    /// The object this tag selected, for object-emitting tags.
    pub object: Option<SelectedObject>,
}

/// The remaining argument stream handed to tag validators, which may
/// consume the tag's value arguments from the front.
pub struct ArgStream {
    args: VecDeque<Argument>,
}

impl ArgStream {
    pub(crate) fn new(args: Vec<Argument>) -> Self {
        Self { args: args.into() }
    }

    pub fn peek(&self) -> Option<&Argument> {
        self.args.front()
    }

    pub fn next(&mut self) -> Option<Argument> {
        self.args.pop_front()
    }

    pub(crate) fn into_rest(self) -> Vec<Argument> {
        self.args.into()
    }
}

/// Validator-time state for one command occurrence: the argument lists
/// after the tag loop, plus a free-form data slot owned by the
/// command's validator.
pub struct CommandCtx {
    pub name: String,
    pub line: u32,
    /// Positional arguments, in order. Tag validators may have coerced
    /// or rewritten values.
    pub positional: Vec<Argument>,
    /// Validated tag occurrences, in source order.
    pub activations: Vec<TagActivation>,
    /// Indices of positional arguments the generator emits.
    pub activated: Vec<usize>,
    data: Option<Box<dyn Any + Send>>,
}

impl CommandCtx {
    pub(crate) fn new(name: String, line: u32) -> Self {
        Self {
            name,
            line,
            positional: Vec::new(),
            activations: Vec::new(),
            activated: Vec::new(),
            data: None,
        }
    }

    /// Marks a positional argument for emission.
    pub fn activate(&mut self, index: usize) {
        if !self.activated.contains(&index) {
            self.activated.push(index);
        }
    }

    /// The activation registered under `opt_code`, if any.
    pub fn activation(&self, opt_code: u64) -> Option<&TagActivation> {
        self.activations.iter().find(|a| a.opt_code == opt_code)
    }

    /// Whether a tag with the given (canonical) name was used.
    pub fn has_tag(&self, name: &str) -> bool {
        self.activations.iter().any(|a| a.name == name)
    }

    /// Installs the command's private data.
    pub fn set_data<T: Any + Send>(&mut self, value: T) {
        self.data = Some(Box::new(value));
    }

    /// The command's private data.
    pub fn data<T: Any + Send>(&self) -> Option<&T> {
        self.data.as_ref()?.downcast_ref()
    }

    /// The command's private data, mutably.
    pub fn data_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.data.as_mut()?.downcast_mut()
    }

    /// The string value of a positional argument.
    pub fn string_arg(&self, index: usize) -> Option<&str> {
        match &self.positional.get(index)?.value {
            ArgValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The string-list value of a positional argument.
    pub fn string_list_arg(&self, index: usize) -> Option<&[String]> {
        match &self.positional.get(index)?.value {
            ArgValue::StringList(items) => Some(items),
            _ => None,
        }
    }

    /// The number value of a positional argument.
    pub fn number_arg(&self, index: usize) -> Option<u64> {
        match &self.positional.get(index)?.value {
            ArgValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// A tag that takes one typed value argument and emits it as its
/// operand, e.g. `:subject "Away"`.
pub struct ValueTag {
    pub name: &'static str,
    pub ty: crate::validate::ArgType,
}

impl TagDef for ValueTag {
    fn name(&self) -> &'static str {
        self.name
    }

    fn validate(
        &self,
        valdtr: &mut Validator<'_>,
        cmd: &mut CommandCtx,
        act: &mut TagActivation,
        args: &mut ArgStream,
    ) -> bool {
        match valdtr.validate_tag_parameter(cmd, act, args, self.ty) {
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
    ) -> Result<(), crate::error::CodegenError> {
        use buggy::bug;
        match &act.payload {
            Some(ArgValue::String(s)) => gen.binary().emit_string_operand(s),
            Some(ArgValue::Number(n)) => gen.binary().emit_number_operand(*n),
            Some(ArgValue::StringList(items)) => gen.binary().emit_string_list_operand(items),
            _ => bug!("value tag without validated payload"),
        }
        Ok(())
    }
}

/// A bare flag tag with no value, e.g. `:mime`. Emits nothing beyond
/// its opt code.
pub struct FlagTag {
    pub name: &'static str,
}

impl TagDef for FlagTag {
    fn name(&self) -> &'static str {
        self.name
    }

    fn validate(
        &self,
        _valdtr: &mut Validator<'_>,
        _cmd: &mut CommandCtx,
        _act: &mut TagActivation,
        _args: &mut ArgStream,
    ) -> bool {
        true
    }
}

/// A validated command with its validated subtests and block, ready for
/// generation.
pub struct ValidatedCommand {
    pub def: Arc<dyn CommandDef>,
    pub ctx: CommandCtx,
    pub tests: Vec<ValidatedCommand>,
    pub block: Vec<ValidatedCommand>,
    /// For an `if`: the `elsif`/`else` commands chained onto it.
    pub else_branches: Vec<ValidatedCommand>,
}

/// A validated script plus the extensions it loaded, in `require`
/// order. The generator links the extension list into the binary's
/// extension index.
pub struct ValidatedScript {
    pub commands: Vec<ValidatedCommand>,
    pub extensions: Vec<String>,
}
