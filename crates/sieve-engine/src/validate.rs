//! Semantic validation of a parsed script.
//!
//! The validator resolves command names against its registered command
//! table, runs each command's tag loop and positional checks, enforces
//! subtest and block arity, and loads `require`d extensions. Errors
//! accumulate through the error handler; validation succeeds only when
//! none were reported.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use sieve_ast::{ArgValue, Argument, CommandNode, Script};

use crate::{
    address_part::{AddressPart, AllPart, DomainPart, LocalPart},
    command::{
        ArgStream, CommandCtx, CommandDef, CommandKind, CommandRegistration, SelectedObject,
        TagActivation, TagDef, ValidatedCommand, ValidatedScript,
    },
    comparator::{AsciiCasemapComparator, Comparator, OctetComparator},
    ehandler::ErrorHandler,
    extension::ExtensionRegistry,
    match_type::{ContainsMatch, IsMatch, MatchType, MatchesMatch},
    named::NamedMap,
};

/// Validation stops after this many errors.
const DEFAULT_MAX_ERRORS: usize = 100;

/// Expected type of a positional or tag-parameter argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    String,
    Number,
    /// A string list; a single string coerces to a one-element list
    /// (RFC 5228 §2.4.2.1).
    StringList,
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::String => "string",
            Self::Number => "number",
            Self::StringList => "string list",
        })
    }
}

fn coerce(value: &mut ArgValue, ty: ArgType) -> bool {
    match (ty, &*value) {
        (ArgType::String, ArgValue::String(_)) => true,
        (ArgType::Number, ArgValue::Number(_)) => true,
        (ArgType::StringList, ArgValue::StringList(_)) => true,
        (ArgType::StringList, ArgValue::String(s)) => {
            *value = ArgValue::StringList(vec![s.clone()]);
            true
        }
        _ => false,
    }
}

/// The validator: command table, object registries, and the walk.
pub struct Validator<'a> {
    registry: &'a ExtensionRegistry,
    ehandler: &'a mut dyn ErrorHandler,
    commands: IndexMap<&'static str, CommandRegistration, fnv::FnvBuildHasher>,
    comparators: NamedMap<Arc<dyn Comparator>>,
    match_types: NamedMap<Arc<dyn MatchType>>,
    address_parts: NamedMap<Arc<dyn AddressPart>>,
    /// Extensions loaded by `require`, in order.
    loaded: Vec<String>,
    /// Tags registered for commands that are not in the table yet
    /// (extensions may decorate each other's commands regardless of
    /// `require` order).
    pending_tags: Vec<(String, Arc<dyn TagDef>, u64)>,
    max_errors: usize,
    non_require_seen: bool,
}

impl<'a> Validator<'a> {
    /// Creates a validator with the core command set registered.
    pub fn new(registry: &'a ExtensionRegistry, ehandler: &'a mut dyn ErrorHandler) -> Self {
        let mut valdtr = Self {
            registry,
            ehandler,
            commands: IndexMap::default(),
            comparators: NamedMap::new(),
            match_types: NamedMap::new(),
            address_parts: NamedMap::new(),
            loaded: Vec::new(),
            pending_tags: Vec::new(),
            max_errors: DEFAULT_MAX_ERRORS,
            non_require_seen: false,
        };

        valdtr.register_comparator(Arc::new(OctetComparator));
        valdtr.register_comparator(Arc::new(AsciiCasemapComparator));
        valdtr.register_match_type(Arc::new(IsMatch));
        valdtr.register_match_type(Arc::new(ContainsMatch));
        valdtr.register_match_type(Arc::new(MatchesMatch));
        valdtr.register_address_part(Arc::new(AllPart));
        valdtr.register_address_part(Arc::new(LocalPart));
        valdtr.register_address_part(Arc::new(DomainPart));

        crate::cmds::register_core(&mut valdtr);
        crate::tsts::register_core(&mut valdtr);
        valdtr
    }

    /// Caps the number of reported errors before giving up.
    pub fn set_max_errors(&mut self, max: usize) {
        self.max_errors = max.max(1);
    }

    // --- diagnostics ---

    /// Reports a validation error at a source line.
    pub fn report_error(&mut self, line: u32, message: fmt::Arguments<'_>) {
        self.ehandler.error(Some(line), message);
    }

    /// Reports a validation warning at a source line.
    pub fn report_warning(&mut self, line: u32, message: fmt::Arguments<'_>) {
        self.ehandler.warning(Some(line), message);
    }

    // --- registration (the command programmer's interface) ---

    /// Registers a command or test. Its `registered` hook runs now, to
    /// register the command's tags.
    pub fn register_command(&mut self, def: Arc<dyn CommandDef>) {
        let name = def.spec().name;
        let mut reg = CommandRegistration::new(def.clone());
        def.registered(self, &mut reg);
        let mut i = 0;
        while i < self.pending_tags.len() {
            if self.pending_tags[i].0 == name {
                let (_, tag, opt_code) = self.pending_tags.remove(i);
                reg.register_tag(tag, opt_code);
            } else {
                i += 1;
            }
        }
        self.commands.insert(name, reg);
    }

    /// Registers a tag on another command. Used by extensions that
    /// decorate foreign commands (e.g. `:flags` on `keep`). If the
    /// command is not registered yet, the tag is attached when it is.
    pub fn register_tag(&mut self, command: &str, tag: Arc<dyn TagDef>, opt_code: u64) {
        match self.commands.get_mut(command) {
            Some(reg) => reg.register_tag(tag, opt_code),
            None => self.pending_tags.push((command.to_owned(), tag, opt_code)),
        }
    }

    /// Registers a comparator object.
    pub fn register_comparator(&mut self, cmp: Arc<dyn Comparator>) {
        self.comparators.replace(cmp);
    }

    /// Registers a match-type object.
    pub fn register_match_type(&mut self, mt: Arc<dyn MatchType>) {
        self.match_types.replace(mt);
    }

    /// Registers an address-part object.
    pub fn register_address_part(&mut self, ap: Arc<dyn AddressPart>) {
        self.address_parts.replace(ap);
    }

    /// Links the `:comparator` tag family onto a command registration.
    pub fn link_comparator_tag(&self, reg: &mut CommandRegistration, opt_code: u64) {
        reg.register_tag(Arc::new(ComparatorTag), opt_code);
    }

    /// Links the match-type tags (`:is`, `:contains`, …) onto a command
    /// registration.
    pub fn link_match_type_tags(&self, reg: &mut CommandRegistration, opt_code: u64) {
        reg.register_tag(Arc::new(MatchTypeTag), opt_code);
    }

    /// Links the address-part tags (`:all`, `:localpart`, `:domain`)
    /// onto a command registration.
    pub fn link_address_part_tags(&self, reg: &mut CommandRegistration, opt_code: u64) {
        reg.register_tag(Arc::new(AddressPartTag), opt_code);
    }

    pub(crate) fn comparator(&self, name: &str) -> Option<Arc<dyn Comparator>> {
        self.comparators.get(name).cloned()
    }

    pub(crate) fn match_type(&self, name: &str) -> Option<Arc<dyn MatchType>> {
        self.match_types.get(name).cloned()
    }

    pub(crate) fn address_part(&self, name: &str) -> Option<Arc<dyn AddressPart>> {
        self.address_parts.get(name).cloned()
    }

    pub(crate) fn has_match_type(&self, name: &str) -> bool {
        self.match_types.contains(name)
    }

    pub(crate) fn has_address_part(&self, name: &str) -> bool {
        self.address_parts.contains(name)
    }

    /// Loads an extension in response to `require`. Unknown names are
    /// an `UnknownExtension` validation error.
    pub fn extension_load(&mut self, line: u32, name: &str) -> bool {
        if self.loaded.iter().any(|n| n == name) {
            return true;
        }
        match self.registry.get(name) {
            Some(ext) => {
                self.loaded.push(name.to_owned());
                ext.validator_load(self);
                true
            }
            None => {
                self.report_error(line, format_args!("unknown extension `{name}`"));
                false
            }
        }
    }

    // --- argument validation helpers ---

    /// Type-checks (and, for string lists, coerces) the positional
    /// argument at `index`.
    pub fn validate_positional_argument(
        &mut self,
        cmd: &mut CommandCtx,
        index: usize,
        what: &'static str,
        ty: ArgType,
    ) -> bool {
        let name = cmd.name.clone();
        let line = cmd.line;
        match cmd.positional.get_mut(index) {
            None => {
                self.ehandler.error(
                    Some(line),
                    format_args!(
                        "the {name} command expects a {ty} as its {what} argument, but it is missing"
                    ),
                );
                false
            }
            Some(arg) => {
                let found = arg.value.type_name();
                let arg_line = arg.line;
                if coerce(&mut arg.value, ty) {
                    true
                } else {
                    self.ehandler.error(
                        Some(arg_line),
                        format_args!(
                            "the {name} command expects a {ty} as its {what} argument, \
                             but a {found} was found"
                        ),
                    );
                    false
                }
            }
        }
    }

    /// Consumes and type-checks a tag's value argument from the stream.
    pub fn validate_tag_parameter(
        &mut self,
        cmd: &CommandCtx,
        act: &TagActivation,
        args: &mut ArgStream,
        ty: ArgType,
    ) -> Option<ArgValue> {
        let takes_value = args
            .peek()
            .is_some_and(|arg| !matches!(arg.value, ArgValue::Tag(_)));
        if !takes_value {
            self.ehandler.error(
                Some(act.line),
                format_args!(
                    "the :{} tag for the {} command requires a {ty} argument",
                    act.name, cmd.name
                ),
            );
            return None;
        }
        let mut arg = args.next()?;
        let found = arg.value.type_name();
        if coerce(&mut arg.value, ty) {
            Some(arg.value)
        } else {
            self.ehandler.error(
                Some(arg.line),
                format_args!(
                    "the :{} tag for the {} command requires a {ty} argument, \
                     but a {found} was found",
                    act.name, cmd.name
                ),
            );
            None
        }
    }

    // --- the walk ---

    /// Validates the whole script. On success, returns the validated
    /// tree plus the extensions it loaded; on failure, the number of
    /// errors reported.
    pub fn run(mut self, script: &Script) -> Result<ValidatedScript, usize> {
        let commands = self.command_block(&script.commands, true);
        match self.ehandler.error_count() {
            0 => Ok(ValidatedScript {
                commands,
                extensions: self.loaded,
            }),
            n => Err(n),
        }
    }

    fn command_block(&mut self, nodes: &[CommandNode], top_level: bool) -> Vec<ValidatedCommand> {
        let mut out: Vec<ValidatedCommand> = Vec::new();
        for node in nodes {
            if self.ehandler.error_count() >= self.max_errors {
                self.ehandler
                    .critical(format_args!("too many errors, aborting validation"));
                break;
            }
            if top_level {
                if node.identifier == "require" {
                    if self.non_require_seen {
                        self.report_error(
                            node.line,
                            format_args!("require commands must precede all other commands"),
                        );
                        continue;
                    }
                } else {
                    self.non_require_seen = true;
                }
            } else if node.identifier == "require" {
                self.report_error(
                    node.line,
                    format_args!("require is only allowed at the top level of a script"),
                );
                continue;
            }

            let Some(vc) = self.command(node, CommandKind::Command) else {
                continue;
            };
            if matches!(vc.ctx.name.as_str(), "elsif" | "else") {
                match out.last_mut() {
                    Some(prev)
                        if prev.ctx.name == "if"
                            && prev
                                .else_branches
                                .last()
                                .map_or(true, |b| b.ctx.name != "else") =>
                    {
                        prev.else_branches.push(vc);
                    }
                    _ => {
                        self.report_error(
                            node.line,
                            format_args!("{} without a matching if command", vc.ctx.name),
                        );
                    }
                }
            } else {
                out.push(vc);
            }
        }
        out
    }

    fn command(&mut self, node: &CommandNode, expected: CommandKind) -> Option<ValidatedCommand> {
        let Some(reg) = self.commands.get(node.identifier.as_str()) else {
            let what = match expected {
                CommandKind::Command => "command",
                CommandKind::Test => "test",
            };
            self.report_error(
                node.line,
                format_args!("unknown {what} `{}`", node.identifier),
            );
            return None;
        };
        let def = reg.def.clone();
        let tags: Vec<(Arc<dyn TagDef>, u64)> = reg
            .tags
            .iter()
            .map(|t| (t.def.clone(), t.opt_code))
            .collect();
        let spec = def.spec();

        if spec.kind != expected {
            let (is, wanted) = match spec.kind {
                CommandKind::Command => ("command", "test"),
                CommandKind::Test => ("test", "command"),
            };
            self.report_error(
                node.line,
                format_args!("`{}` is a {is}, but a {wanted} was expected", node.identifier),
            );
            return None;
        }

        let mut ctx = CommandCtx::new(node.identifier.clone(), node.line);
        let mut ok = def.pre_validate(self, &mut ctx);

        // The tag loop: leading tags are detached and validated by
        // their registered tag definitions; the first non-tag argument
        // starts the positional section.
        let mut stream = ArgStream::new(node.arguments.clone());
        while let Some(arg) = stream.peek() {
            let ArgValue::Tag(tag_name) = &arg.value else {
                break;
            };
            let tag_name = tag_name.clone();
            let tag_line = arg.line;
            let Some((tag_def, opt_code)) = tags
                .iter()
                .find(|(d, _)| d.matches(self, &tag_name))
                .map(|(d, c)| (d.clone(), *c))
            else {
                self.report_error(
                    tag_line,
                    format_args!(
                        "unknown tagged argument `:{tag_name}` for the {} command",
                        node.identifier
                    ),
                );
                return None;
            };
            stream.next();

            if opt_code != 0 && ctx.activation(opt_code).is_some() {
                self.report_error(
                    tag_line,
                    format_args!(
                        "conflicting tagged argument `:{tag_name}` for the {} command",
                        node.identifier
                    ),
                );
                ok = false;
                continue;
            }

            let mut act = TagActivation {
                tag: tag_def.clone(),
                opt_code,
                name: tag_name,
                line: tag_line,
                payload: None,
                object: None,
            };
            if !tag_def.validate(self, &mut ctx, &mut act, &mut stream) {
                ok = false;
            }
            ctx.activations.push(act);
        }

        // Everything after the tags is positional; stray tags are
        // misplaced.
        let rest: Vec<Argument> = stream.into_rest();
        for arg in &rest {
            if let ArgValue::Tag(t) = &arg.value {
                self.report_error(
                    arg.line,
                    format_args!("misplaced tag `:{t}` after positional arguments"),
                );
                ok = false;
            }
        }
        ctx.positional = rest;

        if spec.positional >= 0 && ctx.positional.len() != spec.positional as usize {
            self.report_error(
                node.line,
                format_args!(
                    "the {} {} requires {} positional argument(s), but {} were found",
                    node.identifier,
                    kind_name(spec.kind),
                    spec.positional,
                    ctx.positional.len()
                ),
            );
            ok = false;
        }

        if ok {
            ok = def.validate(self, &mut ctx);
        }

        // Subtest arity.
        match spec.subtests {
            -1 => {
                if node.tests.is_empty() {
                    self.report_error(
                        node.line,
                        format_args!(
                            "the {} {} requires at least one subtest",
                            node.identifier,
                            kind_name(spec.kind)
                        ),
                    );
                    ok = false;
                }
            }
            n => {
                if node.tests.len() != n as usize {
                    self.report_error(
                        node.line,
                        format_args!(
                            "the {} {} requires {} subtest(s), but {} were found",
                            node.identifier,
                            kind_name(spec.kind),
                            n,
                            node.tests.len()
                        ),
                    );
                    ok = false;
                }
            }
        }

        // Block arity.
        if node.block.is_some() && !spec.block_allowed {
            self.report_error(
                node.line,
                format_args!("the {} {} cannot have a block", node.identifier, kind_name(spec.kind)),
            );
            ok = false;
        }
        if node.block.is_none() && spec.block_required {
            self.report_error(
                node.line,
                format_args!("the {} {} requires a block", node.identifier, kind_name(spec.kind)),
            );
            ok = false;
        }

        let tests: Vec<ValidatedCommand> = node
            .tests
            .iter()
            .filter_map(|t| self.command(t, CommandKind::Test))
            .collect();
        let block = match &node.block {
            Some(cmds) => self.command_block(cmds, false),
            None => Vec::new(),
        };

        ok.then_some(ValidatedCommand {
            def,
            ctx,
            tests,
            block,
            else_branches: Vec::new(),
        })
    }
}

fn kind_name(kind: CommandKind) -> &'static str {
    match kind {
        CommandKind::Command => "command",
        CommandKind::Test => "test",
    }
}

// --- capability tag families ---

/// The `:comparator "name"` tag.
struct ComparatorTag;

impl TagDef for ComparatorTag {
    fn name(&self) -> &'static str {
        "comparator"
    }

    fn validate(
        &self,
        valdtr: &mut Validator<'_>,
        cmd: &mut CommandCtx,
        act: &mut TagActivation,
        args: &mut ArgStream,
    ) -> bool {
        let Some(ArgValue::String(name)) =
            valdtr.validate_tag_parameter(cmd, act, args, ArgType::String)
        else {
            return false;
        };
        match valdtr.comparator(&name) {
            Some(cmp) => {
                act.object = Some(SelectedObject::Comparator(cmp));
                true
            }
            None => {
                valdtr.report_error(act.line, format_args!("unknown comparator `{name}`"));
                false
            }
        }
    }

    fn generate(
        &self,
        gen: &mut crate::codegen::Generator<'_>,
        _cmd: &ValidatedCommand,
        act: &TagActivation,
    ) -> Result<(), crate::error::CodegenError> {
        gen.emit_selected_object(act)
    }
}

/// The match-type tag family (`:is`, `:contains`, `:matches`, plus
/// whatever extensions register).
struct MatchTypeTag;

impl TagDef for MatchTypeTag {
    fn name(&self) -> &'static str {
        "match-type"
    }

    fn matches(&self, valdtr: &Validator<'_>, tag: &str) -> bool {
        valdtr.has_match_type(tag)
    }

    fn validate(
        &self,
        valdtr: &mut Validator<'_>,
        _cmd: &mut CommandCtx,
        act: &mut TagActivation,
        _args: &mut ArgStream,
    ) -> bool {
        match valdtr.match_type(&act.name) {
            Some(mt) => {
                act.object = Some(SelectedObject::MatchType(mt));
                true
            }
            None => false,
        }
    }

    fn generate(
        &self,
        gen: &mut crate::codegen::Generator<'_>,
        _cmd: &ValidatedCommand,
        act: &TagActivation,
    ) -> Result<(), crate::error::CodegenError> {
        gen.emit_selected_object(act)
    }
}

/// The address-part tag family (`:all`, `:localpart`, `:domain`, plus
/// whatever extensions register).
struct AddressPartTag;

impl TagDef for AddressPartTag {
    fn name(&self) -> &'static str {
        "address-part"
    }

    fn matches(&self, valdtr: &Validator<'_>, tag: &str) -> bool {
        valdtr.has_address_part(tag)
    }

    fn validate(
        &self,
        valdtr: &mut Validator<'_>,
        _cmd: &mut CommandCtx,
        act: &mut TagActivation,
        _args: &mut ArgStream,
    ) -> bool {
        match valdtr.address_part(&act.name) {
            Some(ap) => {
                act.object = Some(SelectedObject::AddressPart(ap));
                true
            }
            None => false,
        }
    }

    fn generate(
        &self,
        gen: &mut crate::codegen::Generator<'_>,
        _cmd: &ValidatedCommand,
        act: &TagActivation,
    ) -> Result<(), crate::error::CodegenError> {
        gen.emit_selected_object(act)
    }
}
