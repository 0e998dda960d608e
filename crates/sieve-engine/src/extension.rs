//! The extension contract and registry.

use std::{any::Any, sync::Arc};

use crate::{
    action::SideEffect,
    address_part::AddressPart,
    comparator::Comparator,
    error::ExecError,
    interp::{Interpreter, Operation},
    match_type::MatchType,
    named::{AlreadyExists, Named, NamedMap},
    validate::Validator,
};

/// One Sieve extension.
///
/// An extension contributes commands and tags (through
/// [`validator_load`](Self::validator_load), called when a script
/// `require`s it), operations and operand objects (resolved by code
/// when a binary referencing the extension runs), and an optional
/// per-interpreter runtime context.
pub trait Extension: Send + Sync {
    /// The `require` name, e.g. `imap4flags`.
    fn name(&self) -> &'static str;

    /// Registers the extension's commands and tags.
    fn validator_load(&self, valdtr: &mut Validator<'_>);

    /// Creates the extension's per-interpreter context, if it has one.
    fn runtime_load(&self) -> Option<Box<dyn Any + Send>> {
        None
    }

    /// Resolves an operation by extension-local code.
    fn operation(&self, code: u32) -> Option<&dyn Operation> {
        let _ = code;
        None
    }

    /// Decodes the payload of a side-effect operand this extension
    /// owns. `Ok(None)` means the code is unknown, which the caller
    /// treats as a corrupt binary.
    fn read_side_effect(
        &self,
        code: u32,
        it: &mut Interpreter<'_>,
    ) -> Result<Option<Box<dyn SideEffect>>, ExecError> {
        let _ = (code, it);
        Ok(None)
    }

    /// Disassembles the payload of a side-effect operand this
    /// extension owns. Returns false when the code is unknown.
    fn dump_side_effect(
        &self,
        code: u32,
        d: &mut crate::dump::Dumper<'_, '_>,
    ) -> Result<bool, crate::dump::DumpError> {
        let _ = (code, d);
        Ok(false)
    }

    /// A side effect to attach implicitly to every delivery action
    /// (explicit keep/fileinto and the implicit keep).
    fn delivery_side_effect(&self, it: &Interpreter<'_>) -> Option<Box<dyn SideEffect>> {
        let _ = it;
        None
    }

    /// Resolves a comparator object this extension owns.
    fn comparator(&self, code: u32) -> Option<Arc<dyn Comparator>> {
        let _ = code;
        None
    }

    /// Resolves a match-type object this extension owns.
    fn match_type(&self, code: u32) -> Option<Arc<dyn MatchType>> {
        let _ = code;
        None
    }

    /// Resolves an address-part object this extension owns.
    fn address_part(&self, code: u32) -> Option<Arc<dyn AddressPart>> {
        let _ = code;
        None
    }
}

impl Named for dyn Extension {
    fn name(&self) -> &str {
        Extension::name(self)
    }
}

/// The set of extensions a host makes available.
///
/// Built once before any compile or run; shared immutably afterwards.
/// Binaries persist extension *names*, which are re-resolved against
/// the registry whenever a binary is opened or executed.
#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: NamedMap<Arc<dyn Extension>>,
}

impl ExtensionRegistry {
    /// An empty registry: core commands only, nothing to `require`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the engine's bundled extensions.
    pub fn bundled() -> Self {
        let mut registry = Self::new();
        for ext in [
            Arc::new(crate::cmds::FileintoExt) as Arc<dyn Extension>,
            Arc::new(crate::tsts::EnvelopeExt),
            Arc::new(crate::ext::imapflags::ImapFlagsExt),
            Arc::new(crate::ext::vacation::VacationExt),
            Arc::new(crate::ext::duplicate::DuplicateExt::default()),
        ] {
            registry
                .register(ext)
                .expect("bundled extension names are unique");
        }
        registry
    }

    /// Adds an extension. Names must be unique.
    pub fn register(&mut self, ext: Arc<dyn Extension>) -> Result<(), AlreadyExists> {
        self.extensions.insert(ext)
    }

    /// Looks up an extension by `require` name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.extensions.get(name).cloned()
    }

    /// Iterates registered extensions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Extension>> {
        self.extensions.iter()
    }
}
