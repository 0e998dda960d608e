//! The Sieve execution engine: validator, code generator, and bytecode
//! interpreter for the Sieve mail filtering language (RFC 5228), with
//! the `fileinto`, `envelope`, `imap4flags`, `vacation`, and
//! `duplicate` extensions bundled.
//!
//! The pipeline is parse → validate → generate → interpret. A host
//! compiles a script to a [`Binary`] once, then executes it per
//! message:
//!
//! ```no_run
//! use sieve_engine::{
//!     compile, execute, CollectingHandler, ExtensionRegistry, MessageContext,
//! };
//! # fn demo(mail: &dyn sieve_engine::Mail) {
//! let registry = ExtensionRegistry::bundled();
//! let mut handler = CollectingHandler::new();
//!
//! let script = r#"if header :contains "x-spam" "yes" { discard; }"#;
//! let binary = compile(script, &registry, &mut handler).unwrap();
//!
//! let msgdata = sieve_engine::MessageData {
//!     mail,
//!     return_path: Some("sender@example.com".into()),
//!     to_address: Some("me@example.net".into()),
//!     auth_user: None,
//!     id: None,
//! };
//! let env = sieve_engine::ScriptEnv::default();
//! let mut msgctx = MessageContext::new();
//! let code = execute(&binary, &registry, &msgdata, &env, &mut msgctx, &mut handler);
//! # let _ = code;
//! # }
//! ```
//!
//! Execution produces a result: an ordered action list (keep, fileinto,
//! redirect, vacation reply, flag changes) that is validated for
//! duplicates and conflicts and then committed through the host
//! capabilities in [`ScriptEnv`]. Side effects such as duplicate marks
//! only land when the whole run commits.

mod action;
mod address;
mod address_part;
mod cmds;
mod codegen;
mod command;
mod comparator;
mod dump;
mod ehandler;
mod error;
mod ext;
mod extension;
mod interp;
mod match_type;
mod named;
mod result;
mod runtime;
mod tsts;
mod validate;

use std::path::Path;

pub use sieve_ast as ast;
pub use sieve_binary::{Binary, BinaryError};

pub use crate::{
    action::{Action, ActionDef, ActionExecEnv, DuplicatePolicy, SideEffect},
    address::{parse_addresses, Address},
    address_part::AddressPart,
    cmds::FileintoExt,
    codegen::{generate, Generator, JumpList},
    command::{
        ArgStream, CommandCtx, CommandDef, CommandKind, CommandRegistration, CommandSpec,
        SelectedObject, TagActivation, TagDef, ValidatedCommand, ValidatedScript,
    },
    comparator::Comparator,
    dump::{dump, DumpError, Dumper},
    ehandler::{CollectingHandler, Diagnostic, ErrorHandler, Severity, TracingHandler},
    error::{
        ActionError, CodegenError, CommitStatus, CompileError, ExecError, ExitCode,
    },
    ext::{duplicate::DuplicateExt, imapflags::ImapFlagsExt, vacation::VacationExt},
    extension::{Extension, ExtensionRegistry},
    interp::{Interpreter, Operation},
    match_type::{glob_match, MatchContext, MatchType},
    named::{AlreadyExists, Named},
    result::{ActionEntry, ActionState, ScriptResult},
    runtime::{
        DuplicateStore, Mail, MailError, MailStore, MessageContext, MessageData, ScriptEnv,
        SmtpError, SmtpSession, SmtpTransport, StoreError,
    },
    tsts::EnvelopeExt,
    validate::{ArgType, Validator},
};

/// Errors opening a stored binary.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Binary(#[from] BinaryError),
    /// The binary's extension index names an extension the registry
    /// does not know.
    #[error("binary requires unknown extension `{0}`")]
    UnknownExtension(String),
}

/// Compiles a script: parse, validate against the registry's
/// extensions, and generate the binary. Problems are reported through
/// the error handler; the returned error summarizes them.
pub fn compile(
    script: &str,
    registry: &ExtensionRegistry,
    ehandler: &mut dyn ErrorHandler,
) -> Result<Binary, CompileError> {
    let ast = match sieve_lang::parse_script(script) {
        Ok(ast) => ast,
        Err(err) => {
            ehandler.error(Some(err.line), format_args!("{}", err.kind));
            return Err(CompileError::Parse(err));
        }
    };
    let validated = Validator::new(registry, ehandler)
        .run(&ast)
        .map_err(CompileError::Validation)?;
    Ok(codegen::generate(&validated)?)
}

/// Writes a compiled binary to disk.
pub fn save(binary: &Binary, path: impl AsRef<Path>) -> std::io::Result<()> {
    std::fs::write(path, binary.to_bytes())
}

/// Loads a stored binary, verifying its container header and that all
/// extensions in its index resolve against the registry.
pub fn open(path: impl AsRef<Path>, registry: &ExtensionRegistry) -> Result<Binary, OpenError> {
    let bytes = std::fs::read(path)?;
    let binary = Binary::load(&bytes)?;
    for name in binary.extensions() {
        if registry.get(name).is_none() {
            return Err(OpenError::UnknownExtension(name.clone()));
        }
    }
    Ok(binary)
}

/// Executes a binary against a message and commits the resulting
/// actions through the host capabilities.
pub fn execute(
    binary: &Binary,
    registry: &ExtensionRegistry,
    msgdata: &MessageData<'_>,
    env: &ScriptEnv<'_>,
    msgctx: &mut MessageContext,
    ehandler: &mut dyn ErrorHandler,
) -> ExitCode {
    let (status, mut result) = {
        let mut interp =
            match Interpreter::new(binary, registry, msgdata, env, msgctx, ehandler) {
                Ok(interp) => interp,
                Err(ExecError::UnknownExtension(name)) => {
                    ehandler.error(
                        None,
                        format_args!("binary requires unknown extension `{name}`"),
                    );
                    return ExitCode::Failed;
                }
                Err(err) => {
                    ehandler.critical(format_args!("{err}"));
                    return ExitCode::Failed;
                }
            };
        let status = interp.run();
        (status, interp.into_result())
    };

    let mut aenv = ActionExecEnv {
        msgdata,
        env,
        ehandler,
    };
    match status {
        Ok(()) => result.commit(&mut aenv),
        Err(err) => {
            // Nothing was committed; run the finish hooks with the
            // aborted status so no deferred side effect is recorded.
            result.abort(&mut aenv);
            match err {
                ExecError::Aborted => ExitCode::TempFailure,
                err @ (ExecError::BinaryCorrupt(_) | ExecError::Corrupt { .. }) => {
                    aenv.ehandler.error(None, format_args!("{err}"));
                    ExitCode::BinaryCorrupt
                }
                ExecError::Runtime(_) => ExitCode::Failed,
                err => {
                    aenv.ehandler.critical(format_args!("{err}"));
                    ExitCode::Failed
                }
            }
        }
    }
}
