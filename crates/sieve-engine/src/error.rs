use buggy::Bug;
use sieve_binary::BinaryError;

/// How a script run ended, as reported to the host.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// The script ran and at least one explicit action committed.
    Ok,
    /// The script ran but nothing beyond the implicit keep happened;
    /// the host should deliver normally.
    KeepOnly,
    /// A recoverable failure; the host should requeue the message.
    TempFailure,
    /// The binary is corrupt and must be recompiled.
    BinaryCorrupt,
    /// The run failed; see the error handler for details.
    Failed,
}

/// Errors aborting an interpreter run.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The binary could not be decoded at the failing program counter.
    #[error("corrupt binary: {0}")]
    BinaryCorrupt(#[from] BinaryError),
    /// The binary decoded but made no sense (unknown object, operand,
    /// or operation) at the given opcode address.
    #[error("corrupt binary at {pc:#06x}: {what}")]
    Corrupt {
        /// Address of the failing opcode.
        pc: usize,
        /// What was wrong.
        what: String,
    },
    /// The binary references an extension the runtime does not know.
    #[error("binary requires unknown extension `{0}`")]
    UnknownExtension(String),
    /// A runtime error already reported through the error handler.
    #[error("runtime error: {0}")]
    Runtime(String),
    /// The run was aborted by the host's deadline/abort flag.
    #[error("execution aborted")]
    Aborted,
    /// An implementation bug.
    #[error(transparent)]
    Bug(#[from] Bug),
}

/// Errors producing a binary from source.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The script failed to parse.
    #[error(transparent)]
    Parse(#[from] sieve_lang::ParseError),
    /// Validation reported errors through the error handler.
    #[error("validation failed with {0} error(s)")]
    Validation(usize),
    /// Code generation failed.
    #[error(transparent)]
    Codegen(#[from] CodegenError),
}

/// Fatal code generation errors. These indicate engine bugs, not script
/// problems; scripts that reach the generator have already validated.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// A reserved jump slot was never resolved.
    #[error("unresolved jump slot left in generated code")]
    InternalJumpUnresolved,
    /// An operand object's owning extension is not linked into the
    /// binary being generated.
    #[error("object owner `{0}` is not registered in the binary")]
    ObjectNotRegistered(String),
    /// The underlying binary refused an emission.
    #[error(transparent)]
    Binary(#[from] BinaryError),
    /// An implementation bug.
    #[error(transparent)]
    Bug(#[from] Bug),
}

/// A failure from one action's execute hook.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ActionError {
    /// Human-readable description, also fed to the error handler.
    pub message: String,
    /// Whether the host should requeue and retry the message.
    pub temporary: bool,
}

impl ActionError {
    /// A permanent action failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            temporary: false,
        }
    }

    /// A failure the host can retry.
    pub fn temporary(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            temporary: true,
        }
    }
}

/// Outcome passed to every action's finish hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// All actions committed.
    Ok,
    /// At least one action failed.
    Failed,
    /// The run was aborted before commit.
    Aborted,
}
