use crate::opcode::OperandClass;

/// Errors produced while encoding, decoding, or loading a binary.
///
/// Decode-side variants carry the code offset they occurred at; the
/// interpreter surfaces that offset as the failing program counter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BinaryError {
    /// The code ended in the middle of an operation or operand.
    #[error("unexpected end of code at {at:#06x}")]
    UnexpectedEnd {
        /// Offset the read started at.
        at: usize,
    },
    /// The file does not start with the binary magic.
    #[error("not a sieve binary (bad magic)")]
    BadMagic,
    /// The binary was produced by an incompatible format version.
    #[error("unsupported binary version {0}")]
    UnsupportedVersion(u16),
    /// A byte in opcode position does not name a known core operation.
    #[error("invalid opcode {code:#04x} at {at:#06x}")]
    InvalidOpcode {
        /// The offending byte.
        code: u8,
        /// Offset of the opcode.
        at: usize,
    },
    /// An operand of one class was found where another was required.
    #[error("expected {want} operand at {at:#06x}, found class {got:#04x}")]
    UnexpectedOperand {
        /// The class the reader asked for.
        want: OperandClass,
        /// The class byte actually present.
        got: u8,
        /// Offset of the class byte.
        at: usize,
    },
    /// A string operand holds bytes that are not valid UTF-8.
    #[error("invalid UTF-8 in string at {at:#06x}")]
    InvalidUtf8 {
        /// Offset of the string operand.
        at: usize,
    },
    /// A packed integer does not fit in 64 bits.
    #[error("packed integer overflow at {at:#06x}")]
    IntegerOverflow {
        /// Offset of the packed integer.
        at: usize,
    },
    /// A jump lands outside the code, or an offset does not fit its slot.
    #[error("jump offset out of range at {at:#06x}")]
    BadJumpOffset {
        /// Offset of the jump operand.
        at: usize,
    },
    /// A seek target is outside the code.
    #[error("address {at:#06x} is outside the program")]
    BadAddress {
        /// The requested address.
        at: usize,
    },
    /// The extension index is full.
    #[error("too many extensions linked into one binary")]
    TooManyExtensions,
}
