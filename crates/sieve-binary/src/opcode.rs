use core::fmt::{self, Display};

/// First opcode byte value reserved for extension operations.
///
/// An opcode byte `b >= EXT_OPCODE_BASE` addresses extension
/// `b - EXT_OPCODE_BASE` in the binary's extension index and is
/// followed by the extension-local operation code as a packed integer.
pub const EXT_OPCODE_BASE: u8 = 0x80;

/// The core operations. Their codes are stable across binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoreOp {
    /// Unconditional jump.
    Jmp = 0x00,
    /// Jump when the test register is true.
    JmpTrue = 0x01,
    /// Jump when the test register is false.
    JmpFalse = 0x02,
    /// Negate the test register.
    Not = 0x03,
    /// Set the test register to true.
    True = 0x04,
    /// Set the test register to false.
    False = 0x05,
    /// Halt the script.
    Stop = 0x06,
    /// Deliver to the default mailbox.
    Keep = 0x07,
    /// Cancel the implicit keep.
    Discard = 0x08,
    /// Forward the message to an address.
    Redirect = 0x09,
    /// Deliver to a named mailbox.
    Fileinto = 0x0a,
    /// The `address` test.
    Address = 0x0b,
    /// The `header` test.
    Header = 0x0c,
    /// The `exists` test.
    Exists = 0x0d,
    /// The `size :over` test.
    SizeOver = 0x0e,
    /// The `size :under` test.
    SizeUnder = 0x0f,
    /// The `envelope` test.
    Envelope = 0x10,
}

impl CoreOp {
    /// The operation's mnemonic, as shown by the disassembler.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Jmp => "JMP",
            Self::JmpTrue => "JMPTRUE",
            Self::JmpFalse => "JMPFALSE",
            Self::Not => "NOT",
            Self::True => "TRUE",
            Self::False => "FALSE",
            Self::Stop => "STOP",
            Self::Keep => "KEEP",
            Self::Discard => "DISCARD",
            Self::Redirect => "REDIRECT",
            Self::Fileinto => "FILEINTO",
            Self::Address => "ADDRESS",
            Self::Header => "HEADER",
            Self::Exists => "EXISTS",
            Self::SizeOver => "SIZEOVER",
            Self::SizeUnder => "SIZEUNDER",
            Self::Envelope => "ENVELOPE",
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => Self::Jmp,
            0x01 => Self::JmpTrue,
            0x02 => Self::JmpFalse,
            0x03 => Self::Not,
            0x04 => Self::True,
            0x05 => Self::False,
            0x06 => Self::Stop,
            0x07 => Self::Keep,
            0x08 => Self::Discard,
            0x09 => Self::Redirect,
            0x0a => Self::Fileinto,
            0x0b => Self::Address,
            0x0c => Self::Header,
            0x0d => Self::Exists,
            0x0e => Self::SizeOver,
            0x0f => Self::SizeUnder,
            0x10 => Self::Envelope,
            _ => return None,
        })
    }
}

impl Display for CoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One decoded opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// A core operation.
    Core(CoreOp),
    /// An extension operation: index into the binary's extension index
    /// plus the extension-local operation code.
    Ext {
        /// Extension-local index within the binary.
        ext: u8,
        /// Operation code local to that extension.
        code: u32,
    },
}

/// Operand classes. Every operand starts with its class byte; class
/// `End` doubles as the optional-operand block terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperandClass {
    /// No operand / end of an optional block.
    End = 0x00,
    /// A packed unsigned integer.
    Number = 0x01,
    /// A length-prefixed string.
    String = 0x02,
    /// A counted list of strings.
    StringList = 0x03,
    /// A comparator object reference.
    Comparator = 0x04,
    /// A match-type object reference.
    MatchType = 0x05,
    /// An address-part object reference.
    AddressPart = 0x06,
    /// A side-effect object reference plus its private payload.
    SideEffect = 0x07,
}

impl OperandClass {
    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => Self::End,
            0x01 => Self::Number,
            0x02 => Self::String,
            0x03 => Self::StringList,
            0x04 => Self::Comparator,
            0x05 => Self::MatchType,
            0x06 => Self::AddressPart,
            0x07 => Self::SideEffect,
            _ => return None,
        })
    }
}

impl Display for OperandClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::End => "end",
            Self::Number => "number",
            Self::String => "string",
            Self::StringList => "string list",
            Self::Comparator => "comparator",
            Self::MatchType => "match type",
            Self::AddressPart => "address part",
            Self::SideEffect => "side effect",
        })
    }
}
