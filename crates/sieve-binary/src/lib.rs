//! The compiled form of a Sieve script.
//!
//! A [`Binary`] is an append-only byte buffer plus an *extension index*:
//! the ordered list of extension names whose operations or operands
//! appear in the code. Extensions are referenced from the code by their
//! position in that index, so the index is what ties a binary to the set
//! of extensions the runtime must know about.
//!
//! The wire format is internal and versioned:
//!
//! ```text
//! magic "SVBC" | version u16 BE | ext_count u16 BE
//! ext names: (packed length + bytes) * ext_count
//! code: opcode stream
//! ```
//!
//! Unsigned integers are packed as 7-bit groups, least significant
//! first, with the high bit of each byte marking continuation. Strings
//! are packed-length-prefixed UTF-8. Jump offsets are fixed-width
//! 4-byte big-endian signed values, relative to the byte after the
//! offset slot, so the generator can reserve a slot and back-patch it.

#![warn(missing_docs)]

mod binary;
mod error;
mod opcode;
mod reader;

pub use binary::{Binary, JumpSlot};
pub use error::BinaryError;
pub use opcode::{CoreOp, Opcode, OperandClass, EXT_OPCODE_BASE};
pub use reader::BinaryReader;

/// The four magic bytes that begin every saved binary.
pub const MAGIC: [u8; 4] = *b"SVBC";

/// The current binary format version.
pub const VERSION: u16 = 1;
