//! The binary disassembler.
//!
//! Emission is deterministic, so the dump of a binary is stable and
//! two compiles of the same script dump identically. Useful for
//! debugging scripts and for golden tests.

use std::{fmt, io::Write, sync::Arc};

use sieve_binary::{Binary, BinaryError, BinaryReader, CoreOp, Opcode, OperandClass};

use crate::{
    address_part::{AP_ALL, AP_DOMAIN, AP_LOCALPART},
    comparator::{CMP_ASCII_CASEMAP, CMP_OCTET},
    extension::{Extension, ExtensionRegistry},
    match_type::{MT_CONTAINS, MT_IS, MT_MATCHES},
    tsts::{OPT_ADDRESS_PART, OPT_COMPARATOR, OPT_MATCH_TYPE},
};

/// Errors while disassembling.
#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error(transparent)]
    Binary(#[from] BinaryError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The binary references an extension the registry lacks.
    #[error("binary requires unknown extension `{0}`")]
    UnknownExtension(String),
    /// The code decoded to something no operation understands.
    #[error("unrecognized operand near {at:#06x}")]
    Corrupt {
        /// Offset of the unrecognized data.
        at: usize,
    },
}

/// Disassembles a binary to `out`.
pub fn dump(
    binary: &Binary,
    registry: &ExtensionRegistry,
    out: &mut dyn Write,
) -> Result<(), DumpError> {
    let mut exts = Vec::with_capacity(binary.extensions().len());
    for name in binary.extensions() {
        let ext = registry
            .get(name)
            .ok_or_else(|| DumpError::UnknownExtension(name.clone()))?;
        exts.push(ext);
    }
    let mut dumper = Dumper {
        reader: binary.reader(0),
        exts,
        out,
    };
    dumper.run(binary)
}

/// Disassembly state handed to extension operations.
pub struct Dumper<'a, 'w> {
    reader: BinaryReader<'a>,
    exts: Vec<Arc<dyn Extension>>,
    out: &'w mut dyn Write,
}

impl<'a> Dumper<'a, '_> {
    fn run(&mut self, binary: &Binary) -> Result<(), DumpError> {
        for (i, name) in binary.extensions().iter().enumerate() {
            writeln!(self.out, "; extension {i}: {name}")?;
        }
        while !self.reader.at_end() {
            let pc = self.reader.position();
            match self.reader.read_opcode()? {
                Opcode::Core(op) => {
                    writeln!(self.out, "{pc:08x}  {op}")?;
                    self.dump_core_operands(op)?;
                }
                Opcode::Ext { ext, code } => {
                    let extension = self
                        .exts
                        .get(usize::from(ext))
                        .cloned()
                        .ok_or(DumpError::Corrupt { at: pc })?;
                    let Some(op) = extension.operation(code) else {
                        return Err(DumpError::Corrupt { at: pc });
                    };
                    writeln!(self.out, "{pc:08x}  {}", op.name())?;
                    op.dump(self)?;
                }
            }
        }
        Ok(())
    }

    fn dump_core_operands(&mut self, op: CoreOp) -> Result<(), DumpError> {
        match op {
            CoreOp::Jmp | CoreOp::JmpTrue | CoreOp::JmpFalse => {
                let offset = self.reader.read_offset()?;
                let target = self.reader.position() as i64 + i64::from(offset);
                self.write_line(format_args!("to: {target:08x}"))?;
            }
            CoreOp::Not | CoreOp::True | CoreOp::False | CoreOp::Stop => {}
            CoreOp::Keep => {
                self.dump_source_line()?;
                self.dump_delivery_optionals()?;
            }
            CoreOp::Discard => self.dump_source_line()?,
            CoreOp::Redirect => {
                self.dump_source_line()?;
                self.dump_string("address")?;
            }
            CoreOp::Fileinto => {
                self.dump_source_line()?;
                self.dump_delivery_optionals()?;
                self.dump_string("mailbox")?;
            }
            CoreOp::Address | CoreOp::Envelope => {
                self.dump_match_optionals(true)?;
                self.dump_string_list("names")?;
                self.dump_string_list("keys")?;
            }
            CoreOp::Header => {
                self.dump_match_optionals(false)?;
                self.dump_string_list("names")?;
                self.dump_string_list("keys")?;
            }
            CoreOp::Exists => self.dump_string_list("names")?,
            CoreOp::SizeOver | CoreOp::SizeUnder => self.dump_number("limit")?,
        }
        Ok(())
    }

    /// The operand reader.
    pub fn reader(&mut self) -> &mut BinaryReader<'a> {
        &mut self.reader
    }

    /// Writes one indented operand line.
    pub fn write_line(&mut self, message: fmt::Arguments<'_>) -> Result<(), DumpError> {
        writeln!(self.out, "          {message}")?;
        Ok(())
    }

    /// An error for an operand the current operation cannot decode.
    pub fn unknown_operand(&self) -> DumpError {
        DumpError::Corrupt {
            at: self.reader.position(),
        }
    }

    /// Dumps a number operand.
    pub fn dump_number(&mut self, label: &str) -> Result<(), DumpError> {
        let n = self.reader.read_number_operand()?;
        self.write_line(format_args!("{label}: {n}"))
    }

    /// Dumps a string operand.
    pub fn dump_string(&mut self, label: &str) -> Result<(), DumpError> {
        let s = self.reader.read_string_operand()?;
        self.write_line(format_args!("{label}: \"{}\"", s.escape_debug()))
    }

    /// Dumps a string-list operand.
    pub fn dump_string_list(&mut self, label: &str) -> Result<(), DumpError> {
        let items = self.reader.read_string_list_operand()?;
        let rendered: Vec<String> = items.iter().map(|s| format!("\"{}\"", s.escape_debug())).collect();
        self.write_line(format_args!("{label}: [{}]", rendered.join(", ")))
    }

    /// Dumps the packed source-line operand of action operations.
    pub fn dump_source_line(&mut self) -> Result<(), DumpError> {
        let line = self.reader.read_packed()?;
        self.write_line(format_args!("line: {line}"))
    }

    /// Dumps the comparator/match-type/address-part optional block.
    pub fn dump_match_optionals(&mut self, with_address_part: bool) -> Result<(), DumpError> {
        while let Some(code) = self.reader.read_opt_code()? {
            match code {
                OPT_COMPARATOR => self.dump_object(OperandClass::Comparator, "comparator")?,
                OPT_MATCH_TYPE => self.dump_object(OperandClass::MatchType, "match type")?,
                OPT_ADDRESS_PART if with_address_part => {
                    self.dump_object(OperandClass::AddressPart, "address part")?;
                }
                _ => return Err(self.unknown_operand()),
            }
        }
        Ok(())
    }

    fn dump_delivery_optionals(&mut self) -> Result<(), DumpError> {
        while let Some(code) = self.reader.read_opt_code()? {
            if code != crate::action::OPT_SIDE_EFFECTS {
                return Err(self.unknown_operand());
            }
            let count = self.reader.read_packed()?;
            for _ in 0..count {
                let (owner, se_code) = self
                    .reader
                    .read_object_operand(OperandClass::SideEffect)?;
                let Some(ext) = owner
                    .checked_sub(1)
                    .and_then(|i| self.exts.get(i as usize))
                    .cloned()
                else {
                    return Err(self.unknown_operand());
                };
                self.write_line(format_args!("side effect ({})", ext.name()))?;
                if !ext.dump_side_effect(se_code, self)? {
                    return Err(self.unknown_operand());
                }
            }
        }
        Ok(())
    }

    fn dump_object(&mut self, class: OperandClass, label: &str) -> Result<(), DumpError> {
        let (owner, code) = self.reader.read_object_operand(class)?;
        if owner == 0 {
            if let Some(name) = core_object_name(class, code) {
                return self.write_line(format_args!("{label}: {name}"));
            }
            return self.write_line(format_args!("{label}: core object {code}"));
        }
        match self.exts.get(owner as usize - 1) {
            Some(ext) => self.write_line(format_args!("{label}: {} object {code}", ext.name())),
            None => Err(self.unknown_operand()),
        }
    }
}

fn core_object_name(class: OperandClass, code: u32) -> Option<&'static str> {
    match class {
        OperandClass::Comparator => match code {
            CMP_OCTET => Some("i;octet"),
            CMP_ASCII_CASEMAP => Some("i;ascii-casemap"),
            _ => None,
        },
        OperandClass::MatchType => match code {
            MT_IS => Some(":is"),
            MT_CONTAINS => Some(":contains"),
            MT_MATCHES => Some(":matches"),
            _ => None,
        },
        OperandClass::AddressPart => match code {
            AP_ALL => Some(":all"),
            AP_LOCALPART => Some(":localpart"),
            AP_DOMAIN => Some(":domain"),
            _ => None,
        },
        _ => None,
    }
}
