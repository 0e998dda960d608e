use crate::{
    error::BinaryError,
    opcode::{CoreOp, Opcode, OperandClass, EXT_OPCODE_BASE},
};

/// A cursor over a binary's code bytes.
///
/// Every `read_*` either returns the decoded value and advances the
/// cursor, or returns a [`BinaryError`] carrying the offset the read
/// started at. The cursor position doubles as the interpreter's program
/// counter.
#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub(crate) fn new(code: &'a [u8], pos: usize) -> Self {
        Self { code, pos }
    }

    /// The current offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// True when the cursor has consumed all code.
    pub fn at_end(&self) -> bool {
        self.pos >= self.code.len()
    }

    /// Moves the cursor to an absolute offset. The end-of-code position
    /// is a valid target (the program simply ends there).
    pub fn seek(&mut self, pos: usize) -> Result<(), BinaryError> {
        if pos > self.code.len() {
            return Err(BinaryError::BadAddress { at: pos });
        }
        self.pos = pos;
        Ok(())
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8, BinaryError> {
        let b = *self
            .code
            .get(self.pos)
            .ok_or(BinaryError::UnexpectedEnd { at: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    /// Reads a packed unsigned integer.
    pub fn read_packed(&mut self) -> Result<u64, BinaryError> {
        let at = self.pos;
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let b = self.read_u8().map_err(|_| BinaryError::UnexpectedEnd { at })?;
            let group = u64::from(b & 0x7f);
            if shift >= 64 || (shift == 63 && group > 1) {
                return Err(BinaryError::IntegerOverflow { at });
            }
            value |= group << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Reads a fixed-width signed jump offset.
    pub fn read_offset(&mut self) -> Result<i32, BinaryError> {
        let at = self.pos;
        let bytes = self
            .code
            .get(self.pos..self.pos + 4)
            .ok_or(BinaryError::UnexpectedEnd { at })?;
        self.pos += 4;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a packed-length-prefixed string.
    pub fn read_string(&mut self) -> Result<String, BinaryError> {
        let at = self.pos;
        let len = usize::try_from(self.read_packed()?)
            .map_err(|_| BinaryError::IntegerOverflow { at })?;
        let bytes = self
            .code
            .get(self.pos..self.pos.checked_add(len).ok_or(BinaryError::UnexpectedEnd { at })?)
            .ok_or(BinaryError::UnexpectedEnd { at })?;
        self.pos += len;
        String::from_utf8(bytes.to_vec()).map_err(|_| BinaryError::InvalidUtf8 { at })
    }

    /// Reads an opcode: a core operation, or an extension marker byte
    /// followed by the extension-local code.
    pub fn read_opcode(&mut self) -> Result<Opcode, BinaryError> {
        let at = self.pos;
        let b = self.read_u8()?;
        if b >= EXT_OPCODE_BASE {
            let code = u32::try_from(self.read_packed()?)
                .map_err(|_| BinaryError::IntegerOverflow { at })?;
            return Ok(Opcode::Ext {
                ext: b - EXT_OPCODE_BASE,
                code,
            });
        }
        CoreOp::from_byte(b)
            .map(Opcode::Core)
            .ok_or(BinaryError::InvalidOpcode { code: b, at })
    }

    /// Reads an operand class byte, requiring it to be `want`.
    pub fn expect_class(&mut self, want: OperandClass) -> Result<(), BinaryError> {
        let at = self.pos;
        let got = self.read_u8()?;
        if got == want as u8 {
            Ok(())
        } else {
            Err(BinaryError::UnexpectedOperand { want, got, at })
        }
    }

    /// Reads a number operand.
    pub fn read_number_operand(&mut self) -> Result<u64, BinaryError> {
        self.expect_class(OperandClass::Number)?;
        self.read_packed()
    }

    /// Reads a string operand.
    pub fn read_string_operand(&mut self) -> Result<String, BinaryError> {
        self.expect_class(OperandClass::String)?;
        self.read_string()
    }

    /// Reads a string-list operand.
    pub fn read_string_list_operand(&mut self) -> Result<Vec<String>, BinaryError> {
        self.expect_class(OperandClass::StringList)?;
        let at = self.pos;
        let count = usize::try_from(self.read_packed()?)
            .map_err(|_| BinaryError::IntegerOverflow { at })?;
        if count > self.code.len() - self.pos {
            // More entries than remaining bytes means a corrupt count.
            return Err(BinaryError::UnexpectedEnd { at });
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.read_string()?);
        }
        Ok(items)
    }

    /// Reads an object operand of the given class. Returns the owner
    /// tag (0 = core, `n + 1` = binary extension index `n`) and the
    /// object code.
    pub fn read_object_operand(&mut self, class: OperandClass) -> Result<(u32, u32), BinaryError> {
        self.expect_class(class)?;
        let at = self.pos;
        let owner = u32::try_from(self.read_packed()?)
            .map_err(|_| BinaryError::IntegerOverflow { at })?;
        let code = u32::try_from(self.read_packed()?)
            .map_err(|_| BinaryError::IntegerOverflow { at })?;
        Ok((owner, code))
    }

    /// Peeks the class byte of the next operand without consuming it.
    pub fn peek_class(&self) -> Result<Option<OperandClass>, BinaryError> {
        match self.code.get(self.pos) {
            Some(&b) => Ok(OperandClass::from_byte(b)),
            None => Err(BinaryError::UnexpectedEnd { at: self.pos }),
        }
    }

    /// Reads the next optional-operand code; `None` marks the end of
    /// the block.
    pub fn read_opt_code(&mut self) -> Result<Option<u64>, BinaryError> {
        match self.read_packed()? {
            0 => Ok(None),
            code => Ok(Some(code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Binary;

    #[test]
    fn truncated_reads_report_offset() {
        let mut b = Binary::new();
        b.emit_u8(OperandClass::String as u8);
        b.emit_packed(100);
        let err = b.reader(0).read_string_operand().unwrap_err();
        assert!(matches!(err, BinaryError::UnexpectedEnd { .. }));
    }

    #[test]
    fn wrong_operand_class() {
        let mut b = Binary::new();
        b.emit_number_operand(3);
        let err = b.reader(0).read_string_operand().unwrap_err();
        assert_eq!(
            err,
            BinaryError::UnexpectedOperand {
                want: OperandClass::String,
                got: OperandClass::Number as u8,
                at: 0,
            }
        );
    }

    #[test]
    fn packed_overflow() {
        let mut b = Binary::new();
        for _ in 0..10 {
            b.emit_u8(0xff);
        }
        b.emit_u8(0x7f);
        assert!(matches!(
            b.reader(0).read_packed(),
            Err(BinaryError::IntegerOverflow { .. })
        ));
    }

    #[test]
    fn seek_bounds() {
        let mut b = Binary::new();
        b.emit_u8(0);
        let mut r = b.reader(0);
        assert!(r.seek(1).is_ok());
        assert!(r.at_end());
        assert!(matches!(r.seek(2), Err(BinaryError::BadAddress { .. })));
    }

    #[test]
    fn optional_block_codes() {
        let mut b = Binary::new();
        b.emit_opt_code(2);
        b.emit_opt_end();
        let mut r = b.reader(0);
        assert_eq!(r.read_opt_code().unwrap(), Some(2));
        assert_eq!(r.read_opt_code().unwrap(), None);
    }
}
