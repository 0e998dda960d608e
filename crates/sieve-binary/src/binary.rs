use crate::{
    error::BinaryError,
    opcode::{CoreOp, OperandClass, EXT_OPCODE_BASE},
    reader::BinaryReader,
    MAGIC, VERSION,
};

/// A reserved, not yet patched jump offset slot.
///
/// Returned by [`Binary::reserve_jump`]; the generator must hand every
/// slot back to [`Binary::patch_jump`] before generation completes.
#[derive(Debug)]
#[must_use = "a reserved jump slot must be patched"]
pub struct JumpSlot(usize);

/// A compiled script: code bytes plus the extension index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Binary {
    code: Vec<u8>,
    extensions: Vec<String>,
}

impl Binary {
    /// Creates an empty binary.
    pub fn new() -> Self {
        Self::default()
    }

    /// The code bytes, without the container header.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// The extension names this binary references, in index order.
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// The current emission offset (the next opcode's address).
    pub fn position(&self) -> usize {
        self.code.len()
    }

    /// Returns a reader positioned at `pos`.
    pub fn reader(&self, pos: usize) -> BinaryReader<'_> {
        BinaryReader::new(&self.code, pos)
    }

    /// Adds an extension to the index, or returns its existing local
    /// index. The index can hold at most 127 extensions, bounded by the
    /// opcode byte encoding.
    pub fn link_extension(&mut self, name: &str) -> Result<u8, BinaryError> {
        if let Some(i) = self.extension_index(name) {
            return Ok(i);
        }
        let idx = self.extensions.len();
        if idx >= usize::from(u8::MAX - EXT_OPCODE_BASE) {
            return Err(BinaryError::TooManyExtensions);
        }
        self.extensions.push(name.to_owned());
        Ok(idx as u8)
    }

    /// Looks up an extension's local index.
    pub fn extension_index(&self, name: &str) -> Option<u8> {
        self.extensions.iter().position(|n| n == name).map(|i| i as u8)
    }

    // --- primitive emitters ---

    /// Appends one byte.
    pub fn emit_u8(&mut self, b: u8) {
        self.code.push(b);
    }

    /// Appends a packed unsigned integer (7-bit groups, LSB first,
    /// continuation in the high bit).
    pub fn emit_packed(&mut self, n: u64) {
        pack_into(&mut self.code, n);
    }

    /// Appends a packed-length-prefixed string.
    pub fn emit_string(&mut self, s: &str) {
        self.emit_packed(s.len() as u64);
        self.code.extend_from_slice(s.as_bytes());
    }

    /// Appends a core opcode.
    pub fn emit_core_op(&mut self, op: CoreOp) {
        self.code.push(op as u8);
    }

    /// Appends an extension opcode: the marker byte addressing the
    /// extension index, then the extension-local operation code.
    pub fn emit_ext_op(&mut self, ext: u8, code: u32) {
        self.code.push(EXT_OPCODE_BASE + ext);
        self.emit_packed(u64::from(code));
    }

    // --- operand emitters ---

    /// Appends a number operand.
    pub fn emit_number_operand(&mut self, n: u64) {
        self.emit_u8(OperandClass::Number as u8);
        self.emit_packed(n);
    }

    /// Appends a string operand.
    pub fn emit_string_operand(&mut self, s: &str) {
        self.emit_u8(OperandClass::String as u8);
        self.emit_string(s);
    }

    /// Appends a string-list operand.
    pub fn emit_string_list_operand(&mut self, items: &[String]) {
        self.emit_u8(OperandClass::StringList as u8);
        self.emit_packed(items.len() as u64);
        for item in items {
            self.emit_string(item);
        }
    }

    /// Appends an object operand: the class byte, then the owner (0 for
    /// core, `n + 1` for binary extension index `n`) and the object
    /// code within its class.
    pub fn emit_object_operand(&mut self, class: OperandClass, owner: u32, code: u32) {
        self.emit_u8(class as u8);
        self.emit_packed(u64::from(owner));
        self.emit_packed(u64::from(code));
    }

    /// Appends a non-zero optional-operand code.
    pub fn emit_opt_code(&mut self, code: u64) {
        debug_assert_ne!(code, 0);
        self.emit_packed(code);
    }

    /// Terminates an optional-operand block.
    pub fn emit_opt_end(&mut self) {
        self.emit_packed(0);
    }

    // --- jumps ---

    /// Reserves a fixed-width jump offset slot at the current position.
    pub fn reserve_jump(&mut self) -> JumpSlot {
        let at = self.code.len();
        self.code.extend_from_slice(&[0xff; 4]);
        JumpSlot(at)
    }

    /// Resolves a reserved slot to jump to `target`. Offsets are
    /// relative to the byte after the slot.
    pub fn patch_jump(&mut self, slot: JumpSlot, target: usize) -> Result<(), BinaryError> {
        let JumpSlot(at) = slot;
        let base = at as i64 + 4;
        let offset = i32::try_from(target as i64 - base)
            .map_err(|_| BinaryError::BadJumpOffset { at })?;
        self.code[at..at + 4].copy_from_slice(&offset.to_be_bytes());
        Ok(())
    }

    // --- container ---

    /// Serializes the binary into its on-disk container format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.code.len() + 64);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_be_bytes());
        out.extend_from_slice(&(self.extensions.len() as u16).to_be_bytes());
        for name in &self.extensions {
            pack_into(&mut out, name.len() as u64);
            out.extend_from_slice(name.as_bytes());
        }
        out.extend_from_slice(&self.code);
        out
    }

    /// Parses a saved binary, verifying magic and version. The
    /// extension names are *not* resolved here; that is the runtime's
    /// job, against its own registry.
    pub fn load(bytes: &[u8]) -> Result<Self, BinaryError> {
        let header = bytes.get(..8).ok_or(BinaryError::BadMagic)?;
        if header[..4] != MAGIC {
            return Err(BinaryError::BadMagic);
        }
        let version = u16::from_be_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(BinaryError::UnsupportedVersion(version));
        }
        let ext_count = usize::from(u16::from_be_bytes([header[6], header[7]]));

        let mut rdr = BinaryReader::new(&bytes[8..], 0);
        let mut extensions = Vec::with_capacity(ext_count);
        for _ in 0..ext_count {
            extensions.push(rdr.read_string()?);
        }
        let code = bytes[8 + rdr.position()..].to_vec();
        Ok(Self { code, extensions })
    }
}

fn pack_into(out: &mut Vec<u8>, mut n: u64) {
    loop {
        let mut b = (n & 0x7f) as u8;
        n >>= 7;
        if n != 0 {
            b |= 0x80;
        }
        out.push(b);
        if n == 0 {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Opcode;

    #[test]
    fn packed_round_trip() {
        for n in [0u64, 1, 0x7f, 0x80, 300, 16384, u32::MAX as u64, u64::MAX] {
            let mut b = Binary::new();
            b.emit_packed(n);
            let mut r = b.reader(0);
            assert_eq!(r.read_packed().unwrap(), n, "value {n}");
            assert!(r.at_end());
        }
    }

    #[test]
    fn string_operand_round_trip() {
        let mut b = Binary::new();
        b.emit_string_operand("héllo");
        assert_eq!(b.reader(0).read_string_operand().unwrap(), "héllo");
    }

    #[test]
    fn string_list_operand_round_trip() {
        let items = vec!["a".to_owned(), "longer value".to_owned()];
        let mut b = Binary::new();
        b.emit_string_list_operand(&items);
        assert_eq!(b.reader(0).read_string_list_operand().unwrap(), items);
    }

    #[test]
    fn opcode_round_trip() {
        let mut b = Binary::new();
        b.emit_core_op(CoreOp::Keep);
        b.emit_ext_op(2, 5);
        let mut r = b.reader(0);
        assert_eq!(r.read_opcode().unwrap(), Opcode::Core(CoreOp::Keep));
        assert_eq!(r.read_opcode().unwrap(), Opcode::Ext { ext: 2, code: 5 });
    }

    #[test]
    fn jump_patching() {
        let mut b = Binary::new();
        b.emit_core_op(CoreOp::JmpFalse);
        let slot = b.reserve_jump();
        b.emit_core_op(CoreOp::Keep);
        let target = b.position();
        b.patch_jump(slot, target).unwrap();

        let mut r = b.reader(1);
        let offset = r.read_offset().unwrap();
        assert_eq!(r.position() as i64 + i64::from(offset), target as i64);
    }

    #[test]
    fn container_round_trip() {
        let mut b = Binary::new();
        assert_eq!(b.link_extension("vacation").unwrap(), 0);
        assert_eq!(b.link_extension("imap4flags").unwrap(), 1);
        assert_eq!(b.link_extension("vacation").unwrap(), 0);
        b.emit_core_op(CoreOp::Stop);

        let bytes = b.to_bytes();
        let loaded = Binary::load(&bytes).unwrap();
        assert_eq!(loaded, b);
    }

    #[test]
    fn bad_magic() {
        assert_eq!(Binary::load(b"NOPE\x00\x01\x00\x00"), Err(BinaryError::BadMagic));
    }

    #[test]
    fn unsupported_version() {
        let mut bytes = Binary::new().to_bytes();
        bytes[5] = 0x63;
        assert!(matches!(
            Binary::load(&bytes),
            Err(BinaryError::UnsupportedVersion(_))
        ));
    }
}
