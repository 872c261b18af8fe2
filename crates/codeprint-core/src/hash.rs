//! BLAKE3 fingerprints and the deterministic byte encoding fed to them
//!
//! Every variable-length field is length-prefixed and every hash kind carries
//! its own domain tag, so differently-structured inputs never share a byte
//! string.

use crate::model::{CanonicalForm, CmpOp, Collection, Constant, Op, UnresolvedReason};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bumped whenever the encoding below changes.
pub const FORMAT_VERSION: u8 = 1;

/// Domain tags, one per kind of hash input.
mod domain {
    pub const UNIT: &[u8] = b"codeprint/unit";
    pub const CYCLE: &[u8] = b"codeprint/cycle";
    pub const OPAQUE: &[u8] = b"codeprint/opaque";
    pub const UNRESOLVED: &[u8] = b"codeprint/unresolved";
}

/// Body tags.
const BODY_CANONICAL: u8 = 0x01;
const BODY_UNAVAILABLE: u8 = 0x02;

/// A 256-bit content fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Sentinel for references bound outside the fingerprinting domain.
    pub fn opaque() -> Self {
        FingerprintHasher::new(domain::OPAQUE).finalize()
    }

    /// Sentinel for references that could not be bound, one per reason.
    pub fn unresolved(reason: UnresolvedReason) -> Self {
        let mut hasher = FingerprintHasher::new(domain::UNRESOLVED);
        hasher.update_str(reason.as_str());
        hasher.finalize()
    }

    /// First 12 hex characters.
    pub fn short(&self) -> String {
        self.to_string()[..12].to_string()
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(text: &str) -> Option<Self> {
        if text.len() != 64 || !text.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Incremental hasher with the version and domain prefix already applied.
pub struct FingerprintHasher {
    hasher: blake3::Hasher,
}

impl FingerprintHasher {
    fn new(domain: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[FORMAT_VERSION]);
        hasher.update(&(domain.len() as u32).to_le_bytes());
        hasher.update(domain);
        Self { hasher }
    }

    /// Hasher for a single, non-cyclic unit.
    pub fn unit() -> Self {
        Self::new(domain::UNIT)
    }

    /// Hasher for a cyclic strongly connected component.
    pub fn cycle() -> Self {
        Self::new(domain::CYCLE)
    }

    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update(&[value]);
    }

    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(&value.to_le_bytes());
    }

    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(&value.to_le_bytes());
    }

    pub fn update_i128(&mut self, value: i128) {
        self.hasher.update(&value.to_le_bytes());
    }

    pub fn update_len(&mut self, len: usize) {
        self.update_u32(len as u32);
    }

    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.update_len(bytes.len());
        self.hasher.update(bytes);
    }

    pub fn update_str(&mut self, s: &str) {
        self.update_bytes(s.as_bytes());
    }

    pub fn update_fingerprint(&mut self, fingerprint: &Fingerprint) {
        self.hasher.update(fingerprint.as_bytes());
    }

    /// Encode a unit body: either its canonical form or the fixed
    /// "unavailable" sentinel. The failure reason is never hashed.
    pub fn update_body(&mut self, form: Option<&CanonicalForm>) {
        match form {
            Some(form) => {
                self.update_u8(BODY_CANONICAL);
                self.update_form(form);
            }
            None => self.update_u8(BODY_UNAVAILABLE),
        }
    }

    pub fn update_form(&mut self, form: &CanonicalForm) {
        self.update_u32(form.arity);
        self.update_len(form.ops.len());
        for op in &form.ops {
            self.update_op(op);
        }
        self.update_len(form.constants.len());
        for constant in &form.constants {
            self.update_constant(constant);
        }
        self.update_len(form.names.len());
        for name in &form.names {
            self.update_str(name);
        }
    }

    fn update_op(&mut self, op: &Op) {
        match op {
            Op::LoadLocal(slot) => {
                self.update_u8(0x01);
                self.update_u32(*slot);
            }
            Op::LoadFree(depth, slot) => {
                self.update_u8(0x02);
                self.update_u32(*depth);
                self.update_u32(*slot);
            }
            Op::LoadGlobal(index) => {
                self.update_u8(0x03);
                self.update_u32(*index);
            }
            Op::LoadConst(index) => {
                self.update_u8(0x04);
                self.update_u32(*index);
            }
            Op::StoreLocal(slot) => {
                self.update_u8(0x10);
                self.update_u32(*slot);
            }
            Op::StoreFree(depth, slot) => {
                self.update_u8(0x11);
                self.update_u32(*depth);
                self.update_u32(*slot);
            }
            Op::StoreGlobal(index) => {
                self.update_u8(0x12);
                self.update_u32(*index);
            }
            Op::StoreAttr(name) => {
                self.update_u8(0x13);
                self.update_str(name);
            }
            Op::StoreSubscript => self.update_u8(0x14),
            Op::Unpack(n) => {
                self.update_u8(0x15);
                self.update_u32(*n);
            }
            Op::Delete(n) => {
                self.update_u8(0x16);
                self.update_u32(*n);
            }
            Op::Call { args, keywords } => {
                self.update_u8(0x20);
                self.update_u32(*args);
                self.update_u32(*keywords);
            }
            Op::Keyword(name) => {
                self.update_u8(0x21);
                self.update_str(name);
            }
            Op::Splat { double } => {
                self.update_u8(0x22);
                self.update_u8(*double as u8);
            }
            Op::Attr(name) => {
                self.update_u8(0x23);
                self.update_str(name);
            }
            Op::Subscript => self.update_u8(0x24),
            Op::Slice { parts } => {
                self.update_u8(0x25);
                self.update_u32(*parts);
            }
            Op::Binary(op) => {
                self.update_u8(0x26);
                self.update_u8(*op as u8);
            }
            Op::Unary(op) => {
                self.update_u8(0x27);
                self.update_u8(*op as u8);
            }
            Op::Bool { op, operands } => {
                self.update_u8(0x28);
                self.update_u8(*op as u8);
                self.update_u32(*operands);
            }
            Op::Compare(ops) => {
                self.update_u8(0x29);
                self.update_len(ops.len());
                for cmp in ops {
                    self.update_u8(cmp_tag(*cmp));
                }
            }
            Op::Conditional => self.update_u8(0x2a),
            Op::Build { kind, len } => {
                self.update_u8(0x2b);
                self.update_u8(collection_tag(*kind));
                self.update_u32(*len);
            }
            Op::Comprehension { kind, clauses } => {
                self.update_u8(0x2c);
                self.update_u8(collection_tag(*kind));
                self.update_u32(*clauses);
            }
            Op::ForClause => self.update_u8(0x2d),
            Op::IfClause => self.update_u8(0x2e),
            Op::Format { parts } => {
                self.update_u8(0x2f);
                self.update_u32(*parts);
            }
            Op::MakeFunction {
                code,
                defaults,
                decorators,
            } => {
                self.update_u8(0x30);
                self.update_u32(*code);
                self.update_u32(*defaults);
                self.update_u32(*decorators);
            }
            Op::Await => self.update_u8(0x31),
            Op::Yield { from } => {
                self.update_u8(0x32);
                self.update_u8(*from as u8);
            }
            Op::Discard => self.update_u8(0x40),
            Op::Return => self.update_u8(0x41),
            Op::ReturnNone => self.update_u8(0x42),
            Op::Pass => self.update_u8(0x43),
            Op::Break => self.update_u8(0x44),
            Op::Continue => self.update_u8(0x45),
            Op::Raise { args } => {
                self.update_u8(0x46);
                self.update_u32(*args);
            }
            Op::Assert => self.update_u8(0x47),
            Op::If => self.update_u8(0x48),
            Op::Else => self.update_u8(0x49),
            Op::While => self.update_u8(0x4a),
            Op::For => self.update_u8(0x4b),
            Op::Try => self.update_u8(0x4c),
            Op::Except { typed, bound } => {
                self.update_u8(0x4d);
                self.update_u8(*typed as u8);
                self.update_u8(*bound as u8);
            }
            Op::Finally => self.update_u8(0x4e),
            Op::With { items } => {
                self.update_u8(0x4f);
                self.update_u32(*items);
            }
            Op::End => self.update_u8(0x50),
            Op::Node { kind, children } => {
                self.update_u8(0x7f);
                self.update_str(kind);
                self.update_u32(*children);
            }
        }
    }

    fn update_constant(&mut self, constant: &Constant) {
        match constant {
            Constant::None => self.update_u8(0x01),
            Constant::Bool(value) => {
                self.update_u8(0x02);
                self.update_u8(*value as u8);
            }
            Constant::Int(value) => {
                self.update_u8(0x03);
                self.update_i128(*value);
            }
            Constant::BigInt(text) => {
                self.update_u8(0x04);
                self.update_str(text);
            }
            Constant::Float(bits) => {
                self.update_u8(0x05);
                self.update_u64(*bits);
            }
            Constant::Imaginary(bits) => {
                self.update_u8(0x06);
                self.update_u64(*bits);
            }
            Constant::Str(text) => {
                self.update_u8(0x07);
                self.update_str(text);
            }
            Constant::Bytes(bytes) => {
                self.update_u8(0x08);
                self.update_bytes(bytes);
            }
            Constant::Ellipsis => self.update_u8(0x09),
            Constant::Code(form) => {
                self.update_u8(0x0a);
                self.update_form(form);
            }
        }
    }

    pub fn finalize(self) -> Fingerprint {
        Fingerprint(*self.hasher.finalize().as_bytes())
    }
}

fn cmp_tag(op: CmpOp) -> u8 {
    op as u8
}

fn collection_tag(kind: Collection) -> u8 {
    kind as u8
}
