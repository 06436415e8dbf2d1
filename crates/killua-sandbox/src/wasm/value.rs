//! Raw values of the guest calling convention.
//!
//! Every slot the guest ABI passes is either a 32-bit or a 64-bit integer.
//! The ABI treats them as signed; host code that means an address or a length
//! reinterprets the bit pattern as unsigned by round-tripping through raw
//! bytes rather than by arithmetic.

use std::fmt;

use crate::error::{Result, SandboxError};

/// Kind of a single ABI leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WasmKind {
    /// 32-bit integer slot
    I32,
    /// 64-bit integer slot
    I64,
}

impl WasmKind {
    /// Width of the slot when laid out in linear memory.
    pub const fn size(self) -> usize {
        match self {
            Self::I32 => 4,
            Self::I64 => 8,
        }
    }

    /// Lower-case name used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
        }
    }
}

impl fmt::Display for WasmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single ABI leaf value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WasmValue {
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
}

impl WasmValue {
    /// Kind of this value.
    pub const fn kind(self) -> WasmKind {
        match self {
            Self::I32(_) => WasmKind::I32,
            Self::I64(_) => WasmKind::I64,
        }
    }

    /// Zero value of the given kind.
    pub const fn zero(kind: WasmKind) -> Self {
        match kind {
            WasmKind::I32 => Self::I32(0),
            WasmKind::I64 => Self::I64(0),
        }
    }

    /// Expect a 32-bit slot.
    pub fn as_i32(self) -> Result<i32> {
        match self {
            Self::I32(v) => Ok(v),
            other => Err(mismatch(WasmKind::I32, other.kind())),
        }
    }

    /// Expect a 64-bit slot.
    pub fn as_i64(self) -> Result<i64> {
        match self {
            Self::I64(v) => Ok(v),
            other => Err(mismatch(WasmKind::I64, other.kind())),
        }
    }

    /// Append the little-endian memory encoding of this value.
    pub fn encode_le(self, out: &mut Vec<u8>) {
        match self {
            Self::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    /// Decode one value of `kind` from the start of `bytes`.
    pub fn decode_le(kind: WasmKind, bytes: &[u8]) -> Option<Self> {
        match kind {
            WasmKind::I32 => {
                let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
                Some(Self::I32(i32::from_le_bytes(raw)))
            }
            WasmKind::I64 => {
                let raw: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
                Some(Self::I64(i64::from_le_bytes(raw)))
            }
        }
    }
}

impl fmt::Display for WasmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32(v) => write!(f, "{v}i32"),
            Self::I64(v) => write!(f, "{v}i64"),
        }
    }
}

pub(crate) fn mismatch(expected: WasmKind, found: WasmKind) -> SandboxError {
    SandboxError::KindMismatch {
        expected: expected.name(),
        found: found.name(),
    }
}

/// Reinterpret a signed 32-bit slot as unsigned.
pub fn to_unsigned(value: i32) -> u32 {
    u32::from_be_bytes(value.to_be_bytes())
}

/// Reinterpret an unsigned 32-bit value as a signed slot.
pub fn to_signed(value: u32) -> i32 {
    i32::from_be_bytes(value.to_be_bytes())
}

/// Reinterpret a signed 64-bit slot as unsigned.
pub fn to_unsigned64(value: i64) -> u64 {
    u64::from_be_bytes(value.to_be_bytes())
}

/// Reinterpret an unsigned 64-bit value as a signed slot.
pub fn to_signed64(value: u64) -> i64 {
    i64::from_be_bytes(value.to_be_bytes())
}

/// Decode a flat leaf sequence laid out back to back in memory.
pub fn decode_leaves(kinds: &[WasmKind], bytes: &[u8]) -> Result<Vec<WasmValue>> {
    let mut cursor = 0usize;
    let mut values = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        let value = bytes
            .get(cursor..)
            .and_then(|rest| WasmValue::decode_le(kind, rest))
            .ok_or(SandboxError::OutOfBounds {
                offset: cursor as u64,
                len: kind.size() as u64,
                size: bytes.len(),
            })?;
        values.push(value);
        cursor += kind.size();
    }
    Ok(values)
}

/// Encode a flat leaf sequence back to back.
pub fn encode_leaves(values: &[WasmValue]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.iter().map(|v| v.kind().size()).sum());
    for value in values {
        value.encode_le(&mut out);
    }
    out
}

#[cfg(feature = "wasm")]
mod engine {
    use super::{WasmKind, WasmValue};
    use crate::error::{Result, SandboxError};
    use wasmtime::{Val, ValType};

    impl From<WasmKind> for ValType {
        fn from(kind: WasmKind) -> Self {
            match kind {
                WasmKind::I32 => ValType::I32,
                WasmKind::I64 => ValType::I64,
            }
        }
    }

    impl TryFrom<&ValType> for WasmKind {
        type Error = SandboxError;

        fn try_from(ty: &ValType) -> Result<Self> {
            match ty {
                ValType::I32 => Ok(WasmKind::I32),
                ValType::I64 => Ok(WasmKind::I64),
                other => Err(SandboxError::WasmError(format!(
                    "unsupported ABI type {other:?}"
                ))),
            }
        }
    }

    impl From<WasmValue> for Val {
        fn from(value: WasmValue) -> Self {
            match value {
                WasmValue::I32(v) => Val::I32(v),
                WasmValue::I64(v) => Val::I64(v),
            }
        }
    }

    impl TryFrom<&Val> for WasmValue {
        type Error = SandboxError;

        fn try_from(val: &Val) -> Result<Self> {
            match val {
                Val::I32(v) => Ok(WasmValue::I32(*v)),
                Val::I64(v) => Ok(WasmValue::I64(*v)),
                other => Err(SandboxError::WasmError(format!(
                    "unsupported ABI value {other:?}"
                ))),
            }
        }
    }
}
