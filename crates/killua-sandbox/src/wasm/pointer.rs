//! Memory-backed composites: guest pointers and byte slices.

use std::fmt;
use std::ops::RangeBounds;

use super::bind::{next_leaf, Binding, BindingTree, WasmLift, WasmLower, WasmType};
use super::memory::MemoryView;
use super::value::{decode_leaves, encode_leaves, mismatch, to_signed, to_unsigned, WasmKind, WasmValue};
use crate::error::{Result, SandboxError};

/// An unsigned 32-bit address into guest memory.
///
/// The pointer itself owns nothing; reads and writes go through a
/// [`MemoryView`] supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WasmPtr(u32);

impl WasmPtr {
    /// Pointer to `address`.
    pub const fn new(address: u32) -> Self {
        Self(address)
    }

    /// The absolute address.
    pub const fn address(self) -> u32 {
        self.0
    }

    /// A new pointer `bytes` further along. Wraps like guest arithmetic does.
    pub const fn offset(self, bytes: u32) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Read a `T` laid out leaf by leaf at this address.
    pub fn read<T: WasmLift + 'static>(self, memory: &MemoryView<'_>) -> Result<T> {
        let tree = BindingTree::of::<T>()?;
        let width = tree.signature().iter().map(|k| k.size()).sum();
        let bytes = memory.read(self.0, width)?;
        let leaves = decode_leaves(tree.signature(), bytes)?;
        T::lift(memory, &mut leaves.into_iter())
    }

    /// Write `value` leaf by leaf at this address.
    pub fn write<T: WasmLower + 'static>(self, memory: &mut MemoryView<'_>, value: &T) -> Result<()> {
        let leaves = super::bind::lower_value(value)?;
        memory.write(self.0, &encode_leaves(&leaves))
    }

    /// Bytes in `range`, relative to this pointer.
    ///
    /// An open end runs to the end of memory.
    pub fn get<'m, R>(self, memory: &'m MemoryView<'_>, range: R) -> Result<&'m [u8]>
    where
        R: RangeBounds<u32>,
    {
        let (start, len) = memory.resolve(self.0, range)?;
        memory.read(start, len)
    }

    /// Every `step`th byte in `range`, relative to this pointer.
    pub fn get_stepped<R>(self, memory: &MemoryView<'_>, range: R, step: usize) -> Result<Vec<u8>>
    where
        R: RangeBounds<u32>,
    {
        if step == 0 {
            return Err(SandboxError::ZeroStep);
        }
        Ok(self.get(memory, range)?.iter().step_by(step).copied().collect())
    }

    /// Single byte at `index`, relative to this pointer.
    pub fn byte(self, memory: &MemoryView<'_>, index: u32) -> Result<u8> {
        Ok(memory.read(self.offset(index).0, 1)?[0])
    }

    /// Overwrite the bytes in `range`, relative to this pointer.
    ///
    /// The range length must equal `bytes.len()`. An open end takes its
    /// length from `bytes`.
    pub fn set<R>(self, memory: &mut MemoryView<'_>, range: R, bytes: &[u8]) -> Result<()>
    where
        R: RangeBounds<u32>,
    {
        let (start, len) = match range.end_bound() {
            std::ops::Bound::Unbounded => {
                let (start, _) = memory.resolve(self.0, (range.start_bound().cloned(), std::ops::Bound::Unbounded))?;
                (start, bytes.len())
            }
            _ => memory.resolve(self.0, range)?,
        };
        if len != bytes.len() {
            return Err(SandboxError::ArgumentCount {
                expected: len,
                found: bytes.len(),
            });
        }
        memory.write(start, bytes)
    }
}

impl fmt::Display for WasmPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl WasmType for WasmPtr {
    fn binding() -> Binding {
        Binding::Pointer
    }
}

impl WasmLower for WasmPtr {
    fn lower(&self, out: &mut Vec<WasmValue>) -> Result<()> {
        out.push(WasmValue::I32(to_signed(self.0)));
        Ok(())
    }
}

impl WasmLift for WasmPtr {
    fn lift<I>(_memory: &MemoryView<'_>, values: &mut I) -> Result<Self>
    where
        I: Iterator<Item = WasmValue>,
    {
        match next_leaf::<Self, I>(values)? {
            WasmValue::I32(raw) => Ok(Self(to_unsigned(raw))),
            other => Err(mismatch(WasmKind::I32, other.kind())),
        }
    }
}

/// A `(pointer, length)` description of guest bytes.
///
/// Like [`WasmPtr`], a slice does not own memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WasmSlice {
    /// Start of the bytes
    pub ptr: WasmPtr,
    /// Number of bytes
    pub len: u32,
}

impl WasmSlice {
    /// Describe `len` bytes at `ptr`.
    pub const fn new(ptr: WasmPtr, len: u32) -> Self {
        Self { ptr, len }
    }

    /// Borrow the described bytes.
    pub fn bytes<'m>(&self, memory: &'m MemoryView<'_>) -> Result<&'m [u8]> {
        memory.read(self.ptr.address(), self.len as usize)
    }

    /// Decode the described bytes as UTF-8, replacing invalid sequences.
    pub fn to_string_lossy(&self, memory: &MemoryView<'_>) -> Result<String> {
        Ok(String::from_utf8_lossy(self.bytes(memory)?).into_owned())
    }
}

impl WasmType for WasmSlice {
    fn binding() -> Binding {
        Binding::Slice
    }
}

impl WasmLower for WasmSlice {
    fn lower(&self, out: &mut Vec<WasmValue>) -> Result<()> {
        self.ptr.lower(out)?;
        self.len.lower(out)
    }
}

impl WasmLift for WasmSlice {
    fn lift<I>(memory: &MemoryView<'_>, values: &mut I) -> Result<Self>
    where
        I: Iterator<Item = WasmValue>,
    {
        let ptr = WasmPtr::lift(memory, values)?;
        let len = u32::lift(memory, values)?;
        Ok(Self { ptr, len })
    }
}
