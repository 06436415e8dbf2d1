//! Bounds-checked access to a guest's linear memory.

use std::ops::{Bound, RangeBounds};

use crate::error::{Result, SandboxError};

/// A window over the guest's linear memory for the duration of one host call.
///
/// Addresses are absolute 32-bit offsets. Every access is checked against
/// the current memory size; nothing here can read or write past the end.
pub struct MemoryView<'a> {
    data: &'a mut [u8],
}

impl<'a> MemoryView<'a> {
    /// Wrap a linear memory buffer.
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Current memory size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the guest has no memory pages.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn check(&self, offset: u32, len: usize) -> Result<std::ops::Range<usize>> {
        let start = offset as usize;
        start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .map(|end| start..end)
            .ok_or(SandboxError::OutOfBounds {
                offset: u64::from(offset),
                len: len as u64,
                size: self.data.len(),
            })
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn read(&self, offset: u32, len: usize) -> Result<&[u8]> {
        let range = self.check(offset, len)?;
        Ok(&self.data[range])
    }

    /// Mutably borrow `len` bytes starting at `offset`.
    pub fn read_mut(&mut self, offset: u32, len: usize) -> Result<&mut [u8]> {
        let range = self.check(offset, len)?;
        Ok(&mut self.data[range])
    }

    /// Copy `bytes` into memory at `offset`.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        self.read_mut(offset, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Read a little-endian u32.
    pub fn read_u32(&self, offset: u32) -> Result<u32> {
        let raw = self.read(offset, 4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Write a little-endian u32.
    pub fn write_u32(&mut self, offset: u32, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Read a little-endian u64.
    pub fn read_u64(&self, offset: u32) -> Result<u64> {
        let raw = self.read(offset, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(u64::from_le_bytes(buf))
    }

    /// Write a little-endian u64.
    pub fn write_u64(&mut self, offset: u32, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Resolve a range relative to `base` into absolute bounds.
    ///
    /// An unbounded end runs to the end of memory. Both ends are checked.
    pub(crate) fn resolve<R: RangeBounds<u32>>(&self, base: u32, range: R) -> Result<(u32, usize)> {
        let start = match range.start_bound() {
            Bound::Included(&s) => u64::from(s),
            Bound::Excluded(&s) => u64::from(s) + 1,
            Bound::Unbounded => 0,
        } + u64::from(base);
        let end = match range.end_bound() {
            Bound::Included(&e) => u64::from(base) + u64::from(e) + 1,
            Bound::Excluded(&e) => u64::from(base) + u64::from(e),
            Bound::Unbounded => self.data.len() as u64,
        };
        let out_of_bounds = || SandboxError::OutOfBounds {
            offset: start,
            len: end.saturating_sub(start),
            size: self.data.len(),
        };
        if start > end || end > self.data.len() as u64 {
            return Err(out_of_bounds());
        }
        let start = u32::try_from(start).map_err(|_| out_of_bounds())?;
        Ok((start, (end - u64::from(start)) as usize))
    }
}
