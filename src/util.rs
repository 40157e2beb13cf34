//! Small binary and arithmetic helpers shared by the Mach-O and prelink code.
//!
//! - Unaligned little-endian reads (via byteorder)
//! - NUL-terminated string scanning (via memchr)
//! - Overflow-checked alignment and size arithmetic
//! - Lowercase hexadecimal formatting for plist integers

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

// =============================================================================
// Unaligned Reads
// =============================================================================

/// Reads a little-endian u32 from a byte slice at the given offset.
///
/// Returns `None` if fewer than 4 bytes are available.
#[inline(always)]
pub fn read_u32_le_at(data: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    data.get(offset..end).map(LittleEndian::read_u32)
}

// =============================================================================
// Byte Search
// =============================================================================

/// Finds the position of the first null byte in a slice.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Reads a NUL-terminated string starting at `offset`.
///
/// Returns `None` if the offset is out of bounds or the bytes are not UTF-8.
pub fn c_str_at(data: &[u8], offset: usize) -> Option<&str> {
    let tail = data.get(offset..)?;
    std::str::from_utf8(&tail[..memchr_null(tail)]).ok()
}

// =============================================================================
// Alignment Utilities
// =============================================================================

/// Aligns a value up to the given power-of-two alignment.
///
/// Returns `None` instead of wrapping past `u64::MAX`.
#[inline(always)]
pub const fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

/// Aligns a 32-bit size up to the given power-of-two alignment.
#[inline(always)]
pub const fn checked_align_up_u32(value: u32, alignment: u32) -> Option<u32> {
    debug_assert!(alignment.is_power_of_two());
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

/// Aligns a 32-bit size up, surfacing overflow as [`Error::CapacityOverflow`].
#[inline]
pub fn align_size(value: u32, alignment: u32) -> Result<u32> {
    checked_align_up_u32(value, alignment).ok_or(Error::CapacityOverflow)
}

/// Adds two 32-bit sizes, surfacing overflow as [`Error::CapacityOverflow`].
#[inline]
pub fn add_size(a: u32, b: u32) -> Result<u32> {
    a.checked_add(b).ok_or(Error::CapacityOverflow)
}

// =============================================================================
// Formatting
// =============================================================================

/// Formats a value as lowercase `0x`-prefixed hexadecimal.
#[inline]
pub fn lower_hex(value: u64) -> String {
    format!("{value:#x}")
}
