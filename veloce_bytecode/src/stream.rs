//! Primitive readers and writers for the Veloce image format.
//!
//! Every multi-byte value in a Veloce image is little-endian. Strings are stored as a signed
//! 32-bit byte length followed by UTF-8 bytes.

use crate::error::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// Read a length-prefixed UTF-8 string.
pub(crate) fn read_string(bytes: &mut Cursor<Vec<u8>>) -> Result<String> {
    let length = bytes.read_i32::<LittleEndian>()?;
    let length = usize::try_from(length)?;
    let mut buffer = vec![0; length];
    bytes.read_exact(&mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Write a length-prefixed UTF-8 string.
pub(crate) fn write_string(bytes: &mut Vec<u8>, value: &str) -> Result<()> {
    let length = i32::try_from(value.len())?;
    bytes.write_i32::<LittleEndian>(length)?;
    bytes.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Read a signed 32-bit count and convert it to `usize`.
pub(crate) fn read_count(bytes: &mut Cursor<Vec<u8>>) -> Result<usize> {
    let count = bytes.read_i32::<LittleEndian>()?;
    Ok(usize::try_from(count)?)
}

/// Write a `usize` count as a signed 32-bit value.
pub(crate) fn write_count(bytes: &mut Vec<u8>, count: usize) -> Result<()> {
    bytes.write_i32::<LittleEndian>(i32::try_from(count)?)?;
    Ok(())
}

/// Read a 32-bit boolean flag; any non-zero value is true.
pub(crate) fn read_flag(bytes: &mut Cursor<Vec<u8>>) -> Result<bool> {
    Ok(bytes.read_i32::<LittleEndian>()? != 0)
}

/// Write a boolean flag as a 32-bit value.
pub(crate) fn write_flag(bytes: &mut Vec<u8>, value: bool) -> Result<()> {
    bytes.write_i32::<LittleEndian>(i32::from(value))?;
    Ok(())
}
