//! Little-endian field helpers shared by the on-disk encoders.
//!
//! Addresses are always 8 bytes; the undefined address is stored as all
//! ones.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FormatError, Result};

/// Size of a file address on disk.
pub const SIZEOF_ADDR: usize = 8;

/// Size of a length field on disk.
pub const SIZEOF_SIZE: usize = 8;

/// On-disk encoding of an undefined address.
pub const UNDEF_ADDR: u64 = u64::MAX;

pub(crate) fn ensure_len(data: &[u8], offset: usize, needed: usize) -> Result<()> {
    match offset.checked_add(needed) {
        Some(end) if end <= data.len() => Ok(()),
        _ => Err(FormatError::UnexpectedEof {
            expected: offset.saturating_add(needed),
            available: data.len(),
        }),
    }
}

pub(crate) fn read_u16(data: &[u8], pos: usize) -> Result<u16> {
    ensure_len(data, pos, 2)?;
    Ok(LittleEndian::read_u16(&data[pos..]))
}

pub(crate) fn read_u32(data: &[u8], pos: usize) -> Result<u32> {
    ensure_len(data, pos, 4)?;
    Ok(LittleEndian::read_u32(&data[pos..]))
}

pub(crate) fn read_u64(data: &[u8], pos: usize) -> Result<u64> {
    ensure_len(data, pos, 8)?;
    Ok(LittleEndian::read_u64(&data[pos..]))
}

/// Read an address, mapping the all-ones pattern to `None`.
pub(crate) fn read_addr(data: &[u8], pos: usize) -> Result<Option<u64>> {
    let raw = read_u64(data, pos)?;
    Ok(if raw == UNDEF_ADDR { None } else { Some(raw) })
}

pub(crate) fn write_u16(buf: &mut [u8], pos: usize, v: u16) {
    LittleEndian::write_u16(&mut buf[pos..pos + 2], v);
}

pub(crate) fn write_u32(buf: &mut [u8], pos: usize, v: u32) {
    LittleEndian::write_u32(&mut buf[pos..pos + 4], v);
}

pub(crate) fn write_u64(buf: &mut [u8], pos: usize, v: u64) {
    LittleEndian::write_u64(&mut buf[pos..pos + 8], v);
}

pub(crate) fn write_addr(buf: &mut [u8], pos: usize, addr: Option<u64>) {
    write_u64(buf, pos, addr.unwrap_or(UNDEF_ADDR));
}
