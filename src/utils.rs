// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Utilities shared by the persistence formats.

use std::io::{Read, Write};

pub(crate) fn write_u64_le<W: Write>(writer: &mut W, value: u64) -> std::io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

pub(crate) fn read_u64_le<R: Read>(reader: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn write_u64_be<W: Write>(writer: &mut W, value: u64) -> std::io::Result<()> {
    writer.write_all(&value.to_be_bytes())
}

pub(crate) fn read_u64_be<R: Read>(reader: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trips() {
        let mut buf = Vec::new();
        write_u64_le(&mut buf, 0x0123_4567_89AB_CDEF).unwrap();
        write_u64_be(&mut buf, 42).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_u64_le(&mut cursor).unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(read_u64_be(&mut cursor).unwrap(), 42);
    }
}
