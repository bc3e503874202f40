// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire framing shared by every channel: a 4-byte little-endian part count,
//! then one 4-byte little-endian length plus payload per part. Most messages
//! are single-part; the meta channel uses two parts (JSON header + raw
//! value bytes).

use std::io::{self, Read, Write};

/// Upper bound for a single part, to bound allocation on a corrupt stream.
const MAX_PART_LEN: u32 = 256 * 1024 * 1024;
const MAX_PARTS: u32 = 16;

pub fn write_parts<W: Write>(writer: &mut W, parts: &[&[u8]]) -> io::Result<()> {
    writer.write_all(&(parts.len() as u32).to_le_bytes())?;
    for part in parts {
        writer.write_all(&(part.len() as u32).to_le_bytes())?;
        writer.write_all(part)?;
    }
    writer.flush()
}

pub fn read_parts<R: Read>(reader: &mut R) -> io::Result<Vec<Vec<u8>>> {
    let count = read_u32(reader)?;
    if count == 0 || count > MAX_PARTS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame part count {count}"),
        ));
    }
    let mut parts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = read_u32(reader)?;
        if len > MAX_PART_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame part of {len} bytes exceeds limit"),
            ));
        }
        let mut part = vec![0u8; len as usize];
        reader.read_exact(&mut part)?;
        parts.push(part);
    }
    Ok(parts)
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_single_part() {
        let mut buf = Vec::new();
        write_parts(&mut buf, &[b"hello"]).unwrap();
        let parts = read_parts(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parts, vec![b"hello".to_vec()]);
    }

    #[test]
    fn round_trip_two_parts() {
        let mut buf = Vec::new();
        write_parts(&mut buf, &[b"{\"a\":1}", &[0u8, 1, 2, 3]]).unwrap();
        let parts = read_parts(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1], vec![0u8, 1, 2, 3]);
    }

    #[test]
    fn rejects_corrupt_headers() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_le_bytes());
        assert!(read_parts(&mut Cursor::new(buf)).is_err());

        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&(MAX_PART_LEN + 1).to_le_bytes());
        assert!(read_parts(&mut Cursor::new(buf)).is_err());
    }
}
