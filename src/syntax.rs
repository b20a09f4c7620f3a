// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Header syntax of the stream produced by [`RowCoder`].
//!
//! The stream starts with a sequence header chunk. Every frame is one chunk made of a frame
//! header, the byte length of each CTU row payload (big endian `u32`) and the row payloads.
//!
//! [`RowCoder`]: crate::encoder::row_coder::RowCoder

use std::io::Write;

use anyhow::anyhow;
use anyhow::Context;
use bitreader::BitReader;
use enumn::N;

use crate::bitstream::BitWriter;
use crate::bitstream::BitWriterResult;
use crate::Resolution;

pub const SEQUENCE_HEADER_MARKER: u8 = 0xb0;
pub const FRAME_HEADER_MARKER: u8 = 0xb1;

#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Intra = 0,
    Inter = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceHeader {
    pub resolution: Resolution,
    pub qp: u8,
    pub owf: u8,
}

impl SequenceHeader {
    pub fn write_into<W: Write>(&self, writer: &mut BitWriter<W>) -> BitWriterResult<()> {
        writer.write_f(8, SEQUENCE_HEADER_MARKER)?;
        writer.write_f(16, self.resolution.width)?;
        writer.write_f(16, self.resolution.height)?;
        writer.write_f(6, self.qp)?;
        writer.write_f(6, self.owf)?;
        // reserved
        writer.write_f(4, 0u8)?;
        writer.flush()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_number: u32,
    pub frame_type: FrameType,
    pub qp: u8,
    pub num_rows: u32,
}

impl FrameHeader {
    pub fn write_into<W: Write>(&self, writer: &mut BitWriter<W>) -> BitWriterResult<()> {
        writer.write_f(8, FRAME_HEADER_MARKER)?;
        writer.write_f(1, self.frame_type as u8)?;
        writer.write_f(6, self.qp)?;
        writer.write_ue(self.frame_number)?;
        writer.write_ue(self.num_rows)?;
        writer.flush()
    }
}

/// Reads an unsigned exp-Golomb code.
pub fn read_ue(r: &mut BitReader) -> anyhow::Result<u32> {
    let mut leading_zeros: u8 = 0;
    while !r.read_bool()? {
        leading_zeros += 1;
        if leading_zeros > 31 {
            return Err(anyhow!("Broken data: exp-Golomb code too long"));
        }
    }

    let suffix = r.read_u64(leading_zeros)?;
    let value = (1u64 << leading_zeros) + suffix - 1;

    u32::try_from(value).context("Broken data: exp-Golomb value overflow")
}

/// Reads a signed exp-Golomb code.
pub fn read_se(r: &mut BitReader) -> anyhow::Result<i32> {
    let code = read_ue(r)? as i64;
    let magnitude = (code + 1) / 2;
    let value = if code % 2 == 1 { magnitude } else { -magnitude };

    i32::try_from(value).context("Broken data: signed exp-Golomb value overflow")
}

fn check_marker(r: &mut BitReader, expected: u8) -> anyhow::Result<()> {
    let marker = r.read_u8(8)?;
    if marker != expected {
        return Err(anyhow!(
            "Broken data: marker {:#04x}, expected {:#04x}",
            marker,
            expected
        ));
    }

    Ok(())
}

/// Parses a sequence header chunk.
pub fn parse_sequence_header(data: &[u8]) -> anyhow::Result<SequenceHeader> {
    let mut r = BitReader::new(data);

    check_marker(&mut r, SEQUENCE_HEADER_MARKER)?;
    let width = r.read_u32(16)?;
    let height = r.read_u32(16)?;
    let qp = r.read_u8(6)?;
    let owf = r.read_u8(6)?;

    Ok(SequenceHeader {
        resolution: Resolution::from((width, height)),
        qp,
        owf,
    })
}

/// Parses the header of a frame chunk. Returns the header and its size in bytes.
pub fn parse_frame_header(data: &[u8]) -> anyhow::Result<(FrameHeader, usize)> {
    let mut r = BitReader::new(data);

    check_marker(&mut r, FRAME_HEADER_MARKER)?;
    let frame_type =
        FrameType::n(r.read_u8(1)?).ok_or(anyhow!("Broken data: invalid frame type"))?;
    let qp = r.read_u8(6)?;
    let frame_number = read_ue(&mut r)?;
    let num_rows = read_ue(&mut r)?;

    let size = ((r.position() + 7) / 8) as usize;

    Ok((
        FrameHeader {
            frame_number,
            frame_type,
            qp,
            num_rows,
        },
        size,
    ))
}

/// Splits a frame chunk into its header and the row payloads.
pub fn split_frame(data: &[u8]) -> anyhow::Result<(FrameHeader, Vec<&[u8]>)> {
    let (header, mut offset) = parse_frame_header(data)?;

    let num_rows = header.num_rows as usize;
    if num_rows > data.len().saturating_sub(offset) / 4 {
        return Err(anyhow!("Broken data: truncated row length table"));
    }

    let mut lengths = Vec::with_capacity(num_rows);
    for _ in 0..num_rows {
        let bytes = data
            .get(offset..offset + 4)
            .ok_or(anyhow!("Broken data: truncated row length table"))?;
        lengths.push(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize);
        offset += 4;
    }

    let mut rows = Vec::with_capacity(num_rows);
    for len in lengths {
        let row = data
            .get(offset..offset + len)
            .ok_or(anyhow!("Broken data: truncated row payload"))?;
        rows.push(row);
        offset += len;
    }

    Ok((header, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_header() {
        let header = SequenceHeader {
            resolution: Resolution::from((1920, 1080)),
            qp: 37,
            owf: 4,
        };

        let mut out = Vec::new();
        header.write_into(&mut BitWriter::new(&mut out)).unwrap();

        assert_eq!(out.len(), 7);
        assert_eq!(parse_sequence_header(&out).unwrap(), header);
    }

    #[test]
    fn frame_header_size() {
        let header = FrameHeader {
            frame_number: 300,
            frame_type: FrameType::Inter,
            qp: 22,
            num_rows: 3,
        };

        let mut out = Vec::new();
        header.write_into(&mut BitWriter::new(&mut out)).unwrap();
        out.extend_from_slice(&[0xde, 0xad]);

        let (parsed, size) = parse_frame_header(&out).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(size, out.len() - 2);
    }

    #[test]
    fn reject_wrong_marker() {
        assert!(parse_frame_header(&[SEQUENCE_HEADER_MARKER, 0, 0]).is_err());
        assert!(parse_sequence_header(&[]).is_err());
    }

    #[test]
    fn split_truncated_frame() {
        let header = FrameHeader {
            frame_number: 0,
            frame_type: FrameType::Intra,
            qp: 0,
            num_rows: 2,
        };

        let mut out = Vec::new();
        header.write_into(&mut BitWriter::new(&mut out)).unwrap();
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(&2u32.to_be_bytes());
        out.extend_from_slice(&[7, 8, 9]);

        let (_, rows) = split_frame(&out).unwrap();
        assert_eq!(rows, vec![&[7u8][..], &[8, 9][..]]);

        out.pop();
        assert!(split_frame(&out).is_err());
    }
}
