// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoded output accumulation and bit packing.

use std::fmt;
use std::io::Write;

use byteorder::LittleEndian;
use byteorder::WriteBytesExt;
use bytes::Bytes;

/// Per-slot output stream. Coded data is accumulated as a list of chunks until
/// [`Bitstream::take_chunks`] detaches it.
#[derive(Debug, Default)]
pub struct Bitstream {
    chunks: Vec<Bytes>,
    len: usize,
}

impl Bitstream {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends a chunk. Empty chunks are dropped.
    pub fn push_chunk(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }

        self.len += chunk.len();
        self.chunks.push(chunk);
    }

    /// Moves all chunks of `other` to the end of `self`.
    pub fn append(&mut self, other: Bitstream) {
        self.len += other.len;
        self.chunks.extend(other.chunks);
    }

    /// Number of bytes currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Detaches the accumulated chunks. The caller becomes their sole owner and the stream is
    /// left empty for the next frame.
    pub fn take_chunks(&mut self) -> DataChunks {
        self.len = 0;
        DataChunks(std::mem::take(&mut self.chunks))
    }
}

/// Coded chunks of one frame, in stream order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DataChunks(Vec<Bytes>);

impl DataChunks {
    /// Number of chunks
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of bytes in all chunks.
    pub fn total_len(&self) -> usize {
        self.0.iter().map(Bytes::len).sum()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Bytes> {
        self.0.iter()
    }

    /// Concatenates all chunks.
    pub fn into_vec(self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.total_len());
        for chunk in self.0 {
            data.extend_from_slice(&chunk);
        }
        data
    }
}

impl IntoIterator for DataChunks {
    type Item = Bytes;
    type IntoIter = std::vec::IntoIter<Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<DataChunks> for Vec<u8> {
    fn from(value: DataChunks) -> Self {
        value.into_vec()
    }
}

#[derive(Debug)]
pub enum BitWriterError {
    InvalidBitCount,
    Io(std::io::Error),
}

impl fmt::Display for BitWriterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BitWriterError::InvalidBitCount => write!(f, "invalid bit count"),
            BitWriterError::Io(x) => write!(f, "{}", x),
        }
    }
}

impl std::error::Error for BitWriterError {}

impl From<std::io::Error> for BitWriterError {
    fn from(err: std::io::Error) -> Self {
        BitWriterError::Io(err)
    }
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: writer,
            curr_byte: 0,
            nth_bit: 0,
        }
    }

    /// Writes fixed bit size integer (up to 32 bit)
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        for bit in (0..bits).rev() {
            self.write_bit((value >> bit) & 1 == 1)?;
        }

        Ok(bits)
    }

    /// Takes a single bit that will be outputed to [`std::io::Write`]
    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        Ok(())
    }

    /// Writes an unsigned exp-Golomb code. Returns the number of bits written.
    pub fn write_ue(&mut self, value: u32) -> BitWriterResult<usize> {
        let code = value as u64 + 1;
        let len = (u64::BITS - code.leading_zeros()) as usize;

        for _ in 0..len - 1 {
            self.write_bit(false)?;
        }
        for bit in (0..len).rev() {
            self.write_bit((code >> bit) & 1 == 1)?;
        }

        Ok(2 * len - 1)
    }

    /// Writes a signed exp-Golomb code. Positive values map to odd code numbers.
    pub fn write_se(&mut self, value: i32) -> BitWriterResult<usize> {
        let code = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };

        self.write_ue(code)
    }

    /// Immediately outputs any cached bits to [`std::io::Write`]
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        self.out.flush()?;
        Ok(())
    }

    /// Returns `true` if ['Self`] hold data that wasn't written to [`std::io::Write`]
    pub fn has_data_pending(&self) -> bool {
        self.nth_bit != 0
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}

/// Helper struct for synthesizing IVF file header
pub struct IvfFileHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub header_size: u16,
    pub codec: [u8; 4],
    pub width: u16,
    pub height: u16,
    pub framerate: u32,
    pub timescale: u32,
    pub frame_count: u32,
    pub unused: u32,
}

impl Default for IvfFileHeader {
    fn default() -> Self {
        Self {
            magic: Self::MAGIC,
            version: 0,
            header_size: 32,
            codec: Self::CODEC_OWF,
            width: 320,
            height: 240,
            framerate: 1,
            timescale: 1000,
            frame_count: 1,
            unused: Default::default(),
        }
    }
}

impl IvfFileHeader {
    pub const MAGIC: [u8; 4] = *b"DKIF";
    pub const CODEC_OWF: [u8; 4] = *b"OWF0";

    pub fn new(width: u16, height: u16, framerate: u32, frame_count: u32) -> Self {
        let default = Self::default();

        Self {
            width,
            height,
            framerate: framerate * default.timescale,
            frame_count,
            ..default
        }
    }

    /// Writes header into writer
    pub fn write_into(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_u16::<LittleEndian>(self.version)?;
        writer.write_u16::<LittleEndian>(self.header_size)?;
        writer.write_all(&self.codec)?;
        writer.write_u16::<LittleEndian>(self.width)?;
        writer.write_u16::<LittleEndian>(self.height)?;
        writer.write_u32::<LittleEndian>(self.framerate)?;
        writer.write_u32::<LittleEndian>(self.timescale)?;
        writer.write_u32::<LittleEndian>(self.frame_count)?;
        writer.write_u32::<LittleEndian>(self.unused)?;

        Ok(())
    }
}

/// Helper struct for synthesizing IVF frame header
pub struct IvfFrameHeader {
    pub frame_size: u32,
    pub timestamp: u64,
}

impl IvfFrameHeader {
    /// Writes header into writer
    pub fn write_into(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.frame_size)?;
        writer.write_u64::<LittleEndian>(self.timestamp)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_chunks_resets_stream() {
        let mut stream = Bitstream::new();
        stream.push_chunk(vec![1u8, 2, 3]);
        stream.push_chunk(Vec::new());

        let mut other = Bitstream::new();
        other.push_chunk(&b"\x04\x05"[..]);
        stream.append(other);

        assert_eq!(stream.len(), 5);

        let chunks = stream.take_chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.total_len(), 5);
        assert_eq!(chunks.into_vec(), vec![1, 2, 3, 4, 5]);

        assert!(stream.is_empty());
        assert!(stream.take_chunks().is_empty());
    }

    #[test]
    fn exp_golomb_codes() {
        let mut out = Vec::new();
        {
            let mut writer = BitWriter::new(&mut out);
            // 1 | 010 | 011 | 00100
            assert_eq!(writer.write_ue(0).unwrap(), 1);
            assert_eq!(writer.write_ue(1).unwrap(), 3);
            assert_eq!(writer.write_se(-1).unwrap(), 3);
            assert_eq!(writer.write_se(2).unwrap(), 5);
            assert!(writer.has_data_pending());
        }

        assert_eq!(out, vec![0b1010_0110, 0b0100_0000]);
    }

    #[test]
    fn write_f_rejects_wide_values() {
        let mut out = Vec::new();
        let mut writer = BitWriter::new(&mut out);

        assert!(matches!(
            writer.write_f(33, 0u32),
            Err(BitWriterError::InvalidBitCount)
        ));
        assert_eq!(writer.write_f(4, 0b1011u8).unwrap(), 4);
        writer.flush().unwrap();
        drop(writer);

        assert_eq!(out, vec![0b1011_0000]);
    }

    #[test]
    fn ivf_header_layout() {
        let mut out = Vec::new();
        IvfFileHeader::new(64, 48, 30, 2).write_into(&mut out).unwrap();
        IvfFrameHeader {
            frame_size: 9,
            timestamp: 1,
        }
        .write_into(&mut out)
        .unwrap();

        assert_eq!(out.len(), 32 + 12);
        assert_eq!(&out[0..4], b"DKIF");
        assert_eq!(&out[8..12], b"OWF0");
        assert_eq!(&out[12..14], &64u16.to_le_bytes());
        assert_eq!(&out[32..36], &9u32.to_le_bytes());
    }
}
