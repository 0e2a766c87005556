// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk layout of a capture.
//!
//! # Layout
//!
//! ```text
//! +-------------------+---------+---------+-----+---------+
//! | File header (256) | Frame 0 | Frame 1 | ... | Frame N |
//! +-------------------+---------+---------+-----+---------+
//! ```
//!
//! Every frame starts with a 24 byte [`FrameHeader`] whose `len` covers the
//! header, the payload, and the zero padding up to [`ALIGN`]. Integers are
//! written in host byte order; the file header records whether the host was
//! little endian so a reader can swap if needed. There is no implicit
//! padding: every field is encoded explicitly, field by field.

use std::mem;

/// An address in a stack sample, or a synthetic address minted by the jitmap.
pub type CaptureAddress = u64;

pub const MAGIC: u32 = 0xFDCA_975E;
pub const VERSION: u8 = 1;

/// Every frame length and the buffer cursor are multiples of this.
pub const ALIGN: usize = mem::size_of::<CaptureAddress>();

pub const FILE_HEADER_SIZE: usize = 256;
pub const FRAME_HEADER_SIZE: usize = 24;

/// Largest value the 16-bit frame `len` field can hold.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// High bits set on every address minted by the jitmap.
pub const JITMAP_MARK: CaptureAddress = 0xE000_0000_0000_0000;

pub const CAPTURE_TIME_LEN: usize = 64;
pub const SUFFIX_LEN: usize = 168;

/// Byte offset of `end_time` within the file header.
pub const END_TIME_OFFSET: u64 = (4 + 4 + CAPTURE_TIME_LEN + 8) as u64;

pub const SAMPLE_HEAD_SIZE: usize = FRAME_HEADER_SIZE + 8;
pub const MAP_HEAD_SIZE: usize = FRAME_HEADER_SIZE + 4 * 8;
pub const PROCESS_HEAD_SIZE: usize = FRAME_HEADER_SIZE;
pub const FORK_SIZE: usize = FRAME_HEADER_SIZE + 4;
pub const JITMAP_HEAD_SIZE: usize = FRAME_HEADER_SIZE + 4;
pub const COUNTER_DEFINE_HEAD_SIZE: usize = FRAME_HEADER_SIZE + 8;
pub const COUNTER_SET_HEAD_SIZE: usize = FRAME_HEADER_SIZE + 8;

pub const MARK_GROUP_LEN: usize = 24;
pub const MARK_NAME_LEN: usize = 40;
pub const MARK_HEAD_SIZE: usize = FRAME_HEADER_SIZE + 8 + MARK_GROUP_LEN + MARK_NAME_LEN;

pub const COUNTER_CATEGORY_LEN: usize = 32;
pub const COUNTER_NAME_LEN: usize = 32;
pub const COUNTER_DESCRIPTION_LEN: usize = 52;
pub const COUNTER_SIZE: usize =
    COUNTER_CATEGORY_LEN + COUNTER_NAME_LEN + COUNTER_DESCRIPTION_LEN + 4 + 8;

/// Number of `(id, value)` pairs packed into one counter-set group.
pub const COUNTERS_PER_GROUP: usize = 8;
pub const COUNTER_GROUP_SIZE: usize = COUNTERS_PER_GROUP * (4 + 8);

// Compile-time checks.
const _: () = assert!(4 + 4 + CAPTURE_TIME_LEN + 8 + 8 + SUFFIX_LEN == FILE_HEADER_SIZE);
const _: () = assert!(2 + 2 + 4 + 8 + 8 == FRAME_HEADER_SIZE);
const _: () = assert!(COUNTER_SIZE == 128);
const _: () = assert!(COUNTER_GROUP_SIZE == 96);
const _: () = assert!(MARK_HEAD_SIZE == 96);
const _: () = assert!(FILE_HEADER_SIZE % ALIGN == 0);

/// Rounds `len` up to the next multiple of [`ALIGN`].
#[inline]
pub const fn align(len: usize) -> usize {
    len.saturating_add(ALIGN - 1) & !(ALIGN - 1)
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FrameType {
    Timestamp = 1,
    Sample = 2,
    Map = 3,
    Process = 4,
    Fork = 5,
    Exit = 6,
    Jitmap = 7,
    CounterDefine = 8,
    CounterSet = 9,
    Mark = 10,
}

impl FrameType {
    pub const ALL: [FrameType; 10] = [
        FrameType::Timestamp,
        FrameType::Sample,
        FrameType::Map,
        FrameType::Process,
        FrameType::Fork,
        FrameType::Exit,
        FrameType::Jitmap,
        FrameType::CounterDefine,
        FrameType::CounterSet,
        FrameType::Mark,
    ];
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        FrameType::ALL
            .iter()
            .copied()
            .find(|t| *t as u8 == value)
            .ok_or(value)
    }
}

/// Header common to every frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub len: u16,
    /// -1 when the cpu is unknown.
    pub cpu: i16,
    pub pid: i32,
    pub time: i64,
    pub frame_type: u8,
}

impl FrameHeader {
    pub(crate) fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_u16(self.len);
        enc.put_i16(self.cpu);
        enc.put_i32(self.pid);
        enc.put_i64(self.time);
        // type:8 followed by 56 bits of padding.
        enc.put_u64(self.frame_type as u64);
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mut dec = Decoder::new(buf);
        let len = dec.get_u16()?;
        let cpu = dec.get_i16()?;
        let pid = dec.get_i32()?;
        let time = dec.get_i64()?;
        let frame_type = (dec.get_u64()? & 0xff) as u8;
        Some(Self {
            len,
            cpu,
            pid,
            time,
            frame_type,
        })
    }
}

/// The first [`FILE_HEADER_SIZE`] bytes of every capture.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u8,
    pub little_endian: bool,
    /// ISO-8601 wall clock time the capture was created.
    pub capture_time: String,
    pub time: i64,
    /// Zero until the writer has been flushed at least once.
    pub end_time: i64,
}

impl FileHeader {
    pub fn new(capture_time: String, time: i64) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            little_endian: cfg!(target_endian = "little"),
            capture_time,
            time,
            end_time: 0,
        }
    }

    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut out = [0u8; FILE_HEADER_SIZE];
        let mut enc = Encoder::new(&mut out);
        enc.put_u32(self.magic);
        // version:8, little_endian:1, padding:23
        enc.put_u32(self.version as u32 | ((self.little_endian as u32) << 8));
        enc.put_fixed_str(&self.capture_time, CAPTURE_TIME_LEN);
        enc.put_i64(self.time);
        enc.put_i64(self.end_time);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FILE_HEADER_SIZE {
            return None;
        }
        let mut dec = Decoder::new(buf);
        let magic = dec.get_u32()?;
        let bits = dec.get_u32()?;
        let capture_time = dec.get_fixed_str(CAPTURE_TIME_LEN)?;
        let time = dec.get_i64()?;
        let end_time = dec.get_i64()?;
        Some(Self {
            magic,
            version: (bits & 0xff) as u8,
            little_endian: bits & 0x100 != 0,
            capture_time,
            time,
            end_time,
        })
    }
}

/// Returns the bytes of `s` up to its first NUL, which is what a C reader
/// would see.
#[inline]
pub(crate) fn c_bytes(s: &str) -> &[u8] {
    let bytes = s.as_bytes();
    match bytes.iter().position(|&b| b == 0) {
        Some(nul) => &bytes[..nul],
        None => bytes,
    }
}

/// Like `strlcpy`: keeps at most `width - 1` bytes of `s`, never splitting a
/// UTF-8 character.
fn truncate_fixed(s: &str, width: usize) -> &[u8] {
    let bytes = c_bytes(s);
    if bytes.len() < width {
        return bytes;
    }
    let mut end = width.saturating_sub(1);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &bytes[..end]
}

/// Sequential writer over a zeroed slice handed out by the allocator.
pub(crate) struct Encoder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    pub fn put_u16(&mut self, v: u16) {
        self.put_bytes(&v.to_ne_bytes());
    }

    pub fn put_i16(&mut self, v: i16) {
        self.put_bytes(&v.to_ne_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_ne_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.put_bytes(&v.to_ne_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.put_bytes(&v.to_ne_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.put_bytes(&v.to_ne_bytes());
    }

    /// Skips `n` bytes, leaving them zeroed.
    pub fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    /// Writes `s` into a `width` byte field, NUL padded.
    pub fn put_fixed_str(&mut self, s: &str, width: usize) {
        let bytes = truncate_fixed(s, width);
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.buf[self.pos + bytes.len()..self.pos + width].fill(0);
        self.pos += width;
    }

    /// Writes `bytes` followed by a NUL terminator.
    pub fn put_c_str(&mut self, bytes: &[u8]) {
        self.put_bytes(bytes);
        self.buf[self.pos] = 0;
        self.pos += 1;
    }

    #[cfg(test)]
    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Sequential reader used to decode headers and payloads.
pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn get_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn get_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.get_bytes(N)?.try_into().ok()
    }

    pub fn get_u16(&mut self) -> Option<u16> {
        self.get_array().map(u16::from_ne_bytes)
    }

    pub fn get_i16(&mut self) -> Option<i16> {
        self.get_array().map(i16::from_ne_bytes)
    }

    pub fn get_u32(&mut self) -> Option<u32> {
        self.get_array().map(u32::from_ne_bytes)
    }

    pub fn get_i32(&mut self) -> Option<i32> {
        self.get_array().map(i32::from_ne_bytes)
    }

    pub fn get_u64(&mut self) -> Option<u64> {
        self.get_array().map(u64::from_ne_bytes)
    }

    pub fn get_i64(&mut self) -> Option<i64> {
        self.get_array().map(i64::from_ne_bytes)
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        self.get_bytes(n).map(|_| ())
    }

    pub fn get_fixed_str(&mut self, width: usize) -> Option<String> {
        let field = self.get_bytes(width)?;
        let end = field.iter().position(|&b| b == 0).unwrap_or(width);
        Some(String::from_utf8_lossy(&field[..end]).into_owned())
    }

    /// Reads a NUL terminated string. The terminator is consumed.
    pub fn get_c_str(&mut self) -> Option<String> {
        let rest = self.buf.get(self.pos..)?;
        let nul = rest.iter().position(|&b| b == 0)?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Some(s)
    }
}
