// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decoding of frames written by [`crate::CaptureWriter`].
//!
//! This is the inverse of the writer's encoders and is meant for tests and
//! for in-process consumers that already hold the bytes of a capture. It
//! assumes host byte order.

use crate::counter::Counter;
use crate::format::{
    CaptureAddress, Decoder, FrameHeader, FrameType, ALIGN, COUNTERS_PER_GROUP,
    FRAME_HEADER_SIZE, MARK_GROUP_LEN, MARK_NAME_LEN,
};
use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum DecodeError {
    #[error("Truncated frame at offset {offset}")]
    Truncated { offset: usize },
    #[error("Invalid frame length {len} at offset {offset}")]
    InvalidLength { len: u16, offset: usize },
    #[error("Unknown frame type {0}")]
    UnknownType(u8),
    #[error("Malformed {0:?} frame")]
    Malformed(FrameType),
}

/// Eight counter ids and their raw values. Unused slots have id 0.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CounterGroup {
    pub ids: [u32; COUNTERS_PER_GROUP],
    pub values: [u64; COUNTERS_PER_GROUP],
}

#[derive(Clone, Debug, PartialEq)]
pub enum FramePayload {
    Timestamp,
    Sample {
        addrs: Vec<CaptureAddress>,
    },
    Map {
        start: u64,
        end: u64,
        offset: u64,
        inode: u64,
        filename: String,
    },
    Process {
        cmdline: String,
    },
    Fork {
        child_pid: i32,
    },
    Exit,
    Jitmap {
        entries: Vec<(CaptureAddress, String)>,
    },
    CounterDefine {
        counters: Vec<Counter>,
    },
    CounterSet {
        groups: Vec<CounterGroup>,
    },
    Mark {
        duration: i64,
        group: String,
        name: String,
        message: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: FramePayload,
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self.payload {
            FramePayload::Timestamp => FrameType::Timestamp,
            FramePayload::Sample { .. } => FrameType::Sample,
            FramePayload::Map { .. } => FrameType::Map,
            FramePayload::Process { .. } => FrameType::Process,
            FramePayload::Fork { .. } => FrameType::Fork,
            FramePayload::Exit => FrameType::Exit,
            FramePayload::Jitmap { .. } => FrameType::Jitmap,
            FramePayload::CounterDefine { .. } => FrameType::CounterDefine,
            FramePayload::CounterSet { .. } => FrameType::CounterSet,
            FramePayload::Mark { .. } => FrameType::Mark,
        }
    }

    /// Decodes one frame from `buf`, which must start at a frame header and
    /// hold at least the frame's declared length.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let header = FrameHeader::decode(buf).ok_or(DecodeError::Truncated { offset: 0 })?;
        let len = header.len as usize;
        if len < FRAME_HEADER_SIZE || len % ALIGN != 0 {
            return Err(DecodeError::InvalidLength {
                len: header.len,
                offset: 0,
            });
        }
        let body = buf
            .get(FRAME_HEADER_SIZE..len)
            .ok_or(DecodeError::Truncated { offset: 0 })?;
        let frame_type =
            FrameType::try_from(header.frame_type).map_err(DecodeError::UnknownType)?;
        let payload =
            decode_payload(frame_type, body).ok_or(DecodeError::Malformed(frame_type))?;
        Ok(Self { header, payload })
    }
}

fn decode_payload(frame_type: FrameType, body: &[u8]) -> Option<FramePayload> {
    let mut dec = Decoder::new(body);
    let payload = match frame_type {
        FrameType::Timestamp => FramePayload::Timestamp,
        FrameType::Exit => FramePayload::Exit,
        FrameType::Sample => {
            let n = dec.get_u16()? as usize;
            dec.skip(6)?;
            let addrs = (0..n).map(|_| dec.get_u64()).collect::<Option<_>>()?;
            FramePayload::Sample { addrs }
        }
        FrameType::Map => FramePayload::Map {
            start: dec.get_u64()?,
            end: dec.get_u64()?,
            offset: dec.get_u64()?,
            inode: dec.get_u64()?,
            filename: dec.get_c_str()?,
        },
        FrameType::Process => FramePayload::Process {
            cmdline: dec.get_c_str()?,
        },
        FrameType::Fork => FramePayload::Fork {
            child_pid: dec.get_i32()?,
        },
        FrameType::Jitmap => {
            let n = dec.get_u32()? as usize;
            let entries = (0..n)
                .map(|_| Some((dec.get_u64()?, dec.get_c_str()?)))
                .collect::<Option<_>>()?;
            FramePayload::Jitmap { entries }
        }
        FrameType::CounterDefine => {
            let n = dec.get_u16()? as usize;
            dec.skip(6)?;
            let counters = (0..n)
                .map(|_| Counter::decode(&mut dec))
                .collect::<Option<_>>()?;
            FramePayload::CounterDefine { counters }
        }
        FrameType::CounterSet => {
            let n = dec.get_u16()? as usize;
            dec.skip(6)?;
            let mut groups = Vec::with_capacity(n);
            for _ in 0..n {
                let mut group = CounterGroup::default();
                for id in group.ids.iter_mut() {
                    *id = dec.get_u32()?;
                }
                for value in group.values.iter_mut() {
                    *value = dec.get_u64()?;
                }
                groups.push(group);
            }
            FramePayload::CounterSet { groups }
        }
        FrameType::Mark => FramePayload::Mark {
            duration: dec.get_i64()?,
            group: dec.get_fixed_str(MARK_GROUP_LEN)?,
            name: dec.get_fixed_str(MARK_NAME_LEN)?,
            message: dec.get_c_str()?,
        },
    };
    Some(payload)
}

/// Iterates over consecutive frames in `data`, which must start at a frame
/// boundary (for a capture file, right after the file header). Stops after
/// the first error.
pub fn frames(data: &[u8]) -> Frames<'_> {
    Frames {
        data,
        offset: 0,
        failed: false,
    }
}

pub struct Frames<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }
        let offset = self.offset;
        let rest = &self.data[offset..];
        let result = Frame::decode(rest).map_err(|e| match e {
            DecodeError::Truncated { .. } => DecodeError::Truncated { offset },
            DecodeError::InvalidLength { len, .. } => DecodeError::InvalidLength { len, offset },
            e => e,
        });
        match &result {
            Ok(frame) => self.offset += frame.header.len as usize,
            Err(_) => self.failed = true,
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Encoder, FORK_SIZE};

    fn raw_frame(frame_type: u8, child_pid: i32) -> Vec<u8> {
        let mut buf = vec![0u8; 32];
        let mut enc = Encoder::new(&mut buf);
        FrameHeader {
            len: 32,
            cpu: 1,
            pid: 10,
            time: 99,
            frame_type,
        }
        .encode(&mut enc);
        enc.put_i32(child_pid);
        assert_eq!(enc.position(), FORK_SIZE);
        buf
    }

    fn fork_frame(child_pid: i32) -> Vec<u8> {
        raw_frame(FrameType::Fork as u8, child_pid)
    }

    #[test]
    fn decodes_fork() {
        let frame = Frame::decode(&fork_frame(11)).unwrap();
        assert_eq!(frame.frame_type(), FrameType::Fork);
        assert_eq!(frame.payload, FramePayload::Fork { child_pid: 11 });
        assert_eq!(frame.header.time, 99);
        assert_eq!(frame.header.cpu, 1);
    }

    #[test]
    fn iterates_consecutive_frames() {
        let mut data = fork_frame(1);
        data.extend(fork_frame(2));
        let decoded: Vec<_> = frames(&data).collect::<Result<_, _>>().unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].payload, FramePayload::Fork { child_pid: 2 });
    }

    #[test]
    fn reports_truncation() {
        let mut data = fork_frame(1);
        data.extend(&fork_frame(2)[..16]);
        let results: Vec<_> = frames(&data).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert_eq!(
            results[1].as_ref().unwrap_err(),
            &DecodeError::Truncated { offset: 32 }
        );
    }

    #[test]
    fn rejects_unknown_type_and_bad_length() {
        let data = raw_frame(42, 1);
        assert_eq!(Frame::decode(&data), Err(DecodeError::UnknownType(42)));

        let mut data = fork_frame(1);
        data[0..2].copy_from_slice(&12u16.to_ne_bytes());
        assert!(matches!(
            Frame::decode(&data),
            Err(DecodeError::InvalidLength { len: 12, .. })
        ));
    }
}
