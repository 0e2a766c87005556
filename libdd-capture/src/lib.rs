// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only binary capture files for profiling data.
//!
//! A capture is a 256 byte [`FileHeader`] followed by a stream of frames.
//! Every frame starts with a [`FrameHeader`] carrying its length, cpu, pid,
//! timestamp and [`FrameType`], and is padded to 8 bytes. The payload kinds
//! are samples (stacks of addresses), memory maps, process command lines,
//! forks, exits, jitmaps (string tables), counter definitions and values,
//! and marks (named intervals).
//!
//! - [`CaptureWriter`]: buffered single-producer writer. Frames are encoded
//!   in place in a page-multiple buffer and written out when it fills, on
//!   [`CaptureWriter::flush`] and on drop. Captures can be copied to another
//!   path ([`CaptureWriter::save_as`]) or appended to another capture
//!   ([`CaptureWriter::splice`]).
//! - [`SharedCaptureWriter`]: reference-counted writer usable from several
//!   threads; the last reference flushes and closes the file.
//! - [`frame`]: decoding of frames back into [`Frame`]s.
//!
//! Strings referenced by samples are interned with
//! [`CaptureWriter::add_jitmap`], which returns a synthetic address tagged
//! with [`JITMAP_MARK`]. The string table is emitted lazily as jitmap frames,
//! and a string may appear in several of them under different addresses.
//!
//! Values are stored in host byte order; the file header records which.
//! Only unix targets are supported.

pub mod clock;
mod config;
mod counter;
mod error;
#[cfg(feature = "ffi")]
pub mod ffi;
mod format;
pub mod frame;
mod jitmap;
mod shared;
mod transfer;
mod writer;

pub use config::{CaptureWriterConfig, DEFAULT_BUFFER_PAGES, DEFAULT_FILE_MODE};
pub use counter::{Counter, CounterKind, CounterValue, MAX_COUNTER_ID};
pub use error::CaptureError;
pub use format::{
    align, CaptureAddress, FileHeader, FrameHeader, FrameType, ALIGN, COUNTER_GROUP_SIZE,
    COUNTER_SIZE, FILE_HEADER_SIZE, FRAME_HEADER_SIZE, JITMAP_MARK, MAGIC, MAX_FRAME_LEN, VERSION,
};
pub use frame::{Frame, FramePayload};
pub use jitmap::{JITMAP_ARENA_SIZE, JITMAP_BUCKETS};
pub use shared::SharedCaptureWriter;
pub use writer::{CaptureStat, CaptureWriter};
