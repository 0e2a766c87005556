// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The capture writer.
//!
//! Every frame goes through [`CaptureWriter::allocate`], which hands out an
//! aligned, zeroed region of the write buffer and flushes the buffer to the
//! file first when the region would not fit. Frames therefore reach the file
//! in exactly the order they were added.
//!
//! The writer is single-producer: every mutating call takes `&mut self`.
//! Share it between threads with [`crate::SharedCaptureWriter`].

use crate::clock;
use crate::config::{default_buffer_size, CaptureWriterConfig, DEFAULT_FILE_MODE};
use crate::counter::{check_id, Counter, CounterValue, MAX_COUNTER_ID};
use crate::error::CaptureError;
use crate::format::{
    align, c_bytes, CaptureAddress, Encoder, FileHeader, FrameHeader, FrameType,
    COUNTERS_PER_GROUP, COUNTER_DEFINE_HEAD_SIZE, COUNTER_GROUP_SIZE, COUNTER_SET_HEAD_SIZE,
    COUNTER_SIZE, END_TIME_OFFSET, FILE_HEADER_SIZE, FORK_SIZE, FRAME_HEADER_SIZE,
    JITMAP_HEAD_SIZE, MAP_HEAD_SIZE, MARK_GROUP_LEN, MARK_HEAD_SIZE, MARK_NAME_LEN,
    MAX_FRAME_LEN, PROCESS_HEAD_SIZE, SAMPLE_HEAD_SIZE,
};
use crate::jitmap::JitMap;
use crate::transfer;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::ops::Range;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::{debug, error, warn};

/// Per frame type counts of the frames added to a writer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CaptureStat {
    /// Indexed by `FrameType as usize`.
    pub frame_count: [u64; 16],
}

impl CaptureStat {
    pub fn frame_count(&self, frame_type: FrameType) -> u64 {
        self.frame_count[frame_type as usize]
    }

    pub fn total(&self) -> u64 {
        self.frame_count.iter().sum()
    }
}

#[derive(Debug)]
pub struct CaptureWriter {
    file: File,
    file_mode: u32,
    buf: Box<[u8]>,
    /// Bytes of `buf` waiting to be written. The file size plus `pos` is
    /// always a multiple of ALIGN.
    pos: usize,
    jitmap: JitMap,
    next_counter_id: u32,
    stat: CaptureStat,
}

/// Frames store the cpu in 16 bits; anything else is recorded as unknown.
#[inline]
fn cpu_index(cpu: i32) -> i16 {
    i16::try_from(cpu).unwrap_or(-1)
}

impl CaptureWriter {
    /// Creates (or truncates) the capture at `path`. A `buffer_size` of 0
    /// selects the default of 64 pages.
    pub fn new(path: impl AsRef<Path>, buffer_size: usize) -> Result<Self, CaptureError> {
        Self::open(path.as_ref(), buffer_size, DEFAULT_FILE_MODE)
    }

    pub fn with_config(
        path: impl AsRef<Path>,
        config: &CaptureWriterConfig,
    ) -> Result<Self, CaptureError> {
        Self::open(path.as_ref(), config.buffer_size(), config.file_mode())
    }

    fn open(path: &Path, buffer_size: usize, file_mode: u32) -> Result<Self, CaptureError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(file_mode)
            .open(path)?;
        let mut writer = Self::from_file(file, buffer_size)?;
        writer.file_mode = file_mode;
        debug!("Created capture {path:?}");
        Ok(writer)
    }

    /// Takes ownership of an already open descriptor, which must be readable
    /// and writable. The descriptor is truncated.
    pub fn from_fd(fd: OwnedFd, buffer_size: usize) -> Result<Self, CaptureError> {
        Self::from_file(File::from(fd), buffer_size)
    }

    /// Like [`CaptureWriter::from_fd`]. The file is closed when the writer
    /// is dropped, including when construction fails.
    pub fn from_file(file: File, buffer_size: usize) -> Result<Self, CaptureError> {
        let page_size = page_size::get();
        let buffer_size = match buffer_size {
            0 => default_buffer_size(),
            size if size % page_size == 0 => size,
            size => {
                return Err(CaptureError::InvalidBufferSize { size, page_size });
            }
        };

        file.set_len(0)?;
        (&file).rewind()?;

        let mut writer = Self {
            file,
            file_mode: DEFAULT_FILE_MODE,
            buf: vec![0u8; buffer_size].into_boxed_slice(),
            pos: 0,
            // A full arena must still fit in one jitmap frame.
            jitmap: JitMap::with_capacity(buffer_size - JITMAP_HEAD_SIZE),
            next_counter_id: 1,
            stat: CaptureStat::default(),
        };

        let capture_time = chrono::Local::now()
            .format("%Y-%m-%dT%H:%M:%S%.6f%:z")
            .to_string();
        let header = FileHeader::new(capture_time, clock::current_time());
        let range = writer.allocate(FILE_HEADER_SIZE)?;
        writer.buf[range].copy_from_slice(&header.encode());
        writer.flush_data()?;

        Ok(writer)
    }

    /// Size of the in-memory write buffer.
    pub fn buffer_size(&self) -> usize {
        self.buf.len()
    }

    /// A copy of the per frame type counters.
    pub fn stat(&self) -> CaptureStat {
        self.stat
    }

    /// Reserves `n` consecutive counter ids and returns the first one. Ids
    /// start at 1 and are never handed out twice by the same writer. With
    /// `n == 0` nothing is reserved and the next free id is returned.
    ///
    /// Fails without reserving anything when fewer than `n` of the 24-bit
    /// ids are left.
    pub fn request_counter(&mut self, n: u32) -> Result<u32, CaptureError> {
        let first = self.next_counter_id;
        // next_counter_id never exceeds MAX_COUNTER_ID + 1.
        let available = MAX_COUNTER_ID + 1 - first;
        if n > available || available == 0 {
            return Err(CaptureError::CounterIdsExhausted {
                requested: n,
                available,
            });
        }
        self.next_counter_id = first + n;
        Ok(first)
    }

    // -- Buffer -------------------------------------------------------------

    /// Reserves `len` bytes, rounded up to ALIGN, at the end of the buffer
    /// and returns their range. The region is zeroed.
    ///
    /// Fails without touching the file when the rounded length cannot be
    /// represented in a frame header or cannot fit even in an empty buffer.
    pub(crate) fn allocate(&mut self, len: usize) -> Result<Range<usize>, CaptureError> {
        let len = align(len);
        if len > MAX_FRAME_LEN {
            return Err(CaptureError::FrameTooLarge { len });
        }
        if len > self.buf.len() {
            return Err(CaptureError::BufferTooSmall {
                len,
                capacity: self.buf.len(),
            });
        }
        if self.buf.len() - self.pos < len {
            self.flush_data()?;
        }
        let range = self.pos..self.pos + len;
        self.buf[range.clone()].fill(0);
        self.pos += len;
        Ok(range)
    }

    /// Writes the buffered bytes to the file. This is the only place frame
    /// data reaches the file.
    ///
    /// Bytes that reached the file are dropped from the buffer even when the
    /// write fails part way, so a later flush resumes where this one stopped.
    pub(crate) fn flush_data(&mut self) -> Result<(), CaptureError> {
        if self.pos == 0 {
            return Ok(());
        }
        let mut written = 0;
        let result =
            transfer::write_all_retrying(&self.file, &self.buf[..self.pos], &mut written);
        self.consume(written);
        result.map_err(CaptureError::from)
    }

    /// Drops the first `written` buffered bytes, keeping the rest in order.
    fn consume(&mut self, written: usize) {
        self.buf.copy_within(written..self.pos, 0);
        self.pos -= written;
    }

    fn write_frame(
        &mut self,
        frame_type: FrameType,
        time: i64,
        cpu: i32,
        pid: i32,
        len: usize,
        body: impl FnOnce(&mut Encoder<'_>),
    ) -> Result<(), CaptureError> {
        let range = self.allocate(len)?;
        let header = FrameHeader {
            len: range.len() as u16,
            cpu: cpu_index(cpu),
            pid,
            time,
            frame_type: frame_type as u8,
        };
        let mut enc = Encoder::new(&mut self.buf[range]);
        header.encode(&mut enc);
        body(&mut enc);
        self.stat.frame_count[frame_type as usize] += 1;
        Ok(())
    }

    // -- Frames -------------------------------------------------------------

    pub fn add_timestamp(&mut self, time: i64, cpu: i32, pid: i32) -> Result<(), CaptureError> {
        self.write_frame(FrameType::Timestamp, time, cpu, pid, FRAME_HEADER_SIZE, |_| {})
    }

    pub fn add_exit(&mut self, time: i64, cpu: i32, pid: i32) -> Result<(), CaptureError> {
        self.write_frame(FrameType::Exit, time, cpu, pid, FRAME_HEADER_SIZE, |_| {})
    }

    pub fn add_fork(
        &mut self,
        time: i64,
        cpu: i32,
        pid: i32,
        child_pid: i32,
    ) -> Result<(), CaptureError> {
        self.write_frame(FrameType::Fork, time, cpu, pid, FORK_SIZE, |enc| {
            enc.put_i32(child_pid)
        })
    }

    pub fn add_process(
        &mut self,
        time: i64,
        cpu: i32,
        pid: i32,
        cmdline: &str,
    ) -> Result<(), CaptureError> {
        let cmdline = c_bytes(cmdline);
        let len = PROCESS_HEAD_SIZE + cmdline.len() + 1;
        self.write_frame(FrameType::Process, time, cpu, pid, len, |enc| {
            enc.put_c_str(cmdline)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_map(
        &mut self,
        time: i64,
        cpu: i32,
        pid: i32,
        start: u64,
        end: u64,
        offset: u64,
        inode: u64,
        filename: &str,
    ) -> Result<(), CaptureError> {
        let filename = c_bytes(filename);
        let len = MAP_HEAD_SIZE + filename.len() + 1;
        self.write_frame(FrameType::Map, time, cpu, pid, len, |enc| {
            enc.put_u64(start);
            enc.put_u64(end);
            enc.put_u64(offset);
            enc.put_u64(inode);
            enc.put_c_str(filename);
        })
    }

    /// `group` and `name` are truncated to 23 and 39 bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn add_mark(
        &mut self,
        time: i64,
        cpu: i32,
        pid: i32,
        duration: i64,
        group: &str,
        name: &str,
        message: &str,
    ) -> Result<(), CaptureError> {
        let message = c_bytes(message);
        let len = MARK_HEAD_SIZE + message.len() + 1;
        self.write_frame(FrameType::Mark, time, cpu, pid, len, |enc| {
            enc.put_i64(duration);
            enc.put_fixed_str(group, MARK_GROUP_LEN);
            enc.put_fixed_str(name, MARK_NAME_LEN);
            enc.put_c_str(message);
        })
    }

    pub fn add_sample(
        &mut self,
        time: i64,
        cpu: i32,
        pid: i32,
        addrs: &[CaptureAddress],
    ) -> Result<(), CaptureError> {
        let len = addrs
            .len()
            .saturating_mul(std::mem::size_of::<CaptureAddress>())
            .saturating_add(SAMPLE_HEAD_SIZE);
        self.write_frame(FrameType::Sample, time, cpu, pid, len, |enc| {
            // The length check bounds addrs.len() well below u16::MAX.
            enc.put_u16(addrs.len() as u16);
            enc.skip(6);
            for addr in addrs {
                enc.put_u64(*addr);
            }
        })
    }

    /// Returns the synthetic address for `name`, minting one if `name` is
    /// not in the current jitmap generation. May flush the jitmap first to
    /// make room.
    pub fn add_jitmap(&mut self, name: &str) -> Result<CaptureAddress, CaptureError> {
        let name = c_bytes(name);
        if let Some(addr) = self.jitmap.lookup(name) {
            return Ok(addr);
        }
        if !self.jitmap.fits(name) {
            return Err(CaptureError::JitmapEntryTooLarge {
                len: JitMap::entry_len(name),
            });
        }
        if !self.jitmap.has_room_for(name) {
            self.flush_jitmap()?;
        }
        self.jitmap
            .insert(name)
            .ok_or(CaptureError::JitmapEntryTooLarge {
                len: JitMap::entry_len(name),
            })
    }

    /// Emits the current jitmap generation as a frame and clears it.
    pub(crate) fn flush_jitmap(&mut self) -> Result<(), CaptureError> {
        if self.jitmap.is_empty() {
            return Ok(());
        }

        let len = JITMAP_HEAD_SIZE + self.jitmap.contents().len();
        let range = self.allocate(len)?;
        let header = FrameHeader {
            len: range.len() as u16,
            cpu: -1,
            pid: std::process::id() as i32,
            time: clock::current_time(),
            frame_type: FrameType::Jitmap as u8,
        };
        let mut enc = Encoder::new(&mut self.buf[range]);
        header.encode(&mut enc);
        enc.put_u32(self.jitmap.len() as u32);
        enc.put_bytes(self.jitmap.contents());

        debug!("Flushed {} jitmap entries", self.jitmap.len());
        self.jitmap.clear();
        self.stat.frame_count[FrameType::Jitmap as usize] += 1;
        Ok(())
    }

    pub fn define_counters(
        &mut self,
        time: i64,
        cpu: i32,
        pid: i32,
        counters: &[Counter],
    ) -> Result<(), CaptureError> {
        if counters.is_empty() {
            return Ok(());
        }
        counters.iter().try_for_each(Counter::validate)?;

        let len = counters
            .len()
            .saturating_mul(COUNTER_SIZE)
            .saturating_add(COUNTER_DEFINE_HEAD_SIZE);
        self.write_frame(FrameType::CounterDefine, time, cpu, pid, len, |enc| {
            enc.put_u16(counters.len() as u16);
            enc.skip(6);
            for counter in counters {
                counter.encode(enc);
            }
        })
    }

    /// Records new values for previously defined counters, packed in groups
    /// of eight. Unused slots in the last group have id 0.
    pub fn set_counters(
        &mut self,
        time: i64,
        cpu: i32,
        pid: i32,
        values: &[(u32, CounterValue)],
    ) -> Result<(), CaptureError> {
        if values.is_empty() {
            return Ok(());
        }
        values.iter().try_for_each(|(id, _)| check_id(*id))?;

        let n_groups = values.len().div_ceil(COUNTERS_PER_GROUP);
        let len = n_groups
            .saturating_mul(COUNTER_GROUP_SIZE)
            .saturating_add(COUNTER_SET_HEAD_SIZE);
        self.write_frame(FrameType::CounterSet, time, cpu, pid, len, |enc| {
            enc.put_u16(n_groups as u16);
            enc.skip(6);
            for group in values.chunks(COUNTERS_PER_GROUP) {
                for slot in 0..COUNTERS_PER_GROUP {
                    enc.put_u32(group.get(slot).map_or(0, |(id, _)| *id));
                }
                for slot in 0..COUNTERS_PER_GROUP {
                    enc.put_u64(group.get(slot).map_or(0, |(_, value)| value.to_raw()));
                }
            }
        })
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Writes out the jitmap and every buffered frame, then records the end
    /// time in the file header. Failing to record the end time is not an
    /// error.
    ///
    /// Buffered frames are written even if the jitmap cannot be, in which
    /// case the jitmap error is returned.
    pub fn flush(&mut self) -> Result<(), CaptureError> {
        let jitmap = self.flush_jitmap();
        self.flush_data()?;
        jitmap?;

        let end_time = clock::current_time();
        if let Err(e) = transfer::patch_at(&self.file, &end_time.to_ne_bytes(), END_TIME_OFFSET) {
            warn!("Failed to update capture end time: {e}");
        }
        Ok(())
    }

    fn position(&self) -> io::Result<u64> {
        (&self.file).stream_position()
    }

    /// Flushes and copies the capture, as written so far, to `path`. A
    /// partially written destination is removed on failure.
    pub fn save_as(&mut self, path: impl AsRef<Path>) -> Result<(), CaptureError> {
        self.save_with(path.as_ref(), transfer::copy_range)
    }

    fn save_with(
        &mut self,
        path: &Path,
        copy: impl FnOnce(&File, &File, u64, u64) -> io::Result<()>,
    ) -> Result<(), CaptureError> {
        let save_err = |source| CaptureError::SaveAs {
            path: path.to_path_buf(),
            source,
        };

        self.flush()?;
        let len = self.position().map_err(save_err)?;
        let dest = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.file_mode)
            .open(path)
            .map_err(save_err)?;

        if let Err(source) = copy(&dest, &self.file, 0, len) {
            drop(dest);
            let _ = fs::remove_file(path);
            return Err(save_err(source));
        }
        debug!("Saved {len} byte capture to {path:?}");
        Ok(())
    }

    /// Appends every frame of this capture to `dest`. Both writers are
    /// flushed first. This writer keeps its file position and can keep
    /// appending afterwards, even if the splice fails.
    pub fn splice(&mut self, dest: &mut CaptureWriter) -> Result<(), CaptureError> {
        self.flush()?;
        dest.flush()?;

        let pos = self
            .position()
            .map_err(|source| CaptureError::Splice { source })?;
        let result = dest.splice_from_file(&self.file);

        let restored = (&self.file).seek(SeekFrom::Start(pos));
        result?;
        match restored {
            Ok(p) if p == pos => Ok(()),
            Ok(_) => Err(CaptureError::Splice {
                source: io::Error::other("failed to restore file position"),
            }),
            Err(source) => Err(CaptureError::Splice { source }),
        }
    }

    /// Appends everything after the file header of `source` to this capture.
    /// `source` must be a capture file; its position is not changed.
    pub fn splice_from_file(&mut self, source: &File) -> Result<(), CaptureError> {
        let size = source
            .metadata()
            .map_err(|source| CaptureError::Splice { source })?
            .len();
        let header = FILE_HEADER_SIZE as u64;
        if size < header {
            return Err(CaptureError::CorruptSource { size });
        }

        self.flush_data()?;
        transfer::copy_range(&self.file, source, header, size - header)
            .map_err(|source| CaptureError::Splice { source })?;
        debug!("Spliced {} bytes into capture", size - header);
        Ok(())
    }
}

impl Drop for CaptureWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("Failed to flush capture on drop: {e}");
        }
    }
}
