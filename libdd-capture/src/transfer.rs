// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Blocking file I/O primitives used by the writer.
//!
//! All of them retry on `EAGAIN`/`EINTR` and on short transfers, and treat a
//! transfer of zero bytes as an error. None of them time out.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::fs::FileExt;

#[inline]
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Writes all of `buf` at the current position of `out`. `written` counts
/// the bytes that made it, including when an error is returned.
pub(crate) fn write_all_retrying(
    mut out: impl Write,
    buf: &[u8],
    written: &mut usize,
) -> io::Result<()> {
    while *written < buf.len() {
        match out.write(&buf[*written..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => *written += n,
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Writes all of `buf` at `offset` without moving the file position.
pub(crate) fn patch_at(out: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match out.write_at(buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Copies `count` bytes of `input`, starting at `offset`, to the current
/// position of `out`. The position of `input` is left untouched.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn copy_range(out: &File, input: &File, offset: u64, count: u64) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::sendfile::sendfile;

    // Linux transfers at most this many bytes per call.
    const MAX_CHUNK: u64 = 0x7fff_f000;

    let mut in_off = libc::off_t::try_from(offset)
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let mut remaining = count;
    while remaining > 0 {
        let chunk = remaining.min(MAX_CHUNK) as usize;
        match sendfile(out, input, Some(&mut in_off), chunk) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => remaining -= n as u64,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn copy_range(out: &File, input: &File, offset: u64, count: u64) -> io::Result<()> {
    let mut chunk = vec![0u8; 64 * 1024];
    let mut in_off = offset;
    let mut remaining = count;
    while remaining > 0 {
        let want = remaining.min(chunk.len() as u64) as usize;
        match input.read_at(&mut chunk[..want], in_off) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => {
                write_all_retrying(out, &chunk[..n], &mut 0)?;
                in_off += n as u64;
                remaining -= n as u64;
            }
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};

    fn contents(mut file: &File) -> Vec<u8> {
        let mut out = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn write_then_patch() {
        let file = tempfile::tempfile().unwrap();
        write_all_retrying(&file, b"hello world", &mut 0).unwrap();
        patch_at(&file, b"W", 6).unwrap();
        assert_eq!(contents(&file), b"hello World");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn copy_range_preserves_input_position() {
        let mut input = tempfile::tempfile().unwrap();
        write_all_retrying(&input, b"0123456789", &mut 0).unwrap();
        input.seek(SeekFrom::Start(4)).unwrap();

        let out = tempfile::tempfile().unwrap();
        write_all_retrying(&out, b"ab", &mut 0).unwrap();
        copy_range(&out, &input, 3, 5).unwrap();

        assert_eq!(contents(&out), b"ab34567");
        assert_eq!(input.stream_position().unwrap(), 4);
    }

    /// Accepts `budget` bytes, at most 3 per call, after one interrupted call.
    struct Flaky {
        out: Vec<u8>,
        budget: usize,
        interrupted: bool,
    }

    impl Write for Flaky {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(io::ErrorKind::Interrupted.into());
            }
            if self.budget == 0 {
                return Err(io::Error::other("disk full"));
            }
            let n = buf.len().min(3).min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn short_writes_are_resumed() {
        let mut out = Flaky {
            out: Vec::new(),
            budget: usize::MAX,
            interrupted: false,
        };
        let mut written = 0;
        write_all_retrying(&mut out, b"0123456789", &mut written).unwrap();
        assert_eq!(written, 10);
        assert_eq!(out.out, b"0123456789");
    }

    #[test]
    fn failed_write_reports_progress() {
        let mut out = Flaky {
            out: Vec::new(),
            budget: 7,
            interrupted: false,
        };
        let mut written = 0;
        let err = write_all_retrying(&mut out, b"0123456789", &mut written).unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(written, 7);
        assert_eq!(out.out, b"0123456");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn copy_past_end_fails() {
        let input = tempfile::tempfile().unwrap();
        write_all_retrying(&input, b"short", &mut 0).unwrap();
        let out = tempfile::tempfile().unwrap();
        let err = copy_range(&out, &input, 0, 100).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
