// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! C ABI over [`SharedCaptureWriter`].
//!
//! Every successful constructor returns a handle owning one reference.
//! `ddog_capture_writer_ref` takes another and `ddog_capture_writer_unref`
//! releases one; releasing the last one flushes and closes the capture.
//! Failures are reported as `false`, `0` or null and logged at debug level.

use crate::counter::{Counter, CounterKind, CounterValue};
use crate::error::CaptureError;
use crate::format::CaptureAddress;
use crate::shared::{lock_writer, SharedCaptureWriter};
use crate::writer::{CaptureStat, CaptureWriter};
use std::borrow::Cow;
use std::ffi::{c_char, c_int, CStr};
use std::os::fd::{FromRawFd, OwnedFd};
use std::ptr::null;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Opaque writer handle.
pub type CaptureWriterHandle = Mutex<CaptureWriter>;

#[repr(C)]
#[derive(Clone, Copy)]
pub union CaptureCounterValue {
    pub v64: i64,
    pub vdbl: f64,
}

#[repr(C)]
pub struct CaptureCounter {
    pub category: *const c_char,
    pub name: *const c_char,
    pub description: *const c_char,
    pub id: u32,
    /// 0 for int64, 1 for double.
    pub kind: u8,
    pub value: CaptureCounterValue,
}

/// # Safety
/// `s` must be null or a valid NUL-terminated string.
unsafe fn c_str<'a>(s: *const c_char) -> Cow<'a, str> {
    if s.is_null() {
        Cow::Borrowed("")
    } else {
        CStr::from_ptr(s).to_string_lossy()
    }
}

/// # Safety
/// `len` elements must be readable from `ptr` when `len` is non-zero.
unsafe fn slice<'a, T>(ptr: *const T, len: usize) -> Option<&'a [T]> {
    match len {
        0 => Some(&[]),
        _ if ptr.is_null() => None,
        _ => Some(std::slice::from_raw_parts(ptr, len)),
    }
}

fn report<T>(op: &str, result: Result<T, CaptureError>) -> Option<T> {
    result
        .map_err(|e| debug!("{op} failed: {e}"))
        .ok()
}

/// # Safety
/// `writer` must be null or a live handle.
unsafe fn with_writer<T>(
    writer: *const CaptureWriterHandle,
    op: &str,
    f: impl FnOnce(&mut CaptureWriter) -> Result<T, CaptureError>,
) -> Option<T> {
    let writer = writer.as_ref()?;
    let mut guard = lock_writer(writer);
    report(op, f(&mut guard))
}

fn into_handle(result: Result<CaptureWriter, CaptureError>) -> *const CaptureWriterHandle {
    match report("ddog_capture_writer_new", result) {
        Some(writer) => SharedCaptureWriter::new(writer).into_raw(),
        None => null(),
    }
}

/// Creates (or truncates) the capture at `path`. A `buffer_size` of 0
/// selects the default.
///
/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_new(
    path: *const c_char,
    buffer_size: usize,
) -> *const CaptureWriterHandle {
    if path.is_null() {
        return null();
    }
    let path = c_str(path);
    into_handle(CaptureWriter::new(&*path, buffer_size))
}

/// Takes ownership of `fd`, which is closed when the writer goes away or
/// when construction fails.
///
/// # Safety
/// `fd` must be an open, readable and writable descriptor owned by the
/// caller.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_new_from_fd(
    fd: c_int,
    buffer_size: usize,
) -> *const CaptureWriterHandle {
    if fd < 0 {
        return null();
    }
    into_handle(CaptureWriter::from_fd(OwnedFd::from_raw_fd(fd), buffer_size))
}

/// # Safety
/// `writer` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_ref(
    writer: *const CaptureWriterHandle,
) -> *const CaptureWriterHandle {
    if !writer.is_null() {
        Arc::increment_strong_count(writer);
    }
    writer
}

/// # Safety
/// `writer` must be null or a live handle. It must not be used after the
/// call unless another reference is held.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_unref(writer: *const CaptureWriterHandle) {
    if !writer.is_null() {
        drop(SharedCaptureWriter::from_raw(writer));
    }
}

/// # Safety
/// `writer` must be a live handle and `stat` writable.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_stat(
    writer: *const CaptureWriterHandle,
    stat: *mut CaptureStat,
) -> bool {
    let Some(stat) = stat.as_mut() else {
        return false;
    };
    with_writer(writer, "stat", |w| Ok(w.stat()))
        .map(|s| *stat = s)
        .is_some()
}

/// # Safety
/// `writer` must be a live handle; string arguments null or valid.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn ddog_capture_writer_add_map(
    writer: *const CaptureWriterHandle,
    time: i64,
    cpu: c_int,
    pid: i32,
    start: u64,
    end: u64,
    offset: u64,
    inode: u64,
    filename: *const c_char,
) -> bool {
    let filename = c_str(filename);
    with_writer(writer, "add_map", |w| {
        w.add_map(time, cpu, pid, start, end, offset, inode, &filename)
    })
    .is_some()
}

/// # Safety
/// `writer` must be a live handle; string arguments null or valid.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn ddog_capture_writer_add_mark(
    writer: *const CaptureWriterHandle,
    time: i64,
    cpu: c_int,
    pid: i32,
    duration: i64,
    group: *const c_char,
    name: *const c_char,
    message: *const c_char,
) -> bool {
    let (group, name, message) = (c_str(group), c_str(name), c_str(message));
    with_writer(writer, "add_mark", |w| {
        w.add_mark(time, cpu, pid, duration, &group, &name, &message)
    })
    .is_some()
}

/// Returns 0 on failure.
///
/// # Safety
/// `writer` must be a live handle; `name` null or valid.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_add_jitmap(
    writer: *const CaptureWriterHandle,
    name: *const c_char,
) -> CaptureAddress {
    let name = c_str(name);
    with_writer(writer, "add_jitmap", |w| w.add_jitmap(&name)).unwrap_or(0)
}

/// # Safety
/// `writer` must be a live handle; `cmdline` null or valid.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_add_process(
    writer: *const CaptureWriterHandle,
    time: i64,
    cpu: c_int,
    pid: i32,
    cmdline: *const c_char,
) -> bool {
    let cmdline = c_str(cmdline);
    with_writer(writer, "add_process", |w| {
        w.add_process(time, cpu, pid, &cmdline)
    })
    .is_some()
}

/// # Safety
/// `writer` must be a live handle; `n_addrs` addresses readable from
/// `addrs`.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_add_sample(
    writer: *const CaptureWriterHandle,
    time: i64,
    cpu: c_int,
    pid: i32,
    addrs: *const CaptureAddress,
    n_addrs: usize,
) -> bool {
    let Some(addrs) = slice(addrs, n_addrs) else {
        return false;
    };
    with_writer(writer, "add_sample", |w| w.add_sample(time, cpu, pid, addrs)).is_some()
}

/// # Safety
/// `writer` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_add_fork(
    writer: *const CaptureWriterHandle,
    time: i64,
    cpu: c_int,
    pid: i32,
    child_pid: i32,
) -> bool {
    with_writer(writer, "add_fork", |w| w.add_fork(time, cpu, pid, child_pid)).is_some()
}

/// # Safety
/// `writer` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_add_exit(
    writer: *const CaptureWriterHandle,
    time: i64,
    cpu: c_int,
    pid: i32,
) -> bool {
    with_writer(writer, "add_exit", |w| w.add_exit(time, cpu, pid)).is_some()
}

/// # Safety
/// `writer` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_add_timestamp(
    writer: *const CaptureWriterHandle,
    time: i64,
    cpu: c_int,
    pid: i32,
) -> bool {
    with_writer(writer, "add_timestamp", |w| w.add_timestamp(time, cpu, pid)).is_some()
}

/// # Safety
/// `writer` must be a live handle; `n_counters` counters readable from
/// `counters`, each with null or valid strings.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_define_counters(
    writer: *const CaptureWriterHandle,
    time: i64,
    cpu: c_int,
    pid: i32,
    counters: *const CaptureCounter,
    n_counters: usize,
) -> bool {
    let Some(raw) = slice(counters, n_counters) else {
        return false;
    };
    let mut counters = Vec::with_capacity(raw.len());
    for c in raw {
        let value = match c.kind {
            k if k == CounterKind::Int64 as u8 => CounterValue::Int64(c.value.v64),
            k if k == CounterKind::Double as u8 => CounterValue::Double(c.value.vdbl),
            k => {
                debug!("define_counters failed: unknown counter type {k}");
                return false;
            }
        };
        counters.push(Counter::new(
            c_str(c.category),
            c_str(c.name),
            c_str(c.description),
            c.id,
            value,
        ));
    }
    with_writer(writer, "define_counters", |w| {
        w.define_counters(time, cpu, pid, &counters)
    })
    .is_some()
}

/// `values` are the raw 8 byte value unions, in the same order as `ids`.
///
/// # Safety
/// `writer` must be a live handle; `n_values` elements readable from both
/// `ids` and `values`.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_set_counters(
    writer: *const CaptureWriterHandle,
    time: i64,
    cpu: c_int,
    pid: i32,
    ids: *const u32,
    values: *const CaptureCounterValue,
    n_values: usize,
) -> bool {
    let (Some(ids), Some(values)) = (slice(ids, n_values), slice(values, n_values)) else {
        return false;
    };
    let values: Vec<_> = ids
        .iter()
        .zip(values)
        .map(|(id, value)| (*id, CounterValue::Int64(value.v64)))
        .collect();
    with_writer(writer, "set_counters", |w| {
        w.set_counters(time, cpu, pid, &values)
    })
    .is_some()
}

/// # Safety
/// `writer` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_flush(writer: *const CaptureWriterHandle) -> bool {
    with_writer(writer, "flush", CaptureWriter::flush).is_some()
}

/// On failure, `errno` is set to the OS error when there is one.
///
/// # Safety
/// `writer` must be a live handle; `path` a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_save_as(
    writer: *const CaptureWriterHandle,
    path: *const c_char,
) -> bool {
    if path.is_null() {
        return false;
    }
    let path = c_str(path);
    with_writer(writer, "save_as", |w| {
        w.save_as(&*path).inspect_err(set_errno)
    })
    .is_some()
}

/// Reserves `n` consecutive counter ids and returns the first one, or 0 on
/// failure.
///
/// # Safety
/// `writer` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_request_counter(
    writer: *const CaptureWriterHandle,
    n: u32,
) -> u32 {
    with_writer(writer, "request_counter", |w| w.request_counter(n)).unwrap_or(0)
}

/// Appends the frames of `writer` to `dest`.
///
/// # Safety
/// Both must be live handles.
#[no_mangle]
pub unsafe extern "C" fn ddog_capture_writer_splice(
    writer: *const CaptureWriterHandle,
    dest: *const CaptureWriterHandle,
) -> bool {
    if writer.is_null() || dest.is_null() {
        return false;
    }
    let source = std::mem::ManuallyDrop::new(SharedCaptureWriter::from_raw(writer));
    let dest = std::mem::ManuallyDrop::new(SharedCaptureWriter::from_raw(dest));
    report(
        "splice",
        source.splice(&dest).inspect_err(set_errno),
    )
    .is_some()
}

fn set_errno(e: &CaptureError) {
    if let Some(code) = e.raw_os_error() {
        nix::errno::Errno::from_raw(code).set();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FrameType, JITMAP_MARK};
    use std::ffi::CString;

    fn path_in(dir: &tempfile::TempDir, name: &str) -> CString {
        CString::new(dir.path().join(name).to_str().unwrap()).unwrap()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = path_in(&dir, "a.capture");
        unsafe {
            let writer = ddog_capture_writer_new(path.as_ptr(), 0);
            assert!(!writer.is_null());
            assert_eq!(ddog_capture_writer_ref(writer), writer);

            let name = CString::new("main").unwrap();
            let addr = ddog_capture_writer_add_jitmap(writer, name.as_ptr());
            assert_eq!(addr & JITMAP_MARK, JITMAP_MARK);
            assert!(ddog_capture_writer_add_sample(writer, 1, 0, 1, &addr, 1));
            assert!(ddog_capture_writer_add_mark(
                writer,
                2,
                0,
                1,
                5,
                null(),
                null(),
                null()
            ));
            assert!(ddog_capture_writer_flush(writer));

            let mut stat = CaptureStat::default();
            assert!(ddog_capture_writer_stat(writer, &mut stat));
            assert_eq!(stat.frame_count(FrameType::Sample), 1);
            assert_eq!(stat.frame_count(FrameType::Jitmap), 1);

            let copy = path_in(&dir, "b.capture");
            assert!(ddog_capture_writer_save_as(writer, copy.as_ptr()));

            ddog_capture_writer_unref(writer);
            ddog_capture_writer_unref(writer);
        }
        assert!(dir.path().join("b.capture").exists());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = path_in(&dir, "c.capture");
        let category = CString::new("mem").unwrap();
        let name = CString::new("rss").unwrap();
        unsafe {
            let writer = ddog_capture_writer_new(path.as_ptr(), 0);
            let id = ddog_capture_writer_request_counter(writer, 1);
            assert_eq!(id, 1);
            let counter = CaptureCounter {
                category: category.as_ptr(),
                name: name.as_ptr(),
                description: null(),
                id,
                kind: CounterKind::Int64 as u8,
                value: CaptureCounterValue { v64: 0 },
            };
            assert!(ddog_capture_writer_define_counters(
                writer, 1, -1, 1, &counter, 1
            ));
            let value = CaptureCounterValue { v64: 42 };
            assert!(ddog_capture_writer_set_counters(
                writer, 2, -1, 1, &id, &value, 1
            ));

            let bad = CaptureCounter { kind: 7, ..counter };
            assert!(!ddog_capture_writer_define_counters(
                writer, 3, -1, 1, &bad, 1
            ));
            ddog_capture_writer_unref(writer);
        }
    }

    #[test]
    fn null_arguments_fail() {
        unsafe {
            assert!(ddog_capture_writer_new(null(), 0).is_null());
            assert!(ddog_capture_writer_new_from_fd(-1, 0).is_null());
            assert!(!ddog_capture_writer_flush(null()));
            assert_eq!(ddog_capture_writer_add_jitmap(null(), null()), 0);
            assert!(!ddog_capture_writer_splice(null(), null()));
            ddog_capture_writer_unref(null());
        }
    }
}
