// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::CaptureError;
use crate::writer::CaptureWriter;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A reference-counted [`CaptureWriter`] that can be used from several
/// threads.
///
/// Cloning takes a reference and dropping releases it. When the last
/// reference goes away the writer is flushed and its file closed.
#[derive(Clone)]
pub struct SharedCaptureWriter {
    inner: Arc<Mutex<CaptureWriter>>,
}

/// A panic while holding the lock leaves the writer in a consistent state
/// (frames are only committed once fully encoded), so poisoning is ignored.
pub(crate) fn lock_writer(writer: &Mutex<CaptureWriter>) -> MutexGuard<'_, CaptureWriter> {
    writer.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SharedCaptureWriter {
    pub fn new(writer: CaptureWriter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Number of live references.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn lock(&self) -> MutexGuard<'_, CaptureWriter> {
        lock_writer(&self.inner)
    }

    /// Runs `f` with exclusive access to the writer.
    pub fn with<R>(&self, f: impl FnOnce(&mut CaptureWriter) -> R) -> R {
        f(&mut self.lock())
    }

    /// Returns the writer if this is the last reference.
    pub fn try_unwrap(self) -> Result<CaptureWriter, Self> {
        Arc::try_unwrap(self.inner)
            .map(|m| m.into_inner().unwrap_or_else(PoisonError::into_inner))
            .map_err(|inner| Self { inner })
    }

    /// Appends every frame of this capture to `dest`.
    ///
    /// Both writers are locked in a fixed order so that two threads splicing
    /// in opposite directions cannot deadlock.
    pub fn splice(&self, dest: &SharedCaptureWriter) -> Result<(), CaptureError> {
        if Arc::ptr_eq(&self.inner, &dest.inner) {
            return Err(CaptureError::Splice {
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "cannot splice a capture into itself",
                ),
            });
        }
        let self_first = Arc::as_ptr(&self.inner) < Arc::as_ptr(&dest.inner);
        let (mut source, mut dest) = if self_first {
            let source = self.lock();
            (source, dest.lock())
        } else {
            let dest = dest.lock();
            (self.lock(), dest)
        };
        source.splice(&mut dest)
    }

    #[cfg(feature = "ffi")]
    pub(crate) fn into_raw(self) -> *const Mutex<CaptureWriter> {
        Arc::into_raw(self.inner)
    }

    /// # Safety
    /// `ptr` must come from [`SharedCaptureWriter::into_raw`] and own one
    /// reference, which is transferred to the returned value.
    #[cfg(feature = "ffi")]
    pub(crate) unsafe fn from_raw(ptr: *const Mutex<CaptureWriter>) -> Self {
        Self {
            inner: Arc::from_raw(ptr),
        }
    }
}

impl From<CaptureWriter> for SharedCaptureWriter {
    fn from(writer: CaptureWriter) -> Self {
        Self::new(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FrameType, FILE_HEADER_SIZE};
    use std::fs::File;
    use std::thread;

    fn shared() -> (SharedCaptureWriter, File) {
        let file = tempfile::tempfile().unwrap();
        let reader = file.try_clone().unwrap();
        let writer = CaptureWriter::from_file(file, page_size::get()).unwrap();
        (SharedCaptureWriter::new(writer), reader)
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn clone_and_drop_track_references() {
        let (writer, _reader) = shared();
        assert_eq!(writer.ref_count(), 1);
        let other = writer.clone();
        assert_eq!(writer.ref_count(), 2);
        drop(other);
        assert_eq!(writer.ref_count(), 1);

        let extra = writer.clone();
        let writer = writer.try_unwrap().unwrap_err();
        drop(extra);
        assert!(writer.try_unwrap().is_ok());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn last_reference_flushes() {
        let (writer, reader) = shared();
        let other = writer.clone();
        writer.with(|w| w.add_timestamp(1, 0, 1)).unwrap();
        drop(writer);
        assert_eq!(reader.metadata().unwrap().len(), FILE_HEADER_SIZE as u64);
        drop(other);
        assert!(reader.metadata().unwrap().len() > FILE_HEADER_SIZE as u64);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn concurrent_producers() {
        let (writer, _reader) = shared();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let writer = writer.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        writer.with(|w| w.add_fork(i, t, 1, 2)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(writer.lock().stat().frame_count(FrameType::Fork), 400);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn splice_into_self_is_rejected() {
        let (writer, _reader) = shared();
        let same = writer.clone();
        assert!(matches!(
            writer.splice(&same),
            Err(CaptureError::Splice { .. })
        ));
    }
}
