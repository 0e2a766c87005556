// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to write capture: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame of {len} bytes exceeds the maximum frame length")]
    FrameTooLarge { len: usize },
    #[error("Frame of {len} bytes does not fit in a {capacity} byte buffer")]
    BufferTooSmall { len: usize, capacity: usize },
    #[error("Buffer size {size} must be a non-zero multiple of the page size ({page_size})")]
    InvalidBufferSize { size: usize, page_size: usize },
    #[error("Jitmap entry of {len} bytes cannot fit in an empty jitmap")]
    JitmapEntryTooLarge { len: usize },
    #[error("Cannot splice, possibly corrupt file ({size} bytes)")]
    CorruptSource { size: u64 },
    #[error("Failed to save capture to {path:?}: {source}")]
    SaveAs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to splice capture: {source}")]
    Splice {
        #[source]
        source: std::io::Error,
    },
    #[error("Counter id {id} does not fit in 24 bits")]
    InvalidCounterId { id: u32 },
    #[error("Cannot reserve {requested} counter ids, {available} left")]
    CounterIdsExhausted { requested: u32, available: u32 },
}

impl CaptureError {
    /// The raw OS error code behind this error, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            CaptureError::Io(e)
            | CaptureError::SaveAs { source: e, .. }
            | CaptureError::Splice { source: e } => e.raw_os_error(),
            _ => None,
        }
    }
}
