// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Write buffer size, in pages, when none is given.
pub const DEFAULT_BUFFER_PAGES: usize = 64;
/// Permissions of capture files created by the writer.
pub const DEFAULT_FILE_MODE: u32 = 0o640;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureWriterConfig {
    // Size of the in-memory write buffer, a multiple of the page size
    buffer_size: usize,
    file_mode: u32,
}

impl Default for CaptureWriterConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            file_mode: DEFAULT_FILE_MODE,
        }
    }
}

pub fn default_buffer_size() -> usize {
    page_size::get() * DEFAULT_BUFFER_PAGES
}

impl CaptureWriterConfig {
    pub fn new(buffer_size: Option<usize>, file_mode: Option<u32>) -> anyhow::Result<Self> {
        let buffer_size = buffer_size.unwrap_or_else(default_buffer_size);
        let page_size = page_size::get();
        anyhow::ensure!(
            buffer_size > 0 && buffer_size % page_size == 0,
            "Buffer size {buffer_size} must be a non-zero multiple of the page size ({page_size})"
        );
        let file_mode = file_mode.unwrap_or(DEFAULT_FILE_MODE);
        anyhow::ensure!(
            file_mode & !0o7777 == 0,
            "Invalid file mode {file_mode:o}"
        );
        Ok(Self {
            buffer_size,
            file_mode,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn file_mode(&self) -> u32 {
        self.file_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CaptureWriterConfig::new(None, None).unwrap();
        assert_eq!(config, CaptureWriterConfig::default());
        assert_eq!(config.buffer_size(), page_size::get() * 64);
        assert_eq!(config.file_mode(), 0o640);
    }

    #[test]
    fn rejects_unaligned_buffer() {
        let page = page_size::get();
        assert!(CaptureWriterConfig::new(Some(page + 1), None).is_err());
        assert!(CaptureWriterConfig::new(Some(0), None).is_err());
        assert!(CaptureWriterConfig::new(Some(page * 8), None).is_ok());
    }

    #[test]
    fn rejects_bad_mode() {
        assert!(CaptureWriterConfig::new(None, Some(0o100644)).is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let config = CaptureWriterConfig::new(Some(page_size::get() * 2), Some(0o600)).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: CaptureWriterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
