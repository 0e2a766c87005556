// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use libdd_capture::frame::frames;
use libdd_capture::{FileHeader, Frame, FramePayload, FILE_HEADER_SIZE, MAGIC};
use std::collections::HashMap;
use std::path::Path;

pub fn decode_capture(bytes: &[u8]) -> (FileHeader, Vec<Frame>) {
    let header = FileHeader::decode(bytes).expect("capture shorter than its header");
    assert_eq!(header.magic, MAGIC);
    let frames = frames(&bytes[FILE_HEADER_SIZE..])
        .collect::<Result<Vec<_>, _>>()
        .expect("capture holds malformed frames");
    (header, frames)
}

pub fn read_capture(path: &Path) -> (FileHeader, Vec<Frame>) {
    decode_capture(&std::fs::read(path).unwrap())
}

/// Every jitmap entry in `frames`, keyed by address.
pub fn jitmap_entries(frames: &[Frame]) -> HashMap<u64, String> {
    frames
        .iter()
        .filter_map(|f| match &f.payload {
            FramePayload::Jitmap { entries } => Some(entries.iter().cloned()),
            _ => None,
        })
        .flatten()
        .collect()
}
