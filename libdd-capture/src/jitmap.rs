// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Writer-side string interning ("jitmap").
//!
//! Maps strings to synthetic [`CaptureAddress`]es so that samples can refer
//! to a symbol by address instead of repeating its name. The table is a
//! cache for the current generation only: once the writer flushes it as a
//! jitmap frame, the table is cleared and a string seen again later gets a
//! fresh address. Readers must tolerate the same string appearing under
//! several addresses.
//!
//! # Layout
//!
//! ```text
//! arena:   [addr:u64][bytes..][NUL][addr:u64][bytes..][NUL] ...
//! buckets: [Option<{offset, len, addr}>; JITMAP_BUCKETS]
//! ```
//!
//! The arena bytes are exactly the payload of the jitmap frame. Buckets
//! refer into the arena by offset and own nothing. The arena never grows
//! past what one jitmap frame can carry in the writer's buffer.

use crate::format::{CaptureAddress, JITMAP_HEAD_SIZE, JITMAP_MARK, MAX_FRAME_LEN};

pub const JITMAP_BUCKETS: usize = 512;
pub const JITMAP_ARENA_SIZE: usize = 4096 * 4;

const _: () = assert!(JITMAP_HEAD_SIZE + JITMAP_ARENA_SIZE <= MAX_FRAME_LEN);

#[derive(Clone, Copy, Debug)]
struct Bucket {
    /// Offset of the string bytes (after the address) in the arena.
    offset: u32,
    len: u32,
    addr: CaptureAddress,
}

#[derive(Debug)]
pub(crate) struct JitMap {
    /// At most JITMAP_ARENA_SIZE bytes.
    arena: Box<[u8]>,
    arena_pos: usize,
    buckets: Box<[Option<Bucket>]>,
    occupied: usize,
    seq: u64,
}

impl JitMap {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::with_capacity(JITMAP_ARENA_SIZE)
    }

    /// A table whose arena holds at most `capacity` bytes, capped at
    /// JITMAP_ARENA_SIZE.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            arena: vec![0u8; capacity.min(JITMAP_ARENA_SIZE)].into_boxed_slice(),
            arena_pos: 0,
            buckets: vec![None; JITMAP_BUCKETS].into_boxed_slice(),
            occupied: 0,
            seq: 0,
        }
    }

    /// djb2.
    #[inline]
    fn hash_str(bytes: &[u8]) -> u32 {
        let mut h: u32 = 5381;
        for &b in bytes {
            h = (h << 5).wrapping_add(h).wrapping_add(b as u32);
        }
        h
    }

    /// Bucket indices to visit for `name`: from its home slot to the end of
    /// the table, then from the start back up to the home slot.
    #[inline]
    fn probe(name: &[u8]) -> impl Iterator<Item = usize> {
        let home = Self::hash_str(name) as usize % JITMAP_BUCKETS;
        (home..JITMAP_BUCKETS).chain(0..home)
    }

    #[inline]
    fn bucket_str(&self, bucket: &Bucket) -> &[u8] {
        let start = bucket.offset as usize;
        &self.arena[start..start + bucket.len as usize]
    }

    /// Arena bytes needed to store `name`: address, bytes, NUL.
    #[inline]
    pub fn entry_len(name: &[u8]) -> usize {
        std::mem::size_of::<CaptureAddress>() + name.len() + 1
    }

    pub fn lookup(&self, name: &[u8]) -> Option<CaptureAddress> {
        for i in Self::probe(name) {
            let bucket = self.buckets[i].as_ref()?;
            if self.bucket_str(bucket) == name {
                return Some(bucket.addr);
            }
        }
        None
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    /// Whether `name` could be inserted into an empty table.
    #[inline]
    pub fn fits(&self, name: &[u8]) -> bool {
        Self::entry_len(name) <= self.capacity()
    }

    /// Whether `name` can be inserted without flushing first.
    pub fn has_room_for(&self, name: &[u8]) -> bool {
        self.occupied < JITMAP_BUCKETS && self.capacity() - self.arena_pos >= Self::entry_len(name)
    }

    /// Mints a new address for `name`. Returns `None` if there is no room;
    /// the caller flushes and retries against an empty table.
    pub fn insert(&mut self, name: &[u8]) -> Option<CaptureAddress> {
        if !self.has_room_for(name) {
            return None;
        }

        self.seq += 1;
        let addr = JITMAP_MARK | self.seq;

        let pos = self.arena_pos;
        let str_offset = pos + std::mem::size_of::<CaptureAddress>();
        self.arena[pos..str_offset].copy_from_slice(&addr.to_ne_bytes());
        self.arena[str_offset..str_offset + name.len()].copy_from_slice(name);
        self.arena[str_offset + name.len()] = 0;
        self.arena_pos += Self::entry_len(name);

        let bucket = Bucket {
            offset: str_offset as u32,
            len: name.len() as u32,
            addr,
        };
        // occupied < JITMAP_BUCKETS, so an empty bucket exists.
        let slot = Self::probe(name).find(|&i| self.buckets[i].is_none())?;
        self.buckets[slot] = Some(bucket);
        self.occupied += 1;

        Some(addr)
    }

    /// Number of strings in the current generation.
    #[inline]
    pub fn len(&self) -> usize {
        self.occupied
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Raw `[addr][string NUL]*` bytes of the current generation.
    #[inline]
    pub fn contents(&self) -> &[u8] {
        &self.arena[..self.arena_pos]
    }

    /// Drops every entry. The address sequence keeps counting.
    pub fn clear(&mut self) {
        self.arena_pos = 0;
        self.occupied = 0;
        self.buckets.fill(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn insert_and_lookup() {
        let mut map = JitMap::new();
        assert!(map.is_empty());
        assert_eq!(map.lookup(b"foo"), None);

        let foo = map.insert(b"foo").unwrap();
        let bar = map.insert(b"bar").unwrap();
        assert_ne!(foo, bar);
        assert_eq!(foo & JITMAP_MARK, JITMAP_MARK);
        assert_eq!(map.lookup(b"foo"), Some(foo));
        assert_eq!(map.lookup(b"bar"), Some(bar));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn arena_holds_frame_payload() {
        let mut map = JitMap::new();
        let addr = map.insert(b"main").unwrap();

        let mut expected = addr.to_ne_bytes().to_vec();
        expected.extend_from_slice(b"main\0");
        assert_eq!(map.contents(), expected.as_slice());
    }

    #[test]
    fn empty_string_is_a_valid_key() {
        let mut map = JitMap::new();
        let addr = map.insert(b"").unwrap();
        assert_eq!(map.lookup(b""), Some(addr));
        assert_eq!(map.contents().len(), JitMap::entry_len(b""));
    }

    #[test]
    fn clear_starts_a_new_generation() {
        let mut map = JitMap::new();
        let first = map.insert(b"foo").unwrap();
        map.clear();
        assert!(map.is_empty());
        assert!(map.contents().is_empty());
        assert_eq!(map.lookup(b"foo"), None);

        let second = map.insert(b"foo").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn probing_wraps_around() {
        let mut map = JitMap::new();
        // Fill the table completely with short keys, then make sure every one
        // of them is found, which requires wrapping for keys whose home slot
        // is near the end.
        let keys: Vec<String> = (0..JITMAP_BUCKETS).map(|i| format!("{i}")).collect();
        let mut addrs = HashMap::new();
        for key in &keys {
            addrs.insert(key.clone(), map.insert(key.as_bytes()).unwrap());
        }
        assert_eq!(map.len(), JITMAP_BUCKETS);
        assert!(!map.has_room_for(b"one more"));
        assert_eq!(map.insert(b"one more"), None);

        for key in &keys {
            assert_eq!(map.lookup(key.as_bytes()), Some(addrs[key]));
        }
    }

    #[test]
    fn arena_exhaustion_is_reported() {
        let mut map = JitMap::new();
        let big = vec![b'x'; JITMAP_ARENA_SIZE / 2];
        assert!(map.insert(&big).is_some());
        let mut other = big.clone();
        other[0] = b'y';
        assert!(!map.has_room_for(&other));
        assert_eq!(map.insert(&other), None);
    }

    #[test]
    fn capacity_bounds_the_arena() {
        let mut map = JitMap::with_capacity(64);
        assert_eq!(map.capacity(), 64);
        assert!(!map.fits(&[b'x'; 64]));
        assert!(map.fits(&[b'x'; 55]));

        assert!(map.insert(&[b'a'; 40]).is_some());
        assert!(!map.has_room_for(b"0123456789abcdef"));
        assert_eq!(map.insert(b"0123456789abcdef"), None);
        map.clear();
        assert!(map.insert(b"0123456789abcdef").is_some());

        assert_eq!(
            JitMap::with_capacity(1 << 20).capacity(),
            JITMAP_ARENA_SIZE
        );
    }

    #[test]
    fn fuzz_lookup_matches_inserts() {
        bolero::check!()
            .with_type::<Vec<String>>()
            .for_each(|strings| {
                let mut map = JitMap::new();
                let mut seen = HashMap::<&[u8], CaptureAddress>::new();
                for s in strings {
                    let bytes = s.as_bytes();
                    match map.lookup(bytes) {
                        Some(addr) => assert_eq!(seen.get(bytes), Some(&addr)),
                        None => {
                            assert!(!seen.contains_key(bytes));
                            if !map.has_room_for(bytes) {
                                map.clear();
                                seen.clear();
                            }
                            if let Some(addr) = map.insert(bytes) {
                                seen.insert(bytes, addr);
                            }
                        }
                    }
                }
                for (s, addr) in &seen {
                    assert_eq!(map.lookup(s), Some(*addr));
                }
            });
    }
}
