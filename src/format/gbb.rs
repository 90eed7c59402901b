/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Parser for the Google Binary Block (GBB), the RO sub-region holding the
//! HWID, root public key, bitmap firmware volume, recovery key, and the
//! 32-bit flags word.

use std::{mem, ops::Range};

use thiserror::Error;
use zerocopy::{little_endian, FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::util;

pub const SIGNATURE: [u8; 4] = *b"$GBB";
pub const MAJOR_VER: u16 = 1;
pub const MINOR_VER: u16 = 1;
pub const HEADER_SIZE: usize = 128;

/// Candidate headers are only considered at this alignment.
const SEARCH_STRIDE: usize = 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No valid GBB header found in {0} byte blob")]
    NotFound(usize),
    #[error("Multiple ({0}) valid GBB headers found")]
    MultipleHeaders(usize),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the GBB header. The pad bytes bring the size up to
/// [`HEADER_SIZE`].
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`SIGNATURE`].
    signature: [u8; 4],
    major_version: little_endian::U16,
    minor_version: little_endian::U16,
    header_size: little_endian::U32,
    flags: little_endian::U32,
    hwid_offset: little_endian::U32,
    hwid_size: little_endian::U32,
    rootkey_offset: little_endian::U32,
    rootkey_size: little_endian::U32,
    bmpfv_offset: little_endian::U32,
    bmpfv_size: little_endian::U32,
    recovery_key_offset: little_endian::U32,
    recovery_key_size: little_endian::U32,
    pad: [u8; 80],
}

const _: () = assert!(mem::size_of::<RawHeader>() == HEADER_SIZE);

/// A validated GBB header. All descriptor offsets are relative to the start
/// of the header; the `*_range` accessors resolve them to ranges within the
/// blob the header was found in.
#[derive(Clone, Debug)]
pub struct Gbb {
    /// Byte offset of the header within the searched blob.
    pub offset: usize,
    pub flags: u32,
    pub hwid_offset: u32,
    pub hwid_size: u32,
    pub rootkey_offset: u32,
    pub rootkey_size: u32,
    pub bmpfv_offset: u32,
    pub bmpfv_size: u32,
    pub recovery_key_offset: u32,
    pub recovery_key_size: u32,
}

impl Gbb {
    /// Locate the GBB header by scanning for its signature. The blob must
    /// contain exactly one valid header; zero or several is an error.
    pub fn find(blob: &[u8]) -> Result<Self> {
        let mut found = None;
        let mut count = 0;
        let mut pos = 0;

        while pos + HEADER_SIZE <= blob.len() {
            if blob[pos..pos + 4] == SIGNATURE {
                if let Some(gbb) = Self::validate_at(blob, pos) {
                    if count == 0 {
                        found = Some(gbb);
                    }
                    count += 1;
                }
            }

            pos += SEARCH_STRIDE;
        }

        match count {
            0 => Err(Error::NotFound(blob.len())),
            1 => Ok(found.unwrap()),
            n => Err(Error::MultipleHeaders(n)),
        }
    }

    fn validate_at(blob: &[u8], pos: usize) -> Option<Self> {
        let max_len = (blob.len() - pos) as u64;
        let raw = RawHeader::read_from_bytes(&blob[pos..pos + HEADER_SIZE]).ok()?;

        if raw.major_version.get() != MAJOR_VER {
            return None;
        }
        if raw.header_size.get() as usize != HEADER_SIZE || u64::from(raw.header_size.get()) > max_len {
            return None;
        }

        let descriptors = [
            (raw.hwid_offset.get(), raw.hwid_size.get()),
            (raw.rootkey_offset.get(), raw.rootkey_size.get()),
            (raw.bmpfv_offset.get(), raw.bmpfv_size.get()),
            (raw.recovery_key_offset.get(), raw.recovery_key_size.get()),
        ];
        for (offset, size) in descriptors {
            if (offset as usize) < HEADER_SIZE {
                return None;
            }
            if u64::from(offset) + u64::from(size) > max_len {
                return None;
            }
        }

        if raw.hwid_size.get() != 0 {
            // The HWID must be NUL-terminated (ASCII, not unicode).
            let start = pos + raw.hwid_offset.get() as usize;
            let hwid = &blob[start..start + raw.hwid_size.get() as usize];
            if !hwid.contains(&0) {
                return None;
            }
        }

        Some(Self {
            offset: pos,
            flags: raw.flags.get(),
            hwid_offset: raw.hwid_offset.get(),
            hwid_size: raw.hwid_size.get(),
            rootkey_offset: raw.rootkey_offset.get(),
            rootkey_size: raw.rootkey_size.get(),
            bmpfv_offset: raw.bmpfv_offset.get(),
            bmpfv_size: raw.bmpfv_size.get(),
            recovery_key_offset: raw.recovery_key_offset.get(),
            recovery_key_size: raw.recovery_key_size.get(),
        })
    }

    pub fn hwid_range(&self) -> Range<usize> {
        let start = self.offset + self.hwid_offset as usize;
        start..start + self.hwid_size as usize
    }

    pub fn rootkey_range(&self) -> Range<usize> {
        let start = self.offset + self.rootkey_offset as usize;
        start..start + self.rootkey_size as usize
    }

    /// The HWID string bytes, truncated at the first NUL.
    pub fn hwid<'a>(&self, blob: &'a [u8]) -> &'a [u8] {
        util::truncate_at_nul(&blob[self.hwid_range()])
    }

    /// Rewrite the flags word of this header in place.
    pub fn write_flags(&self, blob: &mut [u8], flags: u32) {
        let start = self.offset + mem::offset_of!(RawHeader, flags);
        blob[start..start + 4].copy_from_slice(little_endian::U32::from(flags).as_bytes());
    }
}

/// Build a GBB blob for the given region sizes, in descriptor order: HWID,
/// root key, bitmap FV, recovery key. Every region is sized from its own
/// parameter and laid out back to back after the header.
pub fn create_gbb(hwid_size: u32, rootkey_size: u32, bmpfv_size: u32, recovery_size: u32) -> Vec<u8> {
    let total = HEADER_SIZE
        + hwid_size as usize
        + rootkey_size as usize
        + bmpfv_size as usize
        + recovery_size as usize;
    let mut blob = vec![0u8; total];

    let mut offset = HEADER_SIZE as u32;
    let mut place = |size: u32| {
        let o = offset;
        offset += size;
        o
    };

    let raw = RawHeader {
        signature: SIGNATURE,
        major_version: MAJOR_VER.into(),
        minor_version: MINOR_VER.into(),
        header_size: (HEADER_SIZE as u32).into(),
        flags: 0.into(),
        hwid_offset: place(hwid_size).into(),
        hwid_size: hwid_size.into(),
        rootkey_offset: place(rootkey_size).into(),
        rootkey_size: rootkey_size.into(),
        bmpfv_offset: place(bmpfv_size).into(),
        bmpfv_size: bmpfv_size.into(),
        recovery_key_offset: place(recovery_size).into(),
        recovery_key_size: recovery_size.into(),
        pad: [0; 80],
    };
    blob[..HEADER_SIZE].copy_from_slice(raw.as_bytes());

    blob
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn create_and_find() {
        let mut blob = create_gbb(0x20, 0x100, 0x40, 0x100);
        let gbb = Gbb::find(&blob).unwrap();

        assert_eq!(gbb.offset, 0);
        assert_eq!(gbb.hwid_offset as usize, HEADER_SIZE);
        assert_eq!(gbb.rootkey_size, 0x100);
        assert_eq!(
            gbb.recovery_key_offset,
            (HEADER_SIZE + 0x20 + 0x100 + 0x40) as u32
        );

        let range = gbb.hwid_range();
        blob[range.start..range.start + 5].copy_from_slice(b"MODEL");
        let gbb = Gbb::find(&blob).unwrap();
        assert_eq!(gbb.hwid(&blob), b"MODEL");
    }

    #[test]
    fn single_header_required() {
        let gbb = create_gbb(0x20, 0x40, 0, 0);
        let mut blob = gbb.clone();
        blob.extend_from_slice(&gbb);

        assert_matches!(Gbb::find(&blob), Err(Error::MultipleHeaders(2)));
    }

    #[test]
    fn hwid_must_have_nul() {
        let mut blob = create_gbb(4, 0x40, 0, 0);
        let range = Gbb::find(&blob).unwrap().hwid_range();
        blob[range].copy_from_slice(b"ABCD");

        assert_matches!(Gbb::find(&blob), Err(Error::NotFound(_)));
    }

    #[test]
    fn flags_rewrite() {
        let mut blob = create_gbb(0x20, 0x40, 0, 0);
        let gbb = Gbb::find(&blob).unwrap();
        assert_eq!(gbb.flags, 0);

        gbb.write_flags(&mut blob, 0x39);
        assert_eq!(Gbb::find(&blob).unwrap().flags, 0x39);
    }
}
