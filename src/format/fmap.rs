/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Parser for the Flash Map (FMAP) table that names byte ranges of a flash
//! image. The table can live anywhere in the image, so it is located by a
//! signature scan and every named area is bounds-checked against the image
//! before the view is handed out.

use std::mem;

use thiserror::Error;
use tracing::debug;
use zerocopy::{little_endian, FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::util;

pub const SIGNATURE: [u8; 8] = *b"__FMAP__";
pub const VERSION_MAJOR: u8 = 1;

/// Candidate headers are only considered at this alignment.
const SEARCH_STRIDE: usize = 4;

pub const NAME_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No valid FMAP header found in {0} byte image")]
    NotFound(usize),
    #[error("Unsupported FMAP major version: {0}")]
    UnsupportedVersion(u8),
    #[error("FMAP area table exceeds image bounds")]
    AreaTableOutOfBounds,
    #[error("FMAP area {name:?} ({offset}+{size}) exceeds image bounds")]
    AreaOutOfBounds { name: String, offset: u32, size: u32 },
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the FMAP header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`SIGNATURE`].
    signature: [u8; 8],
    ver_major: u8,
    ver_minor: u8,
    base: little_endian::U64,
    size: little_endian::U32,
    name: [u8; NAME_SIZE],
    nareas: little_endian::U16,
}

/// Raw on-disk layout for one FMAP area record.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawArea {
    offset: little_endian::U32,
    size: little_endian::U32,
    name: [u8; NAME_SIZE],
    flags: little_endian::U16,
}

/// One named byte range of the image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FmapArea {
    pub name: String,
    pub offset: u32,
    pub size: u32,
    pub flags: u16,
}

impl FmapArea {
    pub fn range(&self) -> std::ops::Range<usize> {
        let offset = self.offset as usize;
        offset..offset + self.size as usize
    }
}

/// A parsed flash map. This is a read-only view; it becomes stale if the
/// image buffer it was parsed from is resized or reloaded.
#[derive(Clone, Debug)]
pub struct Fmap {
    /// Byte offset of the FMAP header within the image.
    pub offset: usize,
    pub base: u64,
    pub size: u32,
    pub name: String,
    pub areas: Vec<FmapArea>,
}

impl Fmap {
    /// Locate and parse the FMAP table by scanning for its signature. The
    /// first candidate whose header and area table fully validate wins.
    pub fn find(data: &[u8]) -> Result<Self> {
        let header_size = mem::size_of::<RawHeader>();
        let mut pos = 0;

        while pos + header_size <= data.len() {
            if data[pos..pos + 8] == SIGNATURE {
                match Self::parse_at(data, pos) {
                    Ok(fmap) => return Ok(fmap),
                    Err(e) => debug!(offset = pos, "Rejected FMAP candidate: {e}"),
                }
            }

            pos += SEARCH_STRIDE;
        }

        Err(Error::NotFound(data.len()))
    }

    fn parse_at(data: &[u8], offset: usize) -> Result<Self> {
        let (raw, mut remain) = RawHeader::read_from_prefix(&data[offset..])
            .map_err(|_| Error::AreaTableOutOfBounds)?;

        if raw.ver_major != VERSION_MAJOR {
            return Err(Error::UnsupportedVersion(raw.ver_major));
        }

        let nareas = raw.nareas.get() as usize;
        let mut areas = Vec::with_capacity(nareas);

        for _ in 0..nareas {
            let (raw_area, rest) =
                RawArea::read_from_prefix(remain).map_err(|_| Error::AreaTableOutOfBounds)?;
            remain = rest;

            let area = FmapArea {
                name: String::from_utf8_lossy(util::truncate_at_nul(&raw_area.name)).into_owned(),
                offset: raw_area.offset.get(),
                size: raw_area.size.get(),
                flags: raw_area.flags.get(),
            };

            let end = u64::from(area.offset) + u64::from(area.size);
            if end > data.len() as u64 {
                return Err(Error::AreaOutOfBounds {
                    name: area.name,
                    offset: area.offset,
                    size: area.size,
                });
            }

            areas.push(area);
        }

        Ok(Self {
            offset,
            base: raw.base.get(),
            size: raw.size.get(),
            name: String::from_utf8_lossy(util::truncate_at_nul(&raw.name)).into_owned(),
            areas,
        })
    }

    /// Look up an area by its FMAP name.
    pub fn area(&self, name: &str) -> Option<&FmapArea> {
        self.areas.iter().find(|a| a.name == name)
    }

    /// Serialize the flash map table (header plus area records). The result
    /// is what [`Fmap::find`] locates when spliced into an image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let raw = RawHeader {
            signature: SIGNATURE,
            ver_major: VERSION_MAJOR,
            ver_minor: 1,
            base: self.base.into(),
            size: self.size.into(),
            name: pad_name(&self.name),
            nareas: (self.areas.len() as u16).into(),
        };

        let mut buf = raw.as_bytes().to_vec();

        for area in &self.areas {
            let raw_area = RawArea {
                offset: area.offset.into(),
                size: area.size.into(),
                name: pad_name(&area.name),
                flags: area.flags.into(),
            };
            buf.extend_from_slice(raw_area.as_bytes());
        }

        buf
    }
}

fn pad_name(name: &str) -> [u8; NAME_SIZE] {
    let mut buf = [0u8; NAME_SIZE];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    buf
}
