/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Firmware image data model: an owned byte buffer, its flash map view, and
//! the firmware identifiers extracted from it. Sections are always re-derived
//! from the flash map so that a view can never outlive or alias a stale
//! buffer.

use std::{fs, io, ops::Range, path::Path};

use thiserror::Error;
use tracing::warn;

use crate::{
    archive::{self, Archive},
    format::fmap::{self, Fmap},
    util,
};

pub const RO_FRID: &str = "RO_FRID";
pub const RO_SECTION: &str = "RO_SECTION";
pub const GBB: &str = "GBB";
pub const RO_PRESERVE: &str = "RO_PRESERVE";
pub const RO_VPD: &str = "RO_VPD";
pub const RW_VPD: &str = "RW_VPD";
pub const VBLOCK_A: &str = "VBLOCK_A";
pub const RW_SECTION_A: &str = "RW_SECTION_A";
pub const RW_SECTION_B: &str = "RW_SECTION_B";
pub const RW_FWID: &str = "RW_FWID";
pub const RW_FWID_A: &str = "RW_FWID_A";
pub const RW_FWID_B: &str = "RW_FWID_B";
pub const RW_SHARED: &str = "RW_SHARED";
pub const RW_NVRAM: &str = "RW_NVRAM";
pub const RW_ELOG: &str = "RW_ELOG";
pub const RW_PRESERVE: &str = "RW_PRESERVE";
pub const RW_LEGACY: &str = "RW_LEGACY";
pub const SMMSTORE: &str = "SMMSTORE";
pub const SI_DESC: &str = "SI_DESC";
pub const SI_ME: &str = "SI_ME";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid image (missing FMAP): {0}")]
    MissingFmap(String, #[source] fmap::Error),
    #[error("Does not look like a verified-boot image (no RO_FRID): {0}")]
    NotVbootImage(String),
    #[error("Archive error")]
    Archive(#[from] archive::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A loaded firmware image. The flash map view is parsed once at load time
/// and rebuilt whenever the buffer is replaced or resized.
pub struct FirmwareImage {
    pub programmer: String,
    pub file_name: Option<String>,
    data: Vec<u8>,
    fmap: Fmap,
    pub ro_version: String,
    pub rw_version_a: String,
    pub rw_version_b: String,
}

impl FirmwareImage {
    /// Load an image from a file. If an archive is provided and the path is
    /// relative, the file is read from the archive instead.
    pub fn load(
        file_name: &str,
        archive: Option<&Archive>,
        programmer: &str,
    ) -> Result<Self> {
        let data = match archive {
            Some(ar) if Path::new(file_name).is_relative() => ar.read(file_name)?,
            _ => fs::read(file_name)?,
        };

        Self::from_bytes(data, Some(file_name.to_owned()), programmer)
    }

    pub fn from_bytes(
        data: Vec<u8>,
        file_name: Option<String>,
        programmer: &str,
    ) -> Result<Self> {
        let name = file_name.clone().unwrap_or_else(|| "<memory>".to_owned());
        let fmap = Fmap::find(&data).map_err(|e| Error::MissingFmap(name.clone(), e))?;

        let mut image = Self {
            programmer: programmer.to_owned(),
            file_name,
            data,
            fmap,
            ro_version: String::new(),
            rw_version_a: String::new(),
            rw_version_b: String::new(),
        };

        if !image.has_section(RO_FRID) {
            return Err(Error::NotVbootImage(name));
        }

        image.ro_version = image.firmware_version(RO_FRID);
        if image.has_section(RW_FWID_A) {
            image.rw_version_a = image.firmware_version(RW_FWID_A);
            image.rw_version_b = image.firmware_version(RW_FWID_B);
        } else if image.has_section(RW_FWID) {
            image.rw_version_a = image.firmware_version(RW_FWID);
            image.rw_version_b = image.firmware_version(RW_FWID);
        } else {
            warn!("Unsupported VBoot firmware (no RW ID): {name}");
        }

        Ok(image)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn fmap(&self) -> &Fmap {
        &self.fmap
    }

    /// The byte range of a named section, or `None` if the flash map does not
    /// name it.
    pub fn section_range(&self, name: &str) -> Option<Range<usize>> {
        self.fmap.area(name).map(|a| a.range())
    }

    pub fn section(&self, name: &str) -> Option<&[u8]> {
        self.section_range(name).map(|r| &self.data[r])
    }

    pub fn section_mut(&mut self, name: &str) -> Option<&mut [u8]> {
        let range = self.section_range(name)?;
        Some(&mut self.data[range])
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.fmap.area(name).is_some()
    }

    /// Grow the buffer to `new_len`, filling with `fill`, and rebuild the
    /// flash map view. Shrinking is not supported.
    pub fn extend_to(&mut self, new_len: usize, fill: u8) -> Result<()> {
        if new_len > self.data.len() {
            self.data.resize(new_len, fill);
            self.fmap = Fmap::find(&self.data).map_err(|e| {
                Error::MissingFmap(self.display_name().to_owned(), e)
            })?;
        }

        Ok(())
    }

    /// Replace the buffer contents (e.g. after external tooling rewrote a
    /// copy on disk) and rebuild the flash map view.
    pub fn replace_data(&mut self, data: Vec<u8>) -> Result<()> {
        self.fmap =
            Fmap::find(&data).map_err(|e| Error::MissingFmap(self.display_name().to_owned(), e))?;
        self.data = data;

        Ok(())
    }

    pub fn display_name(&self) -> &str {
        self.file_name.as_deref().unwrap_or("<memory>")
    }

    /// Version string from a firmware ID section, truncated at the first NUL.
    fn firmware_version(&self, section_name: &str) -> String {
        let Some(section) = self.section(section_name) else {
            return String::new();
        };

        String::from_utf8_lossy(util::truncate_at_nul(section)).into_owned()
    }
}

/// Compare a named section between two images. Returns true if the contents
/// differ or if the section exists in only one of them; a section missing
/// from both compares equal. With `None`, whole images are compared.
pub fn section_needs_update(from: &FirmwareImage, to: &FirmwareImage, name: Option<&str>) -> bool {
    match name {
        None => from.data != to.data,
        Some(name) => from.section(name) != to.section(name),
    }
}
