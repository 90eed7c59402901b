/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Preservation engine: byte-exact carry-over of per-device state from the
//! current image into the target image before a full update. Covers the GBB
//! flags and HWID, the Intel ME descriptor handling, and the designated
//! preserved sections.

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::UpdaterConfig,
    format::gbb::Gbb,
    image::{self, FirmwareImage},
    quirks::{self, QuirkKind},
    util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cannot find section {0} in both images")]
    MissingSection(String),
    #[error("Cannot find GBB in image: {0}")]
    MissingGbb(String),
    #[error("HWID from the current image does not fit in the target GBB")]
    HwidTooLarge,
    #[error("No image to preserve {0}")]
    MissingImage(&'static str),
    #[error("Quirk error")]
    Quirk(#[from] quirks::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Sections preserved by [`preserve_images`] whenever the current image has
/// them. "RO_FSG" is a legacy alias kept for not-yet-migrated devices.
const OPTIONAL_SECTIONS: &[&str] = &[
    image::RO_PRESERVE,
    image::RW_PRESERVE,
    image::RW_NVRAM,
    image::RW_ELOG,
    image::SMMSTORE,
    "RO_FSG",
];

fn images_pair(cfg: &mut UpdaterConfig) -> Result<(&FirmwareImage, &mut FirmwareImage)> {
    match (&cfg.image_current, &mut cfg.image) {
        (Some(from), Some(to)) => Ok((from, to)),
        (None, _) => Err(Error::MissingImage("from")),
        (_, None) => Err(Error::MissingImage("to")),
    }
}

/// Copy the named section from one image into the other. The offsets may
/// differ; only the contents are carried over. A larger source section is
/// truncated into the destination; a smaller one leaves the tail of the
/// destination untouched.
pub fn preserve_firmware_section(
    from: &FirmwareImage,
    to: &mut FirmwareImage,
    name: &str,
) -> Result<()> {
    let (Some(from_section), Some(to_range)) = (from.section(name), to.section_range(name))
    else {
        debug!(
            "Cannot find section {name}: from={}, to={}",
            from.has_section(name),
            to.has_section(name)
        );
        return Err(Error::MissingSection(name.to_owned()));
    };

    if from_section.len() > to_range.len() {
        warn!("Section {name} is truncated after update");
    }

    let to_write = from_section.len().min(to_range.len());
    let data = from_section[..to_write].to_vec();
    to.section_mut(name).unwrap()[..to_write].copy_from_slice(&data);

    Ok(())
}

/// Preserve the GBB contents: currently only the flags word and the HWID.
pub fn preserve_gbb(from: &FirmwareImage, to: &mut FirmwareImage) -> Result<()> {
    let find = |image: &FirmwareImage| -> Result<Gbb> {
        let section = image
            .section(image::GBB)
            .ok_or_else(|| Error::MissingGbb(image.display_name().to_owned()))?;
        Gbb::find(section).map_err(|_| Error::MissingGbb(image.display_name().to_owned()))
    };

    let gbb_from = find(from)?;
    let gbb_to = find(to)?;

    let from_section = from.section(image::GBB).unwrap();
    let hwid = gbb_from.hwid(from_section).to_vec();
    if hwid.len() >= gbb_to.hwid_size as usize {
        return Err(Error::HwidTooLarge);
    }

    let to_section = to.section_mut(image::GBB).unwrap();
    gbb_to.write_flags(to_section, gbb_from.flags);

    // Zero the whole field so there is no garbage after the NUL.
    let range = gbb_to.hwid_range();
    to_section[range.clone()].fill(0);
    to_section[range.start..range.start + hwid.len()].copy_from_slice(&hwid);

    Ok(())
}

/// Handle the regions locked by the Intel management engine. An SI_ME that
/// reads back fully erased means the ME is locked and the flash descriptor
/// must be carried over unmodified; otherwise the unlock quirk may patch the
/// descriptor for the update.
pub fn preserve_management_engine(cfg: &mut UpdaterConfig) -> Result<()> {
    let me_is_locked = {
        let from = cfg.image_current.as_ref().ok_or(Error::MissingImage("from"))?;
        match from.section(image::SI_ME) {
            None => {
                debug!("Skipped because no section {}", image::SI_ME);
                return Ok(());
            }
            Some(section) => util::is_filled_with(section, 0xff),
        }
    };

    if me_is_locked {
        debug!("ME is probably locked - preserving {}", image::SI_DESC);
        let (from, to) = images_pair(cfg)?;
        return preserve_firmware_section(from, to, image::SI_DESC);
    }

    Ok(quirks::try_apply(cfg, QuirkKind::UnlockMeForUpdate)?)
}

/// Preserve all critical state from the current firmware into the target:
/// GBB, ME descriptor, both VPDs, and every optional preserved section the
/// current image carries. Individual failures are counted but never abort
/// the sequence.
pub fn preserve_images(cfg: &mut UpdaterConfig) -> usize {
    let mut errors = 0;
    let mut run = |result: Result<()>| {
        if let Err(e) = result {
            debug!("Preservation failure: {e}");
            errors += 1;
        }
    };

    run(images_pair(cfg).and_then(|(from, to)| preserve_gbb(from, to)));
    run(preserve_management_engine(cfg));
    run(images_pair(cfg).and_then(|(from, to)| {
        preserve_firmware_section(from, to, image::RO_VPD)
    }));
    run(images_pair(cfg).and_then(|(from, to)| {
        preserve_firmware_section(from, to, image::RW_VPD)
    }));

    for name in OPTIONAL_SECTIONS {
        let exists = cfg
            .image_current
            .as_ref()
            .is_some_and(|from| from.has_section(name));
        if !exists {
            continue;
        }

        run(images_pair(cfg).and_then(|(from, to)| preserve_firmware_section(from, to, name)));
    }

    errors
}
