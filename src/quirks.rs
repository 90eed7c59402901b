/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Named policy modifiers that patch the target image or alter the update
//! flow for specific device peculiarities. Each quirk carries an integer
//! value (0 disables it) and an optional apply action. Values come from the
//! per-target defaults first, then the user list; later values win.

use std::{fs, io};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::UpdaterConfig,
    flash, image,
    sysprop::PropertyKind,
};

/// CBFS entry offset the legacy bootloader expects for the SMM store.
const EVE_SMM_STORE_OFFSET: u32 = 0x1bf000;
const SMM_STORE_NAME: &str = "smm_store";

/// Unlocked flash-descriptor master bytes, written at this offset within
/// SI_DESC.
const ME_UNLOCK_OFFSET: usize = 128;
const ME_UNLOCK: [u8; 12] = [
    0x00, 0xff, 0xff, 0xff, 0x00, 0xff, 0xff, 0xff, 0x00, 0xff, 0xff, 0xff,
];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown quirk: {0}")]
    UnknownQuirk(String),
    #[error("Quirk <{0}> is not implemented")]
    NotImplemented(&'static str),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Flash(#[from] flash::Error),
    #[error(transparent)]
    Image(#[from] image::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuirkKind {
    EnlargeImage,
    MinPlatformVersion,
    UnlockMeForUpdate,
    DaisySnowDualModel,
    EveSmmStore,
}

impl QuirkKind {
    pub const ALL: [Self; 5] = [
        Self::EnlargeImage,
        Self::MinPlatformVersion,
        Self::UnlockMeForUpdate,
        Self::DaisySnowDualModel,
        Self::EveSmmStore,
    ];
    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|q| *q == self).unwrap()
    }
}

pub struct QuirkEntry {
    pub name: &'static str,
    pub help: &'static str,
    pub apply: Option<fn(&mut UpdaterConfig) -> Result<()>>,
    pub value: i64,
}

/// The registered quirks, in [`QuirkKind::ALL`] order.
pub fn register_quirks() -> [QuirkEntry; QuirkKind::COUNT] {
    [
        QuirkEntry {
            name: "enlarge_image",
            help: "Enlarge image to match flash size by padding with 0xff",
            apply: Some(quirk_enlarge_image),
            value: 0,
        },
        QuirkEntry {
            name: "min_platform_version",
            help: "Minimum platform version this image can be applied to",
            apply: Some(quirk_min_platform_version),
            value: 0,
        },
        QuirkEntry {
            name: "unlock_me_for_update",
            help: "Unlock the Intel ME region for the duration of the write",
            apply: Some(quirk_unlock_me_for_update),
            value: 0,
        },
        QuirkEntry {
            name: "daisy_snow_dual_model",
            help: "Reject automatic updates on snow/daisy dual-model devices",
            apply: Some(quirk_daisy_snow_dual_model),
            value: 0,
        },
        QuirkEntry {
            name: "eve_smm_store",
            help: "Relocate the SMM store in RW_LEGACY for the legacy bootloader",
            apply: Some(quirk_eve_smm_store),
            value: 0,
        },
    ]
}

/// Default quirks for known target images, keyed by RO version prefix. User
/// supplied quirks override these.
pub fn default_quirks(image: &image::FirmwareImage) -> Option<&'static str> {
    const DEFAULTS: &[(&str, &str)] = &[
        ("Google_Eve.", "unlock_me_for_update,eve_smm_store"),
        ("Google_Snow.", "daisy_snow_dual_model"),
        ("Google_Daisy.", "daisy_snow_dual_model"),
    ];

    DEFAULTS
        .iter()
        .find(|(prefix, _)| image.ro_version.starts_with(prefix))
        .map(|(_, quirks)| *quirks)
}

fn parse_value(s: &str) -> i64 {
    let (s, negative) = match s.strip_prefix('-') {
        Some(rest) => (rest, true),
        None => (s, false),
    };

    let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).unwrap_or(0)
    } else {
        s.parse().unwrap_or(0)
    };

    if negative {
        -value
    } else {
        value
    }
}

/// Apply a quirk list of the form `NAME[=VALUE],...` (comma or space
/// separated) to the configuration. A missing value defaults to 1. Unknown
/// names are an error.
pub fn setup_quirks(list: &str, cfg: &mut UpdaterConfig) -> Result<()> {
    for token in list.split([',', ' ']).filter(|t| !t.is_empty()) {
        let (name, value) = match token.split_once('=') {
            Some((name, value)) => (name, parse_value(value)),
            None => (token, 1),
        };

        let entry = cfg
            .quirks
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::UnknownQuirk(name.to_owned()))?;
        debug!("Set quirk {} to {value}", entry.name);
        entry.value = value;
    }

    Ok(())
}

/// Apply a quirk if its value is non-zero. A zero value is a no-op.
pub fn try_apply(cfg: &mut UpdaterConfig, kind: QuirkKind) -> Result<()> {
    let entry = &cfg.quirks[kind.index()];
    if entry.value == 0 {
        return Ok(());
    }

    let name = entry.name;
    let Some(apply) = entry.apply else {
        return Err(Error::NotImplemented(name));
    };

    debug!("Applying quirk <{name}>");
    apply(cfg)
}

/// If the flash (as read by the programmer) is larger than the target image,
/// pad the target with 0xff so a full update can cover the whole flash.
fn quirk_enlarge_image(cfg: &mut UpdaterConfig) -> Result<()> {
    let from_size = match &cfg.image_current {
        Some(current) => current.size(),
        None => return Ok(()),
    };

    let to = cfg
        .image
        .as_mut()
        .ok_or_else(|| Error::Failed("No target image to enlarge".to_owned()))?;
    if from_size <= to.size() {
        return Ok(());
    }

    debug!("Resize image from {} to {from_size}", to.size());
    to.extend_to(from_size, 0xff)?;
    Ok(())
}

/// Fail when the platform revision is older than the quirk value.
fn quirk_min_platform_version(cfg: &mut UpdaterConfig) -> Result<()> {
    let min_version = cfg.quirks[QuirkKind::MinPlatformVersion.index()].value;
    let platform_version = cfg.get_property(PropertyKind::PlatformVer);

    if platform_version < min_version {
        return Err(Error::Failed(format!(
            "Need platform version >= {min_version} (current is {platform_version})"
        )));
    }

    Ok(())
}

/// Rewrite the flash master section of SI_DESC so the ME region is writable
/// during the update.
fn quirk_unlock_me_for_update(cfg: &mut UpdaterConfig) -> Result<()> {
    let to = cfg
        .image
        .as_mut()
        .ok_or_else(|| Error::Failed("No target image".to_owned()))?;
    let desc = to
        .section_mut(image::SI_DESC)
        .ok_or_else(|| Error::Failed(format!("No {} section in target", image::SI_DESC)))?;

    if desc.len() < ME_UNLOCK_OFFSET + ME_UNLOCK.len() {
        return Err(Error::Failed(format!(
            "{} section too small to unlock",
            image::SI_DESC
        )));
    }

    desc[ME_UNLOCK_OFFSET..ME_UNLOCK_OFFSET + ME_UNLOCK.len()].copy_from_slice(&ME_UNLOCK);
    info!("ME region has been unlocked for this update");
    Ok(())
}

/// snow/daisy shipped two models sharing one firmware name; automatic
/// updates cannot pick the right image.
fn quirk_daisy_snow_dual_model(_cfg: &mut UpdaterConfig) -> Result<()> {
    Err(Error::Failed(
        "Dual-model device (snow/daisy) needs a model-specific image".to_owned(),
    ))
}

/// Carry the SMM store from the current RW_LEGACY into the target, re-added
/// at the fixed offset the legacy bootloader expects.
fn quirk_eve_smm_store(cfg: &mut UpdaterConfig) -> Result<()> {
    let Some(current) = &cfg.image_current else {
        return Ok(());
    };
    let current_data = current.data().to_vec();

    let temp_current = cfg.create_temp_file()?;
    fs::write(&temp_current, current_data)?;

    let store = cfg.create_temp_file()?;
    if !flash::cbfs_extract(&temp_current, image::RW_LEGACY, SMM_STORE_NAME, &store)? {
        debug!("No SMM store in current firmware");
        return Ok(());
    }

    let target_data = cfg
        .image
        .as_ref()
        .ok_or_else(|| Error::Failed("No target image".to_owned()))?
        .data()
        .to_vec();
    let temp_target = cfg.create_temp_file()?;
    fs::write(&temp_target, target_data)?;

    flash::cbfs_remove(&temp_target, image::RW_LEGACY, SMM_STORE_NAME)?;
    flash::cbfs_add(
        &temp_target,
        image::RW_LEGACY,
        SMM_STORE_NAME,
        &store,
        EVE_SMM_STORE_OFFSET,
    )?;

    let data = fs::read(&temp_target)?;
    cfg.image.as_mut().unwrap().replace_data(data)?;
    Ok(())
}
