/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Update policy: compatibility checks between the current and target
//! images, update-mode dispatch, slot selection, and the section-granular
//! writes. This is the only module that observes [`UpdateError::NeedRoUpdate`],
//! which carries the Try-RW to Full fallback.

use std::fs;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    config::UpdaterConfig,
    flash::{self, Flashrom},
    format::{
        gbb::Gbb,
        vboot::{self, Keyblock, PackedKey},
    },
    image::{self, section_needs_update, FirmwareImage},
    preserve,
    quirks::{self, QuirkKind},
    sysprop::{ActiveSlot, PropertyKind},
};

const CBFS_AUTO_UPDATE_TAG: &str = "cros_allow_auto_update";

/// The closed error set surfaced by [`update_firmware`].
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Try-RW saw an RO difference with write protection off. Only the
    /// top-level dispatcher may observe this; it falls back to a full
    /// update.
    #[error("RO changed and no WP. Need full update.")]
    NeedRoUpdate,
    #[error("No image to update; try specifying one with -i.")]
    NoImage,
    #[error("Cannot load the active system firmware. {0}")]
    SystemImage(String),
    #[error("The given firmware image is not valid. {0}")]
    InvalidImage(String),
    #[error("Failed writing system flags to try update. {0}")]
    SetCookies(String),
    #[error("Failed writing firmware. {0}")]
    WriteFirmware(String),
    #[error("The system platform is not compatible. {0}")]
    Platform(String),
    #[error("No valid RW target to update. Abort.")]
    Target,
    #[error("RW not signed by the same RO root key. {0}")]
    RootKey(String),
    #[error("RW not usable due to TPM anti-rollback. {0}")]
    TpmRollback(String),
    #[error("Unknown error. {0}")]
    Unknown(String),
}

impl UpdateError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NeedRoUpdate => 1,
            Self::NoImage => 2,
            Self::SystemImage(_) => 3,
            Self::InvalidImage(_) => 4,
            Self::SetCookies(_) => 5,
            Self::WriteFirmware(_) => 6,
            Self::Platform(_) => 7,
            Self::Target => 8,
            Self::RootKey(_) => 9,
            Self::TpmRollback(_) => 10,
            Self::Unknown(_) => 11,
        }
    }
}

type Result<T> = std::result::Result<T, UpdateError>;

/// Which of the configured images a write refers to.
#[derive(Clone, Copy, Debug)]
enum ImageSel {
    Target,
    Current,
    Ec,
    Pd,
}

fn image_ref(cfg: &UpdaterConfig, sel: ImageSel) -> Option<&FirmwareImage> {
    match sel {
        ImageSel::Target => cfg.image.as_ref(),
        ImageSel::Current => cfg.image_current.as_ref(),
        ImageSel::Ec => cfg.ec_image.as_ref(),
        ImageSel::Pd => cfg.pd_image.as_ref(),
    }
}

/// Which RW slot a [`decide_rw_target`] query refers to: the active slot to
/// compare against, or the opposite slot to write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RwTarget {
    Check,
    Update,
}

/// Load the active system firmware through the programmer.
fn load_system_firmware(cfg: &mut UpdaterConfig) -> std::result::Result<(), flash::Error> {
    let tmp_file = cfg.create_temp_file()?;
    Flashrom::new(&cfg.programmer, cfg.verbosity).read(&tmp_file)?;

    let image = FirmwareImage::load(&tmp_file.to_string_lossy(), None, &cfg.programmer)?;
    cfg.image_current = Some(image);
    Ok(())
}

/// Write a section (or with `None`, the whole image) to the system flash. In
/// emulation mode the write is spliced into the emulation file instead.
fn write_firmware(
    cfg: &mut UpdaterConfig,
    sel: ImageSel,
    section: Option<&str>,
) -> std::result::Result<(), flash::Error> {
    if let Some(emulation) = cfg.emulation.clone() {
        let image = image_ref(cfg, sel).expect("no image data to write");
        info!(
            "(emulation) Writing {} from {} to {} (emu={})",
            section.unwrap_or("whole image"),
            image.display_name(),
            image.programmer,
            emulation.display(),
        );
        return flash::emulate_write_firmware(&emulation, image, section);
    }

    let tmp_file = cfg.create_temp_file()?;
    let image = image_ref(cfg, sel).expect("no image data to write");
    let programmer = image.programmer.clone();
    fs::write(&tmp_file, image.data())?;

    Flashrom::new(&programmer, cfg.verbosity.saturating_add(1)).write(&tmp_file, section)
}

/// Write a section if the image is loaded and has it; missing data or a
/// missing section is silently fine.
fn write_optional_firmware(
    cfg: &mut UpdaterConfig,
    sel: ImageSel,
    section: Option<&str>,
) -> std::result::Result<(), flash::Error> {
    let Some(image) = image_ref(cfg, sel) else {
        debug!("No data in {sel:?} image");
        return Ok(());
    };
    if let Some(name) = section {
        if !image.has_section(name) {
            debug!("Image {} does not have section {name}", image.display_name());
            return Ok(());
        }
    }

    write_firmware(cfg, sel, section)
}

/// Decide which RW section to check or to update. In vboot1 the active slot
/// is always assumed to be A, so B is written and A is checked. In vboot2 the
/// opposite of the reported active slot is written; an unknown slot (system
/// booted from RO) means there is no valid target.
fn decide_rw_target(
    cfg: &mut UpdaterConfig,
    target: RwTarget,
    is_vboot2: bool,
) -> Option<&'static str> {
    let a = image::RW_SECTION_A;
    let b = image::RW_SECTION_B;

    if !is_vboot2 {
        return Some(if target == RwTarget::Update { b } else { a });
    }

    match ActiveSlot::from_property(cfg.get_property(PropertyKind::MainfwAct)) {
        ActiveSlot::A => Some(if target == RwTarget::Update { b } else { a }),
        ActiveSlot::B => Some(if target == RwTarget::Update { a } else { b }),
        ActiveSlot::Unknown => None,
    }
}

/// Set the system properties that make the firmware try the newly written
/// slot on the next boot.
fn set_try_cookies(cfg: &UpdaterConfig, target: &str, is_vboot2: bool) -> Result<()> {
    let mut tries = 6;
    // EC software sync needs a few more reboots.
    if cfg.ec_image.is_some() {
        tries += 2;
    }

    let slot = if target == image::RW_SECTION_A {
        "A"
    } else if target == image::RW_SECTION_B {
        "B"
    } else {
        return Err(UpdateError::SetCookies(format!("Unknown target: {target}")));
    };

    if cfg.emulation.is_some() {
        println!("(emulation) Setting try_next to {slot}, try_count to {tries}.");
        return Ok(());
    }

    if is_vboot2 {
        flash::crossystem_set("fw_try_next", slot).map_err(|e| {
            UpdateError::SetCookies(format!("Failed to set fw_try_next to {slot}: {e}"))
        })?;
    }
    flash::crossystem_set("fw_try_count", &tries.to_string()).map_err(|e| {
        UpdateError::SetCookies(format!("Failed to set fw_try_count to {tries}: {e}"))
    })?;

    Ok(())
}

/// The platform is identified by the RO firmware ID up to and including the
/// first dot. Both images must agree on it.
fn check_compatible_platform(cfg: &UpdaterConfig) -> Result<()> {
    let from = cfg.image_current.as_ref().unwrap();
    let to = cfg.image.as_ref().unwrap();

    let Some(dot) = from.ro_version.find('.') else {
        return Err(UpdateError::Platform(format!(
            "Missing dot in RO versions ({} vs {})",
            from.ro_version, to.ro_version
        )));
    };
    if to.ro_version.find('.').is_none() {
        return Err(UpdateError::Platform(format!(
            "Missing dot in RO versions ({} vs {})",
            from.ro_version, to.ro_version
        )));
    }

    let prefix = &from.ro_version[..=dot];
    debug!("Platform: {prefix}");

    if to.ro_version.get(..=dot) != Some(prefix) {
        return Err(UpdateError::Platform(format!(
            "{} vs {}",
            from.ro_version, to.ro_version
        )));
    }

    Ok(())
}

fn find_root_key<'a>(image: &'a FirmwareImage) -> Option<(Gbb, &'a [u8])> {
    let section = image.section(image::GBB)?;
    let gbb = Gbb::find(section).ok()?;
    Some((gbb, section))
}

/// Check that the root key of the current (RO) image can verify the target
/// image's VBLOCK_A keyblock. VBLOCK_A and VBLOCK_B are assumed to be signed
/// the same way.
fn check_compatible_root_key(cfg: &UpdaterConfig) -> Result<()> {
    let from = cfg.image_current.as_ref().unwrap();
    let to = cfg.image.as_ref().unwrap();

    let Some((gbb, gbb_section)) = find_root_key(from) else {
        return Err(UpdateError::RootKey(format!(
            "Cannot find GBB in image: {}",
            from.display_name()
        )));
    };
    let rootkey = PackedKey::parse(&gbb_section[gbb.rootkey_range()])
        .map_err(|e| UpdateError::RootKey(format!("Invalid root key: {e}")))?;

    let Some(vblock) = to.section(image::VBLOCK_A) else {
        return Err(UpdateError::RootKey(format!(
            "No {} section in target image",
            image::VBLOCK_A
        )));
    };
    let keyblock = Keyblock::parse(vblock)
        .map_err(|e| UpdateError::RootKey(format!("Invalid keyblock: {e}")))?;

    if let Err(e) = keyblock.verify(&rootkey) {
        debug!("Keyblock verification failed: {e}");

        // Try harder to provide more diagnostics before giving up.
        let rootkey_to = find_root_key(to).and_then(|(gbb_to, section_to)| {
            PackedKey::parse(&section_to[gbb_to.rootkey_range()]).ok().map(|k| {
                (k.sha1_hex(), k.same_key(&rootkey))
            })
        });

        match rootkey_to {
            Some((_, true)) => info!(
                "Current (RO) image root key is {}, same as target (RW) image. Maybe RW corrupt?",
                rootkey.sha1_hex()
            ),
            Some((sha1, false)) => info!(
                "Current (RO) image root key is {}, target (RW) image is signed with rootkey {sha1}.",
                rootkey.sha1_hex()
            ),
            None => info!(
                "Current (RO) image root key is {}, target (RW) image is signed with rootkey <invalid>.",
                rootkey.sha1_hex()
            ),
        }

        return Err(UpdateError::RootKey(
            "Target image is not signed by the current root key".to_owned(),
        ));
    }

    Ok(())
}

/// Check the target's key versions against the TPM anti-rollback floor. A
/// stored `tpm_fwver` of zero is explicitly legal (uninitialized TPM).
fn do_check_compatible_tpm_keys(cfg: &mut UpdaterConfig) -> std::result::Result<(), String> {
    let (data_key_version, firmware_version) = {
        let to = cfg.image.as_ref().unwrap();
        let Some(vblock) = to.section(image::VBLOCK_A) else {
            return Err(format!("No {} section in target image", image::VBLOCK_A));
        };
        vboot::key_versions(vblock).map_err(|e| format!("Invalid keyblock: {e}"))?
    };

    let tpm_fwver = cfg.get_property(PropertyKind::TpmFwver);
    if tpm_fwver < 0 {
        return Err(format!("Invalid tpm_fwver: {tpm_fwver}"));
    }

    let tpm_data_key_version = (tpm_fwver >> 16) as u32;
    let tpm_firmware_version = (tpm_fwver & 0xffff) as u32;
    debug!("TPM: data_key_version = {tpm_data_key_version}, firmware_version = {tpm_firmware_version}");

    if tpm_data_key_version > data_key_version {
        return Err(format!(
            "Data key version rollback detected ({tpm_data_key_version}->{data_key_version})"
        ));
    }
    if tpm_firmware_version > firmware_version {
        return Err(format!(
            "Firmware version rollback detected ({tpm_firmware_version}->{firmware_version})"
        ));
    }

    Ok(())
}

fn check_compatible_tpm_keys(cfg: &mut UpdaterConfig) -> Result<()> {
    let Err(message) = do_check_compatible_tpm_keys(cfg) else {
        return Ok(());
    };

    if !cfg.force_update {
        error!("Add --force if you want to waive TPM checks.");
        return Err(UpdateError::TpmRollback(message));
    }

    warn!("TPM keys check is waived by --force. You are on your own.");
    Ok(())
}

/// RW_LEGACY is only updated when both the current and the target legacy
/// firmware opt in with the auto-update CBFS tag, and the contents actually
/// differ.
fn legacy_needs_update(cfg: &mut UpdaterConfig) -> bool {
    debug!("Checking {} contents...", image::RW_LEGACY);

    let probe = |cfg: &mut UpdaterConfig, sel: ImageSel| -> Option<bool> {
        let data = image_ref(cfg, sel)?.data().to_vec();
        let tmp_path = cfg.create_temp_file().ok()?;
        fs::write(&tmp_path, data).ok()?;
        Some(flash::cbfs_file_exists(
            &tmp_path,
            image::RW_LEGACY,
            CBFS_AUTO_UPDATE_TAG,
        ))
    };

    // Both sides must carry the updater tag.
    let has_from = probe(cfg, ImageSel::Current).unwrap_or(false);
    let has_to = probe(cfg, ImageSel::Target).unwrap_or(false);

    if !has_from || !has_to {
        debug!(
            "Current legacy firmware has{} updater tag and target firmware has{} updater tag, won't update.",
            if has_from { "" } else { " no" },
            if has_to { "" } else { " no" },
        );
        return false;
    }

    let from = cfg.image_current.as_ref().unwrap();
    let to = cfg.image.as_ref().unwrap();
    section_needs_update(from, to, Some(image::RW_LEGACY))
}

/// Try-RW update: update only the inactive RW slot and try it on reboot.
fn update_try_rw_firmware(cfg: &mut UpdaterConfig, wp_enabled: bool) -> Result<()> {
    let is_vboot2 = cfg.get_property(PropertyKind::FwVboot2) != 0;

    if let (Some(from), Some(to)) = (&cfg.image_current, &mut cfg.image) {
        let _ = preserve::preserve_gbb(from, to);
    }

    if !wp_enabled {
        let from = cfg.image_current.as_ref().unwrap();
        let to = cfg.image.as_ref().unwrap();
        if section_needs_update(from, to, Some(image::RO_SECTION)) {
            return Err(UpdateError::NeedRoUpdate);
        }
    }

    info!("Checking compatibility...");
    check_compatible_root_key(cfg)?;
    check_compatible_tpm_keys(cfg)?;

    debug!("Firmware {} vboot2.", if is_vboot2 { "is" } else { "is NOT" });
    let Some(check_target) = decide_rw_target(cfg, RwTarget::Check, is_vboot2) else {
        error!("TRY-RW update needs the system to boot in RW firmware.");
        return Err(UpdateError::Target);
    };

    info!("Checking {check_target} contents...");
    if !cfg.image.as_ref().unwrap().has_section(check_target) {
        return Err(UpdateError::InvalidImage(format!(
            "Cannot find section {check_target} in the target image"
        )));
    }

    let mut has_update = true;
    if !cfg.force_update {
        let from = cfg.image_current.as_ref().unwrap();
        let to = cfg.image.as_ref().unwrap();
        has_update = section_needs_update(from, to, Some(check_target));
    }

    if has_update {
        let target = decide_rw_target(cfg, RwTarget::Update, is_vboot2)
            .ok_or(UpdateError::Target)?;
        info!(">> TRY-RW UPDATE: Updating {target} to try on reboot.");

        write_firmware(cfg, ImageSel::Target, Some(target))
            .map_err(|e| UpdateError::WriteFirmware(e.to_string()))?;
        set_try_cookies(cfg, target, is_vboot2)?;
    } else if !is_vboot2 && cfg.emulation.is_none() {
        // Clear trial cookies for vboot1.
        let _ = flash::crossystem_set("fwb_tries", "0");
    }

    // Do not fail on updating legacy.
    if legacy_needs_update(cfg) {
        has_update = true;
        info!(">> LEGACY UPDATE: Updating {}.", image::RW_LEGACY);
        let _ = write_firmware(cfg, ImageSel::Target, Some(image::RW_LEGACY));
    }

    if !has_update {
        info!(">> No need to update.");
    }

    Ok(())
}

/// RW update: rewrite both RW slots plus the shared sections, with write
/// protection still enabled.
fn update_rw_firmware(cfg: &mut UpdaterConfig) -> Result<()> {
    info!(
        ">> RW UPDATE: Updating RW sections ({}, {}, {}, and {}).",
        image::RW_SECTION_A,
        image::RW_SECTION_B,
        image::RW_SHARED,
        image::RW_LEGACY,
    );

    info!("Checking compatibility...");
    check_compatible_root_key(cfg)?;
    check_compatible_tpm_keys(cfg)?;

    for section in [image::RW_SECTION_A, image::RW_SECTION_B, image::RW_SHARED] {
        write_firmware(cfg, ImageSel::Target, Some(section))
            .map_err(|e| UpdateError::WriteFirmware(e.to_string()))?;
    }
    write_optional_firmware(cfg, ImageSel::Target, Some(image::RW_LEGACY))
        .map_err(|e| UpdateError::WriteFirmware(e.to_string()))?;

    Ok(())
}

/// Legacy update: rewrite only RW_LEGACY, with no key or TPM checks.
fn update_legacy_firmware(cfg: &mut UpdaterConfig) -> Result<()> {
    info!(">> LEGACY UPDATE: Updating firmware {}.", image::RW_LEGACY);

    write_firmware(cfg, ImageSel::Target, Some(image::RW_LEGACY))
        .map_err(|e| UpdateError::WriteFirmware(e.to_string()))
}

/// Full update: preserve per-device state, then rewrite the whole flash,
/// plus the optional EC and PD images.
fn update_whole_firmware(cfg: &mut UpdaterConfig) -> Result<()> {
    info!(">> FULL UPDATE: Updating whole firmware image(s), RO+RW.");

    let errors = preserve::preserve_images(cfg);
    if errors > 0 {
        debug!("Failed to preserve {errors} sections - ignore.");
    }

    info!("Checking compatibility...");
    check_compatible_tpm_keys(cfg)?;

    // The FMAP layouts may differ, so everything is rewritten.
    write_firmware(cfg, ImageSel::Target, None)
        .map_err(|e| UpdateError::WriteFirmware(e.to_string()))?;
    write_optional_firmware(cfg, ImageSel::Ec, None)
        .map_err(|e| UpdateError::WriteFirmware(e.to_string()))?;
    write_optional_firmware(cfg, ImageSel::Pd, None)
        .map_err(|e| UpdateError::WriteFirmware(e.to_string()))?;

    Ok(())
}

/// The main updater: decide the update mode from the configuration and the
/// system state, then apply it.
pub fn update_firmware(cfg: &mut UpdaterConfig) -> Result<()> {
    if cfg.image.is_none() {
        return Err(UpdateError::NoImage);
    }

    quirks::try_apply(cfg, QuirkKind::DaisySnowDualModel)
        .map_err(|e| UpdateError::Platform(e.to_string()))?;

    {
        let to = cfg.image.as_ref().unwrap();
        info!(
            ">> Target image: {} (RO:{}, RW/A:{}, RW/B:{}).",
            to.display_name(),
            to.ro_version,
            to.rw_version_a,
            to.rw_version_b,
        );
    }

    quirks::try_apply(cfg, QuirkKind::MinPlatformVersion)
        .map_err(|e| UpdateError::Platform(e.to_string()))?;

    if cfg.image_current.is_none() {
        info!("Loading current system firmware...");
        load_system_firmware(cfg).map_err(|e| UpdateError::SystemImage(e.to_string()))?;
    }
    {
        let from = cfg.image_current.as_ref().unwrap();
        info!(
            ">> Current system: {} (RO:{}, RW/A:{}, RW/B:{}).",
            from.display_name(),
            from.ro_version,
            from.rw_version_a,
            from.rw_version_b,
        );
    }

    check_compatible_platform(cfg)?;

    let wp_enabled = cfg.is_write_protection_enabled();
    info!(
        ">> Write protection: {} (HW={}, SW={}).",
        if wp_enabled { "enabled" } else { "disabled" },
        cfg.get_property(PropertyKind::WpHw),
        cfg.get_property(PropertyKind::WpSw),
    );

    if cfg.factory_update && wp_enabled {
        return Err(UpdateError::Platform(
            "Factory mode needs WP disabled.".to_owned(),
        ));
    }

    quirks::try_apply(cfg, QuirkKind::EnlargeImage)
        .map_err(|e| UpdateError::SystemImage(e.to_string()))?;
    quirks::try_apply(cfg, QuirkKind::EveSmmStore)
        .map_err(|e| UpdateError::InvalidImage(e.to_string()))?;

    if cfg.verbosity > 0 {
        cfg.dump_properties();
    }

    if cfg.legacy_update {
        return update_legacy_firmware(cfg);
    }

    if cfg.try_update {
        match update_try_rw_firmware(cfg, wp_enabled) {
            Err(UpdateError::NeedRoUpdate) => {
                warn!("{}", UpdateError::NeedRoUpdate);
            }
            result => return result,
        }
    }

    if wp_enabled {
        update_rw_firmware(cfg)
    } else {
        update_whole_firmware(cfg)
    }
}
