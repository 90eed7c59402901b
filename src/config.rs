/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! The updater configuration: both images, the cached system property cells,
//! the quirk registry, and the temp-file list. A configuration is built from
//! parsed arguments, used for exactly one update call, and removes every
//! temporary file it created when it is dropped.

use std::{
    io::{self, Read, Write},
    path::PathBuf,
};

use clap::ValueEnum;
use tempfile::TempPath;
use thiserror::Error;
use tracing::debug;

use crate::{
    archive::{self, Archive},
    flash::{self, Flashrom, WpState, PROG_EC, PROG_HOST, PROG_PD},
    image::{self, FirmwareImage},
    quirks::{self, QuirkEntry, QuirkKind},
    sysprop::{self, ActiveSlot, PropertyKind},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Manifest is only available for archives")]
    ManifestNeedsArchive,
    #[error("EC/PD images are not supported in the current mode")]
    SingleImageOnly,
    #[error("Archive error")]
    Archive(#[from] archive::Error),
    #[error("Image error")]
    Image(#[from] image::Error),
    #[error("Quirk error")]
    Quirk(#[from] quirks::Error),
    #[error("Property error")]
    SysProp(#[from] sysprop::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum UpdateMode {
    Autoupdate,
    Recovery,
    Legacy,
    Factory,
    #[value(name = "factory_install")]
    FactoryInstall,
}

/// Parsed arguments for building an updater configuration. This mirrors the
/// CLI surface but carries no clap types, so tests can construct it directly.
#[derive(Default)]
pub struct UpdaterConfigArguments {
    pub image: Option<String>,
    pub ec_image: Option<String>,
    pub pd_image: Option<String>,
    pub archive: Option<PathBuf>,
    pub quirks: Option<String>,
    pub mode: Option<UpdateMode>,
    pub programmer: Option<String>,
    pub emulation: Option<PathBuf>,
    pub sys_props: Option<String>,
    pub write_protection: Option<i64>,
    pub is_factory: bool,
    pub try_update: bool,
    pub force_update: bool,
    pub do_manifest: bool,
    pub verbosity: u8,
}

/// What the caller should do after setup.
#[derive(Debug, Eq, PartialEq)]
pub enum SetupAction {
    Proceed,
    ManifestPrinted,
}

pub type PropertyGetter = fn(&UpdaterConfig) -> i64;

struct PropertyCell {
    getter: PropertyGetter,
    value: Option<i64>,
}

pub struct UpdaterConfig {
    pub image: Option<FirmwareImage>,
    pub image_current: Option<FirmwareImage>,
    pub ec_image: Option<FirmwareImage>,
    pub pd_image: Option<FirmwareImage>,
    properties: [PropertyCell; PropertyKind::COUNT],
    pub quirks: [QuirkEntry; QuirkKind::COUNT],
    pub archive: Option<Archive>,
    tempfiles: Vec<TempPath>,
    pub programmer: String,
    pub try_update: bool,
    pub force_update: bool,
    pub legacy_update: bool,
    pub factory_update: bool,
    pub verbosity: u8,
    pub emulation: Option<PathBuf>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdaterConfig {
    pub fn new() -> Self {
        Self {
            image: None,
            image_current: None,
            ec_image: None,
            pd_image: None,
            properties: [
                PropertyCell {
                    getter: host_get_mainfw_act,
                    value: None,
                },
                PropertyCell {
                    getter: host_get_tpm_fwver,
                    value: None,
                },
                PropertyCell {
                    getter: host_get_fw_vboot2,
                    value: None,
                },
                PropertyCell {
                    getter: host_get_platform_version,
                    value: None,
                },
                PropertyCell {
                    getter: host_get_wp_hw,
                    value: None,
                },
                PropertyCell {
                    getter: host_get_wp_sw,
                    value: None,
                },
            ],
            quirks: quirks::register_quirks(),
            archive: None,
            tempfiles: vec![],
            programmer: PROG_HOST.to_owned(),
            try_update: false,
            force_update: false,
            legacy_update: false,
            factory_update: false,
            verbosity: 0,
            emulation: None,
        }
    }

    /// Get a system property, invoking its getter on first access and
    /// caching the result for the lifetime of the configuration.
    pub fn get_property(&mut self, kind: PropertyKind) -> i64 {
        let index = kind.index();
        if let Some(value) = self.properties[index].value {
            return value;
        }

        let getter = self.properties[index].getter;
        let value = getter(self);
        self.properties[index].value = Some(value);
        value
    }

    /// Override a property. The getter will never be invoked for it.
    pub fn override_property(&mut self, kind: PropertyKind, value: i64) {
        self.properties[kind.index()].value = Some(value);
    }

    /// Log all system properties. This forces every getter to run, so it is
    /// only worth the cost when debugging.
    pub fn dump_properties(&mut self) {
        let values = PropertyKind::ALL.map(|p| self.get_property(p));
        debug!("System properties: {values:?}");
    }

    /// Whether write protection is effective: disabled hardware WP always
    /// wins, otherwise anything but a clean "disabled" from software WP
    /// (including errors) counts as enabled.
    pub fn is_write_protection_enabled(&mut self) -> bool {
        if self.get_property(PropertyKind::WpHw) == 0 {
            return false;
        }

        self.get_property(PropertyKind::WpSw) != 0
    }

    /// Create a temporary file that lives until the configuration is
    /// dropped.
    pub fn create_temp_file(&mut self) -> io::Result<PathBuf> {
        let file = tempfile::Builder::new().prefix("fwupdater.").tempfile()?;
        let (_, temp_path) = file.into_parts();
        let path = temp_path.to_path_buf();

        debug!("Created new temporary file: {path:?}");
        self.tempfiles.push(temp_path);
        Ok(path)
    }

    /// Set up the configuration from parsed arguments. Returns whether the
    /// caller should proceed with the update or has already been served
    /// (manifest mode).
    pub fn setup(&mut self, args: &UpdaterConfigArguments) -> Result<SetupAction> {
        self.verbosity = args.verbosity;
        if args.force_update {
            self.force_update = true;
        }

        if args.do_manifest && args.archive.is_none() {
            return Err(Error::ManifestNeedsArchive);
        }

        if args.try_update {
            self.try_update = true;
        }
        let mut is_factory = args.is_factory;
        match args.mode {
            Some(UpdateMode::Autoupdate) => self.try_update = true,
            Some(UpdateMode::Recovery) => self.try_update = false,
            Some(UpdateMode::Legacy) => self.legacy_update = true,
            Some(UpdateMode::Factory) | Some(UpdateMode::FactoryInstall) => is_factory = true,
            None => {}
        }
        if is_factory {
            // Must be processed after the mode string.
            self.factory_update = true;
            self.try_update = false;
        }

        let mut check_single_image = false;
        if let Some(programmer) = &args.programmer {
            check_single_image = true;
            self.programmer = programmer.clone();
            debug!("AP (host) programmer changed to {programmer}");
        }
        if let Some(list) = &args.sys_props {
            for (kind, value) in sysprop::parse_override_list(list)? {
                debug!("property[{}].value = {value}", kind.index());
                self.override_property(kind, value);
            }
        }
        if let Some(wp) = args.write_protection {
            // Must be processed after sys_props.
            self.override_property(PropertyKind::WpHw, wp);
            self.override_property(PropertyKind::WpSw, wp);
        }

        if let Some(emulation) = &args.emulation {
            check_single_image = true;
            debug!("Using file {emulation:?} for emulation");
            self.image_current = Some(FirmwareImage::load(
                &emulation.to_string_lossy(),
                None,
                &self.programmer,
            )?);
            self.emulation = Some(emulation.clone());
        }

        let archive_path = args.archive.clone().unwrap_or_else(|| PathBuf::from("."));
        self.archive = Some(Archive::open(&archive_path)?);

        self.load_images(args)?;

        if args.do_manifest {
            archive::print_json_manifest(self.archive.as_ref().unwrap())?;
            return Ok(SetupAction::ManifestPrinted);
        }

        // Quirks are loaded only after the images, because the target image
        // decides the default quirks, and the user list must override them.
        if let Some(image) = &self.image {
            if let Some(defaults) = quirks::default_quirks(image) {
                quirks::setup_quirks(defaults, self)?;
            }
        }
        if let Some(list) = &args.quirks {
            quirks::setup_quirks(list, self)?;
        }

        if check_single_image && (self.ec_image.is_some() || self.pd_image.is_some()) {
            return Err(Error::SingleImageOnly);
        }

        Ok(SetupAction::Proceed)
    }

    fn load_images(&mut self, args: &UpdaterConfigArguments) -> Result<()> {
        if self.image.is_none() {
            if let Some(image) = &args.image {
                let image = if image == "-" {
                    eprintln!("Reading image from stdin...");
                    let path = self.create_temp_file()?;
                    save_stdin(&path)?;
                    path.to_string_lossy().into_owned()
                } else {
                    image.clone()
                };

                self.image = Some(FirmwareImage::load(
                    &image,
                    self.archive.as_ref(),
                    &self.programmer,
                )?);
            }
        }

        if self.emulation.is_some() {
            return Ok(());
        }

        if self.ec_image.is_none() {
            if let Some(ec_image) = &args.ec_image {
                self.ec_image = Some(FirmwareImage::load(
                    ec_image,
                    self.archive.as_ref(),
                    PROG_EC,
                )?);
            }
        }
        if self.pd_image.is_none() {
            if let Some(pd_image) = &args.pd_image {
                self.pd_image = Some(FirmwareImage::load(
                    pd_image,
                    self.archive.as_ref(),
                    PROG_PD,
                )?);
            }
        }

        Ok(())
    }
}

fn save_stdin(path: &std::path::Path) -> io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    let mut stdin = io::stdin().lock();
    let mut buf = [0u8; 4096];

    loop {
        let n = stdin.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
    }

    file.flush()
}

fn host_get_mainfw_act(_cfg: &UpdaterConfig) -> i64 {
    match flash::crossystem_get("mainfw_act").as_deref() {
        Ok("A") => ActiveSlot::A.to_property(),
        Ok("B") => ActiveSlot::B.to_property(),
        _ => ActiveSlot::Unknown.to_property(),
    }
}

fn host_get_tpm_fwver(_cfg: &UpdaterConfig) -> i64 {
    flash::crossystem_get_int("tpm_fwver")
}

fn host_get_fw_vboot2(_cfg: &UpdaterConfig) -> i64 {
    flash::crossystem_get_int("fw_vboot2")
}

fn host_get_platform_version(_cfg: &UpdaterConfig) -> i64 {
    flash::mosys_platform_version()
}

/// wpsw refers to the write protection switch, not software. wpsw_cur may
/// not be available, especially in recovery mode, so fall back to wpsw_boot.
fn host_get_wp_hw(_cfg: &UpdaterConfig) -> i64 {
    let value = flash::crossystem_get_int("wpsw_cur");
    if value < 0 {
        return flash::crossystem_get_int("wpsw_boot");
    }
    value
}

fn host_get_wp_sw(cfg: &UpdaterConfig) -> i64 {
    match Flashrom::new(&cfg.programmer, 0).wp_status() {
        Ok(WpState::Disabled) => 0,
        Ok(WpState::Enabled) => 1,
        Err(_) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail_getter(_cfg: &UpdaterConfig) -> i64 {
        panic!("getter must not be invoked after override");
    }

    #[test]
    fn property_caching() {
        fn counting_getter(_cfg: &UpdaterConfig) -> i64 {
            use std::sync::atomic::{AtomicI64, Ordering};
            static CALLS: AtomicI64 = AtomicI64::new(0);
            CALLS.fetch_add(1, Ordering::SeqCst) + 100
        }

        let mut cfg = UpdaterConfig::new();
        cfg.properties[PropertyKind::TpmFwver.index()].getter = counting_getter;

        // The getter runs exactly once; later reads hit the cache.
        assert_eq!(cfg.get_property(PropertyKind::TpmFwver), 100);
        assert_eq!(cfg.get_property(PropertyKind::TpmFwver), 100);
    }

    #[test]
    fn property_override_bypasses_getter() {
        let mut cfg = UpdaterConfig::new();
        cfg.properties[PropertyKind::PlatformVer.index()].getter = fail_getter;

        cfg.override_property(PropertyKind::PlatformVer, 3);
        assert_eq!(cfg.get_property(PropertyKind::PlatformVer), 3);
    }

    #[test]
    fn write_protection_folding() {
        // Hardware WP disabled wins regardless of software WP.
        let mut cfg = UpdaterConfig::new();
        cfg.override_property(PropertyKind::WpHw, 0);
        assert!(!cfg.is_write_protection_enabled());

        // Hardware WP errors count as enabled; software WP decides.
        let mut cfg = UpdaterConfig::new();
        cfg.override_property(PropertyKind::WpHw, -1);
        cfg.override_property(PropertyKind::WpSw, 1);
        assert!(cfg.is_write_protection_enabled());

        let mut cfg = UpdaterConfig::new();
        cfg.override_property(PropertyKind::WpHw, 1);
        cfg.override_property(PropertyKind::WpSw, -1);
        assert!(cfg.is_write_protection_enabled());

        let mut cfg = UpdaterConfig::new();
        cfg.override_property(PropertyKind::WpHw, 1);
        cfg.override_property(PropertyKind::WpSw, 0);
        assert!(!cfg.is_write_protection_enabled());
    }

    #[test]
    fn temp_files_removed_on_drop() {
        let mut cfg = UpdaterConfig::new();
        let a = cfg.create_temp_file().unwrap();
        let b = cfg.create_temp_file().unwrap();
        assert!(a.exists() && b.exists());

        drop(cfg);
        assert!(!a.exists() && !b.exists());
    }
}
