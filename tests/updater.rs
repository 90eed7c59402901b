/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! End-to-end updater flows in emulation mode. Each test builds a pair of
//! firmware images (a LINK-flavored target and a PEPPY-flavored current
//! system sharing the same root key), points the updater at an emulation
//! file, and checks the resulting flash contents or error.

use std::{fs, sync::OnceLock};

use assert_matches::assert_matches;
use rsa::RsaPrivateKey;

use fwupdater::{
    config::{SetupAction, UpdateMode, UpdaterConfig, UpdaterConfigArguments},
    format::{
        fmap::{Fmap, FmapArea},
        gbb::{self, Gbb},
        vboot::{self, SignatureAlgorithm},
    },
    image::{self, FirmwareImage},
    preserve,
    update::{self, UpdateError},
};

const IMAGE_SIZE: usize = 0x10000;
const FMAP_OFFSET: usize = 0x5800;

const ME_UNLOCK: [u8; 12] = [
    0x00, 0xff, 0xff, 0xff, 0x00, 0xff, 0xff, 0xff, 0x00, 0xff, 0xff, 0xff,
];

fn root_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
}

fn other_root_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
}

struct ImageSpec {
    ro_version: &'static str,
    rw_version: &'static str,
    hwid: &'static str,
    gbb_flags: u32,
    data_key_version: u32,
    firmware_version: u32,
    signer: &'static RsaPrivateKey,
    vpd_fill: u8,
    body_fill: u8,
}

fn link_target() -> ImageSpec {
    ImageSpec {
        ro_version: "Google_Link.1111.0.0",
        rw_version: "Google_Link.1111.0.0",
        hwid: "X86 LINK TEST 6638",
        gbb_flags: 0,
        data_key_version: 1,
        firmware_version: 4,
        signer: root_key(),
        vpd_fill: 0x22,
        body_fill: 0x33,
    }
}

/// The current system: PEPPY state (HWID, VPD, GBB flags) with an RO version
/// patched to the LINK platform and resigned with the same root key.
fn peppy_current() -> ImageSpec {
    ImageSpec {
        ro_version: "Google_Link.4389.0.0",
        rw_version: "Google_Peppy.4389.0.0",
        hwid: "X86 PEPPY TEST 4211",
        gbb_flags: 0x39,
        data_key_version: 1,
        firmware_version: 2,
        signer: root_key(),
        vpd_fill: 0x77,
        body_fill: 0x44,
    }
}

/// The unpatched PEPPY image: different platform, different root key.
fn peppy_unpatched() -> ImageSpec {
    ImageSpec {
        ro_version: "Google_Peppy.4389.0.0",
        signer: other_root_key(),
        ..peppy_current()
    }
}

fn layout() -> Fmap {
    let area = |name: &str, offset: u32, size: u32| FmapArea {
        name: name.to_owned(),
        offset,
        size,
        flags: 0,
    };

    Fmap {
        offset: FMAP_OFFSET,
        base: 0,
        size: IMAGE_SIZE as u32,
        name: "FMAP".to_owned(),
        areas: vec![
            area(image::SI_DESC, 0x0000, 0x1000),
            area(image::SI_ME, 0x1000, 0x1000),
            area(image::RO_SECTION, 0x2000, 0x6000),
            area(image::RO_FRID, 0x2000, 0x100),
            area(image::GBB, 0x3000, 0x2000),
            area(image::RO_VPD, 0x8000, 0x800),
            area(image::RW_VPD, 0x8800, 0x800),
            area(image::RW_SECTION_A, 0x9000, 0x2000),
            area(image::VBLOCK_A, 0x9000, 0x1000),
            area(image::RW_FWID_A, 0xaf00, 0x100),
            area(image::RW_SECTION_B, 0xb000, 0x2000),
            area("VBLOCK_B", 0xb000, 0x1000),
            area(image::RW_FWID_B, 0xcf00, 0x100),
            area(image::RW_SHARED, 0xd000, 0x800),
            area(image::RW_NVRAM, 0xd800, 0x800),
            area(image::RW_LEGACY, 0xe000, 0x1000),
            area(image::RW_ELOG, 0xf000, 0x800),
        ],
    }
}

fn put(data: &mut [u8], fmap: &Fmap, name: &str, bytes: &[u8]) {
    let range = fmap.area(name).unwrap().range();
    data[range.start..range.start + bytes.len()].copy_from_slice(bytes);
}

fn fill(data: &mut [u8], fmap: &Fmap, name: &str, value: u8) {
    let range = fmap.area(name).unwrap().range();
    data[range].fill(value);
}

fn cstr(s: &str) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

fn build_image(spec: &ImageSpec) -> Vec<u8> {
    let mut data = vec![0xffu8; IMAGE_SIZE];
    let fmap = layout();

    let table = fmap.to_bytes();
    data[FMAP_OFFSET..FMAP_OFFSET + table.len()].copy_from_slice(&table);

    fill(&mut data, &fmap, image::SI_DESC, 0x5a);
    fill(&mut data, &fmap, image::SI_ME, 0x00);
    put(&mut data, &fmap, image::RO_FRID, &cstr(spec.ro_version));

    // GBB with the HWID, flags, and packed root key.
    let rootkey = vboot::pack_key(
        &spec.signer.to_public_key(),
        SignatureAlgorithm::Rsa2048Sha256,
        spec.data_key_version,
    );
    let mut gbb_blob = gbb::create_gbb(0x100, rootkey.len() as u32, 0, 0x100);
    let header = Gbb::find(&gbb_blob).unwrap();
    let hwid_range = header.hwid_range();
    gbb_blob[hwid_range.start..hwid_range.start + spec.hwid.len()]
        .copy_from_slice(spec.hwid.as_bytes());
    gbb_blob[header.rootkey_range()].copy_from_slice(&rootkey);
    header.write_flags(&mut gbb_blob, spec.gbb_flags);
    put(&mut data, &fmap, image::GBB, &gbb_blob);

    // RW slots: body fill, then the signed keyblock+preamble and the FWID.
    let slot = vboot::build_slot(
        spec.signer,
        SignatureAlgorithm::Rsa2048Sha256,
        spec.data_key_version,
        spec.firmware_version,
    )
    .unwrap();
    fill(&mut data, &fmap, image::RW_SECTION_A, spec.body_fill);
    fill(&mut data, &fmap, image::RW_SECTION_B, spec.body_fill);
    put(&mut data, &fmap, image::VBLOCK_A, &slot);
    put(&mut data, &fmap, "VBLOCK_B", &slot);
    put(&mut data, &fmap, image::RW_FWID_A, &cstr(spec.rw_version));
    put(&mut data, &fmap, image::RW_FWID_B, &cstr(spec.rw_version));

    fill(&mut data, &fmap, image::RO_VPD, spec.vpd_fill);
    fill(&mut data, &fmap, image::RW_VPD, spec.vpd_fill);
    fill(&mut data, &fmap, image::RW_SHARED, spec.body_fill);
    fill(&mut data, &fmap, image::RW_NVRAM, spec.body_fill);
    fill(&mut data, &fmap, image::RW_LEGACY, spec.body_fill);
    fill(&mut data, &fmap, image::RW_ELOG, spec.body_fill);

    data
}

fn section<'a>(data: &'a [u8], name: &str) -> &'a [u8] {
    let fmap = Fmap::find(data).unwrap();
    let range = fmap.area(name).unwrap().range();
    &data[range]
}

/// Run one update in emulation mode and return the result plus the final
/// emulation file contents.
fn run_update(
    target: &[u8],
    current: &[u8],
    customize: impl FnOnce(&mut UpdaterConfigArguments),
) -> (Result<(), UpdateError>, Vec<u8>) {
    let dir = tempfile::tempdir().unwrap();
    let emulation = dir.path().join("emulation.bin");
    let target_path = dir.path().join("target.bin");
    fs::write(&emulation, current).unwrap();
    fs::write(&target_path, target).unwrap();

    let mut args = UpdaterConfigArguments {
        image: Some(target_path.to_string_lossy().into_owned()),
        emulation: Some(emulation.clone()),
        ..Default::default()
    };
    customize(&mut args);

    let mut cfg = UpdaterConfig::new();
    assert_eq!(cfg.setup(&args).unwrap(), SetupAction::Proceed);

    let result = update::update_firmware(&mut cfg);
    let bytes = fs::read(&emulation).unwrap();
    (result, bytes)
}

#[test]
fn full_update_preserves_device_state() {
    let target = build_image(&link_target());
    let current = build_image(&peppy_current());

    let (result, emu) = run_update(&target, &current, |args| {
        args.write_protection = Some(0);
        args.sys_props = Some("0,0x10001,1".to_owned());
    });
    result.unwrap();

    // The target firmware was written...
    assert_eq!(section(&emu, image::RO_FRID), section(&target, image::RO_FRID));
    assert_eq!(
        section(&emu, image::RW_SECTION_A),
        section(&target, image::RW_SECTION_A)
    );
    assert_eq!(
        section(&emu, image::RW_SECTION_B),
        section(&target, image::RW_SECTION_B)
    );

    // ...with the PEPPY device state carried over.
    let gbb_section = section(&emu, image::GBB);
    let header = Gbb::find(gbb_section).unwrap();
    assert_eq!(header.hwid(gbb_section), b"X86 PEPPY TEST 4211");
    assert_eq!(header.flags, 0x39);
    assert_eq!(section(&emu, image::RO_VPD), section(&current, image::RO_VPD));
    assert_eq!(section(&emu, image::RW_VPD), section(&current, image::RW_VPD));
    assert_eq!(
        section(&emu, image::RW_NVRAM),
        section(&current, image::RW_NVRAM)
    );
    assert_eq!(section(&emu, image::RW_ELOG), section(&current, image::RW_ELOG));
}

#[test]
fn incompatible_platform_is_rejected() {
    let target = build_image(&link_target());
    let current = build_image(&peppy_unpatched());

    let (result, emu) = run_update(&target, &current, |args| {
        args.write_protection = Some(0);
        args.sys_props = Some("0,0x10001,1".to_owned());
    });

    let err = result.unwrap_err();
    assert_matches!(err, UpdateError::Platform(_));
    assert!(err.to_string().contains("platform is not compatible"));
    assert_eq!(emu, current);
}

#[test]
fn data_key_rollback_is_rejected() {
    let target = build_image(&link_target());
    let current = build_image(&peppy_current());

    let (result, emu) = run_update(&target, &current, |args| {
        args.write_protection = Some(0);
        args.sys_props = Some("1,0x20001,1".to_owned());
    });

    let err = result.unwrap_err();
    assert_matches!(err, UpdateError::TpmRollback(_));
    assert!(err
        .to_string()
        .contains("Data key version rollback detected (2->1)"));
    assert_eq!(emu, current);
}

#[test]
fn negative_tpm_version_is_rejected() {
    let target = build_image(&link_target());
    let current = build_image(&peppy_current());

    let (result, emu) = run_update(&target, &current, |args| {
        args.write_protection = Some(0);
        args.sys_props = Some("0,-1,1".to_owned());
    });

    let err = result.unwrap_err();
    assert_matches!(err, UpdateError::TpmRollback(_));
    assert!(err.to_string().contains("Invalid tpm_fwver: -1"));
    assert_eq!(emu, current);
}

#[test]
fn force_waives_tpm_check() {
    let target = build_image(&link_target());
    let current = build_image(&peppy_current());

    let (result, emu) = run_update(&target, &current, |args| {
        args.write_protection = Some(0);
        args.sys_props = Some("0,-1,1".to_owned());
        args.force_update = true;
    });

    result.unwrap();
    assert_eq!(section(&emu, image::RO_FRID), section(&target, image::RO_FRID));
}

#[test]
fn try_update_writes_inactive_slot() {
    let target = build_image(&link_target());
    let current = build_image(&peppy_current());

    let (result, emu) = run_update(&target, &current, |args| {
        args.write_protection = Some(1);
        args.sys_props = Some("0,0x10001,1".to_owned());
        args.try_update = true;
    });
    result.unwrap();

    // Active slot is A, so only B is rewritten; everything else still reads
    // as the current system.
    let mut expected = current.clone();
    let range = Fmap::find(&current)
        .unwrap()
        .area(image::RW_SECTION_B)
        .unwrap()
        .range();
    expected[range.clone()].copy_from_slice(&target[range]);
    assert_eq!(emu, expected);
}

#[test]
fn try_update_from_slot_b_writes_slot_a() {
    let target = build_image(&link_target());
    let current = build_image(&peppy_current());

    let (result, emu) = run_update(&target, &current, |args| {
        args.write_protection = Some(1);
        args.sys_props = Some("1,0x10001,1".to_owned());
        args.mode = Some(UpdateMode::Autoupdate);
    });
    result.unwrap();

    let mut expected = current.clone();
    let range = Fmap::find(&current)
        .unwrap()
        .area(image::RW_SECTION_A)
        .unwrap()
        .range();
    expected[range.clone()].copy_from_slice(&target[range]);
    assert_eq!(emu, expected);
}

#[test]
fn try_update_falls_back_to_full_when_ro_differs() {
    let target = build_image(&link_target());
    let current = build_image(&peppy_current());

    // The RO sections differ (different RO_FRID), so with WP disabled the
    // try-RW path must fall back to a full RO+RW update.
    let (result, emu) = run_update(&target, &current, |args| {
        args.write_protection = Some(0);
        args.sys_props = Some("0,0x10001,1".to_owned());
        args.try_update = true;
    });
    result.unwrap();

    assert_eq!(section(&emu, image::RO_FRID), section(&target, image::RO_FRID));
    let gbb_section = section(&emu, image::GBB);
    let header = Gbb::find(gbb_section).unwrap();
    assert_eq!(header.hwid(gbb_section), b"X86 PEPPY TEST 4211");
}

#[test]
fn rw_update_with_write_protection() {
    let target = build_image(&link_target());
    let current = build_image(&peppy_current());

    let (result, emu) = run_update(&target, &current, |args| {
        args.write_protection = Some(1);
        args.sys_props = Some("0,0x10001,1".to_owned());
        args.mode = Some(UpdateMode::Recovery);
    });
    result.unwrap();

    for name in [
        image::RW_SECTION_A,
        image::RW_SECTION_B,
        image::RW_SHARED,
        image::RW_LEGACY,
    ] {
        assert_eq!(section(&emu, name), section(&target, name), "{name}");
    }
    // RO is untouched under write protection.
    assert_eq!(section(&emu, image::RO_FRID), section(&current, image::RO_FRID));
}

#[test]
fn legacy_mode_writes_only_rw_legacy() {
    let target = build_image(&link_target());
    let current = build_image(&peppy_current());

    let (result, emu) = run_update(&target, &current, |args| {
        args.write_protection = Some(0);
        args.sys_props = Some("0,0x10001,1".to_owned());
        args.mode = Some(UpdateMode::Legacy);
    });
    result.unwrap();

    let mut expected = current.clone();
    let range = Fmap::find(&current)
        .unwrap()
        .area(image::RW_LEGACY)
        .unwrap()
        .range();
    expected[range.clone()].copy_from_slice(&target[range]);
    assert_eq!(emu, expected);
}

#[test]
fn factory_mode_requires_wp_disabled() {
    let target = build_image(&link_target());
    let current = build_image(&peppy_current());

    let (result, emu) = run_update(&target, &current, |args| {
        args.write_protection = Some(1);
        args.sys_props = Some("0,0x10001,1".to_owned());
        args.mode = Some(UpdateMode::Factory);
    });

    let err = result.unwrap_err();
    assert_matches!(err, UpdateError::Platform(_));
    assert!(err.to_string().contains("needs WP disabled"));
    assert_eq!(emu, current);
}

#[test]
fn enlarge_image_pads_with_erased_bytes() {
    let target = build_image(&link_target());
    let mut current = build_image(&peppy_current());
    current.resize(2 * IMAGE_SIZE, 0xff);

    let (result, emu) = run_update(&target, &current, |args| {
        args.write_protection = Some(0);
        args.sys_props = Some("0,0x10001,1".to_owned());
        args.quirks = Some("enlarge_image".to_owned());
    });
    result.unwrap();

    assert_eq!(emu.len(), 2 * IMAGE_SIZE);
    assert_eq!(section(&emu, image::RO_FRID), section(&target, image::RO_FRID));
    assert!(emu[IMAGE_SIZE..].iter().all(|b| *b == 0xff));
}

#[test]
fn unlock_me_quirk_patches_flash_descriptor() {
    let target = build_image(&link_target());
    let current = build_image(&peppy_current());

    let (result, emu) = run_update(&target, &current, |args| {
        args.write_protection = Some(0);
        args.sys_props = Some("0,0x10001,1".to_owned());
        args.quirks = Some("unlock_me_for_update".to_owned());
    });
    result.unwrap();

    let desc = section(&emu, image::SI_DESC);
    assert!(desc[..128].iter().all(|b| *b == 0x5a));
    assert_eq!(&desc[128..140], &ME_UNLOCK);
    assert!(desc[140..].iter().all(|b| *b == 0x5a));
}

#[test]
fn min_platform_version_quirk() {
    let target = build_image(&link_target());
    let current = build_image(&peppy_current());

    let (result, emu) = run_update(&target, &current, |args| {
        args.write_protection = Some(0);
        args.sys_props = Some("0,0,1,2".to_owned());
        args.quirks = Some("min_platform_version=3".to_owned());
    });

    let err = result.unwrap_err();
    assert_matches!(err, UpdateError::Platform(_));
    assert!(err
        .to_string()
        .contains("Need platform version >= 3 (current is 2)"));
    assert_eq!(emu, current);
}

#[test]
fn no_target_image() {
    let dir = tempfile::tempdir().unwrap();
    let emulation = dir.path().join("emulation.bin");
    fs::write(&emulation, build_image(&peppy_current())).unwrap();

    let args = UpdaterConfigArguments {
        emulation: Some(emulation),
        ..Default::default()
    };

    let mut cfg = UpdaterConfig::new();
    assert_eq!(cfg.setup(&args).unwrap(), SetupAction::Proceed);
    assert_matches!(
        update::update_firmware(&mut cfg),
        Err(UpdateError::NoImage)
    );
}

#[test]
fn preservation_is_idempotent() {
    let spec_from = peppy_current();
    let spec_to = link_target();

    let from = FirmwareImage::from_bytes(build_image(&spec_from), None, "host").unwrap();
    let mut once = FirmwareImage::from_bytes(build_image(&spec_to), None, "host").unwrap();

    preserve::preserve_firmware_section(&from, &mut once, image::RO_VPD).unwrap();
    preserve::preserve_gbb(&from, &mut once).unwrap();
    let first = once.data().to_vec();

    preserve::preserve_firmware_section(&from, &mut once, image::RO_VPD).unwrap();
    preserve::preserve_gbb(&from, &mut once).unwrap();
    assert_eq!(once.data(), &first[..]);
}

#[test]
fn builder_layout_round_trips() {
    let data = build_image(&link_target());
    let fmap = Fmap::find(&data).unwrap();

    for area in &layout().areas {
        let parsed = fmap.area(&area.name).unwrap();
        assert_eq!((parsed.offset, parsed.size), (area.offset, area.size), "{}", area.name);
    }

    let image = FirmwareImage::from_bytes(data, None, "host").unwrap();
    assert_eq!(image.ro_version, "Google_Link.1111.0.0");
    assert_eq!(image.rw_version_a, "Google_Link.1111.0.0");
    assert_eq!(image.rw_version_b, "Google_Link.1111.0.0");
}
