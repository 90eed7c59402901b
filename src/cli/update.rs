/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::level_filters::LevelFilter;

use crate::{
    cli::status,
    config::{SetupAction, UpdateMode, UpdaterConfig, UpdaterConfigArguments},
    update,
};

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Keep stdout clean for the manifest JSON output.
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

pub fn update_main(cli: &UpdateCli, logging_initialized: &AtomicBool) -> Result<()> {
    init_logging(cli.verbose);
    logging_initialized.store(true, Ordering::SeqCst);

    let args = UpdaterConfigArguments {
        image: cli.image.clone(),
        ec_image: cli.ec_image.clone(),
        pd_image: cli.pd_image.clone(),
        archive: cli.archive.clone(),
        quirks: cli.quirks.clone(),
        mode: cli.mode,
        programmer: cli.programmer.clone(),
        emulation: cli.emulate.clone(),
        sys_props: cli.sys_props.clone(),
        write_protection: cli.wp,
        is_factory: cli.factory,
        try_update: cli.try_update,
        force_update: cli.force,
        do_manifest: cli.manifest,
        verbosity: cli.verbose,
    };

    let mut cfg = UpdaterConfig::new();
    match cfg
        .setup(&args)
        .context("Failed to set up updater configuration")?
    {
        SetupAction::ManifestPrinted => return Ok(()),
        SetupAction::Proceed => {}
    }

    update::update_firmware(&mut cfg)?;
    status!("Update completed.");

    Ok(())
}

/// Update the AP (and supporting) firmware.
#[derive(Debug, Parser)]
pub struct UpdateCli {
    /// Path to the target firmware image, or "-" to read from stdin.
    #[arg(short = 'i', long, value_name = "FILE")]
    image: Option<String>,

    /// Path to the target EC firmware image.
    #[arg(short = 'e', long = "ec_image", value_name = "FILE")]
    ec_image: Option<String>,

    /// Path to the target PD firmware image.
    #[arg(short = 'P', long = "pd_image", value_name = "FILE")]
    pd_image: Option<String>,

    /// Archive (directory or zip file) for resolving relative image paths.
    #[arg(short = 'a', long, value_name = "PATH")]
    archive: Option<PathBuf>,

    /// Quirks to apply, as a list of NAME or NAME=VALUE items.
    #[arg(long, value_name = "LIST")]
    quirks: Option<String>,

    /// Updater mode.
    #[arg(long, value_enum, value_name = "MODE")]
    mode: Option<UpdateMode>,

    /// Try the RW update on the next boot (same as --mode=autoupdate).
    #[arg(short = 't', long = "try")]
    try_update: bool,

    /// Factory mode: full update with write protection disabled.
    #[arg(long)]
    factory: bool,

    /// Programmer identifier for the system flash.
    #[arg(long, value_name = "SPEC")]
    programmer: Option<String>,

    /// Emulate the system flash with a local file instead of writing it.
    #[arg(long, value_name = "FILE")]
    emulate: Option<PathBuf>,

    /// Override system properties, as integers separated by comma or space.
    #[arg(long, value_name = "LIST")]
    sys_props: Option<String>,

    /// Override both hardware and software write protection (0 or 1).
    #[arg(long, value_name = "WP")]
    wp: Option<i64>,

    /// Force the update and waive the TPM anti-rollback check.
    #[arg(long)]
    force: bool,

    /// Print a JSON manifest of the archive's models and images, then exit.
    #[arg(long, requires = "archive")]
    manifest: bool,

    /// Increase the log message verbosity.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}
