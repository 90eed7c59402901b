/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Typed wrappers around the external flash and host tools (flashrom,
//! crossystem, mosys, cbfstool). Arguments are always passed as argv
//! elements, never interpolated into a shell command. In emulation mode,
//! flash writes are spliced into a local file instead.

use std::{
    fs, io,
    path::Path,
    process::{Command, ExitStatus},
};

use thiserror::Error;
use tracing::debug;

use crate::image::FirmwareImage;

/// flashrom programmer identifiers.
pub const PROG_HOST: &str = "host";
pub const PROG_EC: &str = "ec";
pub const PROG_PD: &str = "ec:dev=1";

const WP_PATTERN: &str = "write protect is ";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to launch {0}")]
    Launch(&'static str, #[source] io::Error),
    #[error("{0} exited with {1}")]
    CommandFailed(&'static str, ExitStatus),
    #[error("Unrecognized write-protect status output: {0:?}")]
    WpStatus(String),
    #[error("No section {0} in source image")]
    NoSourceSection(String),
    #[error("No section {0} in destination image")]
    NoDestSection(String),
    #[error("Image size mismatch ({0} != {1})")]
    SizeMismatch(usize, usize),
    #[error("Image error")]
    Image(#[from] crate::image::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WpState {
    Disabled,
    Enabled,
}

/// Run a command and return the first line of stdout, stripped of trailing
/// whitespace. A non-zero exit discards all output, since a failed command
/// may leave garbage on stdout.
fn run_first_line(command: &mut Command, tool: &'static str) -> Result<String> {
    debug!("Executing: {command:?}");
    let output = command.output().map_err(|e| Error::Launch(tool, e))?;

    if !output.status.success() {
        debug!("Execution failure with {}: {command:?}", output.status);
        return Ok(String::new());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or("").trim_end().to_owned())
}

/// Run a command, requiring a successful exit status.
fn run_checked(command: &mut Command, tool: &'static str) -> Result<()> {
    debug!("Executing: {command:?}");
    let output = command.output().map_err(|e| Error::Launch(tool, e))?;

    if !output.status.success() {
        debug!(
            "{tool} stderr: {}",
            String::from_utf8_lossy(&output.stderr).trim_end()
        );
        return Err(Error::CommandFailed(tool, output.status));
    }

    Ok(())
}

/// The flashrom(8) facade. Reads and writes target the named programmer;
/// writes can be restricted to a single FMAP section.
pub struct Flashrom {
    programmer: String,
    verbosity: u8,
}

impl Flashrom {
    pub fn new(programmer: &str, verbosity: u8) -> Self {
        Self {
            programmer: programmer.to_owned(),
            verbosity,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("flashrom");
        cmd.arg("-p").arg(&self.programmer);
        for _ in 0..self.verbosity.saturating_sub(1).min(3) {
            cmd.arg("-V");
        }
        cmd
    }

    /// Read the whole flash into `path`.
    pub fn read(&self, path: &Path) -> Result<()> {
        run_checked(self.command().arg("-r").arg(path), "flashrom")
    }

    /// Write `path` to the flash. With a section name, only that FMAP range
    /// is written; otherwise the whole image is replaced.
    pub fn write(&self, path: &Path, section: Option<&str>) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("-w").arg(path);
        if let Some(name) = section {
            cmd.arg("-i").arg(name);
        }

        run_checked(&mut cmd, "flashrom")
    }

    /// Query the software write-protect status.
    pub fn wp_status(&self) -> Result<WpState> {
        debug!("Querying write protection from {}", self.programmer);
        let output = self
            .command()
            .arg("--wp-status")
            .output()
            .map_err(|e| Error::Launch("flashrom", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Some(pos) = line.find(WP_PATTERN) {
                let state = &line[pos + WP_PATTERN.len()..];
                if state.starts_with("enabled") {
                    return Ok(WpState::Enabled);
                } else if state.starts_with("disabled") {
                    return Ok(WpState::Disabled);
                }
            }
        }

        Err(Error::WpStatus(stdout.into_owned()))
    }
}

/// Read a crossystem property as a string. Missing or failed properties
/// yield an empty string.
pub fn crossystem_get(name: &str) -> Result<String> {
    run_first_line(Command::new("crossystem").arg(name), "crossystem")
}

/// Read a crossystem property as an integer, `-1` on any failure.
pub fn crossystem_get_int(name: &str) -> i64 {
    match crossystem_get(name) {
        Ok(value) if !value.is_empty() => value.parse().unwrap_or(-1),
        _ => -1,
    }
}

/// Set a crossystem property.
pub fn crossystem_set(name: &str, value: &str) -> Result<()> {
    run_checked(
        Command::new("crossystem").arg(format!("{name}={value}")),
        "crossystem",
    )
}

/// Platform revision from `mosys platform version`, which reports `revN`.
/// Returns `-1` if the output cannot be parsed.
pub fn mosys_platform_version() -> i64 {
    let result = match run_first_line(
        Command::new("mosys").args(["platform", "version"]),
        "mosys",
    ) {
        Ok(line) => line,
        Err(_) => return -1,
    };

    let version = result
        .strip_prefix("rev")
        .and_then(|v| v.parse().ok())
        .unwrap_or(-1);
    debug!("Raw data = [{result}], parsed version is {version}");
    version
}

/// Check if a CBFS entry exists in a region of an image file.
pub fn cbfs_file_exists(image: &Path, region: &str, name: &str) -> bool {
    let output = Command::new("cbfstool")
        .arg(image)
        .args(["print", "-r", region])
        .output();

    match output {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|line| line.starts_with(name) && line[name.len()..].starts_with(' ')),
        _ => false,
    }
}

/// Extract a CBFS entry to a file. Returns false if the entry does not
/// exist.
pub fn cbfs_extract(image: &Path, region: &str, name: &str, output: &Path) -> Result<bool> {
    if !cbfs_file_exists(image, region, name) {
        return Ok(false);
    }

    let mut cmd = Command::new("cbfstool");
    cmd.arg(image)
        .args(["extract", "-r", region, "-n", name, "-f"])
        .arg(output);
    run_checked(&mut cmd, "cbfstool")?;

    Ok(true)
}

/// Remove a CBFS entry. Removal of a missing entry is not an error.
pub fn cbfs_remove(image: &Path, region: &str, name: &str) -> Result<()> {
    let mut cmd = Command::new("cbfstool");
    cmd.arg(image).args(["remove", "-r", region, "-n", name]);

    if let Err(e) = run_checked(&mut cmd, "cbfstool") {
        debug!("Ignored: {e}");
    }
    Ok(())
}

/// Add a raw CBFS entry at a fixed offset within a region.
pub fn cbfs_add(
    image: &Path,
    region: &str,
    name: &str,
    file: &Path,
    base_offset: u32,
) -> Result<()> {
    let mut cmd = Command::new("cbfstool");
    cmd.arg(image)
        .args(["add", "-r", region, "-n", name, "-f"])
        .arg(file)
        .args(["-t", "raw", "-b"])
        .arg(format!("{base_offset:#x}"));

    run_checked(&mut cmd, "cbfstool")
}

/// Emulate a flash write by splicing into a local image file. The
/// destination file is loaded, the section (or whole image) is overwritten,
/// and the file is rewritten. A source section larger than the destination
/// section is truncated.
pub fn emulate_write_firmware(
    emulation: &Path,
    image: &FirmwareImage,
    section: Option<&str>,
) -> Result<()> {
    let mut to_image = FirmwareImage::load(
        &emulation.to_string_lossy(),
        None,
        &image.programmer,
    )?;

    match section {
        Some(name) => {
            let from = image
                .section(name)
                .ok_or_else(|| Error::NoSourceSection(name.to_owned()))?;
            let to_range = to_image
                .section_range(name)
                .ok_or_else(|| Error::NoDestSection(name.to_owned()))?;

            let to_write = from.len().min(to_range.len());
            debug!("Writing {to_write} bytes to {name}");

            let from = from[..to_write].to_vec();
            to_image.section_mut(name).unwrap()[..to_write].copy_from_slice(&from);
        }
        None => {
            if image.size() != to_image.size() {
                return Err(Error::SizeMismatch(image.size(), to_image.size()));
            }
            debug!("Writing {} bytes", image.size());

            to_image.replace_data(image.data().to_vec())?;
        }
    }

    fs::write(emulation, to_image.data())?;
    Ok(())
}
