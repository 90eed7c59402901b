/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Archive reader used to resolve relative image paths. An archive is either
//! a plain directory or a zip file; the type is detected when it is opened.

use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::Serialize;
use thiserror::Error;
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Archive does not exist: {0:?}")]
    NotFound(PathBuf),
    #[error("Entry does not exist: {0}")]
    EntryNotFound(String),
    #[error("Failed to read zip archive")]
    Zip(#[from] zip::result::ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

enum Backend {
    Dir(PathBuf),
    Zip(Mutex<ZipArchive<File>>),
}

pub struct Archive {
    backend: Backend,
}

impl Archive {
    /// Open a directory or zip archive.
    pub fn open(path: &Path) -> Result<Self> {
        let backend = if path.is_dir() {
            Backend::Dir(path.to_owned())
        } else if path.is_file() {
            let file = File::open(path)?;
            Backend::Zip(Mutex::new(ZipArchive::new(file)?))
        } else {
            return Err(Error::NotFound(path.to_owned()));
        };

        Ok(Self { backend })
    }

    pub fn has_entry(&self, name: &str) -> bool {
        match &self.backend {
            Backend::Dir(dir) => dir.join(name).is_file(),
            Backend::Zip(zip) => zip.lock().unwrap().by_name(name).is_ok(),
        }
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        match &self.backend {
            Backend::Dir(dir) => {
                fs::read(dir.join(name)).map_err(|_| Error::EntryNotFound(name.to_owned()))
            }
            Backend::Zip(zip) => {
                let mut zip = zip.lock().unwrap();
                let mut entry = zip
                    .by_name(name)
                    .map_err(|_| Error::EntryNotFound(name.to_owned()))?;

                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data)?;
                Ok(data)
            }
        }
    }

    /// Top-level entry names, used for manifest scanning.
    pub fn entries(&self) -> Result<Vec<String>> {
        match &self.backend {
            Backend::Dir(dir) => {
                let mut names = vec![];
                for entry in fs::read_dir(dir)? {
                    names.push(entry?.file_name().to_string_lossy().into_owned());
                }
                Ok(names)
            }
            Backend::Zip(zip) => {
                Ok(zip.lock().unwrap().file_names().map(str::to_owned).collect())
            }
        }
    }
}

/// One model configuration found in an archive.
#[derive(Debug, Eq, PartialEq, Serialize)]
pub struct ModelConfig {
    pub name: String,
    pub image: String,
    pub ec_image: Option<String>,
    pub pd_image: Option<String>,
}

/// Scan an archive for model configurations. `image.bin` is the default
/// model; `image-MODEL.bin` defines one model each. EC and PD images follow
/// the same naming scheme and are matched to their model.
pub fn scan_models(archive: &Archive) -> Result<Vec<ModelConfig>> {
    let entries = archive.entries()?;

    let find = |prefix: &str, model: &str| -> Option<String> {
        let name = if model == "default" {
            format!("{prefix}.bin")
        } else {
            format!("{prefix}-{model}.bin")
        };
        entries.contains(&name).then_some(name)
    };

    let mut models = vec![];

    for entry in &entries {
        let model = if entry == "image.bin" {
            "default".to_owned()
        } else if let Some(m) = entry
            .strip_prefix("image-")
            .and_then(|e| e.strip_suffix(".bin"))
        {
            m.to_owned()
        } else {
            continue;
        };

        models.push(ModelConfig {
            image: find("image", &model).unwrap(),
            ec_image: find("ec", &model),
            pd_image: find("pd", &model),
            name: model,
        });
    }

    models.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(models)
}

/// Print the models and images of an archive as JSON on stdout.
pub fn print_json_manifest(archive: &Archive) -> Result<()> {
    let models = scan_models(archive)?;
    println!("{}", serde_json::to_string_pretty(&models).unwrap());
    Ok(())
}
