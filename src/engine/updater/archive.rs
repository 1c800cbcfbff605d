//! Bundle Archive Extraction
//!
//! Bundles are published zipped. Gzipped tarballs and plain (unpacked) JS
//! bundles are accepted as well.

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};

use crate::engine::error::{Result, UpdateError};

/// File name used when the artifact is a bare bundle, and preferred entrypoint
/// when an archive holds several files.
pub const DEFAULT_ENTRYPOINT: &str = "index.bundle";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    Raw,
}

impl ArchiveFormat {
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(b"PK\x05\x06") {
            Self::Zip
        } else if bytes.starts_with(&[0x1f, 0x8b]) {
            Self::TarGz
        } else {
            Self::Raw
        }
    }
}

/// Unpack `bytes` into `dest` and return the entrypoint path relative to `dest`.
///
/// The entrypoint is `index.bundle` when present, otherwise the first regular
/// file in archive order.
pub fn unpack(bytes: &[u8], dest: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dest)?;

    let files = match ArchiveFormat::detect(bytes) {
        ArchiveFormat::Zip => unpack_zip(bytes, dest)?,
        ArchiveFormat::TarGz => unpack_tar_gz(bytes, dest)?,
        ArchiveFormat::Raw => {
            fs::write(dest.join(DEFAULT_ENTRYPOINT), bytes)?;
            vec![PathBuf::from(DEFAULT_ENTRYPOINT)]
        }
    };

    let preferred = Path::new(DEFAULT_ENTRYPOINT);
    files
        .iter()
        .find(|f| f.as_path() == preferred)
        .or_else(|| files.first())
        .cloned()
        .ok_or_else(|| UpdateError::Archive("archive contains no files".to_string()))
}

fn unpack_zip(bytes: &[u8], dest: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut files = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(UpdateError::Archive(format!(
                "unsafe path in archive: {}",
                entry.name()
            )));
        };
        let out_path = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
        out.sync_all()?;
        files.push(relative);
    }

    Ok(files)
}

fn unpack_tar_gz(bytes: &[u8], dest: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(bytes)));
    let mut files = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| UpdateError::Archive(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| UpdateError::Archive(e.to_string()))?;
        let relative = entry
            .path()
            .map_err(|e| UpdateError::Archive(e.to_string()))?
            .into_owned();
        if !is_safe_relative(&relative) {
            return Err(UpdateError::Archive(format!(
                "unsafe path in archive: {}",
                relative.display()
            )));
        }

        let is_file = entry.header().entry_type().is_file();
        entry
            .unpack_in(dest)
            .map_err(|e| UpdateError::Archive(e.to_string()))?;
        if is_file {
            files.push(normalize(&relative));
        }
    }

    Ok(files)
}

fn is_safe_relative(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Drop `./` prefixes so `./index.bundle` matches the preferred entrypoint
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}
