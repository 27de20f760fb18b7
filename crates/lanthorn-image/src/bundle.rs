//! Bundle admission: tar.gz extraction and entry validation.
//!
//! A bundle payload is spooled to a temporary file by the connection
//! handler, then extracted here into a fresh directory. Nothing is
//! persisted until admission succeeds: the extraction root rides in a
//! [`tempfile::TempDir`] that cleans itself up on every failure
//! branch, and only [`PendingBundle::into_image`] releases it into a
//! session-owned [`BundleImage`].

use crate::error::{ImageError, Result};
use crate::store::{file_is_elf, BundleImage, Image};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tempfile::TempDir;
use tracing::debug;

/// Validates a client-supplied entry path.
///
/// The path must be relative and must not contain parent-directory
/// segments; anything else could resolve outside the extraction root.
///
/// # Errors
///
/// Returns [`ImageError::InvalidExecPath`] on an empty, absolute, or
/// escaping path.
pub fn validate_entry_path(entry: &str) -> Result<PathBuf> {
    if entry.is_empty() {
        return Err(ImageError::InvalidExecPath);
    }
    let path = Path::new(entry);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(ImageError::InvalidExecPath);
    }
    Ok(path.to_path_buf())
}

/// An extracted bundle awaiting admission.
///
/// Dropping a `PendingBundle` removes the extraction directory.
#[derive(Debug)]
pub struct PendingBundle {
    dir: TempDir,
    entry: PathBuf,
}

impl PendingBundle {
    /// Extracts a gzip-compressed tar archive into a fresh private
    /// directory and validates the entry executable.
    ///
    /// The entry must exist inside the extraction root and begin with
    /// the ELF magic; it is marked executable (0755) on success.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::TmpDir`] if the extraction directory
    /// cannot be created, [`ImageError::Extract`] if the archive is
    /// malformed, and [`ImageError::InvalidExecPath`] if the entry is
    /// missing or not an ELF.
    pub fn extract(archive: &Path, entry: &str) -> Result<Self> {
        let entry = validate_entry_path(entry)?;

        let dir = tempfile::Builder::new()
            .prefix("lanthorn-bundle-")
            .tempdir()
            .map_err(ImageError::TmpDir)?;

        let file = File::open(archive).map_err(ImageError::Extract)?;
        let mut tar = Archive::new(GzDecoder::new(file));
        tar.set_preserve_permissions(true);
        tar.unpack(dir.path()).map_err(ImageError::Extract)?;

        let entry_abs = dir.path().join(&entry);
        if !file_is_elf(&entry_abs) {
            return Err(ImageError::InvalidExecPath);
        }
        fs::set_permissions(&entry_abs, fs::Permissions::from_mode(0o755))
            .map_err(ImageError::Extract)?;

        debug!(root = %dir.path().display(), entry = %entry.display(), "bundle extracted");
        Ok(Self { dir, entry })
    }

    /// Extraction root, valid until the bundle is admitted or dropped.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Releases the extraction directory into a session-owned image.
    #[must_use]
    pub fn into_image(self) -> Image {
        let entry = self.entry;
        let root = self.dir.keep();
        Image::Bundle(BundleImage::new(root, entry))
    }
}
