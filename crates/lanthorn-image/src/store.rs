//! Uploaded executable images.
//!
//! A raw image lives entirely in an anonymous kernel file and is
//! addressed for exec through `/proc/self/fd/<n>`; a bundle image is
//! an extracted directory tree owned exclusively by its session.
//! Both are immutable after admission.

use crate::error::{ImageError, Result};
use std::ffi::CString;
use std::fs::{self, File};
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// First four bytes of every ELF executable.
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// An admitted image, either shape.
#[derive(Debug)]
pub enum Image {
    /// Raw ELF in an anonymous in-memory file.
    Raw(RawImage),
    /// Extracted bundle directory with a designated entry executable.
    Bundle(BundleImage),
}

impl Image {
    /// Returns true for bundle images.
    #[must_use]
    pub fn is_bundle(&self) -> bool {
        matches!(self, Self::Bundle(_))
    }
}

/// Raw ELF image backed by a `memfd`.
///
/// The descriptor is created close-on-exec; the launcher decides
/// per-start whether the child needs it to survive the exec.
#[derive(Debug)]
pub struct RawImage {
    file: File,
}

impl RawImage {
    /// Creates an empty anonymous in-memory file to receive a raw
    /// upload.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::MemfdCreate`] if the kernel refuses.
    pub fn create(name: &str) -> Result<Self> {
        let c_name = CString::new(name).map_err(|_| {
            ImageError::MemfdCreate(std::io::Error::from(std::io::ErrorKind::InvalidInput))
        })?;
        // SAFETY: name is a valid NUL-terminated string; the returned
        // fd is owned by the File below and nothing else.
        let fd = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(ImageError::MemfdCreate(std::io::Error::last_os_error()));
        }
        // SAFETY: fd is a freshly created, owned descriptor.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Self { file })
    }

    /// The backing file, for streaming the upload payload into it.
    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Raw descriptor number, stable for the life of the image.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Pseudo-path naming the descriptor, usable as an exec target
    /// and as `argv[0]`.
    #[must_use]
    pub fn fd_path(&self) -> String {
        format!("/proc/self/fd/{}", self.file.as_raw_fd())
    }
}

/// Extracted bundle image.
///
/// The extraction root is uniquely owned by the session; dropping the
/// image removes the tree.
#[derive(Debug)]
pub struct BundleImage {
    root: PathBuf,
    entry: PathBuf,
}

impl BundleImage {
    pub(crate) fn new(root: PathBuf, entry: PathBuf) -> Self {
        Self { root, entry }
    }

    /// Extraction root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entry path relative to the root, as supplied at upload.
    #[must_use]
    pub fn entry(&self) -> &Path {
        &self.entry
    }

    /// Absolute path of the entry executable.
    #[must_use]
    pub fn entry_path(&self) -> PathBuf {
        self.root.join(&self.entry)
    }
}

impl Drop for BundleImage {
    fn drop(&mut self) {
        debug!(root = %self.root.display(), "removing bundle directory");
        if let Err(err) = fs::remove_dir_all(&self.root) {
            warn!(root = %self.root.display(), %err, "failed to remove bundle directory");
        }
    }
}

/// Reads the first four bytes of `path` and compares them against the
/// ELF magic. Any I/O failure counts as "not an ELF".
#[must_use]
pub fn file_is_elf(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => magic == ELF_MAGIC,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    fn raw_image_fd_path_names_descriptor() {
        let raw = RawImage::create("test-image").unwrap();
        let path = raw.fd_path();
        assert!(path.starts_with("/proc/self/fd/"));

        let mut file = raw.file();
        file.write_all(b"\x7fELF rest").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        // The pseudo-path resolves to the same content.
        let through_path = fs::read(&path).unwrap();
        assert_eq!(through_path, b"\x7fELF rest");
    }

    #[test]
    fn bundle_drop_removes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("bundle");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/file"), b"x").unwrap();

        let image = BundleImage::new(root.clone(), PathBuf::from("sub/file"));
        assert!(image.entry_path().exists());
        drop(image);
        assert!(!root.exists());
    }

    #[test]
    fn elf_check_rejects_short_and_wrong_magic() {
        let dir = tempfile::tempdir().unwrap();
        let short = dir.path().join("short");
        fs::write(&short, b"\x7fE").unwrap();
        assert!(!file_is_elf(&short));

        let wrong = dir.path().join("wrong");
        fs::write(&wrong, b"#!/bin/sh\n").unwrap();
        assert!(!file_is_elf(&wrong));

        let good = dir.path().join("good");
        fs::write(&good, b"\x7fELF\x02\x01\x01").unwrap();
        assert!(file_is_elf(&good));

        assert!(!file_is_elf(&dir.path().join("missing")));
    }
}
