//! Error types for image operations.

use thiserror::Error;

/// Result type alias for image operations.
pub type Result<T> = std::result::Result<T, ImageError>;

/// Errors that can occur while admitting or serving images.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The anonymous in-memory file could not be created.
    #[error("memfd_create failed: {0}")]
    MemfdCreate(#[source] std::io::Error),

    /// Upload payload could not be written to its spool.
    #[error("failed to write upload data: {0}")]
    UploadWrite(#[source] std::io::Error),

    /// The payload does not begin with the ELF magic.
    #[error("uploaded file is not a valid ELF")]
    InvalidElf,

    /// The bundle entry path is missing, escapes the bundle, or is
    /// not an ELF.
    #[error("exec_path not found or not a valid ELF in bundle")]
    InvalidExecPath,

    /// A temporary file for the bundle archive could not be created.
    #[error("failed to create temporary file: {0}")]
    TmpFile(#[source] std::io::Error),

    /// The bundle extraction directory could not be created.
    #[error("failed to create temporary directory: {0}")]
    TmpDir(#[source] std::io::Error),

    /// The bundle archive could not be extracted.
    #[error("failed to extract tar.gz bundle: {0}")]
    Extract(#[source] std::io::Error),

    /// The sysroot spool file could not be created.
    #[error("failed to create temp file for sysroot: {0}")]
    SysrootTmpFile(#[source] std::io::Error),

    /// None of the host library directories exist.
    #[error("no lib directories found on host")]
    SysrootNoLibs,

    /// The sysroot tarball could not be produced.
    #[error("failed to create sysroot tarball: {0}")]
    SysrootTar(#[source] std::io::Error),
}

impl ImageError {
    /// Wire error code for this error (protocol taxonomy).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MemfdCreate(_) => "memfd_create_failed",
            Self::UploadWrite(_) => "upload_write_failed",
            Self::InvalidElf => "invalid_elf",
            Self::InvalidExecPath => "invalid_exec_path",
            Self::TmpFile(_) => "tmpfile_create_failed",
            Self::TmpDir(_) => "tmpdir_create_failed",
            Self::Extract(_) => "extract_failed",
            Self::SysrootTmpFile(_) => "sysroot_tmpfile_failed",
            Self::SysrootNoLibs => "sysroot_no_libs",
            Self::SysrootTar(_) => "sysroot_tar_failed",
        }
    }
}
