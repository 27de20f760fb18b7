//! Host sysroot bundling.
//!
//! Remote debuggers want the target's shared libraries and debug info
//! to resolve symbols. The daemon answers SYSROOT with a gzip-
//! compressed tar of the host library directories, symlinks
//! dereferenced so the client sees real files.
//!
//! The walk is best-effort: unreadable entries are skipped rather
//! than failing the whole archive. A sysroot with holes is still
//! useful; an error is not.

use crate::error::{ImageError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Directory symlink cycles would otherwise recurse forever.
const MAX_DEPTH: usize = 32;

/// Host directories offered in the sysroot, when present.
#[must_use]
pub fn default_dirs() -> Vec<PathBuf> {
    ["/lib", "/lib64", "/usr/lib", "/usr/lib/debug"]
        .iter()
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
        .collect()
}

/// Builds a gzip-compressed tar of `dirs` into an anonymous spool
/// file and returns the spool rewound to the start plus its size.
///
/// # Errors
///
/// Returns [`ImageError::SysrootNoLibs`] when `dirs` is empty,
/// [`ImageError::SysrootTmpFile`] when the spool cannot be created,
/// and [`ImageError::SysrootTar`] when the archive cannot be written.
pub fn build_archive(dirs: &[PathBuf]) -> Result<(File, u64)> {
    if dirs.is_empty() {
        return Err(ImageError::SysrootNoLibs);
    }

    let spool = tempfile::tempfile().map_err(ImageError::SysrootTmpFile)?;
    let encoder = GzEncoder::new(spool, Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(true);

    for dir in dirs {
        let name: PathBuf = dir.components().skip(1).collect();
        append_tree(&mut builder, &name, dir, 0);
    }

    let encoder = builder.into_inner().map_err(ImageError::SysrootTar)?;
    let mut spool = encoder.finish().map_err(ImageError::SysrootTar)?;
    spool.flush().map_err(ImageError::SysrootTar)?;

    let size = spool.metadata().map_err(ImageError::SysrootTar)?.len();
    spool
        .seek(SeekFrom::Start(0))
        .map_err(ImageError::SysrootTar)?;

    debug!(size, "sysroot archive built");
    Ok((spool, size))
}

/// Appends `dir` under archive name `name`, skipping entries that
/// cannot be read.
fn append_tree(builder: &mut tar::Builder<GzEncoder<File>>, name: &Path, dir: &Path, depth: usize) {
    if depth >= MAX_DEPTH {
        trace!(dir = %dir.display(), "sysroot walk depth limit reached");
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        trace!(dir = %dir.display(), "sysroot dir unreadable, skipping");
        return;
    };

    if builder.append_dir(name, dir).is_err() {
        return;
    }

    for entry in entries.flatten() {
        let path = entry.path();
        let entry_name = name.join(entry.file_name());
        // metadata() follows symlinks; broken links are skipped.
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        if meta.is_dir() {
            append_tree(builder, &entry_name, &path, depth + 1);
        } else if meta.is_file() {
            if let Err(err) = builder.append_path_with_name(&path, &entry_name) {
                trace!(path = %path.display(), %err, "skipping sysroot entry");
            }
        }
    }
}
