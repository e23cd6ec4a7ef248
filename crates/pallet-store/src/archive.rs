//! Archive extraction into staging directories.

use crate::StoreError;
use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const USTAR_MAGIC_OFFSET: usize = 257;

/// Ceiling on the tar stream a single archive may expand to.
pub const MAX_UNPACKED_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Archive format, detected from content rather than file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Tar,
    /// Not an archive: the download itself is the file to install.
    BareFile,
}

impl ArchiveKind {
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(&GZIP_MAGIC) {
            ArchiveKind::TarGz
        } else if data
            .get(USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + 5)
            .is_some_and(|m| m == b"ustar")
        {
            ArchiveKind::Tar
        } else {
            ArchiveKind::BareFile
        }
    }
}

/// Extract `data` into `target_dir`.
///
/// Tarballs are unpacked with permissions preserved; entries escaping the
/// target are refused by the `tar` crate. A bare file is written as
/// `target_dir/<file_name>`.
pub fn extract_archive(
    data: &[u8],
    file_name: &str,
    target_dir: &Path,
) -> Result<ArchiveKind, StoreError> {
    extract_archive_within(data, file_name, target_dir, MAX_UNPACKED_BYTES)
}

/// [`extract_archive`], failing once the tar stream passes `max_unpacked` bytes.
pub fn extract_archive_within(
    data: &[u8],
    file_name: &str,
    target_dir: &Path,
    max_unpacked: u64,
) -> Result<ArchiveKind, StoreError> {
    fs::create_dir_all(target_dir)?;
    let kind = ArchiveKind::detect(data);
    debug!("extracting {} bytes as {kind:?}", data.len());
    match kind {
        ArchiveKind::TarGz => unpack_tar(GzDecoder::new(data), target_dir, max_unpacked)?,
        ArchiveKind::Tar => unpack_tar(data, target_dir, max_unpacked)?,
        ArchiveKind::BareFile => {
            let name = sanitize_file_name(file_name);
            fs::write(target_dir.join(name), data)?;
        }
    }
    Ok(kind)
}

fn unpack_tar<R: Read>(reader: R, target_dir: &Path, max_unpacked: u64) -> Result<(), StoreError> {
    let mut ar = tar::Archive::new(Capped::new(reader, max_unpacked));
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.set_unpack_xattrs(false);
    ar.set_overwrite(true);
    let result = ar.unpack(target_dir);
    if ar.into_inner().exceeded {
        return Err(StoreError::Archive(format!(
            "archive expands past {max_unpacked} bytes"
        )));
    }
    result.map_err(|e| StoreError::Archive(e.to_string()))
}

/// Reader that errors once more than `remaining` bytes have come through.
struct Capped<R> {
    inner: R,
    remaining: u64,
    exceeded: bool,
}

impl<R> Capped<R> {
    fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
            exceeded: false,
        }
    }
}

impl<R: Read> Read for Capped<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        match self.remaining.checked_sub(n as u64) {
            Some(left) => {
                self.remaining = left;
                Ok(n)
            }
            None => {
                self.exceeded = true;
                Err(io::Error::other("unpacked size limit exceeded"))
            }
        }
    }
}

fn sanitize_file_name(file_name: &str) -> &str {
    let name = file_name.rsplit(['/', '\\']).next().unwrap_or("");
    if name.is_empty() || name == "." || name == ".." {
        "download"
    } else {
        name
    }
}

/// Directory install sources are resolved against.
///
/// Release archives conventionally wrap everything in one `<name>-<version>/`
/// directory; when extraction produced exactly one top-level directory, that
/// directory is the root.
pub fn source_root(extracted: &Path) -> Result<PathBuf, StoreError> {
    let mut entries = fs::read_dir(extracted)?
        .filter_map(Result::ok)
        .filter(|e| e.file_name() != "pax_global_header");
    let (Some(only), None) = (entries.next(), entries.next()) else {
        return Ok(extracted.to_path_buf());
    };
    if only.file_type()?.is_dir() {
        Ok(only.path())
    } else {
        Ok(extracted.to_path_buf())
    }
}
