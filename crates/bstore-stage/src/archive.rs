use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use bstore_fs::{CancelToken, IoResultExt};
use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::error::{StageError, StageResult};

const CHUNK_SIZE: usize = 1024 * 1024;

/// Archive formats recognized for unpacking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarZst,
    /// A single gzip-compressed file.
    Gz,
    /// A single zstd-compressed file.
    Zst,
}

/// Longest suffixes first so `.tar.gz` wins over `.gz`.
const SUFFIXES: &[(&str, ArchiveFormat)] = &[
    (".tar.gz", ArchiveFormat::TarGz),
    (".tar.zst", ArchiveFormat::TarZst),
    (".tgz", ArchiveFormat::TarGz),
    (".tzst", ArchiveFormat::TarZst),
    (".tar", ArchiveFormat::Tar),
    (".gz", ArchiveFormat::Gz),
    (".zst", ArchiveFormat::Zst),
];

impl ArchiveFormat {
    /// Detect the format from the file name, ignoring case.
    pub fn detect(path: &Path) -> Option<Self> {
        Self::matching_suffix(path).map(|(_, format)| format)
    }

    pub fn is_archive(path: &Path) -> bool {
        Self::detect(path).is_some()
    }

    /// `data.tar.gz` → `data`. Paths that are not archives are returned as is.
    pub fn strip_extension(path: &Path) -> PathBuf {
        let Some((suffix, _)) = Self::matching_suffix(path) else {
            return path.to_path_buf();
        };
        match path.file_name() {
            Some(name) => path.with_file_name(trim_suffix(name, suffix.len())),
            None => path.to_path_buf(),
        }
    }

    fn is_tar(self) -> bool {
        matches!(self, Self::Tar | Self::TarGz | Self::TarZst)
    }

    fn matching_suffix(path: &Path) -> Option<(&'static str, Self)> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        SUFFIXES
            .iter()
            .find(|(suffix, _)| name.len() > suffix.len() && name.ends_with(suffix))
            .copied()
    }
}

/// Drop the last `len` bytes of `name`. Suffixes are ASCII, so the cut never
/// splits a character and non-UTF-8 names keep their original bytes.
#[cfg(unix)]
fn trim_suffix(name: &OsStr, len: usize) -> OsString {
    use std::os::unix::ffi::OsStrExt;
    let bytes = name.as_bytes();
    OsStr::from_bytes(&bytes[..bytes.len() - len]).to_os_string()
}

#[cfg(not(unix))]
fn trim_suffix(name: &OsStr, len: usize) -> OsString {
    let name = name.to_string_lossy();
    OsString::from(&name[..name.len() - len])
}

/// Unpack `archive` into `dest`, which must not exist yet.
///
/// Tar formats produce a directory at `dest`; single-file formats produce a
/// file. Tar entries that would escape `dest` are skipped. Directory modes
/// are applied after every entry is written, so read-only directories listed
/// ahead of their contents still unpack.
pub fn unpack(archive: &Path, dest: &Path, cancel: &CancelToken) -> StageResult<()> {
    let format = ArchiveFormat::detect(archive).ok_or_else(|| StageError::Archive {
        path: archive.to_path_buf(),
        reason: "unrecognized archive format".into(),
    })?;
    let file = File::open(archive).at("open", archive)?;
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::Tar => Box::new(file),
        ArchiveFormat::TarGz | ArchiveFormat::Gz => Box::new(GzDecoder::new(file)),
        ArchiveFormat::TarZst | ArchiveFormat::Zst => {
            Box::new(zstd::stream::read::Decoder::new(file).map_err(|e| archive_error(archive, e))?)
        }
    };

    if format.is_tar() {
        unpack_tar(archive, reader, dest, cancel)?;
    } else {
        decompress_file(archive, reader, dest, cancel)?;
    }
    debug!(archive = %archive.display(), dest = %dest.display(), ?format, "unpacked");
    Ok(())
}

fn unpack_tar(archive: &Path, reader: Box<dyn Read>, dest: &Path, cancel: &CancelToken) -> StageResult<()> {
    fs::create_dir(dest).at("mkdir", dest)?;
    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    let mut dir_modes = Vec::new();
    for entry in tar.entries().map_err(|e| archive_error(archive, e))? {
        cancel.check()?;
        let mut entry = entry.map_err(|e| archive_error(archive, e))?;
        let deferred = if entry.header().entry_type().is_dir() {
            entry.set_preserve_permissions(false);
            let relative: PathBuf = entry
                .path()
                .map_err(|e| archive_error(archive, e))?
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .collect();
            let mode = entry.header().mode().map_err(|e| archive_error(archive, e))?;
            Some((dest.join(relative), mode))
        } else {
            None
        };
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| archive_error(archive, e))?;
        if !unpacked {
            let name = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
            warn!(archive = %archive.display(), entry = %name, "skipped entry outside destination");
        } else if let Some(dir) = deferred {
            dir_modes.push(dir);
        }
    }
    dir_modes.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
    for (path, mode) in dir_modes {
        set_mode(&path, mode)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> StageResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)).at("chmod", path)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> StageResult<()> {
    Ok(())
}

fn decompress_file(archive: &Path, mut reader: Box<dyn Read>, dest: &Path, cancel: &CancelToken) -> StageResult<()> {
    let mut out = File::options()
        .write(true)
        .create_new(true)
        .open(dest)
        .at("create", dest)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        cancel.check()?;
        let n = reader.read(&mut buf).map_err(|e| archive_error(archive, e))?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).at("write", dest)?;
    }
    out.flush().at("flush", dest)?;
    Ok(())
}

fn archive_error(archive: &Path, err: io::Error) -> StageError {
    StageError::Archive {
        path: archive.to_path_buf(),
        reason: err.to_string(),
    }
}
