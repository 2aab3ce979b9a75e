//! Tar-family to zip normalization.
//!
//! Objects whose key ends in `.tgz`, `.tar`, `.bz2` or `.gz` are treated as
//! tar archives and rewritten as zip before merging. The suffix only decides
//! *whether* to convert: the compression layer is picked by sniffing the
//! first bytes of the stream, so a plain tar uploaded as `.tar.gz` converts
//! as well.
//!
//! | tar entry            | zip result                    |
//! |----------------------|-------------------------------|
//! | regular / contiguous | deflated file, mode preserved |
//! | directory            | directory entry               |
//! | symlink, hard link,  | skipped (`warn!`)             |
//! | device, fifo         |                               |
//! | pax / gnu headers    | consumed by the tar reader    |
//!
//! When a path occurs more than once the later entry wins, as it would when
//! the tar is extracted.

pub mod staging;

use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path};
use tar::EntryType;
use thiserror::Error;

use crate::archive::{ArchiveError, MergedArchive};
use crate::limits::{read_bounded, Budget, MergeLimits};

pub use staging::{StagingArea, StagingSink};

/// Key suffixes routed through conversion. Matching is case-sensitive.
pub const TAR_FAMILY_SUFFIXES: [&str; 4] = [".tgz", ".tar", ".bz2", ".gz"];

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";

/// True when the object key names a tar-family archive.
pub fn is_tar_family(key: &str) -> bool {
    TAR_FAMILY_SUFFIXES
        .iter()
        .any(|suffix| key.ends_with(suffix))
}

/// Compression layer wrapped around a tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
    None,
}

impl Compression {
    /// Detect the compression from the leading bytes of a stream.
    pub fn sniff(prefix: &[u8]) -> Self {
        if prefix.starts_with(GZIP_MAGIC) {
            Self::Gzip
        } else if prefix.starts_with(BZIP2_MAGIC) {
            Self::Bzip2
        } else {
            Self::None
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gzip => write!(f, "tar.gz"),
            Self::Bzip2 => write!(f, "tar.bz2"),
            Self::None => write!(f, "tar"),
        }
    }
}

/// Conversion failures. None of these are retried.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("artifact '{name}': not a valid {compression} archive: {source}")]
    Corrupt {
        name: String,
        compression: Compression,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact '{name}': unsafe entry path '{path}'")]
    UnsafePath { name: String, path: String },

    #[error("artifact '{name}': {message}")]
    Limit { name: String, message: String },

    #[error("artifact '{name}': staging failed: {source}")]
    Staging {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact '{name}': {source}")]
    Zip {
        name: String,
        #[source]
        source: ArchiveError,
    },
}

/// A converted archive.
#[derive(Debug, Clone)]
pub struct Normalized {
    /// Zip-formatted content
    pub content: Bytes,
    /// Length of `content`, not of the original tar stream
    pub content_length: u64,
    pub stats: ConversionStats,
}

/// What a conversion did with the tar entries it saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversionStats {
    pub compression: Option<Compression>,
    pub files: usize,
    pub directories: usize,
    pub skipped: usize,
    /// Files replaced by a later entry with the same path
    pub replaced: usize,
}

/// Convert a tar-family stream into zip bytes.
///
/// `key` is only used for logging; callers decide with [`is_tar_family`]
/// whether to convert at all.
pub fn normalize<R: Read>(
    key: &str,
    input: R,
    name: &str,
    staging: &StagingArea,
    limits: &MergeLimits,
) -> Result<Normalized, ConversionError> {
    let mut input = BufReader::new(input);
    let prefix = input.fill_buf().map_err(|source| ConversionError::Corrupt {
        name: name.to_string(),
        compression: Compression::None,
        source,
    })?;

    if prefix.is_empty() {
        return Err(ConversionError::Corrupt {
            name: name.to_string(),
            compression: Compression::None,
            source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "empty input"),
        });
    }

    let compression = Compression::sniff(prefix);
    tracing::debug!(key, name, %compression, "converting tar-family artifact to zip");

    let mut sink = staging
        .acquire(name)
        .map_err(|source| ConversionError::Staging {
            name: name.to_string(),
            source,
        })?;

    let mut stats = match compression {
        Compression::Gzip => convert_tar(MultiGzDecoder::new(input), name, compression, &mut sink, limits)?,
        Compression::Bzip2 => convert_tar(
            bzip2::read::MultiBzDecoder::new(input),
            name,
            compression,
            &mut sink,
            limits,
        )?,
        Compression::None => convert_tar(input, name, compression, &mut sink, limits)?,
    };
    stats.compression = Some(compression);

    let content = sink.into_bytes().map_err(|source| ConversionError::Staging {
        name: name.to_string(),
        source,
    })?;
    let content_length = content.len() as u64;

    tracing::info!(
        key,
        name,
        files = stats.files,
        directories = stats.directories,
        skipped = stats.skipped,
        bytes = content_length,
        "converted tar-family artifact"
    );

    Ok(Normalized {
        content,
        content_length,
        stats,
    })
}

fn convert_tar<D: Read>(
    decoded: D,
    name: &str,
    compression: Compression,
    sink: &mut StagingSink,
    limits: &MergeLimits,
) -> Result<ConversionStats, ConversionError> {
    let corrupt = |source: std::io::Error| ConversionError::Corrupt {
        name: name.to_string(),
        compression,
        source,
    };

    let mut archive = tar::Archive::new(decoded);
    let mut converted = MergedArchive::new();
    let mut budget = Budget::default();
    let mut stats = ConversionStats::default();

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let raw_path = entry.path().map_err(corrupt)?.into_owned();
        let path = zip_entry_path(&raw_path, limits).map_err(|path| ConversionError::UnsafePath {
            name: name.to_string(),
            path,
        })?;
        let over_limit = |message: String| ConversionError::Limit {
            name: name.to_string(),
            message: format!("{}: {}", path, message),
        };

        match entry.header().entry_type() {
            EntryType::Directory => {
                if path.is_empty() {
                    continue;
                }
                converted.add_directory(&path);
                stats.directories += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                let declared = entry.header().size().map_err(corrupt)?;
                budget.admit(limits, declared).map_err(over_limit)?;
                let mode = entry.header().mode().ok();

                let data = read_bounded(&mut entry, limits.max_entry_bytes, "LimitEntryBytes", declared)
                    .map_err(|e| classify_read_error(e, name, compression))?;
                budget.consume(limits, data.len() as u64).map_err(over_limit)?;

                if converted.add_file(&path, Bytes::from(data), mode) {
                    tracing::debug!(name, path = %path, "tar entry replaced by a later entry");
                    stats.replaced += 1;
                } else {
                    stats.files += 1;
                }
            }
            EntryType::XHeader | EntryType::XGlobalHeader => {
                tracing::debug!(name, path = %path, "ignoring pax header entry");
            }
            other => {
                tracing::warn!(
                    name,
                    path = %path,
                    entry_type = ?other,
                    "skipping tar entry that has no zip representation"
                );
                stats.skipped += 1;
            }
        }
    }

    converted
        .write_zip(sink.file_mut())
        .map_err(|source| ConversionError::Zip {
            name: name.to_string(),
            source,
        })?;

    Ok(stats)
}

/// Tell limit violations apart from a broken stream by their tag.
fn classify_read_error(err: std::io::Error, name: &str, compression: Compression) -> ConversionError {
    if err.to_string().contains("LimitEntryBytes") {
        ConversionError::Limit {
            name: name.to_string(),
            message: err.to_string(),
        }
    } else {
        ConversionError::Corrupt {
            name: name.to_string(),
            compression,
            source: err,
        }
    }
}

/// Relative, `/`-separated zip path for a tar entry path.
///
/// `.` components are dropped; absolute paths and `..` are rejected, as are
/// paths longer than the configured limit.
fn zip_entry_path(path: &Path, limits: &MergeLimits) -> Result<String, String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(path.display().to_string()),
        }
    }
    let joined = parts.join("/");
    if joined.len() > limits.max_path_len {
        return Err(path.display().to_string());
    }
    Ok(joined)
}
