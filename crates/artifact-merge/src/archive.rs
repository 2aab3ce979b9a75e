//! In-memory model of the output archive and the deterministic zip writer.
//!
//! A [`MergedArchive`] is an ordered map from entry path to content.
//! Directory paths end with `/`. Insertion order is kept so that the
//! serialized archive lists entries in the order artifacts were folded in;
//! replacing an existing path keeps its position and swaps the content.
//!
//! Serialization is reproducible: every entry gets the DOS epoch
//! (1980-01-01 00:00) as modification time, files are deflated, and only
//! the unix permission bits are carried over from the source.

use bytes::Bytes;
use indexmap::IndexMap;
use std::io::{Cursor, Read, Seek, Write};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;
const ZIP64_THRESHOLD: u64 = 0xFFFF_FFFF;

/// Errors raised while serializing an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to write zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error while writing zip archive: {0}")]
    Io(#[from] std::io::Error),
}

/// One entry of a [`MergedArchive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveEntry {
    Directory,
    File {
        data: Bytes,
        /// Unix permission bits from the source archive, if it recorded any
        unix_mode: Option<u32>,
    },
}

/// The accumulating output archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedArchive {
    entries: IndexMap<String, ArchiveEntry>,
}

impl MergedArchive {
    /// An empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry paths in archive order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries.get(path)
    }

    /// Content of the file at `path`, if there is one.
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        match self.entries.get(path) {
            Some(ArchiveEntry::File { data, .. }) => Some(data),
            _ => None,
        }
    }

    /// Add a directory entry. A trailing `/` is appended when missing.
    pub fn add_directory(&mut self, path: &str) {
        let path = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };
        self.entries.entry(path).or_insert(ArchiveEntry::Directory);
    }

    /// Add or replace a file entry.
    ///
    /// Returns `true` when an entry already existed at `path` and was
    /// replaced.
    pub fn add_file(&mut self, path: &str, data: impl Into<Bytes>, unix_mode: Option<u32>) -> bool {
        let entry = ArchiveEntry::File {
            data: data.into(),
            unix_mode,
        };
        self.entries.insert(path.to_string(), entry).is_some()
    }

    /// Serialize to zip bytes.
    pub fn to_zip_bytes(&self) -> Result<Bytes, ArchiveError> {
        let cursor = self.write_zip(Cursor::new(Vec::new()))?;
        Ok(Bytes::from(cursor.into_inner()))
    }

    /// Serialize as a zip archive into `writer`, returning it when done.
    pub fn write_zip<W: Write + Seek>(&self, writer: W) -> Result<W, ArchiveError> {
        let mut zip = ZipBuilder::new(writer);
        for (path, entry) in &self.entries {
            match entry {
                ArchiveEntry::Directory => zip.add_directory(path)?,
                ArchiveEntry::File { data, unix_mode } => {
                    let mut reader: &[u8] = data;
                    zip.add_file(path, &mut reader, *unix_mode, data.len() as u64)?;
                }
            }
        }
        zip.finish()
    }
}

/// Deterministic zip writer behind [`MergedArchive::write_zip`].
pub(crate) struct ZipBuilder<W: Write + Seek> {
    inner: ZipWriter<W>,
}

impl<W: Write + Seek> ZipBuilder<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self {
            inner: ZipWriter::new(writer),
        }
    }

    pub(crate) fn add_directory(&mut self, path: &str) -> Result<(), ArchiveError> {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(DateTime::default())
            .unix_permissions(DEFAULT_DIR_MODE);
        self.inner.add_directory(path, options)?;
        Ok(())
    }

    /// Stream `reader` into a new file entry. Returns the bytes written.
    ///
    /// `size` is the expected length; it only decides whether the entry
    /// needs zip64 headers.
    pub(crate) fn add_file<R: Read + ?Sized>(
        &mut self,
        path: &str,
        reader: &mut R,
        unix_mode: Option<u32>,
        size: u64,
    ) -> Result<u64, ArchiveError> {
        let mode = unix_mode.map_or(DEFAULT_FILE_MODE, |m| m & 0o7777);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default())
            .unix_permissions(mode)
            .large_file(size >= ZIP64_THRESHOLD);
        self.inner.start_file(path, options)?;
        let written = std::io::copy(reader, &mut self.inner)?;
        Ok(written)
    }

    pub(crate) fn finish(self) -> Result<W, ArchiveError> {
        Ok(self.inner.finish()?)
    }
}
