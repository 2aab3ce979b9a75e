//! Scoped staging for converted archives.
//!
//! Conversion writes the zip into a named temporary file rather than
//! growing an in-memory buffer entry by entry, then reads it back once
//! finished. The file is removed when the [`StagingSink`] is dropped, which
//! covers success, conversion failure and panics alike.

use bytes::Bytes;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::blob::naming::staging_prefix;

/// Where staging files are created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingArea {
    dir: Option<PathBuf>,
}

impl StagingArea {
    /// Stage in the system temp directory.
    pub fn system() -> Self {
        Self { dir: None }
    }

    /// Stage in `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// Acquire a fresh sink whose file name starts with the artifact name.
    pub fn acquire(&self, name: &str) -> std::io::Result<StagingSink> {
        let prefix = staging_prefix(name);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix(".zip");
        let file = match &self.dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(StagingSink { file })
    }
}

/// A staging file owned by one conversion.
#[derive(Debug)]
pub struct StagingSink {
    file: NamedTempFile,
}

impl StagingSink {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub(crate) fn file_mut(&mut self) -> &mut File {
        self.file.as_file_mut()
    }

    /// Read back everything written so far and release the file.
    pub fn into_bytes(mut self) -> std::io::Result<Bytes> {
        let file = self.file.as_file_mut();
        let len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        let mut buf = Vec::with_capacity(len as usize);
        file.read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}
