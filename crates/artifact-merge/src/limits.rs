use serde::Deserialize;
use std::io::Read;

/// Resource limits applied while decoding input archives.
///
/// Artifacts come from arbitrary upstream stages, so both the tar converter
/// and the zip loader refuse entries that would blow up memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeLimits {
    pub max_entry_bytes: u64,
    pub max_total_bytes: u64,
    pub max_entries: usize,
    pub max_path_len: usize,
}

impl Default for MergeLimits {
    fn default() -> Self {
        Self {
            max_entry_bytes: 1024_u64 * 1024 * 1024,
            max_total_bytes: 4_u64 * 1024 * 1024 * 1024,
            max_entries: 100_000,
            max_path_len: 1024,
        }
    }
}

/// Partial overrides for `MergeLimits`. Used for config file parsing.
/// Unknown keys cause deserialization to fail (deny_unknown_fields).
/// Merge with `MergeLimits::default().apply(overrides)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeLimitsOverrides {
    pub max_entry_bytes: Option<u64>,
    pub max_total_bytes: Option<u64>,
    pub max_entries: Option<usize>,
    pub max_path_len: Option<usize>,
}

impl MergeLimits {
    /// Apply overrides onto these limits. Only `Some` values override.
    pub fn apply(self, overrides: MergeLimitsOverrides) -> Self {
        Self {
            max_entry_bytes: overrides.max_entry_bytes.unwrap_or(self.max_entry_bytes),
            max_total_bytes: overrides.max_total_bytes.unwrap_or(self.max_total_bytes),
            max_entries: overrides.max_entries.unwrap_or(self.max_entries),
            max_path_len: overrides.max_path_len.unwrap_or(self.max_path_len),
        }
    }
}

/// Running totals checked against [`MergeLimits`] across several archives.
#[derive(Debug, Default)]
pub(crate) struct Budget {
    entries: usize,
    bytes: u64,
}

impl Budget {
    /// Admit one more entry whose header declares `declared` bytes.
    ///
    /// Declared sizes can lie, so this only rejects early. The total is
    /// charged with [`Budget::consume`] once the content has been read.
    pub(crate) fn admit(&mut self, limits: &MergeLimits, declared: u64) -> Result<(), String> {
        if declared > limits.max_entry_bytes {
            return Err(format!(
                "entry size {} exceeds limit {}",
                declared, limits.max_entry_bytes
            ));
        }
        self.entries += 1;
        if self.entries > limits.max_entries {
            return Err(format!("entry count exceeds limit {}", limits.max_entries));
        }
        Ok(())
    }

    /// Charge `actual` decoded bytes against the total.
    pub(crate) fn consume(&mut self, limits: &MergeLimits, actual: u64) -> Result<(), String> {
        self.bytes = self.bytes.saturating_add(actual);
        if self.bytes > limits.max_total_bytes {
            return Err(format!(
                "decoded size exceeds limit of {} bytes",
                limits.max_total_bytes
            ));
        }
        Ok(())
    }
}

/// A reader that limits the total number of bytes read and fails explicitly on overflow.
///
/// Declared sizes in archive headers are not trusted: the limit is enforced
/// on the bytes actually produced by the decoder.
pub(crate) struct LimitReader<R> {
    inner: R,
    limit: u64,
    read: u64,
    error_tag: &'static str,
}

impl<R: Read> LimitReader<R> {
    pub(crate) fn new(inner: R, limit: u64, error_tag: &'static str) -> Self {
        Self {
            inner,
            limit,
            read: 0,
            error_tag,
        }
    }
}

impl<R: Read> Read for LimitReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // Allow one byte past the limit so that "exactly at the limit" and
        // "over the limit" can be told apart.
        let allowed = self.limit.saturating_add(1).saturating_sub(self.read);
        let max_to_read = allowed.min(buf.len() as u64);
        if max_to_read == 0 {
            return Ok(0);
        }

        let n = self.inner.read(&mut buf[..max_to_read as usize])?;
        self.read += n as u64;

        if self.read > self.limit {
            return Err(std::io::Error::other(format!(
                "{}: exceeded limit of {} bytes",
                self.error_tag, self.limit
            )));
        }

        Ok(n)
    }
}

/// Read `reader` to the end, failing if it yields more than `limit` bytes.
pub(crate) fn read_bounded<R: Read>(
    reader: R,
    limit: u64,
    error_tag: &'static str,
    capacity_hint: u64,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(capacity_hint.min(limit).min(64 * 1024 * 1024) as usize);
    LimitReader::new(reader, limit, error_tag).read_to_end(&mut buf)?;
    Ok(buf)
}
