//! The merge engine: folds retrieved artifacts into one archive.
//!
//! Artifacts are processed strictly in the order given. For each one the
//! engine picks a merge target (the archive root, or a folder named after
//! the artifact), optionally writes a revision marker into it, and then
//! copies every entry of the artifact's zip under the target.
//!
//! ```text
//! subfolder=false, revisions=true     subfolder=true, revisions=true
//!   .revision-id-a                      a/
//!   f1                                  a/.revision-id
//!   .revision-id-b                      a/f1
//!   f2                                  b/
//!                                       b/.revision-id
//!                                       b/f2
//! ```
//!
//! At the root, an entry path present in several artifacts ends up with the
//! content of the last one.

use bytes::Bytes;
use std::io::Cursor;
use thiserror::Error;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::archive::MergedArchive;
use crate::limits::{read_bounded, Budget, MergeLimits};
use crate::options::MergeOptions;
use crate::retrieve::RetrievedArtifact;

/// Marker file name inside a per-artifact folder.
pub const SUBFOLDER_REVISION_MARKER: &str = ".revision-id";
/// Marker file name prefix at the archive root; the artifact name follows.
pub const ROOT_REVISION_MARKER_PREFIX: &str = ".revision-id-";

/// Merge failures. The first failing artifact aborts the fold.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("artifact '{name}' (#{index}) is not a loadable zip archive: {source}")]
    InvalidArchive {
        name: String,
        index: usize,
        #[source]
        source: ZipError,
    },

    #[error("artifact '{name}': failed to read entry '{path}': {source}")]
    Entry {
        name: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact '{name}': unsafe path '{path}'")]
    UnsafePath { name: String, path: String },

    #[error("artifact '{name}': {message}")]
    Limit { name: String, message: String },
}

/// Fold `artifacts` into `initial`, in order.
pub fn merge(
    initial: MergedArchive,
    artifacts: impl IntoIterator<Item = RetrievedArtifact>,
    options: &MergeOptions,
    limits: &MergeLimits,
) -> Result<MergedArchive, MergeError> {
    let mut archive = initial;
    let mut budget = Budget::default();

    for (index, artifact) in artifacts.into_iter().enumerate() {
        archive = fold_artifact(archive, index, &artifact, options, limits, &mut budget)?;
    }

    Ok(archive)
}

/// Path prefix of the merge target for `name`: empty for the root, or
/// `name/` in subfolder mode.
pub fn target_prefix(options: &MergeOptions, name: &str) -> String {
    if options.subfolder {
        format!("{}/", name)
    } else {
        String::new()
    }
}

/// Path of the revision marker for artifact `name`.
pub fn revision_marker_path(options: &MergeOptions, name: &str) -> String {
    if options.subfolder {
        format!("{}/{}", name, SUBFOLDER_REVISION_MARKER)
    } else {
        format!("{}{}", ROOT_REVISION_MARKER_PREFIX, name)
    }
}

fn fold_artifact(
    mut archive: MergedArchive,
    index: usize,
    artifact: &RetrievedArtifact,
    options: &MergeOptions,
    limits: &MergeLimits,
    budget: &mut Budget,
) -> Result<MergedArchive, MergeError> {
    let name = artifact.name.as_str();

    // The name becomes part of entry paths in both layouts that use it.
    if (options.subfolder || options.revisions) && !is_safe_path(name, limits) {
        return Err(MergeError::UnsafePath {
            name: name.to_string(),
            path: name.to_string(),
        });
    }

    let prefix = target_prefix(options, name);
    if options.subfolder {
        archive.add_directory(&prefix);
    }

    if options.revisions {
        let revision = artifact.revision.clone().unwrap_or_default();
        archive.add_file(&revision_marker_path(options, name), revision, None);
    }

    let mut zip =
        ZipArchive::new(Cursor::new(artifact.content.clone())).map_err(|source| {
            MergeError::InvalidArchive {
                name: name.to_string(),
                index,
                source,
            }
        })?;

    let mut replaced = 0usize;
    for i in 0..zip.len() {
        let mut file = zip
            .by_index(i)
            .map_err(|source| MergeError::InvalidArchive {
                name: name.to_string(),
                index,
                source,
            })?;

        // Some archivers write Windows separators.
        let entry_name = file.name().replace('\\', "/");
        if !is_safe_path(&entry_name, limits) {
            return Err(MergeError::UnsafePath {
                name: name.to_string(),
                path: entry_name,
            });
        }
        let path = format!("{}{}", prefix, entry_name);

        if file.is_dir() {
            archive.add_directory(&path);
            continue;
        }

        let declared = file.size();
        budget
            .admit(limits, declared)
            .map_err(|message| MergeError::Limit {
                name: name.to_string(),
                message: format!("{}: {}", entry_name, message),
            })?;
        let unix_mode = file.unix_mode();

        let data = read_bounded(&mut file, limits.max_entry_bytes, "LimitEntryBytes", declared)
            .map_err(|source| {
                if source.to_string().contains("LimitEntryBytes") {
                    MergeError::Limit {
                        name: name.to_string(),
                        message: source.to_string(),
                    }
                } else {
                    MergeError::Entry {
                        name: name.to_string(),
                        path: entry_name.clone(),
                        source,
                    }
                }
            })?;
        budget
            .consume(limits, data.len() as u64)
            .map_err(|message| MergeError::Limit {
                name: name.to_string(),
                message: format!("{}: {}", entry_name, message),
            })?;

        if archive.add_file(&path, Bytes::from(data), unix_mode) {
            tracing::debug!(artifact = name, path = %path, "entry overwritten by later artifact");
            replaced += 1;
        }
    }

    tracing::debug!(
        artifact = name,
        index,
        entries = zip.len(),
        replaced,
        "artifact folded into output archive"
    );

    Ok(archive)
}

/// Absolute paths, `..` segments, backslashes and over-long paths are unsafe.
///
/// Entry names have their backslashes turned into `/` before this check.
fn is_safe_path(path: &str, limits: &MergeLimits) -> bool {
    !(path.is_empty()
        || path.len() > limits.max_path_len
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|segment| segment == ".."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zip_of(entries: &[(&str, &str)]) -> Bytes {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (path, data) in entries {
            if path.ends_with('/') {
                writer
                    .add_directory(*path, SimpleFileOptions::default())
                    .unwrap();
            } else {
                writer.start_file(*path, SimpleFileOptions::default()).unwrap();
                writer.write_all(data.as_bytes()).unwrap();
            }
        }
        Bytes::from(writer.finish().unwrap().into_inner())
    }

    fn artifact(name: &str, revision: Option<&str>, entries: &[(&str, &str)]) -> RetrievedArtifact {
        let content = zip_of(entries);
        RetrievedArtifact {
            name: name.to_string(),
            revision: revision.map(str::to_string),
            content_length: content.len() as u64,
            content,
            encryption: None,
        }
    }

    #[test]
    fn test_target_and_marker_paths() {
        let root = MergeOptions::default();
        let sub = MergeOptions {
            subfolder: true,
            revisions: true,
        };
        assert_eq!(target_prefix(&root, "a"), "");
        assert_eq!(target_prefix(&sub, "a"), "a/");
        assert_eq!(revision_marker_path(&root, "a"), ".revision-id-a");
        assert_eq!(revision_marker_path(&sub, "a"), "a/.revision-id");
    }

    #[test]
    fn test_directories_are_copied() {
        let merged = merge(
            MergedArchive::new(),
            vec![artifact("a", None, &[("dist/", ""), ("dist/app.js", "1")])],
            &MergeOptions {
                subfolder: true,
                revisions: false,
            },
            &MergeLimits::default(),
        )
        .unwrap();

        assert_eq!(
            merged.paths().collect::<Vec<_>>(),
            vec!["a/", "a/dist/", "a/dist/app.js"]
        );
    }

    #[test]
    fn test_invalid_zip_reports_index() {
        let mut bad = artifact("b", None, &[]);
        bad.content = Bytes::from_static(b"definitely not a zip");

        let err = merge(
            MergedArchive::new(),
            vec![artifact("a", None, &[("f1", "1")]), bad],
            &MergeOptions::default(),
            &MergeLimits::default(),
        )
        .unwrap_err();

        match err {
            MergeError::InvalidArchive { name, index, .. } => {
                assert_eq!(name, "b");
                assert_eq!(index, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parent_dir_entry_is_rejected() {
        let err = merge(
            MergedArchive::new(),
            vec![artifact("a", None, &[("../escape.sh", "rm -rf")])],
            &MergeOptions::default(),
            &MergeLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::UnsafePath { .. }));
    }

    #[test]
    fn test_unsafe_artifact_name_in_subfolder_mode() {
        let err = merge(
            MergedArchive::new(),
            vec![artifact("../up", None, &[("f", "1")])],
            &MergeOptions {
                subfolder: true,
                revisions: false,
            },
            &MergeLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::UnsafePath { .. }));
    }

    #[test]
    fn test_entry_count_limit() {
        let limits = MergeLimits {
            max_entries: 2,
            ..MergeLimits::default()
        };
        let err = merge(
            MergedArchive::new(),
            vec![
                artifact("a", None, &[("f1", "1"), ("f2", "2")]),
                artifact("b", None, &[("f3", "3")]),
            ],
            &MergeOptions::default(),
            &limits,
        )
        .unwrap_err();
        match err {
            MergeError::Limit { name, .. } => assert_eq!(name, "b"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_total_limit_uses_decoded_bytes() {
        let content = "x".repeat(1000);
        let mut big = artifact("a", None, &[("big", content.as_str())]);

        // Understate the uncompressed size in the central directory.
        let mut bytes = big.content.to_vec();
        let central = bytes
            .windows(4)
            .position(|w| w == b"PK\x01\x02")
            .expect("central directory header");
        bytes[central + 24..central + 28].copy_from_slice(&1u32.to_le_bytes());
        big.content = Bytes::from(bytes);

        let limits = MergeLimits {
            max_total_bytes: 10,
            ..MergeLimits::default()
        };
        let err = merge(
            MergedArchive::new(),
            vec![big],
            &MergeOptions::default(),
            &limits,
        )
        .unwrap_err();
        match err {
            MergeError::Limit { message, .. } => assert!(message.contains("decoded size")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_backslash_separators_are_normalized() {
        let merged = merge(
            MergedArchive::new(),
            vec![artifact("a", None, &[("dist\\app.js", "1")])],
            &MergeOptions::default(),
            &MergeLimits::default(),
        )
        .unwrap();
        assert_eq!(merged.paths().collect::<Vec<_>>(), vec!["dist/app.js"]);

        let err = merge(
            MergedArchive::new(),
            vec![artifact("a", None, &[("..\\evil.sh", "rm -rf")])],
            &MergeOptions::default(),
            &MergeLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::UnsafePath { .. }));
    }

    #[test]
    fn test_merge_into_non_empty_initial_archive() {
        let mut initial = MergedArchive::new();
        initial.add_file("seed.txt", "seed", None);

        let merged = merge(
            initial,
            vec![artifact("a", None, &[("f1", "1")])],
            &MergeOptions::default(),
            &MergeLimits::default(),
        )
        .unwrap();
        assert_eq!(merged.paths().collect::<Vec<_>>(), vec!["seed.txt", "f1"]);
    }
}
