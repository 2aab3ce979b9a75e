//! Merge layout options and the user-parameter string they are read from.
//!
//! The orchestration layer hands over a free-form string. It is parsed as
//! JSON into [`MergeOptions`]:
//!
//! ```text
//! ""                                        -> defaults (root merge, no markers)
//! null                                      -> defaults
//! { "subfolder": true }                     -> subfolder merge, no markers
//! { "subfolder": true, "revisions": true }  -> subfolder merge with markers
//! { "subfolder": true }}                    -> ConfigError (malformed)
//! { "flatten": true }                       -> ConfigError (unknown key)
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Layout options for the merge engine. Both flags default to `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MergeOptions {
    /// Place each artifact's entries under a folder named after the artifact.
    pub subfolder: bool,
    /// Write a revision-marker entry for each artifact.
    pub revisions: bool,
}

/// The parameter string could not be turned into [`MergeOptions`].
#[derive(Debug, Error)]
#[error("invalid merge parameters '{input}': {source}")]
pub struct OptionsError {
    pub input: String,
    #[source]
    pub source: serde_json::Error,
}

impl MergeOptions {
    /// Parse the user-parameter string.
    ///
    /// An absent, empty or whitespace-only string is valid and yields the
    /// defaults. Malformed JSON, wrongly typed values and unknown keys are
    /// rejected.
    pub fn parse(input: Option<&str>) -> Result<Self, OptionsError> {
        let input = match input.map(str::trim) {
            None | Some("") => return Ok(Self::default()),
            Some(trimmed) => trimmed,
        };

        let parsed: Option<Self> = serde_json::from_str(input).map_err(|source| OptionsError {
            input: input.to_string(),
            source,
        })?;
        Ok(parsed.unwrap_or_default())
    }
}
