//! Errors that abort resolution.
//!
//! Anything that merely means "this pattern does not apply here" is logged and skipped instead of
//! being reported through these types.

use std::path::PathBuf;

/// A malformed line in one of the line-oriented definition sources (GUIDs, protocol bindings,
/// type libraries).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{source_name}:{line}: {reason}")]
pub struct DefinitionError {
    pub source_name: String,
    pub line: usize,
    pub reason: String,
}

impl DefinitionError {
    pub(crate) fn new(source_name: &str, line: usize, reason: impl Into<String>) -> Self {
        Self {
            source_name: source_name.to_owned(),
            line,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed definition source: {0}")]
    Definition(#[from] DefinitionError),
    #[error(
        "binary does not target the EFI platform (type `{root_type}` is unknown); \
         select the EFI platform when loading the binary"
    )]
    PlatformMismatch { root_type: String },
    #[error("malformed exported database at line {line}: {reason}")]
    MalformedExport { line: usize, reason: String },
    #[error("could not access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
