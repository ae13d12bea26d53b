//! Error taxonomy shared by the parsing, decoding and extraction layers.
//!
//! Missing optional metadata is never an error; these types only cover
//! conditions the caller has to see.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::filesystem::FilesystemKind;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Corrupt container header: {0}")]
    CorruptHeader(String),
    /// Neither the declared nor the inferred section count gives a
    /// self-consistent table.
    #[error("Ambiguous section count (declared {declared}, inferred {inferred:?})")]
    AmbiguousSectionCount { declared: u32, inferred: Option<u32> },
    #[error("Malformed board description: {0}")]
    MalformedDocument(String),
}

#[derive(Error, Debug)]
pub enum DecompressError {
    #[error("No known compression envelope found")]
    UnknownEnvelope,
    #[error("{codec} codec failure: {reason}")]
    CodecFailure { codec: &'static str, reason: String },
}

impl DecompressError {
    pub(crate) fn codec(codec: &'static str, reason: impl ToString) -> Self {
        DecompressError::CodecFailure { codec, reason: reason.to_string() }
    }
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("No file system section found")]
    NoFilesystemSection,
    #[error("Section '{section}' holds an unrecognised file system")]
    UnsupportedFilesystem { section: String },
    #[error("No {kind} decoder registered for section '{section}'")]
    DecoderUnavailable { section: String, kind: FilesystemKind },
    #[error("Refusing to write outside the destination: {}", .0.display())]
    UnsafePath(PathBuf),
    #[error("Blob '{name}' could not be decoded: {source}")]
    Blob { name: &'static str, #[source] source: DecompressError },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of one analysis pipeline (one inner container).
#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Not a PAK container and no archive unwrapper available")]
    NotAContainer,
    #[error("No PAK containers found in archive")]
    NoContainers,
    #[error("Archive unwrap failed: {0}")]
    Unwrap(String),
}
