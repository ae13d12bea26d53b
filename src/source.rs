//! Where firmware bytes come from, and how outer archives are opened.
//!
//! Firmware is distributed either as a bare PAK container or wrapped in an
//! outer archive (ZIP and friends) holding one or more containers.  Fetching
//! and unwrapping are pluggable; the core only ever sees byte buffers.

use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info};

use crate::container::{is_container, Container};
use crate::error::AnalyzeError;
use crate::filesystem::Decoders;
use crate::report::{analyze, AnalysisContext, FirmwareReport};

/// Raw bytes of a firmware file and where they came from.
#[derive(Debug, Clone)]
pub struct Source {
    pub locator: String,
    pub bytes:   Vec<u8>,
    /// SHA-256 if the provider already knows it.
    pub digest:  Option<String>,
}

pub trait SourceProvider {
    fn fetch(&self, locator: &str) -> io::Result<Source>;
}

/// Reads sources from the local file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSource;

impl SourceProvider for FileSource {
    fn fetch(&self, locator: &str) -> io::Result<Source> {
        let path = Path::new(locator);
        let bytes = fs::read(path)?;
        debug!(path = %path.display(), size = bytes.len(), "source read");
        Ok(Source {
            locator: locator.to_string(),
            bytes,
            digest: None,
        })
    }
}

/// A container found inside an outer archive.
#[derive(Debug, Clone)]
pub struct InnerContainer {
    pub name:  String,
    pub bytes: Vec<u8>,
}

/// Opens an outer archive and returns every PAK container inside it.
pub trait ArchiveUnwrapper: Send + Sync {
    fn unwrap_archive(&self, bytes: &[u8]) -> io::Result<Vec<InnerContainer>>;
}

/// Analyse a source: directly when it is a bare container, otherwise one
/// report per inner container.  A failing inner container does not stop
/// the others; its error takes its slot in the result.
pub fn analyze_source(
    source: Source,
    unwrapper: Option<&dyn ArchiveUnwrapper>,
    decoders: Option<&Decoders>,
) -> Result<Vec<Result<FirmwareReport, AnalyzeError>>, AnalyzeError> {
    let Source { locator, bytes, digest } = source;

    if is_container(&bytes) {
        let context = AnalysisContext { locator, pak: None, digest };
        let report = Container::parse(bytes)
            .map_err(AnalyzeError::from)
            .and_then(|container| analyze(&container, &context, decoders));
        return Ok(vec![report]);
    }

    let unwrapper = unwrapper.ok_or(AnalyzeError::NotAContainer)?;
    let inner = unwrapper
        .unwrap_archive(&bytes)
        .map_err(|e| AnalyzeError::Unwrap(e.to_string()))?;
    if inner.is_empty() {
        return Err(AnalyzeError::NoContainers);
    }
    info!(locator = %locator, count = inner.len(), "analysing inner containers");

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        Ok(inner
            .into_par_iter()
            .map(|pak| analyze_inner(&locator, pak, decoders))
            .collect())
    }

    #[cfg(not(feature = "parallel"))]
    {
        Ok(inner
            .into_iter()
            .map(|pak| analyze_inner(&locator, pak, decoders))
            .collect())
    }
}

fn analyze_inner(
    locator: &str,
    pak: InnerContainer,
    decoders: Option<&Decoders>,
) -> Result<FirmwareReport, AnalyzeError> {
    let context = AnalysisContext {
        locator: locator.to_string(),
        pak:     Some(pak.name),
        digest:  None,
    };
    let container = Container::parse(pak.bytes)?;
    analyze(&container, &context, decoders)
}
