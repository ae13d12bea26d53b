//! Materialise a container's file systems (and boot blobs) on disk.
//!
//! The primary file system (`fs`/`rootfs`) lands in the destination root;
//! the application file system (`app`) lands in [`ExtractOptions::app_subpath`]
//! beneath it.  Existing files are skipped unless `overwrite` is set, except
//! for UBIFS sections, whose decoder cannot re-extract partially and always
//! rewrites.

use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use crate::codec::{decompress, decompress_bootloader, kernel_config};
use crate::container::{Container, Section, APP_SECTION, KERNEL_SECTIONS, ROOTFS_SECTIONS, UBOOT_SECTIONS};
use crate::error::{DecompressError, ExtractError};
use crate::fdt::{self, Fdt};
use crate::filesystem::{classify, Decoders, EntryKind, FilesystemDecoder, FilesystemEntry, FilesystemKind, FsEntry};

/// Directory used by [`extract_firmware`] when there is no primary section.
pub const APP_ONLY_ROOT: &str = "app-root";
/// Decompiled device tree written next to the kernel.
pub const DTS_FILE: &str = "camera.dts";

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub overwrite:   bool,
    /// Where the `app` section goes, relative to the file system root.
    pub app_subpath: PathBuf,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            overwrite:   false,
            app_subpath: PathBuf::from("mnt/app"),
        }
    }
}

/// What an extraction did.  Paths are relative to the destination.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionReport {
    pub sections: Vec<FilesystemEntry>,
    pub written:  Vec<PathBuf>,
    /// Pre-existing files left untouched.
    pub skipped:  Vec<PathBuf>,
}

struct Plan<'a> {
    section: Section<'a>,
    kind:    FilesystemKind,
    decoder: &'a dyn FilesystemDecoder,
    target:  PathBuf,
}

pub fn extract(
    container: &Container,
    destination: &Path,
    decoders: &Decoders,
    options: &ExtractOptions,
) -> Result<ExtractionReport, ExtractError> {
    let mut sections = container.filesystem_sections();
    if sections.is_empty() {
        return Err(ExtractError::NoFilesystemSection);
    }
    // Primary first so the secondary tree is laid over it.
    sections.sort_by_key(|s| s.name() == APP_SECTION);

    let mut plans = Vec::with_capacity(sections.len());
    for section in sections {
        let kind = classify(section.bytes());
        if kind == FilesystemKind::Unknown {
            return Err(ExtractError::UnsupportedFilesystem { section: section.name().to_string() });
        }
        let decoder = decoders.get(kind).ok_or_else(|| ExtractError::DecoderUnavailable {
            section: section.name().to_string(),
            kind,
        })?;
        let target = if section.name() == APP_SECTION {
            options.app_subpath.clone()
        } else {
            PathBuf::new()
        };
        plans.push(Plan { section, kind, decoder, target });
    }

    fs::create_dir_all(destination)?;
    let mut report = ExtractionReport::default();
    for plan in plans {
        let entries = plan.decoder.decode(plan.section.bytes())?;
        info!(
            section = plan.section.name(),
            kind = %plan.kind,
            entries = entries.len(),
            "extracting file system"
        );
        report.sections.push(FilesystemEntry {
            name: plan.section.name().to_string(),
            kind: plan.kind,
        });
        let overwrite = options.overwrite || plan.kind == FilesystemKind::Ubifs;
        write_entries(destination, &plan.target, entries, overwrite, &mut report)?;
    }
    Ok(report)
}

/// Full unpack: the file system tree under `destination/<primary section>/`
/// plus the decoded boot loader, kernel, kernel config and device tree
/// source next to it.
pub fn extract_firmware(
    container: &Container,
    destination: &Path,
    decoders: &Decoders,
    options: &ExtractOptions,
) -> Result<ExtractionReport, ExtractError> {
    let root = container
        .find_section(ROOTFS_SECTIONS)
        .map(|s| s.name().to_string())
        .unwrap_or_else(|| APP_ONLY_ROOT.to_string());
    let mut report = extract(container, &destination.join(&root), decoders, options)?;
    report.written = report.written.into_iter().map(|p| Path::new(&root).join(p)).collect();
    report.skipped = report.skipped.into_iter().map(|p| Path::new(&root).join(p)).collect();

    let blobs = extract_blobs(container, destination, options.overwrite)?;
    report.written.extend(blobs.written);
    report.skipped.extend(blobs.skipped);
    Ok(report)
}

/// Write `uboot`, `kernel`, `.config` (when embedded) and `camera.dts` (when
/// a device tree is found) into `destination`.  Missing sections are
/// skipped; undecodable ones are errors.
pub fn extract_blobs(
    container: &Container,
    destination: &Path,
    overwrite: bool,
) -> Result<ExtractionReport, ExtractError> {
    fs::create_dir_all(destination)?;
    let mut report = ExtractionReport::default();

    if let Some(section) = container.find_section(UBOOT_SECTIONS) {
        let uboot = match decompress_bootloader(section.bytes()) {
            Ok(payload) => payload.data,
            Err(DecompressError::UnknownEnvelope) => section.bytes().to_vec(),
            Err(source) => return Err(ExtractError::Blob { name: "uboot", source }),
        };
        write_file(destination, Path::new("uboot"), &uboot, overwrite, &mut report)?;
    } else {
        debug!("no boot loader section");
    }

    let mut kernel = None;
    if let Some(section) = container.find_section(KERNEL_SECTIONS) {
        let data = decompress(section.bytes())
            .map_err(|source| ExtractError::Blob { name: "kernel", source })?
            .data;
        if let Some(config) = kernel_config(&data) {
            write_file(destination, Path::new(".config"), &config, overwrite, &mut report)?;
        }
        write_file(destination, Path::new("kernel"), &data, overwrite, &mut report)?;
        kernel = Some(data);
    } else {
        debug!("no kernel section");
    }

    match fdt::locate(container, kernel.as_deref()).and_then(Fdt::parse) {
        Some(tree) => {
            write_file(destination, Path::new(DTS_FILE), tree.to_string().as_bytes(), overwrite, &mut report)?;
        }
        None => debug!("no readable device tree"),
    }
    Ok(report)
}

fn write_entries(
    destination: &Path,
    target: &Path,
    entries: Vec<FsEntry>,
    overwrite: bool,
    report: &mut ExtractionReport,
) -> Result<(), ExtractError> {
    for entry in entries {
        let rel = target.join(checked_relative(&entry.path)?);
        match entry.kind {
            EntryKind::Directory => fs::create_dir_all(destination.join(&rel))?,
            EntryKind::File(data) => write_file(destination, &rel, &data, overwrite, report)?,
        }
    }
    Ok(())
}

fn write_file(
    destination: &Path,
    rel: &Path,
    data: &[u8],
    overwrite: bool,
    report: &mut ExtractionReport,
) -> io::Result<()> {
    let path = destination.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = if overwrite {
        OpenOptions::new().write(true).create(true).truncate(true).open(&path)
    } else {
        OpenOptions::new().write(true).create_new(true).open(&path)
    };
    match file {
        Ok(mut f) => {
            f.write_all(data)?;
            report.written.push(rel.to_path_buf());
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            debug!(path = %rel.display(), "keeping existing file");
            report.skipped.push(rel.to_path_buf());
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Entry paths must stay below the extraction root.
fn checked_relative(path: &Path) -> Result<PathBuf, ExtractError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => {
                return Err(ExtractError::UnsafePath(path.to_path_buf()));
            }
        }
    }
    Ok(out)
}
