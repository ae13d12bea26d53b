//! Merge everything known about one container into a [`FirmwareReport`].

use serde::Serialize;
use std::path::Path;
use tracing::{debug, warn};

use crate::board::{find_version_prefix, parse_board_info, version_build_date, BoardInfo, FIRMWARE_VERSION_PREFIX};
use crate::codec::{decompress, decompress_bootloader};
use crate::container::{Container, BOARD_SECTIONS, KERNEL_SECTIONS, UBOOT_SECTIONS};
use crate::error::{AnalyzeError, DecompressError, ExtractError};
use crate::fdt;
use crate::filesystem::{classify, Decoders, EntryKind, FilesystemEntry, FilesystemKind, FsEntry};
use crate::scanner::{bootloader_vendor, scan_bootloader, scan_kernel, Architecture, KernelMetadata};
use crate::uimage::LegacyImageHeader;

const APP_DIR: &str = "mnt/app";
const BOARD_FILE: &str = "dvr.xml";
const VERSION_FILE: &str = "version_file";
const STARTUP_SCRIPTS: &[&str] = &["dvr", "router"];

/// Where a container came from.
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    /// Path or URL of the source.
    pub locator: String,
    /// Name of the container inside an outer archive.
    pub pak:     Option<String>,
    /// Precomputed SHA-256 of the container; computed when absent.
    pub digest:  Option<String>,
}

impl AnalysisContext {
    pub fn new(locator: impl Into<String>) -> Self {
        Self { locator: locator.into(), ..Self::default() }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FirmwareReport {
    pub file:   String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pak:    Option<String>,
    pub sha256: String,
    #[serde(flatten)]
    pub board_info: BoardInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_build_date: Option<String>,
    pub os:                Option<String>,
    pub architecture:      Option<Architecture>,
    pub kernel_image_name: Option<String>,
    pub kernel_image_time: Option<String>,
    pub linux_banner:      Option<String>,
    pub device_tree:       bool,
    pub uboot_version:     Option<String>,
    pub uboot_compiler:    Option<String>,
    pub uboot_linker:      Option<String>,
    pub board:             Option<String>,
    pub board_vendor:      Option<String>,
    pub filesystems:       Vec<FilesystemEntry>,
    /// Recoverable problems met while building the report.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues:            Vec<String>,
}

/// Files of interest pulled from the application file system.
#[derive(Debug, Default)]
struct AppFiles {
    board:   Option<Vec<u8>>,
    version: Option<Vec<u8>>,
    scripts: Vec<Vec<u8>>,
}

pub fn analyze(
    container: &Container,
    context: &AnalysisContext,
    decoders: Option<&Decoders>,
) -> Result<FirmwareReport, AnalyzeError> {
    let mut report = FirmwareReport {
        file:   context.locator.clone(),
        pak:    context.pak.clone(),
        sha256: context.digest.clone().unwrap_or_else(|| container.sha256_hex()),
        filesystems: container
            .filesystem_table()
            .iter()
            .map(|s| FilesystemEntry { name: s.name().to_string(), kind: classify(s.bytes()) })
            .collect(),
        ..FirmwareReport::default()
    };

    board_facts(container, decoders, &mut report)?;

    let mut kernel_payload = None;
    match container.find_section(KERNEL_SECTIONS) {
        Some(section) => {
            let header = LegacyImageHeader::parse(section.bytes());
            match decompress(section.bytes()) {
                Ok(payload) => {
                    let meta = scan_kernel(&payload.data);
                    apply_kernel(&mut report, meta, header.as_ref());
                    kernel_payload = Some(payload.data);
                }
                Err(e) => {
                    warn!(error = %e, "kernel not decoded");
                    report.issues.push(format!("kernel: {e}"));
                    let meta = KernelMetadata {
                        architecture: Architecture::detect(section.bytes()),
                        ..KernelMetadata::default()
                    };
                    apply_kernel(&mut report, meta, header.as_ref());
                }
            }
        }
        None => report.issues.push("kernel: section not found".to_string()),
    }

    let uboot = container.find_section(UBOOT_SECTIONS);
    match uboot {
        Some(section) => {
            let payload = match decompress_bootloader(section.bytes()) {
                Ok(payload) => Some(payload.data),
                Err(DecompressError::UnknownEnvelope) => Some(section.bytes().to_vec()),
                Err(e) => {
                    warn!(error = %e, "boot loader not decoded");
                    report.issues.push(format!("uboot: {e}"));
                    None
                }
            };
            if let Some(payload) = payload {
                let meta = scan_bootloader(&payload);
                report.uboot_version = meta.version;
                report.uboot_compiler = meta.compiler;
                report.uboot_linker = meta.linker;
            }
        }
        None => report.issues.push("uboot: section not found".to_string()),
    }

    let tree = fdt::locate(container, kernel_payload.as_deref()).and_then(fdt::root_properties);
    report.device_tree = report.device_tree || tree.is_some();
    if let Some(tree) = tree {
        report.board = tree.model.clone();
        report.board_vendor = tree.vendor();
    }
    if report.board_vendor.is_none() {
        report.board_vendor = uboot.and_then(|s| bootloader_vendor(s.bytes())).map(str::to_string);
    }
    Ok(report)
}

fn apply_kernel(report: &mut FirmwareReport, mut meta: KernelMetadata, header: Option<&LegacyImageHeader>) {
    if let Some(header) = header {
        meta = meta.with_image_header(header);
        report.kernel_image_time = header.timestamp().map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string());
    }
    report.os = meta.os;
    report.architecture = meta.architecture;
    report.kernel_image_name = meta.image_name;
    report.linux_banner = meta.banner;
    report.device_tree = meta.has_device_tree;
}

/// Board document, version file and start-up scripts.
fn board_facts(
    container: &Container,
    decoders: Option<&Decoders>,
    report: &mut FirmwareReport,
) -> Result<(), AnalyzeError> {
    if let Some(section) = container.find_section(BOARD_SECTIONS) {
        debug!(section = section.name(), "board document from section");
        report.board_info = parse_board_info(section.bytes())?;
        return Ok(());
    }

    let files = match app_files(container, decoders) {
        Ok(files) => files,
        Err(e) => {
            warn!(error = %e, "application file system not read");
            report.issues.push(format!("board: {e}"));
            return Ok(());
        }
    };
    match files.board {
        Some(document) => report.board_info = parse_board_info(&document)?,
        None => report.issues.push(format!("board: {BOARD_FILE} not found")),
    }
    if let Some(version) = files.version {
        let version = String::from_utf8_lossy(&version).trim().to_string();
        report.version_build_date = version_build_date(&version).map(|d| d.format("%Y-%m-%d").to_string());
        report.version_file = Some(version);
    }
    if report.board_info.version_prefix().is_none() {
        if let Some(prefix) = files.scripts.iter().find_map(|s| find_version_prefix(s)) {
            report.board_info.insert(FIRMWARE_VERSION_PREFIX, prefix);
        }
    }
    Ok(())
}

/// Decode the last file system section and pick out the files the report
/// reads, either at the root or under the application mount point.
fn app_files(container: &Container, decoders: Option<&Decoders>) -> Result<AppFiles, ExtractError> {
    let section = container
        .filesystem_sections()
        .pop()
        .ok_or(ExtractError::NoFilesystemSection)?;
    let kind = classify(section.bytes());
    if kind == FilesystemKind::Unknown {
        return Err(ExtractError::UnsupportedFilesystem { section: section.name().to_string() });
    }
    let decoder = decoders
        .and_then(|d| d.get(kind))
        .ok_or_else(|| ExtractError::DecoderUnavailable { section: section.name().to_string(), kind })?;
    let entries = decoder.decode(section.bytes())?;
    debug!(section = section.name(), %kind, entries = entries.len(), "application file system decoded");

    let mut files = AppFiles::default();
    for entry in entries {
        let FsEntry { path, kind: EntryKind::File(data) } = entry else { continue };
        let path = path.strip_prefix("/").unwrap_or(path.as_path());
        let path = path.strip_prefix(APP_DIR).unwrap_or(path);
        if path == Path::new(BOARD_FILE) {
            files.board = Some(data);
        } else if path == Path::new(VERSION_FILE) {
            files.version = Some(data);
        } else if STARTUP_SCRIPTS.iter().any(|s| path == Path::new(s)) {
            files.scripts.push(data);
        }
    }
    Ok(files)
}
