//! PAK container header and section table.
//!
//! # Layout
//! All fields little-endian.
//!
//! | Offset        | Size    | Field                          |
//! |---------------|---------|--------------------------------|
//! | 0             | 4       | magic `0x32725913`             |
//! | 4             | 4       | header CRC32 (stored only)     |
//! | 8             | 4       | product type                   |
//! | 12            | 4       | declared section count `n`     |
//! | 16            | n × 64  | section entries                |
//! | 16 + n × 64   | n × 76  | MTD partition entries          |
//!
//! Section data starts right after the table, so the first entry's `start`
//! equals `header_size(n)`.  Vendor revisions disagree about whether the
//! declared count can be trusted; when it cannot, the count is recovered
//! from that first offset and the resulting table must still validate.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::ops::Range;
use tracing::{debug, warn};

use crate::error::ParseError;

pub const MAGIC: u32 = 0x3272_5913;
pub const FIXED_HEADER_SIZE: usize = 16;
pub const SECTION_ENTRY_SIZE: usize = 64;
pub const MTD_ENTRY_SIZE: usize = 76;
/// Upper bound on a plausible section count.
pub const MAX_SECTIONS: u32 = 32;

const NAME_LEN: usize = 32;
const VERSION_LEN: usize = 24;

pub const UBOOT_SECTIONS: &[&str] = &["uboot", "uboot1", "BOOT"];
pub const KERNEL_SECTIONS: &[&str] = &["kernel", "KERNEL"];
pub const ROOTFS_SECTIONS: &[&str] = &["fs", "rootfs"];
pub const APP_SECTION: &str = "app";
pub const FS_SECTIONS: &[&str] = &["fs", "rootfs", "app"];
pub const FDT_SECTION: &str = "fdt";
pub const BOARD_SECTIONS: &[&str] = &["dvr.xml", "board"];

/// Total header size for a table of `count` sections.
pub fn header_size(count: u32) -> usize {
    FIXED_HEADER_SIZE + count as usize * (SECTION_ENTRY_SIZE + MTD_ENTRY_SIZE)
}

/// Cheap magic check, used to tell bare containers from outer archives.
pub fn is_container(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && LittleEndian::read_u32(&bytes[..4]) == MAGIC
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionEntry {
    pub name:    String,
    pub version: String,
    pub offset:  u64,
    pub size:    u64,
}

impl SectionEntry {
    pub fn range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.size) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MtdPart {
    pub name:  String,
    pub mtd:   String,
    pub flags: u32,
    pub start: u64,
    pub size:  u64,
}

/// Where the section count of a parsed container came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CountSource {
    Declared,
    Inferred,
}

/// A named byte range borrowed from its [`Container`].
#[derive(Debug, Clone, Copy)]
pub struct Section<'a> {
    pub entry: &'a SectionEntry,
    data:      &'a [u8],
}

impl<'a> Section<'a> {
    pub fn name(&self) -> &'a str { &self.entry.name }
    pub fn bytes(&self) -> &'a [u8] { self.data }
    pub fn len(&self) -> usize { self.data.len() }
    pub fn is_empty(&self) -> bool { self.data.is_empty() }
}

/// An inner firmware container: raw bytes plus the validated section table.
/// Read-only after construction.
#[derive(Debug, Clone)]
pub struct Container {
    data:           Vec<u8>,
    product_type:   u32,
    header_crc:     u32,
    declared_count: u32,
    count_source:   CountSource,
    sections:       Vec<SectionEntry>,
    mtd_parts:      Vec<MtdPart>,
}

impl Container {
    pub fn parse(data: impl Into<Vec<u8>>) -> Result<Self, ParseError> {
        let data = data.into();
        if data.len() < FIXED_HEADER_SIZE + SECTION_ENTRY_SIZE {
            return Err(ParseError::CorruptHeader(format!(
                "{} bytes is too short for a section table", data.len()
            )));
        }
        let mut rdr = Cursor::new(&data[..FIXED_HEADER_SIZE]);
        let magic = rdr.read_u32::<LittleEndian>().map_err(corrupt)?;
        if magic != MAGIC {
            return Err(ParseError::CorruptHeader(format!("bad magic {magic:#010x}")));
        }
        let header_crc = rdr.read_u32::<LittleEndian>().map_err(corrupt)?;
        let product_type = rdr.read_u32::<LittleEndian>().map_err(corrupt)?;
        let declared = rdr.read_u32::<LittleEndian>().map_err(corrupt)?;

        if (1..=MAX_SECTIONS).contains(&declared) {
            match read_table(&data, declared) {
                Ok((sections, mtd_parts)) => {
                    debug!(count = declared, "section table parsed with declared count");
                    return Ok(Self {
                        data, product_type, header_crc,
                        declared_count: declared,
                        count_source: CountSource::Declared,
                        sections, mtd_parts,
                    });
                }
                Err(reason) => debug!(count = declared, %reason, "declared section count rejected"),
            }
        }

        let inferred = infer_count(&data);
        if let Some(count) = inferred {
            match read_table(&data, count) {
                Ok((sections, mtd_parts)) => {
                    warn!(declared, inferred = count, "section count inferred from first section offset");
                    return Ok(Self {
                        data, product_type, header_crc,
                        declared_count: declared,
                        count_source: CountSource::Inferred,
                        sections, mtd_parts,
                    });
                }
                Err(reason) => debug!(count, %reason, "inferred section count rejected"),
            }
        }
        Err(ParseError::AmbiguousSectionCount { declared, inferred })
    }

    pub fn size(&self) -> usize { self.data.len() }
    pub fn bytes(&self) -> &[u8] { &self.data }
    pub fn product_type(&self) -> u32 { self.product_type }
    pub fn header_crc(&self) -> u32 { self.header_crc }
    pub fn declared_count(&self) -> u32 { self.declared_count }
    pub fn count_source(&self) -> CountSource { self.count_source }
    pub fn section_count(&self) -> usize { self.sections.len() }
    pub fn entries(&self) -> &[SectionEntry] { &self.sections }
    pub fn mtd_parts(&self) -> &[MtdPart] { &self.mtd_parts }

    pub fn sections(&self) -> impl Iterator<Item = Section<'_>> {
        // Empty entries may carry a stale offset; only sized ranges are validated.
        self.sections.iter().map(move |entry| Section {
            entry,
            data: self.data.get(entry.range()).unwrap_or(&[]),
        })
    }

    pub fn section(&self, name: &str) -> Option<Section<'_>> {
        self.sections().find(|s| s.name() == name)
    }

    /// First non-empty section whose name is one of `candidates`, in table order.
    pub fn find_section(&self, candidates: &[&str]) -> Option<Section<'_>> {
        self.sections().find(|s| !s.is_empty() && candidates.contains(&s.name()))
    }

    /// Non-empty file system sections in table order.
    pub fn filesystem_sections(&self) -> Vec<Section<'_>> {
        self.sections()
            .filter(|s| !s.is_empty() && FS_SECTIONS.contains(&s.name()))
            .collect()
    }

    /// Every file system entry in table order, empty ones included.
    pub fn filesystem_table(&self) -> Vec<Section<'_>> {
        self.sections().filter(|s| FS_SECTIONS.contains(&s.name())).collect()
    }

    pub fn sha256_hex(&self) -> String {
        hex::encode(Sha256::digest(&self.data))
    }
}

fn corrupt(e: std::io::Error) -> ParseError {
    ParseError::CorruptHeader(e.to_string())
}

/// Count implied by the first entry's start offset, if it lands exactly on
/// a table boundary.
fn infer_count(data: &[u8]) -> Option<u32> {
    let at = FIXED_HEADER_SIZE + NAME_LEN + VERSION_LEN;
    let start = LittleEndian::read_u32(&data[at..at + 4]) as usize;
    let body = start.checked_sub(FIXED_HEADER_SIZE)?;
    let stride = SECTION_ENTRY_SIZE + MTD_ENTRY_SIZE;
    if body == 0 || body % stride != 0 {
        return None;
    }
    let count = u32::try_from(body / stride).ok()?;
    (1..=MAX_SECTIONS).contains(&count).then_some(count)
}

/// Read and validate the table for `count` sections.  The error string says
/// which consistency rule failed.
fn read_table(data: &[u8], count: u32) -> Result<(Vec<SectionEntry>, Vec<MtdPart>), String> {
    let end = header_size(count);
    if end > data.len() {
        return Err(format!("table of {end} bytes overruns {} byte buffer", data.len()));
    }
    let total = data.len() as u64;
    let mut rdr = Cursor::new(&data[FIXED_HEADER_SIZE..end]);
    let mut sections = Vec::new();
    let mut seen = HashSet::new();

    for slot in 0..count {
        let name = read_name(&mut rdr, NAME_LEN)?;
        let version = read_text(&mut rdr, VERSION_LEN)?;
        let offset = rdr.read_u32::<LittleEndian>().map_err(|e| e.to_string())? as u64;
        let size = rdr.read_u32::<LittleEndian>().map_err(|e| e.to_string())? as u64;

        if name.is_empty() {
            if offset != 0 || size != 0 {
                return Err(format!("unnamed slot {slot} has data"));
            }
            continue;
        }
        if size > 0 && (offset < end as u64 || offset + size > total) {
            return Err(format!("section '{name}' [{offset}, +{size}) out of bounds"));
        }
        if !seen.insert(name.clone()) {
            return Err(format!("duplicate section name '{name}'"));
        }
        sections.push(SectionEntry { name, version, offset, size });
    }
    if sections.is_empty() {
        return Err("no named sections".to_string());
    }
    // A shorter count still reads as a valid prefix of the real table.
    if let Some(first) = sections.iter().filter(|s| s.size > 0).map(|s| s.offset).min() {
        if first != end as u64 {
            return Err(format!("section data starts at {first}, table ends at {end}"));
        }
    }

    let mut mtd_parts = Vec::new();
    for _ in 0..count {
        let name = read_text(&mut rdr, NAME_LEN)?;
        let mtd = read_text(&mut rdr, NAME_LEN)?;
        let flags = rdr.read_u32::<LittleEndian>().map_err(|e| e.to_string())?;
        let start = rdr.read_u32::<LittleEndian>().map_err(|e| e.to_string())? as u64;
        let size = rdr.read_u32::<LittleEndian>().map_err(|e| e.to_string())? as u64;
        if !name.is_empty() {
            mtd_parts.push(MtdPart { name, mtd, flags, start, size });
        }
    }
    Ok((sections, mtd_parts))
}

/// NUL-padded field that must be printable ASCII.
fn read_name<R: Read>(rdr: &mut R, len: usize) -> Result<String, String> {
    let mut buf = vec![0u8; len];
    rdr.read_exact(&mut buf).map_err(|e| e.to_string())?;
    let text = until_nul(&buf);
    if !text.iter().all(|b| (0x20..=0x7e).contains(b)) {
        return Err("section name is not printable".to_string());
    }
    Ok(String::from_utf8_lossy(text).into_owned())
}

/// NUL-padded free text, decoded lossily.
fn read_text<R: Read>(rdr: &mut R, len: usize) -> Result<String, String> {
    let mut buf = vec![0u8; len];
    rdr.read_exact(&mut buf).map_err(|e| e.to_string())?;
    Ok(String::from_utf8_lossy(until_nul(&buf)).into_owned())
}

pub(crate) fn until_nul(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}
