//! Board description document (`dvr.xml`).
//!
//! The interesting values are attributes of the root element; some firmware
//! revisions nest them as child elements instead.  Missing fields are simply
//! absent.

use chrono::NaiveDate;
use memchr::memmem;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::ParseError;

pub const FIRMWARE_VERSION_PREFIX: &str = "firmware_version_prefix";
pub const BOARD_TYPE:              &str = "board_type";
pub const BOARD_NAME:              &str = "board_name";
pub const BUILD_DATE:              &str = "build_date";
pub const DISPLAY_TYPE_INFO:       &str = "display_type_info";
pub const DETAIL_MACHINE_TYPE:     &str = "detail_machine_type";
pub const DEVICE_TYPE:             &str = "type";
pub const VERSION_FILE:            &str = "version_file";

/// Fields read from the document, in report order.
pub const BOARD_FIELDS: &[&str] = &[
    FIRMWARE_VERSION_PREFIX,
    BOARD_TYPE,
    BOARD_NAME,
    BUILD_DATE,
    DISPLAY_TYPE_INFO,
    DETAIL_MACHINE_TYPE,
    DEVICE_TYPE,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BoardInfo {
    fields: BTreeMap<String, String>,
}

impl BoardInfo {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn fields(&self) -> &BTreeMap<String, String> { &self.fields }
    pub fn len(&self) -> usize { self.fields.len() }
    pub fn is_empty(&self) -> bool { self.fields.is_empty() }

    pub fn model(&self) -> Option<&str> { self.get(DISPLAY_TYPE_INFO) }
    pub fn hardware_id(&self) -> Option<&str> { self.get(DETAIL_MACHINE_TYPE) }
    pub fn device_type(&self) -> Option<&str> { self.get(DEVICE_TYPE) }
    pub fn version_prefix(&self) -> Option<&str> { self.get(FIRMWARE_VERSION_PREFIX) }
    pub fn build_date(&self) -> Option<&str> { self.get(BUILD_DATE) }
    pub fn board_type(&self) -> Option<&str> { self.get(BOARD_TYPE) }
    pub fn board_name(&self) -> Option<&str> { self.get(BOARD_NAME) }
}

pub fn parse_board_info(document: &[u8]) -> Result<BoardInfo, ParseError> {
    let text = std::str::from_utf8(document)
        .map_err(|e| ParseError::MalformedDocument(e.to_string()))?;
    // Sections are padded; the BOM is optional.
    let text = text.trim_start_matches('\u{feff}').trim_end_matches(['\0', ' ', '\n', '\r', '\t']);
    let doc = roxmltree::Document::parse(text)
        .map_err(|e| ParseError::MalformedDocument(e.to_string()))?;
    let root = doc.root_element();

    let mut info = BoardInfo::default();
    for &key in BOARD_FIELDS {
        let value = root.attribute(key).or_else(|| {
            root.children()
                .find(|n| n.is_element() && n.has_tag_name(key))
                .map(|n| n.text().unwrap_or("").trim())
        });
        if let Some(value) = value {
            info.insert(key, value);
        }
    }
    Ok(info)
}

/// `v2.0.0` / `v3.0.0` from an `echo vN.0.0` line in a start-up script.
pub fn find_version_prefix(script: &[u8]) -> Option<String> {
    const NEEDLE: &[u8] = b"echo v";
    memmem::find_iter(script, NEEDLE).find_map(|pos| {
        let version = script.get(pos + NEEDLE.len() - 1..pos + NEEDLE.len() + 5)?;
        let ok = matches!(version[1], b'2' | b'3') && &version[2..] == b".0.0";
        ok.then(|| String::from_utf8_lossy(version).into_owned())
    })
}

/// Build date encoded in a `version_file` value such as `2.0.0.1441_19032101`:
/// `YYMMDD` followed by two build digits.
pub fn version_build_date(version: &str) -> Option<NaiveDate> {
    let token = version.split('_').nth(1)?;
    let stem = token.get(..token.len().checked_sub(2)?)?;
    if stem.len() != 6 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year = 2000 + stem[..2].parse::<i32>().ok()?;
    let month = stem[2..4].parse::<u32>().ok()?;
    let day = stem[4..6].parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}
