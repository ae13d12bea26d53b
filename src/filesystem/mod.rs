//! File system classification and the decoder seam.
//!
//! Classification is by magic number only.  Decoding section bytes into a
//! file list is left to external codecs, registered in [`Decoders`] and
//! picked by [`FilesystemKind`].

use byteorder::{BigEndian, ByteOrder};
use memchr::memmem;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;

pub const CRAMFS_MAGIC:   [u8; 4] = [0x45, 0x3D, 0xCD, 0x28];
pub const SQUASHFS_MAGIC: [u8; 4] = *b"hsqs";
pub const UBIFS_MAGIC:    [u8; 4] = [0x31, 0x18, 0x10, 0x06];
pub const UBI_MAGIC:      [u8; 4] = *b"UBI#";

/// PEB size assumed when a UBI image holds a single erase block header.
const DEFAULT_PEB_SIZE: usize = 128 * 1024;
/// The layout volume occupies the first two PEBs.
const LAYOUT_PEBS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemKind {
    Cramfs,
    Squashfs,
    Ubifs,
    Unknown,
}

impl FilesystemKind {
    pub fn name(self) -> &'static str {
        match self {
            FilesystemKind::Cramfs   => "cramfs",
            FilesystemKind::Squashfs => "squashfs",
            FilesystemKind::Ubifs    => "ubifs",
            FilesystemKind::Unknown  => "unknown",
        }
    }

    fn from_magic(magic: &[u8]) -> Option<Self> {
        match magic.get(..4)? {
            m if m == CRAMFS_MAGIC   => Some(FilesystemKind::Cramfs),
            m if m == SQUASHFS_MAGIC => Some(FilesystemKind::Squashfs),
            m if m == UBIFS_MAGIC    => Some(FilesystemKind::Ubifs),
            _                        => None,
        }
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `{section_name, FilesystemKind}` pair as listed in reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilesystemEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FilesystemKind,
}

/// Total: empty, short and garbage input all yield `Unknown`.
pub fn classify(bytes: &[u8]) -> FilesystemKind {
    if let Some(kind) = FilesystemKind::from_magic(bytes) {
        return kind;
    }
    if bytes.starts_with(&UBI_MAGIC) {
        return classify_ubi_volume(bytes);
    }
    FilesystemKind::Unknown
}

/// Look through a UBI image at the first LEB of the first user volume.
fn classify_ubi_volume(bytes: &[u8]) -> FilesystemKind {
    let peb_size = memmem::find(&bytes[UBI_MAGIC.len()..], &UBI_MAGIC)
        .map(|pos| pos + UBI_MAGIC.len())
        .unwrap_or(DEFAULT_PEB_SIZE);
    let data_offset = bytes.get(20..24).map(BigEndian::read_u32).unwrap_or(0) as usize;
    let at = LAYOUT_PEBS * peb_size + data_offset;
    match bytes.get(at..).and_then(FilesystemKind::from_magic) {
        Some(FilesystemKind::Squashfs) => FilesystemKind::Squashfs,
        _ => FilesystemKind::Ubifs,
    }
}

// ── Decoder seam ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File(Vec<u8>),
}

/// One decoded file system entry; `path` is relative to the image root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
}

impl FsEntry {
    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), kind: EntryKind::Directory }
    }

    pub fn file(path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) -> Self {
        Self { path: path.into(), kind: EntryKind::File(data.into()) }
    }
}

/// Turns a file system image into its entries.  Implementations are
/// supplied by the caller; a UBI-wrapped image is handed over whole.
pub trait FilesystemDecoder: Send + Sync {
    fn decode(&self, image: &[u8]) -> io::Result<Vec<FsEntry>>;
}

/// One optional decoder per known [`FilesystemKind`].
#[derive(Default)]
pub struct Decoders {
    pub cramfs:   Option<Box<dyn FilesystemDecoder>>,
    pub squashfs: Option<Box<dyn FilesystemDecoder>>,
    pub ubifs:    Option<Box<dyn FilesystemDecoder>>,
}

impl Decoders {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, kind: FilesystemKind, decoder: Box<dyn FilesystemDecoder>) -> Self {
        match kind {
            FilesystemKind::Cramfs   => self.cramfs = Some(decoder),
            FilesystemKind::Squashfs => self.squashfs = Some(decoder),
            FilesystemKind::Ubifs    => self.ubifs = Some(decoder),
            FilesystemKind::Unknown  => {}
        }
        self
    }

    pub fn get(&self, kind: FilesystemKind) -> Option<&dyn FilesystemDecoder> {
        match kind {
            FilesystemKind::Cramfs   => self.cramfs.as_deref(),
            FilesystemKind::Squashfs => self.squashfs.as_deref(),
            FilesystemKind::Ubifs    => self.ubifs.as_deref(),
            FilesystemKind::Unknown  => None,
        }
    }
}
