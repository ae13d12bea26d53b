use byteorder::{BigEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use crc32fast::Hasher;
use memchr::memmem;
use std::io::{self, Read};

use crate::container::until_nul;

pub const UIMAGE_MAGIC: u32 = 0x2705_1956;
pub const UIMAGE_MAGIC_BYTES: [u8; 4] = UIMAGE_MAGIC.to_be_bytes();
pub const UIMAGE_HEADER_SIZE: usize = 64;

pub const IH_OS_LINUX:    u8 = 5;
pub const IH_OS_FIRMWARE: u8 = 17;
pub const IH_TYPE_KERNEL: u8 = 2;

/// `ih_comp` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Lzma,
    Lzo,
    Lz4,
    Zstd,
    Other(u8),
}

impl From<u8> for Compression {
    fn from(v: u8) -> Self {
        match v {
            0 => Compression::None,
            1 => Compression::Gzip,
            2 => Compression::Bzip2,
            3 => Compression::Lzma,
            4 => Compression::Lzo,
            5 => Compression::Lz4,
            6 => Compression::Zstd,
            other => Compression::Other(other),
        }
    }
}

/// U-Boot legacy image header (big-endian, 64 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyImageHeader {
    pub magic:      u32,
    pub hcrc:       u32,
    pub time:       u32,
    pub size:       u32,
    pub load:       u32,
    pub ep:         u32,
    pub dcrc:       u32,
    pub os:         u8,
    pub arch:       u8,
    pub image_type: u8,
    pub comp:       u8,
    pub name:       String,
}

impl LegacyImageHeader {
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let magic = reader.read_u32::<BigEndian>()?;
        let hcrc = reader.read_u32::<BigEndian>()?;
        let time = reader.read_u32::<BigEndian>()?;
        let size = reader.read_u32::<BigEndian>()?;
        let load = reader.read_u32::<BigEndian>()?;
        let ep = reader.read_u32::<BigEndian>()?;
        let dcrc = reader.read_u32::<BigEndian>()?;
        let os = reader.read_u8()?;
        let arch = reader.read_u8()?;
        let image_type = reader.read_u8()?;
        let comp = reader.read_u8()?;
        let mut name = [0u8; 32];
        reader.read_exact(&mut name)?;
        Ok(Self {
            magic, hcrc, time, size, load, ep, dcrc, os, arch, image_type, comp,
            name: String::from_utf8_lossy(until_nul(&name)).into_owned(),
        })
    }

    /// Header at the start of `data`, if the magic matches.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < UIMAGE_HEADER_SIZE || !data.starts_with(&UIMAGE_MAGIC_BYTES) {
            return None;
        }
        Self::read(&data[..UIMAGE_HEADER_SIZE]).ok()
    }

    pub fn compression(&self) -> Compression {
        Compression::from(self.comp)
    }

    pub fn os_name(&self) -> &'static str {
        if self.os == IH_OS_LINUX { "Linux" } else { "Unknown" }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.time), 0)
    }

    /// Payload range declared by the header, clamped to `data_len`.
    pub fn payload_range(&self, data_len: usize) -> std::ops::Range<usize> {
        let end = UIMAGE_HEADER_SIZE.saturating_add(self.size as usize).min(data_len);
        UIMAGE_HEADER_SIZE.min(end)..end
    }
}

/// True when the 64 header bytes carry a valid `ih_hcrc`.
pub fn header_crc_matches(raw: &[u8]) -> bool {
    if raw.len() < UIMAGE_HEADER_SIZE {
        return false;
    }
    let stored = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let mut hasher = Hasher::new();
    hasher.update(&raw[..4]);
    hasher.update(&[0u8; 4]);
    hasher.update(&raw[8..UIMAGE_HEADER_SIZE]);
    hasher.finalize() == stored
}

/// First CRC-valid header anywhere in `data` accepted by `want`, with its offset.
pub fn find_header<F>(data: &[u8], want: F) -> Option<(usize, LegacyImageHeader)>
where
    F: Fn(&LegacyImageHeader) -> bool,
{
    memmem::find_iter(data, &UIMAGE_MAGIC_BYTES).find_map(|pos| {
        let raw = data.get(pos..pos + UIMAGE_HEADER_SIZE)?;
        if !header_crc_matches(raw) {
            return None;
        }
        let header = LegacyImageHeader::read(raw).ok()?;
        want(&header).then_some((pos, header))
    })
}
