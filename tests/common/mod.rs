#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use fwinspect::filesystem::{FilesystemDecoder, FsEntry};
use std::io::{self, Write};
use xz2::stream::{Check, Filters, LzmaOptions, Stream};
use xz2::write::XzEncoder;

pub const PAK_MAGIC: u32 = 0x3272_5913;

/// Builds synthetic PAK containers: sections are laid out back to back
/// right after the table.
pub struct PakBuilder {
    product_type: u32,
    declared:     Option<u32>,
    slots:        Option<u32>,
    sections:     Vec<(String, String, Vec<u8>)>,
}

impl PakBuilder {
    pub fn new() -> Self {
        Self { product_type: 0x4D53, declared: None, slots: None, sections: Vec::new() }
    }

    pub fn section(mut self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.sections.push((name.to_string(), "v1.0".to_string(), data.into()));
        self
    }

    /// Count written to the header, independent of the real table size.
    pub fn declared_count(mut self, count: u32) -> Self {
        self.declared = Some(count);
        self
    }

    /// Table size; unused slots stay zeroed.
    pub fn slots(mut self, count: u32) -> Self {
        self.slots = Some(count);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let n = self.slots.unwrap_or(self.sections.len() as u32) as usize;
        let header = 16 + n * (64 + 76);
        let mut out = Vec::new();
        out.extend_from_slice(&PAK_MAGIC.to_le_bytes());
        out.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        out.extend_from_slice(&self.product_type.to_le_bytes());
        out.extend_from_slice(&self.declared.unwrap_or(n as u32).to_le_bytes());

        let mut offset = header;
        let mut placed = Vec::new();
        for slot in 0..n {
            match self.sections.get(slot) {
                Some((name, version, data)) => {
                    out.extend_from_slice(&padded(name, 32));
                    out.extend_from_slice(&padded(version, 24));
                    out.extend_from_slice(&(offset as u32).to_le_bytes());
                    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                    placed.push((name.clone(), offset, data.len()));
                    offset += data.len();
                }
                None => out.extend_from_slice(&[0u8; 64]),
            }
        }
        for slot in 0..n {
            match placed.get(slot) {
                Some((name, start, len)) => {
                    out.extend_from_slice(&padded(name, 32));
                    out.extend_from_slice(&padded(&format!("mtd{slot}"), 32));
                    out.extend_from_slice(&0u32.to_le_bytes());
                    out.extend_from_slice(&(*start as u32).to_le_bytes());
                    out.extend_from_slice(&(*len as u32).to_le_bytes());
                }
                None => out.extend_from_slice(&[0u8; 76]),
            }
        }
        assert_eq!(out.len(), header);
        for (_, _, data) in &self.sections {
            out.extend_from_slice(data);
        }
        out
    }
}

fn padded(text: &str, len: usize) -> Vec<u8> {
    let mut buf = text.as_bytes().to_vec();
    buf.resize(len, 0);
    buf
}

// ── Payload helpers ──────────────────────────────────────────────────────────

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

pub fn xz(data: &[u8]) -> Vec<u8> {
    let mut enc = XzEncoder::new(Vec::new(), 6);
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// xz stream with the ARM branch filter in front of LZMA2, as ARM kernel
/// builds produce.
pub fn xz_arm(data: &[u8]) -> Vec<u8> {
    let opts = LzmaOptions::new_preset(6).unwrap();
    let mut filters = Filters::new();
    filters.arm();
    filters.lzma2(&opts);
    let stream = Stream::new_stream_encoder(&filters, Check::Crc32).unwrap();
    let mut enc = XzEncoder::new_stream(Vec::new(), stream);
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// lzma-alone stream with unknown size and an end marker.
pub fn lzma(data: &[u8]) -> Vec<u8> {
    let opts = LzmaOptions::new_preset(6).unwrap();
    let stream = Stream::new_lzma_encoder(&opts).unwrap();
    let mut enc = XzEncoder::new_stream(Vec::new(), stream);
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

pub fn zstd(data: &[u8]) -> Vec<u8> {
    zstd::encode_all(data, 3).unwrap()
}

/// Legacy LZ4 frame cut into `block`-byte blocks, followed by the
/// uncompressed size word kernel builds append.
pub fn lz4_legacy(data: &[u8], block: usize) -> Vec<u8> {
    let mut out = vec![0x02, 0x21, 0x4C, 0x18];
    for chunk in data.chunks(block) {
        let packed = lz4_flex::block::compress(chunk);
        out.extend_from_slice(&(packed.len() as u32).to_le_bytes());
        out.extend_from_slice(&packed);
    }
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out
}

/// Words an ARM build is full of: `bl` instructions the branch filter rewrites.
pub fn arm_code(words: usize) -> Vec<u8> {
    (0..words as u32)
        .flat_map(|i| {
            let target = i.wrapping_mul(0x0001_0203) & 0x00FF_FFFF;
            let word = 0xEB00_0000 | target;
            word.to_le_bytes()
        })
        .collect()
}

/// Legacy uImage: 64-byte big-endian header with a valid header CRC.
pub fn uimage(payload: &[u8], os: u8, arch: u8, image_type: u8, comp: u8, name: &str, time: u32) -> Vec<u8> {
    let mut hdr = Vec::with_capacity(64);
    hdr.extend_from_slice(&0x2705_1956u32.to_be_bytes());
    hdr.extend_from_slice(&0u32.to_be_bytes());
    hdr.extend_from_slice(&time.to_be_bytes());
    hdr.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    hdr.extend_from_slice(&0x8000u32.to_be_bytes());
    hdr.extend_from_slice(&0x8000u32.to_be_bytes());
    hdr.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
    hdr.extend_from_slice(&[os, arch, image_type, comp]);
    hdr.extend_from_slice(&padded(name, 32));
    let crc = crc32fast::hash(&hdr);
    hdr[4..8].copy_from_slice(&crc.to_be_bytes());
    hdr.extend_from_slice(payload);
    hdr
}

/// Minimal version-17 device tree with `model` and `compatible` on the root.
pub fn device_tree(model: &str, compatible: &[&str]) -> Vec<u8> {
    fn prop(structs: &mut Vec<u8>, nameoff: u32, value: &[u8]) {
        structs.extend_from_slice(&3u32.to_be_bytes());
        structs.extend_from_slice(&(value.len() as u32).to_be_bytes());
        structs.extend_from_slice(&nameoff.to_be_bytes());
        structs.extend_from_slice(value);
        while structs.len() % 4 != 0 {
            structs.push(0);
        }
    }

    let strings = b"model\0compatible\0".to_vec();
    let mut structs = Vec::new();
    structs.extend_from_slice(&1u32.to_be_bytes());
    structs.extend_from_slice(&[0u8; 4]);
    let mut model_value = model.as_bytes().to_vec();
    model_value.push(0);
    prop(&mut structs, 0, &model_value);
    let compat_value: Vec<u8> = compatible.iter().flat_map(|c| c.bytes().chain([0])).collect();
    prop(&mut structs, 6, &compat_value);
    structs.extend_from_slice(&2u32.to_be_bytes());
    structs.extend_from_slice(&9u32.to_be_bytes());

    let off_rsvmap = 40u32;
    let off_struct = off_rsvmap + 16;
    let off_strings = off_struct + structs.len() as u32;
    let total = off_strings + strings.len() as u32;
    let mut blob = Vec::new();
    for field in [
        0xD00D_FEEDu32, total, off_struct, off_strings, off_rsvmap,
        17, 16, 0, strings.len() as u32, structs.len() as u32,
    ] {
        blob.extend_from_slice(&field.to_be_bytes());
    }
    blob.extend_from_slice(&[0u8; 16]);
    blob.extend_from_slice(&structs);
    blob.extend_from_slice(&strings);
    blob
}

pub fn board_xml(prefix: Option<&str>) -> String {
    let prefix = prefix.map(|p| format!(" firmware_version_prefix=\"{p}\"")).unwrap_or_default();
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <dvr{prefix} board_type=\"IPC_51516M5M\" board_name=\"IPC_51516M5M\" \
         build_date=\"230113\" display_type_info=\"RLC-810A\" \
         detail_machine_type=\"IPC_51516M5M\" type=\"IPC\">\n\
         <sub_node/>\n</dvr>\n"
    )
}

/// Boot loader image with the strings the scanner looks for.
pub fn uboot_blob() -> Vec<u8> {
    let mut data = b"GM8136\x00\x00".to_vec();
    data.extend_from_slice(&[0x13, 0x37, 0x00, 0x01]);
    data.extend_from_slice(b"\x00U-Boot 2014.10 (Jan 13 2023 - 10:11:12 +0800)\n\x00");
    data.extend_from_slice(b"\x00arm-linux-gcc (GCC) 4.9.4\n\x00\x00GNU ld (GNU Binutils) 2.24\n\x00");
    data
}

pub const LINUX_BANNER: &str =
    "Linux version 4.19.91 (builder@buildhost) (gcc version 8.4.0 (GCC)) #1 SMP PREEMPT Fri Jan 13 10:00:00 CST 2023";

/// Decompressed kernel body: banner, embedded config and a device tree.
pub fn kernel_body(config: &[u8], fdt: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; 64];
    body.extend_from_slice(LINUX_BANNER.as_bytes());
    body.extend_from_slice(b"\n\x00\x00");
    body.extend_from_slice(b"IKCFG_ST");
    body.extend_from_slice(&gzip(config));
    body.extend_from_slice(b"IKCFG_ED");
    body.extend_from_slice(&[0u8; 12]);
    body.extend_from_slice(fdt);
    body
}

pub fn squashfs_image() -> Vec<u8> {
    let mut image = b"hsqs".to_vec();
    image.resize(256, 0);
    image
}

pub fn cramfs_image() -> Vec<u8> {
    let mut image = vec![0x45, 0x3D, 0xCD, 0x28];
    image.resize(256, 0);
    image
}

pub fn ubifs_image() -> Vec<u8> {
    let mut image = vec![0x31, 0x18, 0x10, 0x06];
    image.resize(256, 0);
    image
}

/// Stands in for an external file system codec.
#[derive(Clone)]
pub struct FakeDecoder(pub Vec<FsEntry>);

impl FilesystemDecoder for FakeDecoder {
    fn decode(&self, _image: &[u8]) -> io::Result<Vec<FsEntry>> {
        Ok(self.0.clone())
    }
}

pub struct FailingDecoder;

impl FilesystemDecoder for FailingDecoder {
    fn decode(&self, _image: &[u8]) -> io::Result<Vec<FsEntry>> {
        Err(io::Error::new(io::ErrorKind::InvalidData, "bad superblock"))
    }
}
