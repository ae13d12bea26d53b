//! Codec registry for compressed firmware blobs.
//!
//! Firmware images never declare their compression reliably, so every codec
//! is identified by the magic bytes its stream starts with.  [`CodecId::sniff`]
//! checks a buffer start, [`find_stream`] looks for the earliest stream after
//! a given offset.  Decoding goes through the [`Codec`] trait and the
//! [`get_codec`] factory.

pub mod envelope;

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::GzDecoder;
use memchr::memmem;
use std::io::{Cursor, Read};
use tracing::debug;
use xz2::stream::{Action, Status, Stream};

use crate::error::DecompressError;

pub use envelope::{decompress, decompress_bootloader, kernel_config, DecompressedPayload};

// ── Stream magics ────────────────────────────────────────────────────────────

pub const GZIP_MAGIC:       [u8; 3] = [0x1F, 0x8B, 0x08];
pub const XZ_MAGIC:         [u8; 7] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 0x00];
pub const LZ4_LEGACY_MAGIC: [u8; 4] = [0x02, 0x21, 0x4C, 0x18];
pub const ZSTD_MAGIC:       [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
/// lzma-alone streams of unknown size: 5 property bytes, then all-ones size.
const LZMA_UNKNOWN_SIZE:    [u8; 8] = [0xFF; 8];
const LZMA_HEADER_LEN:      usize   = 13;
/// lc/lp/pb packed as `(pb * 5 + lp) * 9 + lc` stays below this.
const LZMA_MAX_PROPS:       u8      = 225;
const LZMA_MIN_DICT:        u32     = 4096;

/// Legacy LZ4 frames are cut into blocks of at most 8 MiB.
const LZ4_LEGACY_BLOCK_SIZE: usize = 8 << 20;

// ── CodecId ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    /// Payload stored verbatim.
    None,
    Gzip,
    Lzma,
    Xz,
    Lz4Legacy,
    Zstd,
}

impl CodecId {
    /// Human-readable name (diagnostics only).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None      => "none",
            CodecId::Gzip      => "gzip",
            CodecId::Lzma      => "lzma",
            CodecId::Xz        => "xz",
            CodecId::Lz4Legacy => "lz4",
            CodecId::Zstd      => "zstd",
        }
    }

    /// Codec whose stream starts at `data[0]`, if any.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if is_gzip(data) {
            Some(CodecId::Gzip)
        } else if is_xz(data) {
            Some(CodecId::Xz)
        } else if data.starts_with(&LZ4_LEGACY_MAGIC) {
            Some(CodecId::Lz4Legacy)
        } else if data.starts_with(&ZSTD_MAGIC) {
            Some(CodecId::Zstd)
        } else if is_lzma(data) {
            Some(CodecId::Lzma)
        } else {
            None
        }
    }
}

fn is_gzip(data: &[u8]) -> bool {
    // Reserved FLG bits must be clear.
    data.starts_with(&GZIP_MAGIC) && data.get(3).is_some_and(|flg| flg & 0xE0 == 0)
}

fn is_xz(data: &[u8]) -> bool {
    // Rejects the "7zXZ" literals xz itself leaves in string tables.
    data.starts_with(&XZ_MAGIC) && data.get(8..10) != Some(b"XZ".as_slice())
}

fn is_lzma(data: &[u8]) -> bool {
    if data.len() < LZMA_HEADER_LEN || data[0] >= LZMA_MAX_PROPS || data[5..13] != LZMA_UNKNOWN_SIZE {
        return false;
    }
    u32::from_le_bytes([data[1], data[2], data[3], data[4]]) >= LZMA_MIN_DICT
}

/// Earliest recognised stream at or after `from`.
pub fn find_stream(data: &[u8], from: usize) -> Option<(usize, CodecId)> {
    let hay = data.get(from..)?;
    let mut best: Option<(usize, CodecId)> = None;
    let mut consider = |pos: usize, codec: CodecId| {
        if best.map_or(true, |(b, _)| pos < b) {
            best = Some((pos, codec));
        }
    };

    for (magic, codec) in [
        (&GZIP_MAGIC[..], CodecId::Gzip),
        (&XZ_MAGIC[..], CodecId::Xz),
        (&LZ4_LEGACY_MAGIC[..], CodecId::Lz4Legacy),
        (&ZSTD_MAGIC[..], CodecId::Zstd),
    ] {
        if let Some(pos) = memmem::find_iter(hay, magic).find(|&p| CodecId::sniff(&hay[p..]) == Some(codec)) {
            consider(pos, codec);
        }
    }
    if let Some(pos) = memmem::find_iter(hay, &LZMA_UNKNOWN_SIZE)
        .filter_map(|p| p.checked_sub(5))
        .find(|&p| is_lzma(&hay[p..]))
    {
        consider(pos, CodecId::Lzma);
    }
    best.map(|(pos, codec)| (from + pos, codec))
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, DecompressError>;
}

fn failure(id: CodecId, reason: impl ToString) -> DecompressError {
    DecompressError::codec(id.name(), reason)
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId { CodecId::None }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, DecompressError> { Ok(data.to_vec()) }
}

/// Single member only; trailing bytes are ignored.
pub struct GzipCodec;
impl Codec for GzipCodec {
    fn codec_id(&self) -> CodecId { CodecId::Gzip }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, DecompressError> {
        let mut out = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| failure(self.codec_id(), e))?;
        Ok(out)
    }
}

/// Memory ceiling for liblzma decoders; firmware dictionaries stay far below.
const LZMA_MEMLIMIT: u64 = 256 << 20;

/// Run one liblzma stream to its end marker.  Bytes after the stream (size
/// trailers, padding) are left unread.
fn drain_lzma(id: CodecId, data: &[u8], mut stream: Stream) -> Result<Vec<u8>, DecompressError> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(4).max(4096));
    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity());
        }
        let (in_before, out_before) = (stream.total_in(), stream.total_out());
        let input = data.get(in_before as usize..).unwrap_or(&[]);
        let status = stream
            .process_vec(input, &mut out, Action::Run)
            .map_err(|e| failure(id, e))?;
        if matches!(status, Status::StreamEnd) {
            return Ok(out);
        }
        if stream.total_in() == in_before && stream.total_out() == out_before {
            return Err(failure(id, "stream is truncated"));
        }
    }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn codec_id(&self) -> CodecId { CodecId::Lzma }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, DecompressError> {
        let stream = Stream::new_lzma_decoder(LZMA_MEMLIMIT)
            .map_err(|e| failure(self.codec_id(), e))?;
        drain_lzma(self.codec_id(), data, stream)
    }
}

/// Single xz stream, including the branch-call filters kernel builds chain
/// in front of LZMA2.
pub struct XzCodec;
impl Codec for XzCodec {
    fn codec_id(&self) -> CodecId { CodecId::Xz }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, DecompressError> {
        let stream = Stream::new_stream_decoder(LZMA_MEMLIMIT, 0)
            .map_err(|e| failure(self.codec_id(), e))?;
        drain_lzma(self.codec_id(), data, stream)
    }
}

/// Legacy LZ4 frame: magic, then `u32` length-prefixed blocks.  Decoding
/// stops at a length that runs past the buffer (the size trailer appended
/// by kernel builds) or at the first bad block once output exists.
pub struct Lz4LegacyCodec;
impl Codec for Lz4LegacyCodec {
    fn codec_id(&self) -> CodecId { CodecId::Lz4Legacy }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, DecompressError> {
        if !data.starts_with(&LZ4_LEGACY_MAGIC) {
            return Err(failure(self.codec_id(), "missing legacy frame magic"));
        }
        let magic = u32::from_le_bytes(LZ4_LEGACY_MAGIC);
        let body = &data[LZ4_LEGACY_MAGIC.len()..];
        let mut rdr = Cursor::new(body);
        let mut block = vec![0u8; LZ4_LEGACY_BLOCK_SIZE];
        let mut out = Vec::new();

        while let Ok(len) = rdr.read_u32::<LittleEndian>() {
            if len == magic {
                continue;
            }
            let pos = rdr.position() as usize;
            let rest = &body[pos..];
            let len = len as usize;
            if len == 0 || len > rest.len() {
                break;
            }
            match lz4_flex::block::decompress_into(&rest[..len], &mut block) {
                Ok(n) => out.extend_from_slice(&block[..n]),
                Err(e) if !out.is_empty() => {
                    debug!(error = %e, "lz4 stream ended on an undecodable block");
                    break;
                }
                Err(e) => return Err(failure(self.codec_id(), e)),
            }
            rdr.set_position((pos + len) as u64);
        }
        if out.is_empty() {
            return Err(failure(self.codec_id(), "no decodable blocks"));
        }
        Ok(out)
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zstd }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, DecompressError> {
        let mut out = Vec::new();
        zstd::stream::read::Decoder::new(data)
            .map_err(|e| failure(self.codec_id(), e))?
            .single_frame()
            .read_to_end(&mut out)
            .map_err(|e| failure(self.codec_id(), e))?;
        Ok(out)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None      => Box::new(NoneCodec),
        CodecId::Gzip      => Box::new(GzipCodec),
        CodecId::Lzma      => Box::new(LzmaCodec),
        CodecId::Xz        => Box::new(XzCodec),
        CodecId::Lz4Legacy => Box::new(Lz4LegacyCodec),
        CodecId::Zstd      => Box::new(ZstdCodec),
    }
}
