//! Envelope detection for boot-loader and kernel sections.
//!
//! Recognised shapes, tried in order:
//! 1. legacy uImage header whose body starts with an lzma/xz stream
//!    (some vendors write "none" in `ih_comp` regardless);
//! 2. legacy uImage header with a supported `ih_comp`;
//! 3. a raw compressed stream at offset 0;
//! 4. a self-extracting kernel: the stream after the decompressor's
//!    `" -- System halted"` message.

use memchr::memmem;
use tracing::{debug, warn};

use super::{find_stream, get_codec, CodecId};
use crate::error::DecompressError;
use crate::uimage::{
    find_header, header_crc_matches, Compression, LegacyImageHeader, IH_OS_FIRMWARE,
    IH_TYPE_KERNEL, UIMAGE_HEADER_SIZE,
};

const HALT_MARKER: &[u8] = b" -- System halted";
const IKCFG_START: &[u8] = b"IKCFG_ST";
const IKCFG_END: &[u8] = b"IKCFG_ED";

#[derive(Debug, Clone)]
pub struct DecompressedPayload {
    pub codec:  CodecId,
    /// uImage header the payload was wrapped in, if any.
    pub header: Option<LegacyImageHeader>,
    pub data:   Vec<u8>,
}

pub fn decompress(bytes: &[u8]) -> Result<DecompressedPayload, DecompressError> {
    if let Some(header) = LegacyImageHeader::parse(bytes) {
        if !header_crc_matches(bytes) {
            warn!(name = %header.name, "uImage header CRC mismatch");
        }
        return decompress_uimage(bytes, header);
    }
    if let Some(codec) = CodecId::sniff(bytes) {
        return decode(codec, bytes, None);
    }
    decompress_self_extracting(bytes, None)
}

/// Boot loaders are sometimes wrapped in a firmware-typed uImage somewhere
/// inside the section.  `UnknownEnvelope` here means "stored uncompressed".
pub fn decompress_bootloader(bytes: &[u8]) -> Result<DecompressedPayload, DecompressError> {
    let wrapped = find_header(bytes, |h| h.os == IH_OS_FIRMWARE && h.image_type == IH_TYPE_KERNEL);
    if let Some((pos, header)) = wrapped {
        debug!(offset = pos, name = %header.name, "embedded boot loader image header");
        let start = pos + UIMAGE_HEADER_SIZE;
        let end = start.saturating_add(header.size as usize).min(bytes.len());
        return match header.compression() {
            Compression::Lzma => decode(CodecId::Lzma, &bytes[start..end], Some(header)),
            other => Err(DecompressError::codec("uimage", format!("unexpected compression {other:?}"))),
        };
    }
    decompress(bytes)
}

/// The embedded kernel `.config` (`CONFIG_IKCONFIG`), decompressed.
pub fn kernel_config(payload: &[u8]) -> Option<Vec<u8>> {
    let start = memmem::find(payload, IKCFG_START)? + IKCFG_START.len();
    let len = memmem::find(&payload[start..], IKCFG_END)?;
    get_codec(CodecId::Gzip).decompress(&payload[start..start + len]).ok()
}

fn decompress_uimage(
    bytes: &[u8],
    header: LegacyImageHeader,
) -> Result<DecompressedPayload, DecompressError> {
    let body = &bytes[UIMAGE_HEADER_SIZE..];
    if let Some(codec @ (CodecId::Lzma | CodecId::Xz)) = CodecId::sniff(body) {
        return decode(codec, body, Some(header));
    }
    let payload = &bytes[header.payload_range(bytes.len())];
    let codec = match header.compression() {
        Compression::None => {
            return match decompress_self_extracting(payload, Some(header.clone())) {
                Err(DecompressError::UnknownEnvelope) => Ok(DecompressedPayload {
                    codec: CodecId::None,
                    header: Some(header),
                    data: payload.to_vec(),
                }),
                other => other,
            };
        }
        Compression::Gzip => CodecId::Gzip,
        Compression::Lzma => CodecId::Lzma,
        Compression::Lz4  => CodecId::Lz4Legacy,
        Compression::Zstd => CodecId::Zstd,
        other => {
            return Err(DecompressError::codec("uimage", format!("unsupported compression {other:?}")));
        }
    };
    decode(codec, payload, Some(header))
}

fn decompress_self_extracting(
    bytes: &[u8],
    header: Option<LegacyImageHeader>,
) -> Result<DecompressedPayload, DecompressError> {
    let halt = memmem::find(bytes, HALT_MARKER).ok_or(DecompressError::UnknownEnvelope)?;
    let (start, codec) = find_stream(bytes, halt).ok_or(DecompressError::UnknownEnvelope)?;
    debug!(offset = start, codec = codec.name(), "self-extracting kernel stream");
    decode(codec, &bytes[start..], header)
}

fn decode(
    codec: CodecId,
    data: &[u8],
    header: Option<LegacyImageHeader>,
) -> Result<DecompressedPayload, DecompressError> {
    let data = get_codec(codec).decompress(data)?;
    debug!(codec = codec.name(), size = data.len(), "blob decompressed");
    Ok(DecompressedPayload { codec, header, data })
}
