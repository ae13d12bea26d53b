//! Best-effort string mining over decompressed kernel and boot-loader images.
//!
//! Payloads are mostly code; anchors are only matched inside printable runs
//! (maximal stretches of printable ASCII).  Each anchor has its own scan
//! function and the first match wins.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use memchr::memmem;
use serde::Serialize;

use crate::fdt;
use crate::uimage::LegacyImageHeader;

pub const KERNEL_BANNER_PREFIX: &str = "Linux version ";
pub const UBOOT_VERSION_PREFIX: &str = "U-Boot ";
const TOOLCHAIN_TRIPLET_MARK: &str = "-linux-";
const HISILICON_LOGO: &[u8] = b"HISILICON LOGO MAGIC";
/// Shortest byte run worth treating as text.
pub const MIN_RUN_LEN: usize = 4;

const ZIMAGE_MAGIC_OFFSET: usize = 0x24;
const ZIMAGE_MAGIC: u32 = 0x016F_2818;
const ARM64_IMAGE_MAGIC_OFFSET: usize = 0x38;
const ARM64_IMAGE_MAGIC: &[u8; 4] = b"ARM\x64";

// ── Printable runs ───────────────────────────────────────────────────────────

/// A printable run `data[start..end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRun<'a> {
    pub start: usize,
    pub end:   usize,
    pub text:  &'a str,
}

pub struct TextRuns<'a> {
    data: &'a [u8],
    pos:  usize,
}

impl<'a> Iterator for TextRuns<'a> {
    type Item = TextRun<'a>;

    fn next(&mut self) -> Option<TextRun<'a>> {
        while self.pos < self.data.len() {
            let rest = &self.data[self.pos..];
            let Some(skip) = rest.iter().position(|&b| is_printable(b)) else {
                self.pos = self.data.len();
                break;
            };
            let start = self.pos + skip;
            let len = self.data[start..].iter().take_while(|&&b| is_printable(b)).count();
            let end = start + len;
            self.pos = end;
            if len < MIN_RUN_LEN {
                continue;
            }
            // Printable bytes are ASCII, so this never fails.
            if let Ok(text) = std::str::from_utf8(&self.data[start..end]) {
                return Some(TextRun { start, end, text });
            }
        }
        None
    }
}

pub fn printable_runs(data: &[u8]) -> TextRuns<'_> {
    TextRuns { data, pos: 0 }
}

fn is_printable(b: u8) -> bool {
    (0x20..=0x7e).contains(&b) || b == b'\t'
}

// ── Architecture ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Architecture {
    #[serde(rename = "ARM")]
    Arm,
    #[serde(rename = "MIPS")]
    Mips,
    #[serde(rename = "AArch64")]
    Arm64,
}

impl Architecture {
    pub fn name(self) -> &'static str {
        match self {
            Architecture::Arm   => "ARM",
            Architecture::Mips  => "MIPS",
            Architecture::Arm64 => "AArch64",
        }
    }

    /// `ih_arch` of a legacy image header.
    pub fn from_uimage(code: u8) -> Option<Self> {
        match code {
            2  => Some(Architecture::Arm),
            5  => Some(Architecture::Mips),
            22 => Some(Architecture::Arm64),
            _  => None,
        }
    }

    pub fn from_elf_machine(machine: u16) -> Option<Self> {
        match machine {
            8   => Some(Architecture::Mips),
            40  => Some(Architecture::Arm),
            183 => Some(Architecture::Arm64),
            _   => None,
        }
    }

    /// Architecture from signature bytes at fixed offsets: uImage header,
    /// ELF header, ARM zImage or arm64 Image header.
    pub fn detect(data: &[u8]) -> Option<Self> {
        if let Some(header) = LegacyImageHeader::parse(data) {
            return Self::from_uimage(header.arch);
        }
        if data.starts_with(b"\x7fELF") && data.len() >= 20 {
            let machine = match data[5] {
                2 => BigEndian::read_u16(&data[18..20]),
                _ => LittleEndian::read_u16(&data[18..20]),
            };
            return Self::from_elf_machine(machine);
        }
        if data
            .get(ZIMAGE_MAGIC_OFFSET..ZIMAGE_MAGIC_OFFSET + 4)
            .is_some_and(|m| LittleEndian::read_u32(m) == ZIMAGE_MAGIC)
        {
            return Some(Architecture::Arm);
        }
        if data.get(ARM64_IMAGE_MAGIC_OFFSET..ARM64_IMAGE_MAGIC_OFFSET + 4) == Some(ARM64_IMAGE_MAGIC.as_slice()) {
            return Some(Architecture::Arm64);
        }
        None
    }
}

// ── Metadata records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelMetadata {
    pub architecture:    Option<Architecture>,
    pub os:              Option<String>,
    pub image_name:      Option<String>,
    pub banner:          Option<String>,
    pub has_device_tree: bool,
}

impl KernelMetadata {
    /// Fill the fields a legacy image header knows about.
    pub fn with_image_header(mut self, header: &LegacyImageHeader) -> Self {
        self.os = Some(header.os_name().to_string());
        self.image_name = Some(header.name.clone());
        if let Some(arch) = Architecture::from_uimage(header.arch) {
            self.architecture = Some(arch);
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootloaderMetadata {
    pub version:  Option<String>,
    pub compiler: Option<String>,
    pub linker:   Option<String>,
}

pub fn scan_kernel(payload: &[u8]) -> KernelMetadata {
    KernelMetadata {
        architecture:    Architecture::detect(payload),
        os:              None,
        image_name:      None,
        banner:          find_kernel_banner(payload),
        has_device_tree: fdt::find(payload).is_some(),
    }
}

pub fn scan_bootloader(payload: &[u8]) -> BootloaderMetadata {
    let (compiler, linker) = find_toolchain(payload);
    BootloaderMetadata {
        version: find_uboot_version(payload),
        compiler,
        linker,
    }
}

// ── Anchors ──────────────────────────────────────────────────────────────────

/// `Linux version 4.9.37 (user@host) (gcc version ...) #1 SMP ...`
pub fn find_kernel_banner(data: &[u8]) -> Option<String> {
    printable_runs(data)
        .find(|run| {
            run.text.starts_with(KERNEL_BANNER_PREFIX) && run.text.contains('@') && run.text.contains('(')
        })
        .map(|run| run.text.trim_end().to_string())
}

/// `U-Boot 2016.11 (Jan 01 2020 - 12:00:00 +0800)`
pub fn find_uboot_version(data: &[u8]) -> Option<String> {
    printable_runs(data).find_map(|run| {
        run.text.match_indices(UBOOT_VERSION_PREFIX).find_map(|(at, _)| {
            let tail = &run.text[at..];
            if !is_year_month(&tail[UBOOT_VERSION_PREFIX.len()..]) {
                return None;
            }
            // The build stamp in parentheses is what sets a version apart
            // from log text such as "U-Boot 2016.11 loading kernel".
            let open = tail.find(" (")?;
            let close = tail[open..].find(')')?;
            Some(tail[..open + close + 1].to_string())
        })
    })
}

fn is_year_month(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 7
        && b[..4].iter().all(u8::is_ascii_digit)
        && b[4] == b'.'
        && b[5..7].iter().all(u8::is_ascii_digit)
}

/// Compiler and linker identification lines, which the build leaves next to
/// each other: `arm-linux-gcc (GCC) 7.3.0\n\0\0GNU ld (GNU Binutils) 2.30\n`.
/// The first compiler line followed by a linker wins; a compiler line on its
/// own is only reported when no such pair exists.
pub fn find_toolchain(data: &[u8]) -> (Option<String>, Option<String>) {
    let runs: Vec<TextRun<'_>> = printable_runs(data).collect();
    let mut lone = None;
    for (i, run) in runs.iter().enumerate() {
        if !is_compiler_line(run.text) || (run.start > 0 && data[run.start - 1] != 0) {
            continue;
        }
        let linker = runs.get(i + 1).filter(|next| {
            let gap = &data[run.end..next.start];
            gap.first() == Some(&b'\n') && gap[1..].iter().all(|&b| b == 0 || b == b'\n')
        });
        match linker {
            Some(next) => return (Some(run.text.to_string()), Some(next.text.to_string())),
            None => lone = lone.or(Some(run.text)),
        }
    }
    (lone.map(str::to_string), None)
}

fn is_compiler_line(text: &str) -> bool {
    let Some(mark) = text.find(TOOLCHAIN_TRIPLET_MARK) else { return false };
    let after = &text[mark..];
    let Some(open) = after.find(" (") else { return false };
    let Some(close) = after[open..].find(") ") else { return false };
    after[open + close + 2..].starts_with(|c: char| c.is_ascii_digit())
}

/// SoC vendor guessed from the raw boot-loader section.
pub fn bootloader_vendor(section: &[u8]) -> Option<&'static str> {
    if section.len() >= 6 && section.starts_with(b"GM") && section[2..6].iter().all(u8::is_ascii_digit) {
        return Some("Grain Media");
    }
    memmem::find(section, HISILICON_LOGO).map(|_| "HiSilicon")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_skip_short_and_binary_stretches() {
        let data = b"\x00\x01ab\x00hello world\xff\xfeok\x00";
        let runs: Vec<_> = printable_runs(data).collect();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].text, "hello world");
        assert_eq!(&data[runs[0].start..runs[0].end], b"hello world");
    }

    #[test]
    fn banner_is_the_whole_line() {
        let line = "Linux version 4.9.37 (builder@host) (gcc version 6.3.0 (HC&C) ) #1 SMP PREEMPT";
        let mut data = vec![0x12, 0x00];
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\n\x00\x7f\x45");
        assert_eq!(find_kernel_banner(&data).as_deref(), Some(line));
    }

    #[test]
    fn banner_prefix_inside_a_sentence_is_ignored() {
        let data = b"\x00see Linux version 5 (a@b) here\n\x00";
        assert_eq!(find_kernel_banner(data), None);
    }

    #[test]
    fn uboot_version_stops_at_closing_paren() {
        let data = b"\x00\nU-Boot 2016.11-g1234 (Mar 21 2019 - 10:00:00 +0800) trailing\n\x00";
        assert_eq!(
            find_uboot_version(data).as_deref(),
            Some("U-Boot 2016.11-g1234 (Mar 21 2019 - 10:00:00 +0800)")
        );
    }

    #[test]
    fn uboot_without_year_is_not_a_version() {
        assert_eq!(find_uboot_version(b"\x00U-Boot SPL loader\x00"), None);
    }

    #[test]
    fn uboot_version_needs_build_stamp() {
        assert_eq!(find_uboot_version(b"\x00U-Boot 2016.11 loading kernel from flash\x00"), None);
        assert_eq!(find_uboot_version(b"\x00U-Boot 2016.11 (unterminated\x00"), None);

        let data = b"\x00U-Boot 2016.11 loading kernel from flash\x00\x00\
                     U-Boot 2016.11 (Apr 02 2020 - 09:15:00 +0800)\n\x00";
        assert_eq!(
            find_uboot_version(data).as_deref(),
            Some("U-Boot 2016.11 (Apr 02 2020 - 09:15:00 +0800)")
        );
    }

    #[test]
    fn toolchain_pair() {
        let data = b"\x00\x00arm-linux-gnueabi-gcc (Linaro GCC 7.3) 7.3.1 20180425\n\x00\x00\x00GNU ld (Linaro_Binutils-2018.05) 2.28.2.20170706\n\x00";
        let (compiler, linker) = find_toolchain(data);
        assert_eq!(compiler.as_deref(), Some("arm-linux-gnueabi-gcc (Linaro GCC 7.3) 7.3.1 20180425"));
        assert_eq!(linker.as_deref(), Some("GNU ld (Linaro_Binutils-2018.05) 2.28.2.20170706"));
    }

    #[test]
    fn compiler_without_adjacent_linker() {
        let data = b"\x00mipsel-linux-gcc (GCC) 4.9.4\xaa\xbbsomething else\x00";
        let (compiler, linker) = find_toolchain(data);
        assert_eq!(compiler.as_deref(), Some("mipsel-linux-gcc (GCC) 4.9.4"));
        assert_eq!(linker, None);
    }

    #[test]
    fn later_compiler_with_linker_is_preferred() {
        let data = b"\x00arm-linux-gcc (GCC) 4.9.4\xaa\xbbpadding bytes\x00\
                     \x00arm-hisiv500-linux-gcc (Hisilicon_v500) 4.9.4\n\x00\x00GNU ld (GNU Binutils) 2.24\n\x00";
        let (compiler, linker) = find_toolchain(data);
        assert_eq!(compiler.as_deref(), Some("arm-hisiv500-linux-gcc (Hisilicon_v500) 4.9.4"));
        assert_eq!(linker.as_deref(), Some("GNU ld (GNU Binutils) 2.24"));
    }

    #[test]
    fn architecture_from_headers() {
        let mut zimage = vec![0u8; 0x40];
        zimage[0x24..0x28].copy_from_slice(&ZIMAGE_MAGIC.to_le_bytes());
        assert_eq!(Architecture::detect(&zimage), Some(Architecture::Arm));

        let mut image = vec![0u8; 0x40];
        image[0x38..0x3c].copy_from_slice(b"ARM\x64");
        assert_eq!(Architecture::detect(&image), Some(Architecture::Arm64));

        let mut elf = vec![0u8; 0x40];
        elf[..4].copy_from_slice(b"\x7fELF");
        elf[5] = 2;
        elf[18..20].copy_from_slice(&8u16.to_be_bytes());
        assert_eq!(Architecture::detect(&elf), Some(Architecture::Mips));

        assert_eq!(Architecture::detect(&[0u8; 0x40]), None);
    }

    #[test]
    fn vendor_from_bootloader_bytes() {
        assert_eq!(bootloader_vendor(b"GM8136 loader"), Some("Grain Media"));
        assert_eq!(bootloader_vendor(b"\x00\x00HISILICON LOGO MAGIC\x00"), Some("HiSilicon"));
        assert_eq!(bootloader_vendor(b"GMabcd"), None);
    }
}
