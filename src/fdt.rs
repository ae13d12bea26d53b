//! Flattened device tree blobs.
//!
//! A blob is located by magic and version, walked into a [`Node`] tree and
//! rendered back as device tree source.  All fields big-endian.
//!
//! | Block            | Contents                                          |
//! |------------------|---------------------------------------------------|
//! | header (40)      | [`FdtHeader`]                                     |
//! | memory reserve   | `(address, size)` u64 pairs, ended by `(0, 0)`    |
//! | structure        | `BEGIN_NODE name`, `PROP len nameoff value`, ...  |
//! | strings          | NUL-terminated property names                     |

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use memchr::memmem;
use serde::Serialize;
use std::fmt;
use std::io::{self, Cursor, Read};

use crate::container::{until_nul, Container, FDT_SECTION, KERNEL_SECTIONS};

pub const FDT_MAGIC: [u8; 4] = [0xD0, 0x0D, 0xFE, 0xED];
pub const FDT_HEADER_SIZE: usize = 40;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE:   u32 = 2;
const FDT_PROP:       u32 = 3;
const FDT_NOP:        u32 = 4;
const FDT_END:        u32 = 9;

/// Nesting limit; real trees stay in single digits.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdtHeader {
    pub magic:             u32,
    pub totalsize:         u32,
    pub off_dt_struct:     u32,
    pub off_dt_strings:    u32,
    pub off_mem_rsvmap:    u32,
    pub version:           u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys:   u32,
    pub size_dt_strings:   u32,
    pub size_dt_struct:    u32,
}

impl FdtHeader {
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        Ok(Self {
            magic:             reader.read_u32::<BigEndian>()?,
            totalsize:         reader.read_u32::<BigEndian>()?,
            off_dt_struct:     reader.read_u32::<BigEndian>()?,
            off_dt_strings:    reader.read_u32::<BigEndian>()?,
            off_mem_rsvmap:    reader.read_u32::<BigEndian>()?,
            version:           reader.read_u32::<BigEndian>()?,
            last_comp_version: reader.read_u32::<BigEndian>()?,
            boot_cpuid_phys:   reader.read_u32::<BigEndian>()?,
            size_dt_strings:   reader.read_u32::<BigEndian>()?,
            size_dt_struct:    reader.read_u32::<BigEndian>()?,
        })
    }
}

/// First version-17 device tree blob in `data`, cut to its `totalsize`.
pub fn find(data: &[u8]) -> Option<&[u8]> {
    memmem::find_iter(data, &FDT_MAGIC).find_map(|pos| {
        let header = FdtHeader::read(data.get(pos..pos + FDT_HEADER_SIZE)?).ok()?;
        if header.version != FDT_VERSION || header.last_comp_version != FDT_LAST_COMP_VERSION {
            return None;
        }
        let end = pos.checked_add(header.totalsize as usize)?.min(data.len());
        Some(&data[pos..end])
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTree {
    pub model:      Option<String>,
    pub compatible: Vec<String>,
}

impl DeviceTree {
    /// SoC vendor from the first `compatible` entry, e.g. `"novatek,nvt-na51055"`.
    pub fn vendor(&self) -> Option<String> {
        let prefix = self.compatible.first()?.split(',').next()?;
        Some(match prefix.to_lowercase().as_str() {
            "novatek"   => "Novatek".to_string(),
            "sstar"     => "MStar/SigmaStar".to_string(),
            "hisilicon" => "HiSilicon".to_string(),
            _           => prefix.to_string(),
        })
    }
}

/// Device tree blob to use for a container: the `fdt` section first, then
/// the raw kernel section, then the decompressed kernel.
pub fn locate<'a>(container: &'a Container, kernel: Option<&'a [u8]>) -> Option<&'a [u8]> {
    container
        .section(FDT_SECTION)
        .and_then(|s| find(s.bytes()))
        .or_else(|| container.find_section(KERNEL_SECTIONS).and_then(|s| find(s.bytes())))
        .or_else(|| kernel.and_then(find))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Property {
    pub name:  String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Node {
    /// Unit name, e.g. `uart@f0290000`; empty for the root.
    pub name:       String,
    pub properties: Vec<Property>,
    pub children:   Vec<Node>,
}

impl Node {
    pub fn property(&self, name: &str) -> Option<&[u8]> {
        self.properties.iter().find(|p| p.name == name).map(|p| p.value.as_slice())
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }
}

/// A parsed blob.  `Display` renders it as DTS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fdt {
    pub header:       FdtHeader,
    /// Memory reservations as `(address, size)`.
    pub reservations: Vec<(u64, u64)>,
    pub root:         Node,
}

impl Fdt {
    /// Walk a blob returned by [`find`].  `None` when any block is unreadable
    /// or the structure block is unbalanced.
    pub fn parse(blob: &[u8]) -> Option<Self> {
        let header = FdtHeader::read(blob.get(..FDT_HEADER_SIZE)?).ok()?;
        let reservations = read_reservations(blob.get(header.off_mem_rsvmap as usize..)?)?;
        let structs = blob.get(header.off_dt_struct as usize..)?;
        let strings = blob.get(header.off_dt_strings as usize..)?;
        let root = read_structure(structs, strings)?;
        Some(Self { header, reservations, root })
    }

    /// Root `model` and `compatible`.
    pub fn summary(&self) -> DeviceTree {
        DeviceTree {
            model: self
                .root
                .property("model")
                .map(|v| String::from_utf8_lossy(until_nul(v)).into_owned()),
            compatible: self
                .root
                .property("compatible")
                .map(|v| {
                    v.split(|&b| b == 0)
                        .filter(|s| !s.is_empty())
                        .map(|s| String::from_utf8_lossy(s).into_owned())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// Root node properties of a blob returned by [`find`].
pub fn root_properties(blob: &[u8]) -> Option<DeviceTree> {
    Fdt::parse(blob).map(|tree| tree.summary())
}

fn read_reservations(block: &[u8]) -> Option<Vec<(u64, u64)>> {
    let mut rdr = Cursor::new(block);
    let mut out = Vec::new();
    loop {
        let address = rdr.read_u64::<BigEndian>().ok()?;
        let size = rdr.read_u64::<BigEndian>().ok()?;
        if address == 0 && size == 0 {
            return Some(out);
        }
        out.push((address, size));
    }
}

fn read_structure(structs: &[u8], strings: &[u8]) -> Option<Node> {
    let mut rdr = Cursor::new(structs);
    let mut open: Vec<Node> = Vec::new();
    loop {
        match next_token(&mut rdr)? {
            FDT_BEGIN_NODE => {
                if open.len() >= MAX_DEPTH {
                    return None;
                }
                let name = read_cstr(&mut rdr)?;
                open.push(Node { name: String::from_utf8_lossy(name).into_owned(), ..Node::default() });
            }
            FDT_PROP => {
                let len = rdr.read_u32::<BigEndian>().ok()? as usize;
                let nameoff = rdr.read_u32::<BigEndian>().ok()? as usize;
                let start = rdr.position() as usize;
                let value = structs.get(start..start.checked_add(len)?)?;
                rdr.set_position(align4(start + len) as u64);
                let name = until_nul(strings.get(nameoff..)?);
                open.last_mut()?.properties.push(Property {
                    name:  String::from_utf8_lossy(name).into_owned(),
                    value: value.to_vec(),
                });
            }
            FDT_END_NODE => {
                let node = open.pop()?;
                match open.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Some(node),
                }
            }
            _ => return None,
        }
    }
}

fn next_token(rdr: &mut Cursor<&[u8]>) -> Option<u32> {
    loop {
        match rdr.read_u32::<BigEndian>().ok()? {
            FDT_NOP => continue,
            token => return Some(token),
        }
    }
}

fn read_cstr<'a>(rdr: &mut Cursor<&'a [u8]>) -> Option<&'a [u8]> {
    let start = rdr.position() as usize;
    let buf: &'a [u8] = *rdr.get_ref();
    let rest = buf.get(start..)?;
    let nul = rest.iter().position(|&b| b == 0)?;
    rdr.set_position(align4(start + nul + 1) as u64);
    Some(&rest[..nul])
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

// ── DTS rendering ────────────────────────────────────────────────────────────

impl fmt::Display for Fdt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "/dts-v1/;")?;
        writeln!(f)?;
        for (address, size) in &self.reservations {
            writeln!(f, "/memreserve/ {address:#018x} {size:#018x};")?;
        }
        if !self.reservations.is_empty() {
            writeln!(f)?;
        }
        write_node(f, &self.root, 0)
    }
}

fn write_node(f: &mut fmt::Formatter<'_>, node: &Node, depth: usize) -> fmt::Result {
    let indent = "\t".repeat(depth);
    let name = if depth == 0 { "/" } else { node.name.as_str() };
    writeln!(f, "{indent}{name} {{")?;
    for prop in &node.properties {
        match format_value(&prop.value) {
            Some(value) => writeln!(f, "{indent}\t{} = {value};", prop.name)?,
            None => writeln!(f, "{indent}\t{};", prop.name)?,
        }
    }
    for (i, child) in node.children.iter().enumerate() {
        if i > 0 || !node.properties.is_empty() {
            writeln!(f)?;
        }
        write_node(f, child, depth + 1)?;
    }
    writeln!(f, "{indent}}};")
}

/// Strings when the value is a list of printable NUL-terminated strings,
/// cells when it divides into words, bytes otherwise.  Empty values are
/// boolean properties and have no value.
fn format_value(value: &[u8]) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    if let Some(strings) = as_strings(value) {
        let quoted: Vec<String> = strings.iter().map(|s| format!("\"{}\"", escape(s))).collect();
        return Some(quoted.join(", "));
    }
    if value.len() % 4 == 0 {
        let cells: Vec<String> = value.chunks_exact(4).map(|c| format!("{:#x}", BigEndian::read_u32(c))).collect();
        return Some(format!("<{}>", cells.join(" ")));
    }
    let bytes: Vec<String> = value.iter().map(|b| format!("{b:02x}")).collect();
    Some(format!("[{}]", bytes.join(" ")))
}

fn as_strings(value: &[u8]) -> Option<Vec<&str>> {
    let body = value.strip_suffix(&[0])?;
    body.split(|&b| b == 0)
        .map(|s| {
            let printable = !s.is_empty() && s.iter().all(|b| (0x20..=0x7e).contains(b));
            if printable { std::str::from_utf8(s).ok() } else { None }
        })
        .collect()
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
