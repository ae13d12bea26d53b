pub mod error;
pub mod container;
pub mod filesystem;
pub mod uimage;
pub mod codec;
pub mod fdt;
pub mod scanner;
pub mod board;
pub mod report;
pub mod extract;
pub mod source;

pub use error::{AnalyzeError, DecompressError, ExtractError, ParseError};
pub use container::{Container, Section, SectionEntry};
pub use filesystem::{classify, Decoders, FilesystemDecoder, FilesystemKind, FsEntry};
pub use codec::{decompress, decompress_bootloader, kernel_config, CodecId, DecompressedPayload};
pub use fdt::{DeviceTree, Fdt};
pub use scanner::{scan_bootloader, scan_kernel, BootloaderMetadata, KernelMetadata};
pub use board::{parse_board_info, BoardInfo};
pub use report::{analyze, AnalysisContext, FirmwareReport};
pub use extract::{extract, extract_blobs, extract_firmware, ExtractOptions, ExtractionReport};
pub use source::{analyze_source, ArchiveUnwrapper, FileSource, InnerContainer, Source, SourceProvider};
