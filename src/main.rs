use clap::{Parser, Subcommand};
use fwinspect::container::{Container, Section, FS_SECTIONS};
use fwinspect::extract::extract_blobs;
use fwinspect::filesystem::classify;
use fwinspect::source::{analyze_source, FileSource, SourceProvider};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fwinspect", about = "Inspect PAK firmware containers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the metadata report(s) as JSON
    Info {
        file: String,
        /// JSON indentation; 0 prints compact output
        #[arg(long, default_value = "2")]
        indent: usize,
    },
    /// Print the section table
    Sections {
        file: PathBuf,
    },
    /// Write the decompressed boot loader, kernel and kernel config
    Blobs {
        file: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        /// Overwrite existing files
        #[arg(short, long)]
        force: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { file, indent } => {
            let source = FileSource.fetch(&file)?;
            let results = analyze_source(source, None, None)?;
            let reports: Vec<Value> = results
                .into_iter()
                .map(|r| match r {
                    Ok(report) => serde_json::to_value(report),
                    Err(e) => Ok(json!({ "file": file, "error": e.to_string() })),
                })
                .collect::<Result<_, _>>()?;
            println!("{}", to_json(&Value::Array(reports), indent)?);
        }

        // ── Sections ─────────────────────────────────────────────────────────
        Commands::Sections { file } => {
            let pak = Container::parse(std::fs::read(&file)?)?;
            println!("Container: {}", file.display());
            println!("  Product type   {:#x}", pak.product_type());
            println!("  Sections       {} ({:?})", pak.section_count(), pak.count_source());
            println!("{:<12} {:<24} {:>10} {:>10}  Type", "Name", "Version", "Offset", "Size");
            for s in pak.sections() {
                println!("{:<12} {:<24} {:>10} {:>10}  {}",
                    s.name(), s.entry.version, s.entry.offset, s.entry.size, section_kind(&s));
            }
            if !pak.mtd_parts().is_empty() {
                println!("MTD partitions:");
                for p in pak.mtd_parts() {
                    println!("  {:<12} {:<12} start={:#x} size={:#x}", p.name, p.mtd, p.start, p.size);
                }
            }
        }

        // ── Blobs ────────────────────────────────────────────────────────────
        Commands::Blobs { file, output_dir, force } => {
            let pak = Container::parse(std::fs::read(&file)?)?;
            let report = extract_blobs(&pak, &output_dir, force)?;
            for path in &report.written {
                println!("  wrote   {}", output_dir.join(path).display());
            }
            for path in &report.skipped {
                println!("  exists  {}", output_dir.join(path).display());
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

/// Type column of the section table: file system kind, or `-`.
fn section_kind(section: &Section<'_>) -> &'static str {
    if !section.is_empty() && FS_SECTIONS.contains(&section.name()) {
        classify(section.bytes()).name()
    } else {
        "-"
    }
}

fn to_json(value: &Value, indent: usize) -> Result<String, Box<dyn std::error::Error>> {
    if indent == 0 {
        return Ok(serde_json::to_string(value)?);
    }
    let spaces = vec![b' '; indent];
    let formatter = serde_json::ser::PrettyFormatter::with_indent(&spaces);
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    serde::Serialize::serialize(value, &mut ser)?;
    Ok(String::from_utf8(out)?)
}
