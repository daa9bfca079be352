//! Sketchmerge CLI - host tool for AVR sketch images
//!
//! Commands:
//! - info: print flash and data footprints of an image
//! - vectors: list the interrupt vectors a sketch implements
//! - relocate: move a data-space variable to a new address

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use avr_elf::{AvrImage, RunCursor};

#[derive(Parser)]
#[command(name = "sketchmerge-cli")]
#[command(about = "Host tool for AVR sketch images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print flash and data footprints of an image
    Info {
        /// Path to the ELF image
        elf_path: PathBuf,
    },
    /// List the interrupt vectors a sketch implements
    Vectors {
        /// Path to the ELF image
        elf_path: PathBuf,

        /// Print the run-serialized form instead of a listing
        #[arg(long)]
        serialized: bool,
    },
    /// Rewrite every load/store referencing a symbol to a new address
    Relocate {
        /// Path to the ELF image
        elf_path: PathBuf,

        /// Symbol to relocate
        #[arg(short, long)]
        symbol: String,

        /// New data-space address (decimal or 0x-prefixed hex)
        #[arg(short, long, value_parser = parse_address)]
        address: u16,

        /// Where to write the patched image (defaults to in place)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn parse_address(text: &str) -> Result<u16> {
    let value = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    value.with_context(|| format!("invalid address '{text}'"))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Info { elf_path } => print_info(&elf_path),
        Commands::Vectors {
            elf_path,
            serialized,
        } => print_vectors(&elf_path, serialized),
        Commands::Relocate {
            elf_path,
            symbol,
            address,
            output,
        } => relocate(&elf_path, &symbol, address, output),
    }
}

fn print_info(elf_path: &PathBuf) -> Result<()> {
    let image = AvrImage::load(elf_path)
        .with_context(|| format!("failed to load {}", elf_path.display()))?;

    println!("flash used: {} bytes", image.flash_used());
    println!("data size:  {} bytes", image.data_size());
    Ok(())
}

fn print_vectors(elf_path: &PathBuf, serialized: bool) -> Result<()> {
    let image = AvrImage::load(elf_path)
        .with_context(|| format!("failed to load {}", elf_path.display()))?;

    let Some(vectors) = image.implemented_vectors() else {
        bail!(
            "{}: default interrupt handler not found; not a linked AVR sketch?",
            elf_path.display()
        );
    };

    if serialized {
        println!("{vectors}");
        return Ok(());
    }

    if vectors.is_empty() {
        println!("no implemented vectors beyond reset");
        return Ok(());
    }
    println!("{} implemented vector(s):", vectors.count());
    let mut cursor = RunCursor::new(&vectors);
    while let Some(index) = cursor.current() {
        println!("  vector {index}");
        cursor.next();
    }
    Ok(())
}

fn relocate(
    elf_path: &PathBuf,
    symbol: &str,
    address: u16,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut image = AvrImage::load(elf_path)
        .with_context(|| format!("failed to load {}", elf_path.display()))?;

    let patched = image.patch_symbol_address(symbol, address);
    if patched == 0 {
        bail!("no load/store of '{symbol}' found; image left untouched");
    }

    let out_path = output.unwrap_or_else(|| elf_path.clone());
    image
        .save(&out_path)
        .with_context(|| format!("failed to write {}", out_path.display()))?;
    info!("patched {patched} word(s) in {}", out_path.display());

    println!(
        "relocated '{symbol}' to 0x{address:04X}: {patched} word(s) patched"
    );
    Ok(())
}
