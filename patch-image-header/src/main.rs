// Licensed under the Apache-2.0 license

use clap::Parser;
use image_builder::{PatchOptions, Toolchain};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use std::path::PathBuf;

/// Patches the image header of a firmware ELF file with the size and CRC32 of
/// the image payload.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the ELF file to patch
    #[arg(value_name = "ELF")]
    elf: PathBuf,

    /// Toolchain prefix for objcopy and gdb (e.g. "arm-none-eabi")
    #[arg(long)]
    prefix: Option<String>,

    /// Write the header fields directly into the ELF instead of using gdb
    #[arg(long, default_value_t = false)]
    native: bool,

    /// Compute and print the header fields without patching the ELF
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = SimpleLogger::new().with_level(level).init();

    let options = PatchOptions {
        toolchain: Toolchain::new(cli.prefix.as_deref()),
        native: cli.native,
        dry_run: cli.dry_run,
    };
    let result = image_builder::patch_elf(&cli.elf, &options).map(|info| {
        if cli.dry_run {
            println!("{info}");
        }
    });
    result.unwrap_or_else(|e| {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    });
}
