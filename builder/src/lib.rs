// Licensed under the Apache-2.0 license

mod elf_patch;
mod toolchain;

pub use elf_patch::native_patch;
pub use image_header::PayloadInfo;
pub use toolchain::{extract_binary, gdb_commands, gdb_patch, ToolInvocationError, Toolchain};

use anyhow::{Context, Result};
use log::info;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct PatchOptions {
    pub toolchain: Toolchain,
    /// Write the header fields into the ELF directly instead of through gdb.
    pub native: bool,
    /// Compute the header fields but leave the ELF untouched.
    pub dry_run: bool,
}

/// Extracts the flat binary from `elf`, computes the payload size and CRC of
/// the firmware image, and writes both into the `image_hdr` symbol.
///
/// Nothing is written unless both values were computed.
pub fn patch_elf(elf: &Path, options: &PatchOptions) -> Result<PayloadInfo> {
    let binary = extract_binary(&options.toolchain, elf)?;
    let info = image_header::process_binary_payload(&binary)
        .with_context(|| format!("Invalid image header in {}", elf.display()))?;
    info!("{}: {}", elf.display(), info);

    if options.dry_run {
        return Ok(info);
    }
    if options.native {
        native_patch(elf, &info)?;
    } else {
        gdb_patch(&options.toolchain, elf, &info)?;
    }
    info!("Patched image header in {}", elf.display());
    Ok(info)
}
