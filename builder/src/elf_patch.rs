// Licensed under the Apache-2.0 license

//! Writes the computed header fields straight into the `image_hdr` symbol of
//! an ELF file, without going through gdb.

use anyhow::{anyhow, bail, Context, Result};
use elf::abi::{SHN_UNDEF, SHT_NOBITS};
use elf::endian::AnyEndian;
use elf::ElfBytes;
use image_header::{PayloadInfo, CRC_FIELD_OFFSET, DATA_SIZE_FIELD_OFFSET, IMAGE_HDR_SYMBOL};
use log::debug;
use std::path::Path;

// The header must at least reach the end of `data_size`.
const PATCHED_LEN: u64 = (DATA_SIZE_FIELD_OFFSET + core::mem::size_of::<u32>()) as u64;
// Section indices from here up are reserved (SHN_ABS, SHN_COMMON, ...).
const SHN_LORESERVE: u16 = 0xff00;

/// File offset of a `PATCHED_LEN`-byte object at `st_value` inside a section
/// loaded at `sh_addr`, or `None` if it does not fit in the section.
fn symbol_file_offset(st_value: u64, sh_addr: u64, sh_offset: u64, sh_size: u64) -> Option<u64> {
    let offset = st_value.checked_sub(sh_addr)?;
    if offset.checked_add(PATCHED_LEN)? > sh_size {
        return None;
    }
    sh_offset.checked_add(offset)
}

struct HeaderLocation {
    file_offset: usize,
    big_endian: bool,
}

fn locate_image_header(bytes: &[u8]) -> Result<HeaderLocation> {
    let file = ElfBytes::<AnyEndian>::minimal_parse(bytes)?;
    let (symtab, strtab) = file
        .symbol_table()?
        .ok_or(anyhow!("ELF file has no symbol table"))?;
    let symbol = symtab
        .iter()
        .find(|sym| strtab.get(sym.st_name as usize).unwrap_or_default() == IMAGE_HDR_SYMBOL)
        .ok_or(anyhow!("error finding {IMAGE_HDR_SYMBOL} symbol"))?;

    if symbol.st_shndx == SHN_UNDEF || symbol.st_shndx >= SHN_LORESERVE {
        bail!("{IMAGE_HDR_SYMBOL} is not defined in a section of the ELF file");
    }
    if symbol.st_size != 0 && symbol.st_size < PATCHED_LEN {
        bail!(
            "{IMAGE_HDR_SYMBOL} is {} bytes, expected at least {PATCHED_LEN}",
            symbol.st_size
        );
    }

    let shdrs = file
        .section_headers()
        .ok_or(anyhow!("ELF file has no section headers"))?;
    let shdr = shdrs.get(symbol.st_shndx as usize)?;
    if shdr.sh_type == SHT_NOBITS {
        bail!("{IMAGE_HDR_SYMBOL} is in a section without file contents");
    }

    let file_offset =
        symbol_file_offset(symbol.st_value, shdr.sh_addr, shdr.sh_offset, shdr.sh_size)
            .ok_or(anyhow!(
                "{IMAGE_HDR_SYMBOL} at {:#x} lies outside its section",
                symbol.st_value
            ))?;
    let file_offset = usize::try_from(file_offset)?;
    debug!(
        "{IMAGE_HDR_SYMBOL} at address {:#x}, file offset {:#x}",
        symbol.st_value, file_offset
    );

    Ok(HeaderLocation {
        file_offset,
        big_endian: matches!(file.ehdr.endianness, AnyEndian::Big),
    })
}

fn write_u32(bytes: &mut [u8], offset: usize, value: u32, big_endian: bool) -> Result<()> {
    let raw = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    bytes
        .get_mut(offset..offset + raw.len())
        .ok_or(anyhow!("offset {offset:#x} is past the end of the ELF file"))?
        .copy_from_slice(&raw);
    Ok(())
}

/// Patches `image_hdr.crc` and `image_hdr.data_size` in `elf` in place.
pub fn native_patch(elf: &Path, info: &PayloadInfo) -> Result<()> {
    let mut bytes =
        std::fs::read(elf).with_context(|| format!("Cannot read ELF file {}", elf.display()))?;
    let location = locate_image_header(&bytes)
        .with_context(|| format!("Cannot locate image header in {}", elf.display()))?;

    let HeaderLocation {
        file_offset,
        big_endian,
    } = location;
    write_u32(
        &mut bytes,
        file_offset + CRC_FIELD_OFFSET,
        info.crc32,
        big_endian,
    )?;
    write_u32(
        &mut bytes,
        file_offset + DATA_SIZE_FIELD_OFFSET,
        info.data_size,
        big_endian,
    )?;

    std::fs::write(elf, &bytes)
        .with_context(|| format!("Cannot write ELF file {}", elf.display()))?;
    Ok(())
}
