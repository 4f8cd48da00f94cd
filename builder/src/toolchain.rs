// Licensed under the Apache-2.0 license

use anyhow::{Context, Result};
use image_header::{PayloadInfo, CRC_FIELD, DATA_SIZE_FIELD, IMAGE_HDR_SYMBOL};
use log::debug;
use std::io;
use std::path::Path;
use std::process::{Command, ExitStatus, Output, Stdio};
use thiserror::Error;

const OBJCOPY: &str = "objcopy";
const GDB: &str = "gdb";

/// Errors from running the external objcopy and gdb tools.
#[derive(Error, Debug)]
pub enum ToolInvocationError {
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("{tool} failed ({status}): {stderr}")]
    Failed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Names of the cross toolchain executables, e.g. `arm-none-eabi-objcopy`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Toolchain {
    prefix: Option<String>,
}

impl Toolchain {
    pub fn new(prefix: Option<&str>) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()).map(str::to_string),
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn objcopy(&self) -> String {
        self.tool(OBJCOPY)
    }

    pub fn gdb(&self) -> String {
        self.tool(GDB)
    }

    fn tool(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}-{name}"),
            None => name.to_string(),
        }
    }
}

fn run(cmd: &mut Command) -> Result<Output, ToolInvocationError> {
    let tool = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null());
    debug!("Executing {:?}", cmd);

    let output = cmd
        .output()
        .map_err(|source| ToolInvocationError::Spawn {
            tool: tool.clone(),
            source,
        })?;
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !output.stdout.is_empty() {
        debug!("{tool}: {}", String::from_utf8_lossy(&output.stdout).trim());
    }
    if !output.status.success() {
        return Err(ToolInvocationError::Failed {
            tool,
            status: output.status,
            stderr,
        });
    }
    if !stderr.is_empty() {
        debug!("{tool}: {stderr}");
    }
    Ok(output)
}

/// Converts `elf` into a flat binary with objcopy and returns its contents.
///
/// The binary is written to a temporary file next to the ELF which is removed
/// before returning.
pub fn extract_binary(toolchain: &Toolchain, elf: &Path) -> Result<Vec<u8>> {
    let dir = match elf.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let bin = tempfile::Builder::new()
        .prefix(elf.file_name().unwrap_or_default())
        .suffix(".tmp.bin")
        .tempfile_in(dir)
        .with_context(|| format!("Unable to create temporary file in {}", dir.display()))?;

    run(Command::new(toolchain.objcopy())
        .arg(elf)
        .args(["-O", "binary"])
        .arg(bin.path()))?;

    let data = std::fs::read(bin.path())
        .with_context(|| format!("Cannot read extracted binary {}", bin.path().display()))?;
    debug!("Extracted {} bytes from {}", data.len(), elf.display());
    Ok(data)
}

/// gdb commands that store `info` into the `image_hdr` symbol.
pub fn gdb_commands(info: &PayloadInfo) -> Vec<String> {
    vec![
        format!("set {IMAGE_HDR_SYMBOL}.{DATA_SIZE_FIELD}={}", info.data_size),
        format!("set {IMAGE_HDR_SYMBOL}.{CRC_FIELD}={}", info.crc32),
        "q".to_string(),
    ]
}

/// Writes `info` into `elf` in place by scripting gdb.
pub fn gdb_patch(toolchain: &Toolchain, elf: &Path, info: &PayloadInfo) -> Result<()> {
    let mut cmd = Command::new(toolchain.gdb());
    cmd.arg("--write");
    for command in gdb_commands(info) {
        cmd.arg("-ex").arg(command);
    }
    cmd.arg(elf);
    run(&mut cmd)?;
    Ok(())
}
