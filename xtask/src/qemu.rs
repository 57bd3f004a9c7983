//! QEMU runner for Cortex-M3 emulation.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use tempfile::NamedTempFile;

/// Output from running QEMU.
pub struct QemuOutput {
    /// Text printed over semihosting (stdout).
    pub semihosting: String,
    /// UART0 output: the bytes the simulated transmitter put on the wire.
    pub wire: Vec<u8>,
}

/// Run an ELF in QEMU until it exits through semihosting.
pub fn run_qemu(elf_path: &Path) -> Result<QemuOutput> {
    let uart0_file = NamedTempFile::new().context("Failed to create temp file for UART0")?;
    let uart0_path = uart0_file.path();

    let output = Command::new("qemu-system-arm")
        .arg("-cpu")
        .arg("cortex-m3")
        .arg("-machine")
        .arg("lm3s6965evb")
        .arg("-nographic")
        .arg("-monitor")
        .arg("none")
        .arg("-semihosting-config")
        .arg("enable=on,target=native")
        .arg("-serial")
        .arg(format!("file:{}", uart0_path.display()))
        .arg("-kernel")
        .arg(elf_path)
        .stdin(Stdio::null())
        .output()
        .context("Failed to run QEMU")?;

    let semihosting = String::from_utf8_lossy(&output.stdout).into_owned();

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "QEMU exited with error: {:?}\n{}{}",
            output.status.code(),
            semihosting,
            stderr
        );
    }

    let wire = fs::read(uart0_path).unwrap_or_default();

    Ok(QemuOutput { semihosting, wire })
}
