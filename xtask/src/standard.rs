//! Standard test runner: single run, compare output against expected files.
//!
//! Each scenario has two expected files under `testsuite/expected/`:
//! - `<name>.expected`: the semihosting text.
//! - `<name>.wire`: the raw bytes transmitted on UART0.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::build::project_root;
use crate::qemu::run_qemu;
use crate::runner::RunOptions;

/// Run a standard test.
///
/// Executes the example once and compares both outputs against the expected files.
pub fn run_standard(example: &str, elf_path: &Path, opts: &RunOptions) -> Result<bool> {
    println!("Running in QEMU...");
    let output = run_qemu(elf_path)?;

    if opts.verbose {
        print!("{}", output.semihosting);
        println!("--- QEMU run end ---");
        if !output.wire.is_empty() {
            println!("--- wire ({} bytes) ---", output.wire.len());
            println!("{}", String::from_utf8_lossy(&output.wire).escape_debug());
        }
        return Ok(true);
    }

    let expected_dir = project_root().join("testsuite").join("expected");
    let text_path = expected_dir.join(format!("{example}.expected"));
    let wire_path = expected_dir.join(format!("{example}.wire"));

    if opts.bless {
        fs::create_dir_all(&expected_dir)?;
        bless(&text_path, output.semihosting.as_bytes())?;
        bless(&wire_path, &output.wire)?;
        return Ok(true);
    }

    if !text_path.exists() {
        println!("  No expected output file, run with --bless to create");
        println!("--- output ---");
        print!("{}", output.semihosting);
        return Ok(false);
    }

    let expected = fs::read_to_string(&text_path)?;
    // A scenario that transmits nothing may omit its wire file.
    let expected_wire = read_optional(&wire_path)?;

    let text_ok = output.semihosting == expected;
    let wire_ok = output.wire == expected_wire;
    if text_ok && wire_ok {
        println!("  PASS");
        return Ok(true);
    }

    println!("  FAIL: output differs from expected");
    if !text_ok {
        println!("--- expected ---");
        print!("{expected}");
        println!("--- semihosting ---");
        print!("{}", output.semihosting);
    }
    if !wire_ok {
        println!("--- expected wire ---");
        println!("{}", String::from_utf8_lossy(&expected_wire).escape_debug());
        println!("--- wire ---");
        println!("{}", String::from_utf8_lossy(&output.wire).escape_debug());
    }
    Ok(false)
}

/// Write `contents` to `path` if it differs, reporting what happened.
fn bless(path: &PathBuf, contents: &[u8]) -> Result<()> {
    let filename = path.file_name().unwrap().to_string_lossy();
    let status = if path.exists() {
        if fs::read(path)? == contents {
            "No change"
        } else {
            fs::write(path, contents)?;
            "Updated"
        }
    } else {
        fs::write(path, contents)?;
        "Created"
    };
    println!("  {filename}: {status}");
    Ok(())
}

fn read_optional(path: &Path) -> Result<Vec<u8>> {
    if path.exists() {
        fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
    } else {
        Ok(Vec::new())
    }
}
