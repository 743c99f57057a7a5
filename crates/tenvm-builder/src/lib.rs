//! Cross-compiler glue: source text in, guest ELF blob out.
//!
//! The compiler itself is an external script (the on-host cross-compiler
//! driver); this crate writes the source to a temp file, invokes the
//! script, and reads back the produced binary. Small, fallible, and
//! never on the hot path.

use std::io::Write;
use std::process::Command;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use tenvm_contracts::crc32c;

/// How much compiler output to keep when reporting a failure.
const OUTPUT_TAIL: usize = 2048;

fn env_with_default(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Compile `source` with `args` and return the produced ELF bytes. The
/// output path is keyed by the checksums of both inputs, so identical
/// requests reuse one file name.
pub fn build_and_load(source: &str, args: &str) -> Result<Vec<u8>> {
    let script = env_with_default("RISCV_BUILD_SCRIPT", "builder.sh");
    let triple = env_with_default("RISCV_GCC_TRIPLE", "riscv64-linux-gnu");

    let mut code_file = NamedTempFile::new().context("creating temporary source file")?;
    code_file
        .write_all(source.as_bytes())
        .context("writing temporary source file")?;
    code_file.flush().context("flushing temporary source file")?;

    let checksum = crc32c(source.as_bytes()) ^ crc32c(args.as_bytes());
    let bin_filename = format!("/tmp/binary-{checksum:08X}");

    let output = Command::new(&script)
        .arg(&triple)
        .arg(args)
        .arg(code_file.path())
        .arg(&bin_filename)
        .output()
        .with_context(|| format!("invoking compiler script '{script}'"))?;

    if !output.status.success() {
        let mut tail = output.stderr;
        if tail.is_empty() {
            tail = output.stdout;
        }
        let start = tail.len().saturating_sub(OUTPUT_TAIL);
        anyhow::bail!(
            "compilation failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&tail[start..])
        );
    }

    std::fs::read(&bin_filename)
        .with_context(|| format!("reading compiled binary '{bin_filename}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_name_is_checksum_keyed() {
        let a = crc32c(b"int main(){}") ^ crc32c(b"-O2");
        let b = crc32c(b"int main(){}") ^ crc32c(b"-O3");
        assert_ne!(a, b);
    }
}
