use std::{fs, path::Path};

use disk::run::{RunCmdError, Runner};
use snafu::{ensure, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum GenFstabError {
    #[snafu(display("Failed to generate fstab"))]
    Generate { source: RunCmdError },
    #[snafu(display("genfstab produced no entries"))]
    EmptyFstab,
    #[snafu(display("Failed to write {path}"))]
    OperateFstabFile {
        path: String,
        source: std::io::Error,
    },
}

/// Captures `genfstab -U` for the mounted target and writes the result
/// to etc/fstab below `root`.
pub(crate) fn generate_fstab(root: &Path, runner: &Runner) -> Result<(), GenFstabError> {
    let root_s = root.display().to_string();
    let output = runner
        .run_capture("genfstab", ["-U", root_s.as_str()])
        .context(GenerateSnafu)?;

    write_fstab(root, &output)?;
    runner.log("fstab written");

    Ok(())
}

/// An fstab with surrounding whitespace stripped and exactly one
/// trailing newline. Empty output is rejected, a system without an
/// fstab cannot boot.
pub(crate) fn write_fstab(root: &Path, output: &str) -> Result<(), GenFstabError> {
    let fstab = output.trim();
    ensure!(!fstab.is_empty(), EmptyFstabSnafu);

    let path = root.join("etc/fstab");
    fs::write(&path, format!("{fstab}\n")).context(OperateFstabFileSnafu {
        path: path.display().to_string(),
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const SAMPLE: &str = "
# /dev/sda2
UUID=0b65a334-aa2a-4e3c-a3a4-9b4d23c08f07\t/\text4\trw,relatime\t0 1

# /dev/sda1
UUID=CA60-4DF6\t/boot/efi\tvfat\trw,relatime,fmask=0022\t0 2

";

    #[test]
    fn fstab_is_trimmed_and_newline_terminated() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();

        write_fstab(dir.path(), SAMPLE).unwrap();

        let written = fs::read_to_string(dir.path().join("etc/fstab")).unwrap();
        assert!(written.starts_with("# /dev/sda2"));
        assert!(written.ends_with("0 2\n"));
        assert!(!written.ends_with("\n\n"));
    }

    #[test]
    fn empty_fstab_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();

        let err = write_fstab(dir.path(), "  \n \n").unwrap_err();
        assert!(matches!(err, GenFstabError::EmptyFstab));
    }

    #[test]
    fn missing_target_etc_surfaces_the_io_error() {
        let dir = tempfile::tempdir().unwrap();

        let err = write_fstab(dir.path(), SAMPLE).unwrap_err();
        assert!(matches!(err, GenFstabError::OperateFstabFile { .. }));
    }
}
