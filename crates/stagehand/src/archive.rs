use std::fs;
use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};

// Uncompressed tar: checkpoints are disposable, so speed wins over size, and
// the format preserves file timestamps on extraction.

/// Packs `source_dir` into a single archive at `archive_path`. Filesystem
/// errors propagate; archiving is assumed reliable relative to the network.
pub fn pack(source_dir: &Path, archive_path: &Path) -> Result<()> {
    if !source_dir.is_dir() {
        return Err(Error::msg(format!(
            "archive source is not a directory: {}",
            source_dir.display()
        )));
    }
    let parent = source_dir
        .parent()
        .ok_or_else(|| Error::msg(format!("archive source has no parent: {}", source_dir.display())))?;
    let leaf = source_dir
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::msg(format!("invalid archive source name: {}", source_dir.display())))?;
    if let Some(dir) = archive_path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    }

    let status = Command::new("tar")
        .arg("-cf")
        .arg(archive_path)
        .arg("-C")
        .arg(parent)
        .arg(leaf)
        .status()
        .map_err(|e| Error::msg(format!("failed to spawn tar: {e}")))?;
    if !status.success() {
        return Err(Error::msg(format!(
            "tar pack of {} failed (status: {status})",
            source_dir.display()
        )));
    }
    Ok(())
}

/// Unpacks `archive_path` into `dest_dir`, overwriting existing entries.
/// Timestamps come back as packed. A failure here means the resume data is
/// unusable; callers degrade to a fresh build.
pub fn unpack(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    if !archive_path.is_file() {
        return Err(Error::msg(format!(
            "archive missing: {}",
            archive_path.display()
        )));
    }
    fs::create_dir_all(dest_dir)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest_dir.display())))?;

    let status = Command::new("tar")
        .arg("-xpf")
        .arg(archive_path)
        .arg("-C")
        .arg(dest_dir)
        .status()
        .map_err(|e| Error::msg(format!("failed to spawn tar: {e}")))?;
    if !status.success() {
        return Err(Error::msg(format!(
            "tar unpack of {} failed (status: {status})",
            archive_path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_then_unpack_restores_tree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested")).expect("src dirs");
        fs::write(src.join("a.txt"), "alpha").expect("write a");
        fs::write(src.join("nested/b.txt"), "beta").expect("write b");

        let archive = tmp.path().join("payload.tar");
        pack(&src, &archive).expect("pack");
        assert!(archive.is_file());

        let dest = tmp.path().join("dest");
        unpack(&archive, &dest).expect("unpack");
        assert_eq!(
            fs::read_to_string(dest.join("src/a.txt")).expect("read a"),
            "alpha"
        );
        assert_eq!(
            fs::read_to_string(dest.join("src/nested/b.txt")).expect("read b"),
            "beta"
        );
    }

    #[test]
    fn unpack_overwrites_existing_content() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).expect("src dir");
        fs::write(src.join("state.txt"), "new").expect("write");
        let archive = tmp.path().join("payload.tar");
        pack(&src, &archive).expect("pack");

        let dest = tmp.path().join("dest");
        fs::create_dir_all(dest.join("src")).expect("dest dir");
        fs::write(dest.join("src/state.txt"), "stale").expect("stale write");
        unpack(&archive, &dest).expect("unpack");
        assert_eq!(
            fs::read_to_string(dest.join("src/state.txt")).expect("read"),
            "new"
        );
    }

    #[test]
    fn pack_rejects_missing_source() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = pack(&tmp.path().join("nope"), &tmp.path().join("out.tar"))
            .expect_err("must fail");
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn unpack_rejects_missing_archive() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = unpack(&tmp.path().join("absent.tar"), tmp.path()).expect_err("must fail");
        assert!(err.to_string().contains("archive missing"));
    }
}
