use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{CxError, CxResult};

const PRIVATE_FILE_MODE: u32 = 0o600;
const PRIVATE_DIR_MODE: u32 = 0o700;

/// Reads a whole file, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> CxResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(CxError::io("failed to read", path, err)),
    }
}

/// Writes `data` to a temp file beside `path`, then renames it over `path`.
/// Readers see either the old bytes or the new bytes, never a torn file.
pub fn write_atomic(path: &Path, data: &[u8]) -> CxResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CxError::Config(format!("invalid target path: {}", path.display())))?;
    ensure_private_dir(parent)?;

    let mut temp_file = NamedTempFile::new_in(parent)
        .map_err(|err| CxError::io("failed to create temp file in", parent, err))?;
    temp_file
        .write_all(data)
        .and_then(|_| temp_file.as_file().sync_all())
        .map_err(|err| CxError::io("failed to write temp file for", path, err))?;
    let _ = temp_file
        .as_file()
        .set_permissions(fs::Permissions::from_mode(PRIVATE_FILE_MODE));

    temp_file
        .persist(path)
        .map_err(|err| CxError::io("failed to persist", path, err.error))?;
    Ok(())
}

/// Removes a file; returns whether anything was there.
pub fn remove_optional(path: &Path) -> CxResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(CxError::io("failed to remove", path, err)),
    }
}

pub fn ensure_private_dir(dir: &Path) -> CxResult<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|err| CxError::io("failed to create dir", dir, err))?;
    let _ = fs::set_permissions(dir, fs::Permissions::from_mode(PRIVATE_DIR_MODE));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn read_optional_treats_missing_file_as_absent() {
        let temp = TempDir::new().expect("temp dir");
        let missing = temp.path().join("nope.json");
        assert!(read_optional(&missing).expect("read").is_none());
    }

    #[test]
    fn write_atomic_creates_parents_and_restricts_mode() {
        let temp = TempDir::new().expect("temp dir");
        let target = temp.path().join("a/b/auth.json");

        write_atomic(&target, b"{\"v\":1}").expect("first write");
        write_atomic(&target, b"{\"v\":2}").expect("overwrite");

        assert_eq!(fs::read(&target).expect("read back"), b"{\"v\":2}");
        let mode = fs::metadata(&target).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let leftovers: Vec<_> = fs::read_dir(target.parent().expect("parent"))
            .expect("list")
            .flatten()
            .filter(|entry| entry.file_name() != "auth.json")
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[test]
    fn remove_optional_reports_whether_file_existed() {
        let temp = TempDir::new().expect("temp dir");
        let target = temp.path().join("auth.json");
        fs::write(&target, b"x").expect("seed");

        assert!(remove_optional(&target).expect("remove"));
        assert!(!remove_optional(&target).expect("remove again"));
    }
}
