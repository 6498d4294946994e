//! Best-effort secure deletion of private key material.
//!
//! Mirrors `secureDelete` in the original: overwrite a file with random
//! bytes before unlinking it, rather than relying on the filesystem to
//! scrub the old blocks. The overwrite always happens before the
//! unlink, on every path, including error returns.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write as _};

use fs_mistrust::CheckedDir;
use rand::RngCore;

use remailer_error::{ErrorDetail, Result};

/// Overwrite the file at `path` (within `dir`) with random bytes, then
/// remove it.
///
/// If the file does not exist, this is a no-op: callers regenerate
/// secrets lazily, and deleting something that was never created is not
/// an error.
pub fn secure_delete_file(dir: &CheckedDir, path: &str) -> Result<()> {
    let full_path = match dir.join(path) {
        Ok(p) => p,
        Err(e) => return Err(ErrorDetail::Io(format!("bad path for secure delete: {e}")).into()),
    };
    if !full_path.try_exists().unwrap_or(false) {
        return Ok(());
    }

    overwrite_with_random(dir, path)?;
    dir.remove_file(path)
        .map_err(|e| ErrorDetail::Io(format!("could not remove {path}: {e}")))?;
    Ok(())
}

/// Overwrite the contents of `path` in place with cryptographically
/// random bytes of the same length, without changing its size.
fn overwrite_with_random(dir: &CheckedDir, path: &str) -> Result<()> {
    let len = dir
        .metadata(path)
        .map_err(|e| ErrorDetail::Io(format!("could not stat {path}: {e}")))?
        .len();

    let mut file = dir
        .open(path, OpenOptions::new().write(true))
        .map_err(|e| ErrorDetail::Io(format!("could not open {path} for overwrite: {e}")))?;

    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; len as usize];
    rng.fill_bytes(&mut buf);

    file.seek(SeekFrom::Start(0))
        .map_err(|e| ErrorDetail::Io(e.to_string()))?;
    file.write_all(&buf)
        .map_err(|e| ErrorDetail::Io(format!("could not overwrite {path}: {e}")))?;
    file.sync_all().map_err(|e| ErrorDetail::Io(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use fs_mistrust::Mistrust;

    fn checked_dir(tmp: &tempfile::TempDir) -> CheckedDir {
        Mistrust::new()
            .verifier()
            .permit_readable()
            .make_secure_dir(tmp.path())
            .unwrap()
    }

    #[test]
    fn delete_nonexistent_file_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = checked_dir(&tmp);
        secure_delete_file(&dir, "nope").unwrap();
    }

    #[test]
    fn delete_removes_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = checked_dir(&tmp);
        dir.write_and_replace("secret", b"shh").unwrap();
        assert!(dir.as_path().join("secret").exists());

        secure_delete_file(&dir, "secret").unwrap();
        assert!(!dir.as_path().join("secret").exists());
    }
}
