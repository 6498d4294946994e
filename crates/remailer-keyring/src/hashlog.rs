//! A handle to a keyset's replay-detection hash log.
//!
//! The hash log store itself (checking and recording packet-digest
//! replays) is an external collaborator; the mix/replay-detection
//! algorithm is out of scope here. This module only owns the
//! handle's lifecycle: where the log file lives, and that it is deleted
//! alongside its keyset. Grounded in `ServerKeyset.getHashLogFileName`/
//! `getHashLog` and `mixminion.server.HashLog.deleteHashLog` in
//! `ServerKeys.py`.

use std::path::{Path, PathBuf};

use remailer_error::{ErrorDetail, Result};

/// An opaque handle identifying one keyset's hash log on disk.
///
/// This crate never opens or writes to the log itself; it only tracks
/// the file's location so [`crate::keyset::KeySet`] can hand it to a
/// packet-handling collaborator, and so it gets deleted when its keyset
/// does.
#[derive(Clone, Debug)]
pub struct HashLogHandle {
    path: PathBuf,
}

impl HashLogHandle {
    /// Construct a handle for the hash log belonging to keyset `keyname`
    /// under `hash_dir`.
    ///
    /// `keyname` may be either the bare ordinal (`0001`) or the full
    /// `key_NNNN`-style directory name the ordinal is embedded in; either
    /// way, the file this handle points to is `hash_NNNN`, matching the
    /// `work/hashlogs/hash_NNNN` layout.
    pub fn new(hash_dir: &Path, keyname: &str) -> Self {
        let ordinal = keyname.strip_prefix("key_").unwrap_or(keyname);
        HashLogHandle {
            path: hash_dir.join(format!("hash_{ordinal}")),
        }
    }

    /// The path to this hash log's backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the hash log's backing file, if present.
    ///
    /// Unlike key material, a hash log is not secret, so a plain
    /// `remove_file` suffices; no secure-overwrite is needed.
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ErrorDetail::Io(format!(
                "could not remove hash log {}: {e}",
                self.path.display()
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_is_namespaced_by_keyname() {
        let handle = HashLogHandle::new(Path::new("/var/spool/hashlogs"), "0007");
        assert_eq!(
            handle.path(),
            Path::new("/var/spool/hashlogs/hash_0007")
        );
    }

    #[test]
    fn strips_key_prefix_from_directory_name() {
        let handle = HashLogHandle::new(Path::new("/var/spool/hashlogs"), "key_0007");
        assert_eq!(
            handle.path(),
            Path::new("/var/spool/hashlogs/hash_0007")
        );
    }

    #[test]
    fn delete_of_missing_file_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = HashLogHandle::new(tmp.path(), "missing");
        handle.delete().unwrap();
    }

    #[test]
    fn delete_removes_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = HashLogHandle::new(tmp.path(), "0001");
        std::fs::write(handle.path(), b"x").unwrap();
        handle.delete().unwrap();
        assert!(!handle.path().exists());
    }
}
