//! Point-in-time snapshots of a process's virtual memory mappings.
//!
//! The snapshot relates virtual addresses in the trace to on-disk binaries,
//! so a decoder can recover the instruction stream later. It is taken once,
//! before tracing starts; a target that has already mapped or unmapped code
//! since then cannot be decoded reliably.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::unistd::Pid;
use tracing::debug;

use crate::error::{Error, Result};

/// Copy `/proc/<pid>/maps` to `path`.
///
/// The destination is created fresh with mode `0600` and must not already
/// exist. Fails if the target process is gone or on any I/O error.
pub fn snapshot(pid: Pid, path: &Path) -> Result<()> {
    debug!(%pid, path = %path.display(), "snapshotting memory map");

    copy_maps(pid, path).map_err(|source| Error::MapSnapshot {
        pid,
        path: path.to_owned(),
        source,
    })
}

fn copy_maps(pid: Pid, path: &Path) -> io::Result<()> {
    let maps = fs::read(format!("/proc/{}/maps", pid))?;

    let mut out = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    out.write_all(&maps)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn own_pid() -> Pid {
        Pid::from_raw(std::process::id() as i32)
    }

    #[test]
    fn test_snapshot_own_maps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maps");

        snapshot(own_pid(), &path).unwrap();

        let meta = fs::metadata(&path).unwrap();
        assert!(meta.len() > 0);
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        // Sanity: the copy looks like a mapping list.
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.lines().any(|line| line.contains("r-xp") || line.contains("rw-p")));
    }

    #[test]
    fn test_snapshot_missing_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maps");

        // Linux pids are capped well below i32::MAX, so this cannot exist.
        let err = snapshot(Pid::from_raw(i32::MAX), &path).unwrap_err();
        assert!(matches!(err, Error::MapSnapshot { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_snapshot_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maps");
        fs::write(&path, b"precious").unwrap();

        let err = snapshot(own_pid(), &path).unwrap_err();
        assert!(matches!(err, Error::MapSnapshot { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"precious");
    }
}
