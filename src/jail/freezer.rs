//! Per-worker freezer cgroup
//!
//! Every jail gets its own directory under the v1 freezer hierarchy. The
//! wrapper script writes the jail's pid into the group's `tasks` file before
//! exec, so the whole process tree is captured and can be suspended with a
//! single state write.

use crate::errors::JailError;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const FREEZER_DIR: &str = "/sys/fs/cgroup/freezer";

pub struct Freezer {
    dir: PathBuf,
    state: File,
}

impl Freezer {
    /// Allocate a fresh cgroup directory and open its `freezer.state` file.
    /// The state handle stays open for the freezer's entire lifetime.
    pub fn new() -> Result<Freezer, JailError> {
        let dir = create_unique_dir(Path::new(FREEZER_DIR))?;
        let state = OpenOptions::new().write(true).open(dir.join("freezer.state"))?;
        Ok(Freezer { dir, state })
    }

    /// Path of the `tasks` file the wrapper script registers itself in
    pub fn tasks_path(&self) -> PathBuf {
        self.dir.join("tasks")
    }

    /// Suspend every task in the group. Fire-and-forget: the kernel applies
    /// the state asynchronously, and the next operation on the worker either
    /// undoes it or blocks until the tree is resumed.
    pub fn freeze(&self) -> io::Result<()> {
        (&self.state).write_all(b"FROZEN")
    }

    /// Resume every task in the group
    pub fn thaw(&self) -> io::Result<()> {
        (&self.state).write_all(b"THAWED")
    }

    /// Best-effort thaw, then remove the cgroup directory. The kernel empties
    /// the `tasks` file asynchronously after the tree dies, so a failed
    /// removal is retried once after 500ms. The last error wins.
    pub async fn close(self) -> Result<(), JailError> {
        let mut err = None;
        if let Err(e) = self.thaw() {
            err = Some(JailError::from(e));
        }
        drop(self.state);
        if fs::remove_dir(&self.dir).is_err() {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if let Err(e) = fs::remove_dir(&self.dir) {
                err = Some(JailError::from(e));
            }
        }
        match err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

fn create_unique_dir(base: &Path) -> io::Result<PathBuf> {
    loop {
        let dir = base.join(format!("slicer{:08x}", rand::random::<u32>()));
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_dir_skips_collisions() {
        let base = tempfile::tempdir().unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let dir = create_unique_dir(base.path()).unwrap();
            assert!(dir.is_dir());
            assert!(seen.insert(dir));
        }
    }
}
