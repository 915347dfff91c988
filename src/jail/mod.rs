//! Jailed child processes with a freezer cgroup wrapped around them
//!
//! The jail launches a program under nsjail, but indirectly: the child execs
//! a two-line shell wrapper that first writes its own pid into the freezer
//! cgroup's `tasks` file and only then execs nsjail. That ordering guarantees
//! the jail and everything it spawns are members of the freezer group before
//! any sandboxed code runs.
//!
//! The nsjail binary, the wrapper script and the serialized config all live
//! in sealed anonymous memory files and are addressed through
//! `/proc/<pid>/fd/<fd>`, so nothing the jail needs can be changed or removed
//! from under it once constructed.

pub mod config;
mod freezer;

pub use config::JailConfig;
pub use freezer::Freezer;

use crate::errors::JailError;
use memfd::{FileSeal, Memfd, MemfdOptions};
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use tokio::process::Child;

pub struct Jail {
    freezer: Freezer,
    nsjail: File,
    wrapper: File,
    config: File,
    program: String,
    args: Vec<String>,
    pid: Option<u32>,
}

impl Jail {
    /// Prepare a jail for `program args...`. Reads the nsjail launcher from
    /// `nsjail_path` into a sealed memory file; the launcher on disk is free
    /// to change afterwards.
    pub fn new(nsjail_path: &Path, program: &str, args: &[String]) -> Result<Jail, JailError> {
        let freezer = Freezer::new()?;
        let nsjail = sealed_memfd("slicer:nsjail", &std::fs::read(nsjail_path)?)?;
        let wrapper = sealed_memfd(
            "slicer:wrapper",
            wrapper_script(&freezer.tasks_path(), &proc_path(&nsjail)).as_bytes(),
        )?;
        let config = MemfdOptions::default().create("slicer:config")?.into_file();
        Ok(Jail {
            freezer,
            nsjail,
            wrapper,
            config,
            program: program.to_string(),
            args: args.to_vec(),
            pid: None,
        })
    }

    /// Serialize the config and start the child through the wrapper.
    /// The environment travels inside the config, so the command's own
    /// environment is cleared.
    pub fn start(&mut self, config: &JailConfig) -> Result<Child, JailError> {
        if self.pid.is_some() {
            return Err(JailError::AlreadyStarted);
        }
        self.config.write_all(config.to_string().as_bytes())?;

        let mut cmd = std::process::Command::new(proc_path(&self.wrapper));
        cmd.arg0("nsjail");
        cmd.args(["--quiet", "--config", &proc_path(&self.config), "--"]);
        cmd.arg(&self.program);
        cmd.args(&self.args);
        cmd.env_clear();

        let child = tokio::process::Command::from(cmd).spawn()?;
        self.pid = child.id();
        Ok(child)
    }

    pub fn freeze(&self) -> io::Result<()> {
        self.freezer.freeze()
    }

    pub fn thaw(&self) -> io::Result<()> {
        self.freezer.thaw()
    }

    /// Unconditionally SIGKILL the wrapper process. The tree itself dies
    /// once thawed; the caller follows up with [Jail::close].
    pub fn kill(&self) -> Result<(), JailError> {
        let pid = self.pid.ok_or(JailError::NotStarted)?;
        let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Release the memory files and tear down the freezer cgroup
    pub async fn close(self) -> Result<(), JailError> {
        drop(self.config);
        drop(self.wrapper);
        drop(self.nsjail);
        self.freezer.close().await
    }
}

fn proc_path(file: &File) -> String {
    format!("/proc/{}/fd/{}", std::process::id(), file.as_raw_fd())
}

fn wrapper_script(tasks: &Path, nsjail: &str) -> String {
    format!(
        "#!/bin/bash\nset -e\necho $$ > {}\nexec -c -a nsjail {} \"$@\"\n",
        tasks.display(),
        nsjail
    )
}

fn sealed_memfd(name: &str, data: &[u8]) -> Result<File, JailError> {
    let memfd: Memfd = MemfdOptions::default().allow_sealing(true).create(name)?;
    memfd.as_file().write_all(data)?;
    memfd.add_seals(
        &[
            FileSeal::SealWrite,
            FileSeal::SealShrink,
            FileSeal::SealGrow,
            FileSeal::SealSeal,
        ]
        .iter()
        .cloned()
        .collect(),
    )?;
    Ok(memfd.into_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn sealed_memfd_rejects_writes() {
        let file = sealed_memfd("slicer:test", b"#!/bin/true\n").unwrap();
        assert!((&file).write_all(b"tamper").is_err());
        let mut readback = String::new();
        let mut reopen = File::open(proc_path(&file)).unwrap();
        reopen.read_to_string(&mut readback).unwrap();
        assert_eq!(readback, "#!/bin/true\n");
    }

    #[test]
    fn wrapper_registers_in_tasks_before_exec() {
        let script = wrapper_script(Path::new("/sys/fs/cgroup/freezer/slicer00c0ffee/tasks"), "/proc/42/fd/7");
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "#!/bin/bash");
        assert_eq!(lines[1], "set -e");
        assert_eq!(lines[2], "echo $$ > /sys/fs/cgroup/freezer/slicer00c0ffee/tasks");
        assert_eq!(lines[3], "exec -c -a nsjail /proc/42/fd/7 \"$@\"");
    }
}
