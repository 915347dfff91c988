//! Sandbox configuration and its serialization to nsjail's text format
//!
//! nsjail consumes a protobuf text-format config file. The subset of fields
//! we drive is small enough that the config is written directly; nothing in
//! this process ever reads it back.

use std::fmt;
use std::os::unix::io::RawFd;

/// One mount point inside the sandbox mount view
#[derive(Debug, Clone, Default)]
pub struct Mount {
    pub src: Option<String>,
    pub dst: String,
    pub fstype: Option<String>,
    pub options: Option<String>,
    pub is_bind: bool,
    pub is_dir: Option<bool>,
    pub rw: Option<bool>,
}

/// uid/gid mapping entry: the name inside the sandbox and the account
/// outside it
#[derive(Debug, Clone)]
pub struct IdMap {
    pub inside: String,
    pub outside: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

/// Resource limit type tag, mirroring nsjail's RLimit enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlimitType {
    Value,
    Soft,
    Hard,
    Inf,
}

impl RlimitType {
    fn as_str(self) -> &'static str {
        match self {
            RlimitType::Value => "VALUE",
            RlimitType::Soft => "SOFT",
            RlimitType::Hard => "HARD",
            RlimitType::Inf => "INF",
        }
    }
}

/// One resource limit: an optional numeric value plus its type tag
#[derive(Debug, Clone, Copy)]
pub struct Rlimit {
    pub value: Option<u64>,
    pub kind: RlimitType,
}

impl Rlimit {
    pub fn inf() -> Rlimit {
        Rlimit {
            value: None,
            kind: RlimitType::Inf,
        }
    }

    pub fn soft(value: u64) -> Rlimit {
        Rlimit {
            value: Some(value),
            kind: RlimitType::Soft,
        }
    }
}

/// The sandbox configuration handed to nsjail
///
/// Serialized with [fmt::Display]; the output is what lands in the config
/// memfd the jail passes via `--config /proc/<pid>/fd/<fd>`.
#[derive(Debug, Clone)]
pub struct JailConfig {
    pub mounts: Vec<Mount>,
    pub uidmap: Vec<IdMap>,
    pub gidmap: Vec<IdMap>,
    pub cwd: String,
    pub mount_proc: bool,
    pub envar: Vec<String>,
    pub pass_fd: Vec<RawFd>,
    pub hostname: String,
    pub log_level: LogLevel,
    pub rlimit_as: Option<Rlimit>,
    pub rlimit_fsize: Option<Rlimit>,
    pub rlimit_cpu: Option<Rlimit>,
    pub rlimit_nofile: Option<Rlimit>,
    pub rlimit_nproc: Option<Rlimit>,
    pub time_limit: u32,
    pub clone_newnet: bool,
    pub seccomp: Vec<String>,
}

impl Default for JailConfig {
    fn default() -> JailConfig {
        JailConfig {
            mounts: Vec::new(),
            uidmap: Vec::new(),
            gidmap: Vec::new(),
            cwd: "/".to_string(),
            mount_proc: true,
            envar: Vec::new(),
            pass_fd: Vec::new(),
            hostname: "slicer".to_string(),
            log_level: LogLevel::Warning,
            rlimit_as: Some(Rlimit::inf()),
            rlimit_fsize: Some(Rlimit::inf()),
            rlimit_cpu: Some(Rlimit::inf()),
            rlimit_nofile: None,
            rlimit_nproc: None,
            time_limit: 0,
            clone_newnet: false,
            seccomp: Vec::new(),
        }
    }
}

impl JailConfig {
    /// The restricted syscall policy applied to every worker, in nsjail's
    /// seccomp DSL. Carried as opaque data; nothing here interprets it.
    pub fn default_seccomp_policy() -> Vec<String> {
        SECCOMP_POLICY.iter().map(|line| line.to_string()).collect()
    }
}

impl fmt::Display for JailConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for mount in &self.mounts {
            writeln!(f, "mount {{")?;
            if let Some(src) = &mount.src {
                writeln!(f, "  src: {}", quote(src))?;
            }
            writeln!(f, "  dst: {}", quote(&mount.dst))?;
            if let Some(fstype) = &mount.fstype {
                writeln!(f, "  fstype: {}", quote(fstype))?;
            }
            if let Some(options) = &mount.options {
                writeln!(f, "  options: {}", quote(options))?;
            }
            writeln!(f, "  is_bind: {}", mount.is_bind)?;
            if let Some(is_dir) = mount.is_dir {
                writeln!(f, "  is_dir: {}", is_dir)?;
            }
            if let Some(rw) = mount.rw {
                writeln!(f, "  rw: {}", rw)?;
            }
            writeln!(f, "}}")?;
        }
        for map in &self.uidmap {
            write_idmap(f, "uidmap", map)?;
        }
        for map in &self.gidmap {
            write_idmap(f, "gidmap", map)?;
        }
        writeln!(f, "cwd: {}", quote(&self.cwd))?;
        writeln!(f, "mount_proc: {}", self.mount_proc)?;
        for env in &self.envar {
            writeln!(f, "envar: {}", quote(env))?;
        }
        for fd in &self.pass_fd {
            writeln!(f, "pass_fd: {}", fd)?;
        }
        writeln!(f, "hostname: {}", quote(&self.hostname))?;
        writeln!(f, "log_level: {}", self.log_level.as_str())?;
        write_rlimit(f, "as", &self.rlimit_as)?;
        write_rlimit(f, "fsize", &self.rlimit_fsize)?;
        write_rlimit(f, "cpu", &self.rlimit_cpu)?;
        write_rlimit(f, "nofile", &self.rlimit_nofile)?;
        write_rlimit(f, "nproc", &self.rlimit_nproc)?;
        writeln!(f, "time_limit: {}", self.time_limit)?;
        writeln!(f, "clone_newnet: {}", self.clone_newnet)?;
        for line in &self.seccomp {
            writeln!(f, "seccomp_string: {}", quote(line))?;
        }
        Ok(())
    }
}

fn write_idmap(f: &mut fmt::Formatter, field: &str, map: &IdMap) -> fmt::Result {
    writeln!(f, "{} {{", field)?;
    writeln!(f, "  inside_id: {}", quote(&map.inside))?;
    writeln!(f, "  outside_id: {}", quote(&map.outside))?;
    writeln!(f, "}}")
}

fn write_rlimit(f: &mut fmt::Formatter, name: &str, rlimit: &Option<Rlimit>) -> fmt::Result {
    if let Some(rlimit) = rlimit {
        if let Some(value) = rlimit.value {
            writeln!(f, "rlimit_{}: {}", name, value)?;
        }
        writeln!(f, "rlimit_{}_type: {}", name, rlimit.kind.as_str())?;
    }
    Ok(())
}

/// Quote a string for protobuf text format
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

const SECCOMP_POLICY: &[&str] = &[
    "DENY {",
    "  getpgid,",
    "  getpgrp,",
    "  getsid",
    "}",
    "ERRNO(1) {",
    "  acct,",
    "  add_key,",
    "  bpf,",
    "  capset,",
    "  chroot,",
    "  delete_module,",
    "  fallocate,",
    "  fanotify_init,",
    "  fchmod,",
    "  fchown,",
    "  finit_module,",
    "  init_module,",
    "  ioperm,",
    "  ioprio_set,",
    "  kexec_file_load,",
    "  kexec_load,",
    "  keyctl,",
    "  lookup_dcookie,",
    "  mbind,",
    "  migrate_pages,",
    "  mincore,",
    "  mount,",
    "  move_pages,",
    "  open_by_handle_at,",
    "  perf_event_open,",
    "  pivot_root,",
    "  prctl,",
    "  ptrace,",
    "  quotactl,",
    "  reboot,",
    "  request_key,",
    "  restart_syscall,",
    "  seccomp,",
    "  setdomainname,",
    "  setgid,",
    "  setgroups,",
    "  sethostname,",
    "  set_mempolicy,",
    "  setns,",
    "  setregid,",
    "  setresgid,",
    "  setresuid,",
    "  setreuid,",
    "  settimeofday,",
    "  setuid,",
    "  swapoff,",
    "  swapon,",
    "  sysctl,",
    "  syslog,",
    "  umount,",
    "  unshare,",
    "  vhangup",
    "}",
    "ERRNO(38) {",
    "  afs_syscall,",
    "  create_module,",
    "  epoll_ctl_old,",
    "  epoll_wait_old,",
    "  get_kernel_syms,",
    "  getpmsg,",
    "  get_thread_area,",
    "  kcmp,",
    "  nfsservctl,",
    "  putpmsg,",
    "  query_module,",
    "  security,",
    "  set_thread_area,",
    "  tuxcall,",
    "  uselib,",
    "  vserver",
    "}",
    "DEFAULT ALLOW",
];
