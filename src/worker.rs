//! A pooled, pre-warmed sandboxed worker
//!
//! A worker owns one jailed runtime process, the shared region mapped into
//! it, and the host end of its control socket pair. Between invocations the
//! whole process tree sits frozen in its cgroup, so the runtime's
//! initialization cost is paid exactly once.

use crate::control::{Args, ControlChannel, ControlState};
use crate::errors::{ControlError, WorkerError};
use crate::jail::config::{IdMap, JailConfig, Mount, Rlimit};
use crate::jail::Jail;
use crate::shmem::SharedRegion;
use std::fmt::Write as _;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::watch;

const SHM_NAME: &str = "slicershmem1";

/// Immutable description of a vendor runtime: how to boot it and where its
/// collectors live. Built once at startup, read-only afterwards.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub name: String,
    pub console_addr: PathBuf,
    pub logs_addr: PathBuf,
    pub cmd: String,
    pub args: Vec<String>,
    pub user: String,
    pub group: String,
    pub chroot: PathBuf,
    pub nsjail: PathBuf,
}

pub struct Worker {
    jail: Jail,
    shmem: SharedRegion,
    control: ControlChannel,
    handler: String,
    exited: watch::Receiver<bool>,
}

impl Worker {
    /// Boot a fresh worker: shared region, control socket pair, jailed
    /// runtime, collector connections, fd/environment handoff, and the
    /// initial control handshake. On handshake failure the worker is closed
    /// before the error propagates, so nothing leaks.
    pub async fn new(runtime: &Runtime, dir: &Path, handler: &str) -> Result<Worker, WorkerError> {
        let dir = std::path::absolute(dir)?;
        let shmem = SharedRegion::create(SHM_NAME)?;

        let (host, bootstrap) = std::os::unix::net::UnixDatagram::pair()?;
        let mut jail = Jail::new(&runtime.nsjail, &runtime.cmd, &runtime.args)?;

        let console = std::os::unix::net::UnixStream::connect(&runtime.console_addr)?;
        let logs = std::os::unix::net::UnixStream::connect(&runtime.logs_addr)?;

        let mut env = Vec::new();
        let mut pass_fd = Vec::new();
        for (name, fd) in [
            ("_LAMBDA_CONTROL_SOCKET", bootstrap.as_raw_fd()),
            ("_LAMBDA_CONSOLE_SOCKET", console.as_raw_fd()),
            ("_LAMBDA_LOG_FD", logs.as_raw_fd()),
            ("_LAMBDA_SHARED_MEM_FD", shmem.as_raw_fd()),
        ] {
            set_nonblocking(fd)?;
            clear_close_on_exec(fd)?;
            pass_fd.push(fd);
            env.push(format!("{}={}", name, fd));
        }

        env.push(format!("_HANDLER={}", handler));
        env.extend(BASE_ENV.iter().map(|line| line.to_string()));

        let config = jail_config(runtime, &dir, env, pass_fd);
        let mut child = match jail.start(&config) {
            Ok(child) => child,
            Err(err) => {
                // the freezer cgroup exists by now; tear it down
                if let Err(close_err) = jail.close().await {
                    log::warn!("closing unstarted jail: {}", close_err);
                }
                return Err(err.into());
            }
        };

        // the bootstrap holds its own copies now
        drop(bootstrap);
        drop(console);
        drop(logs);

        let (exit_tx, exited) = watch::channel(false);
        tokio::spawn(async move {
            let _ = child.wait().await;
            let _ = exit_tx.send(true);
        });

        host.set_nonblocking(true)?;
        let control = ControlChannel::new(tokio::net::UnixDatagram::from_std(host)?);

        let mut worker = Worker {
            jail,
            shmem,
            control,
            handler: handler.to_string(),
            exited,
        };

        let args = start_args(&worker.handler);
        let handshake = {
            let mut exited = worker.exited.clone();
            tokio::select! {
                result = worker.control.init(&args) => result,
                _ = exited.changed() => Err(ControlError::Disconnected),
            }
        };
        if let Err(err) = handshake {
            if let Err(close_err) = worker.close().await {
                log::warn!("closing failed worker: {}", close_err);
            }
            return Err(err.into());
        }

        Ok(worker)
    }

    /// Run one invocation through the control channel, with the lambda-style
    /// START/REPORT/END lines on stdout
    pub async fn invoke(&mut self) -> Result<(), WorkerError> {
        let start = Instant::now();
        let id = fake_guid();

        let args = invoke_args(&id);

        println!("START RequestId: {} Version: $LATEST", id);

        let result = {
            let mut exited = self.exited.clone();
            tokio::select! {
                result = self.control.invoke(&args) => result,
                _ = exited.changed() => Err(ControlError::Disconnected),
            }
        };

        let millis = start.elapsed().as_secs_f64() * 1e3;
        println!(
            "REPORT RequestId: {}\tDuration: {:.2} ms\t Billed Duration: {:.0} ms\tMemory Size: {} MB\tMax Memory Used: {} MB",
            id,
            millis,
            (millis / 100.0).ceil() * 100.0,
            "1024",
            -1,
        );
        println!("END RequestId: {}", id);

        result.map_err(Into::into)
    }

    /// Control state after the last operation; only [ControlState::Ready]
    /// workers may go back to the pool
    pub fn state(&self) -> ControlState {
        self.control.state()
    }

    pub fn freeze(&self) -> io::Result<()> {
        self.jail.freeze()
    }

    pub fn thaw(&self) -> io::Result<()> {
        self.jail.thaw()
    }

    pub fn reset(&mut self) {
        self.shmem.reset()
    }

    /// Copy request bytes into the shared region's body slot
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.shmem.write(data)
    }

    pub fn debug(&self) -> &[u8] {
        self.shmem.debug()
    }

    pub fn response(&self) -> &[u8] {
        self.shmem.response()
    }

    /// Tear the worker down: drop the control endpoint and region, kill the
    /// process unconditionally, then thaw and remove the cgroup so the
    /// kernel can reap the tree. Errors accumulate; the last one wins.
    pub async fn close(self) -> Result<(), WorkerError> {
        let mut err = None;
        drop(self.control);
        drop(self.shmem);
        if let Err(e) = self.jail.kill() {
            err = Some(WorkerError::from(e));
        }
        if let Err(e) = self.jail.close().await {
            err = Some(WorkerError::from(e));
        }
        match err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

fn start_args(handler: &str) -> Args {
    let mut args = Args::new();
    args.insert("invokeid".to_string(), fake_guid());
    args.insert("handler".to_string(), handler.to_string());
    args.insert("mode".to_string(), "event".to_string());
    args.insert("supressinit".to_string(), "0".to_string());
    args.insert("awskey".to_string(), "not implemented".to_string());
    args.insert("awssecret".to_string(), "not implemented".to_string());
    args.insert("awssession".to_string(), "not implemented".to_string());
    args
}

fn invoke_args(id: &str) -> Args {
    let mut args = Args::new();
    args.insert("invokeid".to_string(), id.to_string());
    args.insert("needdebuglogs".to_string(), "1".to_string());
    args.insert("deadlinens".to_string(), "0".to_string());
    args.insert("mode".to_string(), "event".to_string());
    args.insert("clientcontext".to_string(), "{}".to_string());
    args.insert("x-amzn-trace-id".to_string(), "x=1".to_string());
    args.insert("invokedFunctionArn".to_string(), "not implemented".to_string());
    args.insert("awskey".to_string(), "not implemented".to_string());
    args.insert("awssecret".to_string(), "not implemented".to_string());
    args.insert("awssession".to_string(), "not implemented".to_string());
    args.insert("cognitoidentityid".to_string(), "not implemented".to_string());
    args.insert("cognitopoolid".to_string(), "not implemented".to_string());
    args
}

fn jail_config(runtime: &Runtime, dir: &Path, envar: Vec<String>, pass_fd: Vec<RawFd>) -> JailConfig {
    let bind = |src: &str, dst: &str| Mount {
        src: Some(src.to_string()),
        dst: dst.to_string(),
        is_bind: true,
        ..Default::default()
    };

    let mounts = vec![
        Mount {
            src: Some(runtime.chroot.to_string_lossy().into_owned()),
            dst: "/".to_string(),
            is_bind: true,
            rw: Some(false),
            is_dir: Some(true),
            ..Default::default()
        },
        Mount {
            dst: "/tmp".to_string(),
            fstype: Some("tmpfs".to_string()),
            options: Some("size=536870912".to_string()),
            is_bind: false,
            is_dir: Some(true),
            rw: Some(true),
            ..Default::default()
        },
        Mount {
            src: Some(dir.to_string_lossy().into_owned()),
            dst: "/var/task".to_string(),
            is_bind: true,
            rw: Some(false),
            is_dir: Some(true),
            ..Default::default()
        },
        bind("/dev/urandom", "/dev/urandom"),
        bind("/dev/random", "/dev/random"),
        bind("/dev/zero", "/dev/zero"),
        bind("/dev/null", "/dev/null"),
    ];

    JailConfig {
        mounts,
        uidmap: vec![IdMap {
            inside: "root".to_string(),
            outside: runtime.user.clone(),
        }],
        gidmap: vec![IdMap {
            inside: "root".to_string(),
            outside: runtime.group.clone(),
        }],
        cwd: "/var/task".to_string(),
        envar,
        pass_fd,
        rlimit_nofile: Some(Rlimit::soft(1024)),
        seccomp: JailConfig::default_seccomp_policy(),
        ..Default::default()
    }
}

/// Environment handed to the bootstrap, verbatim. Values the emulator does
/// not model are transmitted as literal stubs.
const BASE_ENV: &[&str] = &[
    "AWS_LAMBDA_FUNCTION_NAME=test",
    "_X_AMZN_TRACE_ID=Parent=4631f93d66676d9e",
    "_LAMBDA_RUNTIME_LOAD_TIME=10746081534797",
    "_LAMBDA_SB_ID=0",
    "_AWS_XRAY_DAEMON_ADDRESS=127.0.0.1",
    "_AWS_XRAY_DAEMON_PORT=9090",
    "AWS_XRAY_DAEMON_ADDRESS=127.0.0.1:9090",
    "AWS_XRAY_CONTEXT_MISSING=ERROR",
    "AWS_DEFAULT_REGION=not implemented",
    "AWS_EXECUTION_ENV=not implemented",
    "AWS_LAMBDA_FUNCTION_MEMORY_SIZE=not implemented",
    "AWS_LAMBDA_FUNCTION_VERSION=not implemented",
    "AWS_LAMBDA_LOG_GROUP_NAME=not implemented",
    "AWS_LAMBDA_LOG_STREAM_NAME=not implemented",
    "AWS_LAMBDA_RUNTIME_API=not implemented",
    "AWS_REGION=not implemented",
    "LAMBDA_TASK_ROOT=/var/task",
    "LAMBDA_RUNTIME_DIR=/var/runtime",
    "LANG=en_US.UTF-8",
    "LD_LIBRARY_PATH=/var/lang/lib:/lib64:/usr/lib64:/var/runtime:/var/runtime/lib:/var/task:/var/task/lib",
    "PATH=/var/lang/bin:/usr/local/bin:/usr/bin/:/bin",
    "PYTHONPATH=/tmp/:/var/task/:/var/runtime/",
    "TZ=:UTC",
    "LOG_LEVEL=DEBUG",
];

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn clear_close_on_exec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// 36-character identifier shaped like a v1 guid: random lowercase hex with
/// a literal '1' at position 14
pub(crate) fn fake_guid() -> String {
    let raw: [u8; 16] = rand::random();
    let mut out = String::with_capacity(36);
    for (i, byte) in raw.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        let _ = write!(out, "{:02x}", byte);
    }
    out.replace_range(14..15, "1");
    out
}
