#![deny(clippy::all)]

mod cgroup;
mod child;
mod parent;
mod seccomp;
mod signal;

pub use self::cgroup::check_cgroup;
pub use self::signal::kill_group;

use self::cgroup::Cgroup;
use self::child::ChildSetup;
use self::parent::Meter;

use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SandboxArgs {
    pub bin: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,

    pub work_dir: PathBuf,

    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,

    pub uid: Option<u32>,
    pub gid: Option<u32>,

    pub real_time_limit: Option<u64>, // milliseconds
    pub memory_limit: Option<u64>,    // bytes, resident, whole tree

    pub rlimit_cpu: Option<u64>,   // seconds
    pub rlimit_as: Option<u64>,    // bytes
    pub rlimit_data: Option<u64>,  // bytes
    pub rlimit_fsize: Option<u64>, // bytes
    pub rlimit_nproc: Option<u64>,

    /// `pids.max` of the run's cgroup. Ignored without one.
    pub pids_limit: Option<u64>,

    pub isolation: Isolation,
}

/// Confinement beyond resource limits. Everything except `seccomp` needs
/// root.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Isolation {
    /// Hierarchy root. A fresh group per run caps the whole process tree.
    pub cgroup_root: Option<PathBuf>,

    /// Refuses network sockets, ptrace, setsid/setpgid and namespace or
    /// mount changes.
    pub seccomp: bool,

    /// A fresh network namespace with only a downed loopback.
    pub unshare_network: bool,

    /// Lays an empty tmpfs over the work dir's parent and re-attaches the
    /// work dir alone.
    pub hide_siblings: bool,

    /// Directories replaced by an empty read-only tmpfs.
    pub hidden_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOutput {
    pub code: i32,
    pub signal: i32,
    pub status: i32,

    pub real_time: u64, // milliseconds
    pub sys_time: u64,  // milliseconds
    pub user_time: u64, // milliseconds
    pub cpu_time: u64,  // milliseconds
    pub memory: u64,    // KiB

    pub timed_out: bool,
    pub memory_exceeded: bool,
}

impl SandboxOutput {
    pub fn is_success(&self) -> bool {
        let exited = libc::WIFEXITED(self.status);
        exited && self.code == 0
    }

    pub fn is_signaled(&self) -> bool {
        libc::WIFSIGNALED(self.status)
    }
}

fn libc_call(f: impl FnOnce() -> i32) -> io::Result<u32> {
    let ret = f();
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as u32)
}

fn open_stdio(path: Option<&Path>, write: bool) -> Result<Stdio> {
    let path = match path {
        Some(p) => p,
        None => return Ok(Stdio::null()),
    };
    let file = if write {
        File::create(path)
    } else {
        File::open(path)
    };
    let file = file.with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Stdio::from(file))
}

/// Orphaned descendants are re-parented to us so they can be reaped.
fn become_subreaper() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let ret = libc_call(|| unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1) });
        if let Err(err) = ret {
            tracing::warn!(%err, "failed to become child subreaper");
        }
    });
}

/// Runs a command under the given limits and waits for its whole process
/// tree to terminate.
///
/// Returns `Err` without waiting when the command cannot be started.
pub fn run_bounded(args: &SandboxArgs) -> Result<SandboxOutput> {
    become_subreaper();

    let cgroup = match args.isolation.cgroup_root {
        Some(ref root) => {
            let cg = Cgroup::new(root, rand::random()).context("failed to create cgroup")?;
            cg.set_limits(args.memory_limit, args.pids_limit)?;
            Some(Arc::new(cg))
        }
        None => None,
    };
    let filters = if args.isolation.seccomp {
        seccomp::build_filters().context("failed to build seccomp filters")?
    } else {
        Vec::new()
    };
    let cgroup_procs = cgroup.as_ref().map(|cg| cg.procs_fds()).unwrap_or_default();
    let setup = ChildSetup::new(args, cgroup_procs, filters)?;

    let mut cmd = Command::new(&args.bin);
    cmd.args(&args.args)
        .env_clear()
        .envs(args.env.iter().map(|(k, v)| (k, v)))
        .current_dir(&args.work_dir)
        .stdin(open_stdio(args.stdin.as_deref(), false)?)
        .stdout(open_stdio(args.stdout.as_deref(), true)?)
        .stderr(open_stdio(args.stderr.as_deref(), true)?);

    unsafe { cmd.pre_exec(move || child::setup(&setup)) };

    let t0 = Instant::now();
    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn: bin = {}", args.bin.display()))?;

    let pid = Pid::from_raw(child.id() as i32);
    debug!(%pid, bin = %args.bin.display(), "spawned");

    // the child called setpgid(0, 0) before exec
    let pgid = pid;
    let tree_guard = {
        let cgroup = cgroup.clone();
        scopeguard::guard(pgid, move |pgid| {
            signal::kill_group(pgid);
            if let Some(cg) = cgroup {
                cg.killall();
            }
        })
    };

    let meter = match cgroup {
        Some(ref cg) => Meter::Cgroup(Arc::clone(cg)),
        None => Meter::Group,
    };
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let deadline = args
        .real_time_limit
        .map(|ms| t0 + Duration::from_millis(ms));
    let memory_limit = args.memory_limit;
    let watchdog =
        thread::spawn(move || parent::watch(pgid, meter, deadline, memory_limit, done_rx));

    let wait_result = parent::wait4(pid);
    let real_time = t0.elapsed().as_millis() as u64;

    drop(done_tx);
    let watch = watchdog.join().unwrap_or_default();

    drop(tree_guard);

    let (status, rusage) = wait_result.context("failed to wait4")?;

    let code = libc::WEXITSTATUS(status);
    let signal = if libc::WIFSIGNALED(status) {
        libc::WTERMSIG(status)
    } else {
        0
    };

    let mut user_time = parent::timeval_to_ms(rusage.ru_utime);
    let mut sys_time = parent::timeval_to_ms(rusage.ru_stime);
    let mut memory_exceeded = watch.memory_exceeded;

    if let Some(ref cg) = cgroup {
        // the group also accounts for descendants nobody waited for
        let stats = cg
            .collect_statistics()
            .context("failed to collect statistics from cgroup")?;
        user_time = user_time.max(stats.user_time);
        sys_time = sys_time.max(stats.sys_time);
        memory_exceeded |= stats.oom_killed;
    }

    let output = SandboxOutput {
        code,
        signal,
        status,
        real_time,
        sys_time,
        user_time,
        cpu_time: user_time + sys_time,
        memory: (rusage.ru_maxrss as u64).max(watch.peak_memory / 1024),
        timed_out: watch.timed_out,
        memory_exceeded,
    };

    debug!(?output, "sandbox finished");
    Ok(output)
}
