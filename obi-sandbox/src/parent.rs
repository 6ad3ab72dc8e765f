use crate::cgroup::Cgroup;
use crate::signal::send_group_signal;

use std::fs;
use std::io;
use std::mem::MaybeUninit;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::debug;

const WATCH_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default, Clone, Copy)]
pub struct Watch {
    pub timed_out: bool,
    pub memory_exceeded: bool,
    pub peak_memory: u64, // bytes, whole tree
}

/// How the watchdog measures the tree.
pub enum Meter {
    Cgroup(Arc<Cgroup>),
    /// Every process in the group, found by scanning `/proc`.
    Group,
}

impl Meter {
    fn resident_memory(&self, pgid: Pid) -> io::Result<u64> {
        match self {
            Meter::Cgroup(cg) => cg
                .resident_memory()
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err)),
            Meter::Group => group_resident_memory(pgid),
        }
    }

    fn oom_killed(&self) -> bool {
        match self {
            Meter::Cgroup(cg) => cg.oom_killed().unwrap_or(false),
            Meter::Group => false,
        }
    }
}

/// Kills the group at the wall-clock deadline, when the tree's resident
/// memory exceeds `memory_limit` or when the kernel reports an OOM kill.
/// Returns once `done` is dropped.
pub fn watch(
    pgid: Pid,
    meter: Meter,
    deadline: Option<Instant>,
    memory_limit: Option<u64>,
    done: Receiver<()>,
) -> Watch {
    let mut ans = Watch::default();
    loop {
        match done.recv_timeout(WATCH_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                debug!(%pgid, "real time limit exceeded");
                ans.timed_out = true;
                let _ = send_group_signal(pgid, Signal::SIGKILL);
                break;
            }
        }

        if let Ok(rss) = meter.resident_memory(pgid) {
            ans.peak_memory = ans.peak_memory.max(rss);
        }

        let over_limit = memory_limit.map_or(false, |limit| ans.peak_memory > limit);
        if over_limit || meter.oom_killed() {
            debug!(%pgid, peak = ans.peak_memory, ?memory_limit, "memory limit exceeded");
            ans.memory_exceeded = true;
            let _ = send_group_signal(pgid, Signal::SIGKILL);
            break;
        }
    }
    ans
}

/// Sums the resident memory of every process whose group is `pgid`.
pub fn group_resident_memory(pgid: Pid) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let pid = match entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) {
            Some(pid) => Pid::from_raw(pid),
            None => continue,
        };
        // processes may exit while we scan
        if process_group(pid).ok() == Some(pgid) {
            total += resident_memory(pid).unwrap_or(0);
        }
    }
    Ok(total)
}

/// Field 5 of `/proc/<pid>/stat`. The command name may contain spaces, so
/// fields are counted from its closing parenthesis.
fn process_group(pid: Pid) -> io::Result<Pid> {
    let content = fs::read_to_string(format!("/proc/{}/stat", pid))?;
    let rest = content
        .rfind(')')
        .map(|i| &content[i + 1..])
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed stat"))?;
    rest.split_whitespace()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .map(Pid::from_raw)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed stat"))
}

/// Resident set size in bytes, from `/proc/<pid>/statm`.
pub fn resident_memory(pid: Pid) -> io::Result<u64> {
    let content = fs::read_to_string(format!("/proc/{}/statm", pid))?;
    let pages: u64 = content
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed statm"))?;
    Ok(pages * page_size())
}

fn page_size() -> u64 {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret > 0 {
        ret as u64
    } else {
        4096
    }
}

pub fn wait4(pid: Pid) -> io::Result<(i32, libc::rusage)> {
    let pid = pid.as_raw();
    let mut status: i32 = 0;
    let mut rusage: MaybeUninit<libc::rusage> = MaybeUninit::zeroed();

    loop {
        let ret = unsafe { libc::wait4(pid, &mut status, 0, rusage.as_mut_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        debug!("wait4 ret = {}, status = {}", ret, status);

        if ret > 0 {
            break;
        }
    }

    unsafe { Ok((status, rusage.assume_init())) }
}

pub fn timeval_to_ms(tv: libc::timeval) -> u64 {
    (tv.tv_sec as u64) * 1000 + (tv.tv_usec as u64) / 1000
}
