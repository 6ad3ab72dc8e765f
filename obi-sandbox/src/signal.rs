use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

const REAP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn send_group_signal(pgid: Pid, signal: Signal) -> nix::Result<()> {
    let result = signal::killpg(pgid, signal);
    debug!(
        "killpg pgid = {}, signal = {}, result = {:?}",
        pgid, signal, result
    );
    result
}

fn group_is_empty(pgid: Pid) -> bool {
    matches!(signal::killpg(pgid, None), Err(Errno::ESRCH))
}

/// SIGKILLs each pid, then reaps the ones that are our children.
pub fn kill_pids(pids: &[Pid]) {
    for &pid in pids {
        let _ = signal::kill(pid, Signal::SIGKILL);
    }
    reap_pids(pids);
}

pub fn reap_pids(pids: &[Pid]) {
    for &pid in pids {
        let _ = wait::waitpid(pid, Some(WaitPidFlag::WNOHANG));
    }
}

/// Kills every process in the group and reaps the ones re-parented to us.
/// Returns when no member of the group is left or after a bounded wait.
pub fn kill_group(pgid: Pid) {
    let _ = send_group_signal(pgid, Signal::SIGSTOP);
    let _ = send_group_signal(pgid, Signal::SIGKILL);

    let any_in_group = Pid::from_raw(-pgid.as_raw());
    let t0 = Instant::now();
    loop {
        loop {
            match wait::waitpid(any_in_group, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(_) => continue,
            }
        }

        if group_is_empty(pgid) {
            break;
        }

        if t0.elapsed() > REAP_TIMEOUT {
            warn!(%pgid, "process group is still alive after SIGKILL");
            break;
        }

        let _ = send_group_signal(pgid, Signal::SIGKILL);
        thread::sleep(Duration::from_millis(1));
    }
}
