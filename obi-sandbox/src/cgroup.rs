use crate::signal::{kill_pids, reap_pids};

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write as _};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::{self, Pid};
use tracing::{debug, warn};

const GROUP_NAME: &str = "obi-sandbox";

const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared parents may be created by a concurrent run.
fn ensure_cgroup(dir: &Path) -> Result<()> {
    match unistd::mkdir(dir, Mode::from_bits_truncate(0o755)) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(err) => Err(err)
            .with_context(|| format!("failed to create cgroup directory: {}", dir.display())),
    }
}

fn write_cgroup(dir: &Path, file: &str, content: impl std::fmt::Display) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(dir.join(file))?;
    write!(file, "{}", content)?;
    Ok(())
}

fn read_cgroup<T>(dir: &Path, file: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let content = fs::read_to_string(dir.join(file))?;
    Ok(content.trim_end().parse::<T>()?)
}

/// Looks up `key` in a flat keyed file such as `memory.stat`.
fn read_keyed(dir: &Path, file: &str, key: &str) -> Result<Option<u64>> {
    let content = fs::read_to_string(dir.join(file))?;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some(key) {
            if let Some(value) = parts.next() {
                return Ok(Some(value.parse()?));
            }
        }
    }
    Ok(None)
}

fn remove_cgroup(dir: &Path) {
    if let Err(err) = fs::remove_dir(dir) {
        warn!("failed to remove cgroup: {}, path = {}", err, dir.display());
    }
}

/// The cgroup this process lives in, relative to the hierarchy root.
/// `None` selects the unified hierarchy.
fn own_cgroup(controller: Option<&str>) -> Result<PathBuf> {
    let content = fs::read_to_string("/proc/self/cgroup")?;
    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        let (controllers, path) = match (parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(controllers), Some(path)) => (controllers, path),
            _ => continue,
        };
        let matched = match controller {
            Some(c) => controllers.split(',').any(|x| x == c),
            None => controllers.is_empty(),
        };
        if matched {
            return Ok(PathBuf::from(path.trim_start_matches('/')));
        }
    }
    anyhow::bail!("no cgroup entry for {:?}", controller)
}

/// Where per-run groups are created: below our own group when it is
/// visible, at the hierarchy root otherwise.
fn parent_dir(hierarchy: &Path, controller: Option<&str>) -> PathBuf {
    let own = own_cgroup(controller).map(|p| hierarchy.join(p));
    let base = match own {
        Ok(dir) if dir.is_dir() => dir,
        _ => hierarchy.to_owned(),
    };
    base.join(GROUP_NAME)
}

#[derive(Debug)]
pub struct Statistics {
    pub sys_time: u64,  // milliseconds
    pub user_time: u64, // milliseconds
    pub oom_killed: bool,
}

/// A control group created for one run and removed on drop.
///
/// On the unified hierarchy `cpu`, `memory` and `pids` name the same
/// directory.
#[derive(Debug)]
pub struct Cgroup {
    unified: bool,
    cg_cpu: PathBuf,
    cg_memory: PathBuf,
    cg_pids: PathBuf,
    created: Vec<PathBuf>,
    procs: Vec<File>,
}

impl Cgroup {
    pub fn new(root: &Path, nonce: u32) -> Result<Self> {
        debug!("cgroup nonce = {}", nonce);
        let mut cg = Self {
            unified: root.join("cgroup.controllers").exists(),
            cg_cpu: PathBuf::new(),
            cg_memory: PathBuf::new(),
            cg_pids: PathBuf::new(),
            created: Vec::new(),
            procs: Vec::new(),
        };

        if cg.unified {
            let parent = parent_dir(root, None);
            ensure_cgroup(&parent)?;
            write_cgroup(&parent, "cgroup.subtree_control", "+memory +pids")
                .context("failed to enable memory and pids controllers")?;
            let dir = cg.create(parent.join(nonce.to_string()))?;
            cg.cg_cpu = dir.clone();
            cg.cg_memory = dir.clone();
            cg.cg_pids = dir;
        } else {
            cg.cg_cpu = cg.create_in(root, "cpuacct", nonce)?;
            cg.cg_memory = cg.create_in(root, "memory", nonce)?;
            cg.cg_pids = cg.create_in(root, "pids", nonce)?;
        }

        let mut dirs = vec![cg.cg_cpu.clone()];
        if !cg.unified {
            dirs.push(cg.cg_memory.clone());
            dirs.push(cg.cg_pids.clone());
        }
        for dir in dirs {
            let path = dir.join("cgroup.procs");
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            cg.procs.push(file);
        }

        Ok(cg)
    }

    fn create(&mut self, dir: PathBuf) -> Result<PathBuf> {
        unistd::mkdir(&dir, Mode::from_bits_truncate(0o755))
            .with_context(|| format!("failed to create cgroup directory: {}", dir.display()))?;
        self.created.push(dir.clone());
        Ok(dir)
    }

    fn create_in(&mut self, root: &Path, controller: &str, nonce: u32) -> Result<PathBuf> {
        let parent = parent_dir(&root.join(controller), Some(controller));
        ensure_cgroup(&parent)?;
        self.create(parent.join(nonce.to_string()))
    }

    /// Handles the child writes "0" into to join every hierarchy before
    /// exec. They are close-on-exec.
    pub fn procs_fds(&self) -> Vec<RawFd> {
        self.procs.iter().map(|f| f.as_raw_fd()).collect()
    }

    pub fn set_limits(&self, memory: Option<u64>, pids: Option<u64>) -> Result<()> {
        if let Some(bytes) = memory {
            if self.unified {
                write_cgroup(&self.cg_memory, "memory.max", bytes)
                    .context("failed to set memory limit")?;
                let _ = write_cgroup(&self.cg_memory, "memory.swap.max", 0);
            } else {
                write_cgroup(&self.cg_memory, "memory.limit_in_bytes", bytes)
                    .context("failed to set memory limit")?;
                // absent when swap accounting is off
                let _ = write_cgroup(&self.cg_memory, "memory.memsw.limit_in_bytes", bytes);
            }
        }

        if let Some(n) = pids {
            write_cgroup(&self.cg_pids, "pids.max", n).context("failed to set max pids limit")?;
        }

        Ok(())
    }

    pub fn procs(&self) -> Result<Vec<Pid>> {
        let content = fs::read_to_string(self.cg_pids.join("cgroup.procs"))
            .context("failed to read cgroup procs")?;
        let mut pids = Vec::new();
        for t in content.split('\n') {
            if !t.is_empty() {
                pids.push(Pid::from_raw(t.parse::<i32>()?));
            }
        }
        Ok(pids)
    }

    /// Anonymous memory charged to the group, in bytes.
    pub fn resident_memory(&self) -> Result<u64> {
        let value = if self.unified {
            read_keyed(&self.cg_memory, "memory.stat", "anon")?
        } else {
            match read_keyed(&self.cg_memory, "memory.stat", "total_rss")? {
                Some(v) => Some(v),
                None => read_keyed(&self.cg_memory, "memory.stat", "rss")?,
            }
        };
        Ok(value.unwrap_or(0))
    }

    pub fn oom_killed(&self) -> Result<bool> {
        let file = if self.unified {
            "memory.events"
        } else {
            "memory.oom_control"
        };
        let count = read_keyed(&self.cg_memory, file, "oom_kill")?;
        Ok(count.map_or(false, |n| n > 0))
    }

    /// Kills every process in the group, including the ones that left the
    /// process group, and reaps those re-parented to us.
    pub fn killall(&self) {
        if self.unified && write_cgroup(&self.cg_pids, "cgroup.kill", 1).is_ok() {
            debug!("cgroup.kill written");
        }

        let mut seen = Vec::new();
        let t0 = Instant::now();
        loop {
            let pids = match self.procs() {
                Ok(pids) => pids,
                Err(err) => {
                    warn!(?err, "failed to list cgroup members");
                    break;
                }
            };
            if pids.is_empty() {
                break;
            }

            kill_pids(&pids);
            seen.extend_from_slice(&pids);

            if t0.elapsed() > REAP_TIMEOUT {
                warn!(count = pids.len(), "cgroup is still populated after SIGKILL");
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        // zombies leave cgroup.procs before they are reaped
        seen.sort_unstable();
        seen.dedup();
        reap_pids(&seen);
    }

    pub fn collect_statistics(&self) -> Result<Statistics> {
        let (sys_time, user_time) = if self.unified {
            let sys = read_keyed(&self.cg_cpu, "cpu.stat", "system_usec")?.unwrap_or(0);
            let user = read_keyed(&self.cg_cpu, "cpu.stat", "user_usec")?.unwrap_or(0);
            (sys / 1000, user / 1000) // us => ms
        } else {
            let sys = read_cgroup::<u64>(&self.cg_cpu, "cpuacct.usage_sys")?;
            let user = read_cgroup::<u64>(&self.cg_cpu, "cpuacct.usage_user")?;
            (sys / 1_000_000, user / 1_000_000) // ns => ms
        };
        let oom_killed = self.oom_killed()?;

        debug!("sys_time  = {:?} ms", sys_time);
        debug!("user_time = {:?} ms", user_time);
        debug!("oom_killed = {}", oom_killed);

        Ok(Statistics {
            sys_time,
            user_time,
            oom_killed,
        })
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        self.procs.clear();
        for dir in self.created.iter().rev() {
            remove_cgroup(dir);
        }
    }
}

/// Creates and removes a throwaway group under `root`.
pub fn check_cgroup(root: &Path) -> Result<()> {
    let cg = Cgroup::new(root, rand::random())?;
    cg.set_limits(Some(64 << 20), Some(8))?;
    cg.collect_statistics()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_lookup() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join("memory.stat"),
            "cache 4096\nrss 8192\ntotal_rss 12288\n",
        )?;
        assert_eq!(read_keyed(dir.path(), "memory.stat", "rss")?, Some(8192));
        assert_eq!(read_keyed(dir.path(), "memory.stat", "total_rss")?, Some(12288));
        assert_eq!(read_keyed(dir.path(), "memory.stat", "anon")?, None);
        Ok(())
    }

    #[test]
    fn own_cgroup_is_relative() -> Result<()> {
        if !Path::new("/proc/self/cgroup").exists() {
            return Ok(());
        }
        let content = fs::read_to_string("/proc/self/cgroup")?;
        if content.lines().any(|l| l.starts_with("0::")) {
            assert!(own_cgroup(None)?.is_relative());
        }
        Ok(())
    }
}
