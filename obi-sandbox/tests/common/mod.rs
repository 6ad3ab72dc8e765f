use std::sync::Once;

use obi_sandbox::{SandboxArgs, SandboxOutput};

use anyhow::Result;
use tracing::{debug, error, warn};

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn run(args: &SandboxArgs) -> Result<SandboxOutput> {
    debug!("sandbox args = {:?}", args);
    match obi_sandbox::run_bounded(args) {
        Ok(output) => {
            debug!("sandbox output = {:?}", output);
            Ok(output)
        }
        Err(err) => {
            error!("sandbox error:\n{:?}", err);
            Err(err)
        }
    }
}

pub fn sh(work_dir: &std::path::Path, script: &str) -> SandboxArgs {
    SandboxArgs {
        bin: "/bin/sh".into(),
        args: vec!["-c".into(), script.into()],
        env: vec![("PATH".into(), "/usr/bin:/bin".into())],
        work_dir: work_dir.into(),
        ..SandboxArgs::default()
    }
}

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

pub fn cgroup_root() -> Option<std::path::PathBuf> {
    let root = std::path::Path::new(CGROUP_ROOT);
    match obi_sandbox::check_cgroup(root) {
        Ok(()) => Some(root.to_owned()),
        Err(err) => {
            warn!("cgroup unavailable, skipped: {:?}", err);
            None
        }
    }
}

/// Whether namespaces and mounts can be set up here.
pub fn isolation_available() -> bool {
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(_) => return false,
    };
    let work_dir = dir.path().join("work");
    if std::fs::create_dir(&work_dir).is_err() {
        return false;
    }
    let mut args = sh(&work_dir, "true");
    args.isolation.unshare_network = true;
    args.isolation.hide_siblings = true;
    let ok = matches!(obi_sandbox::run_bounded(&args), Ok(ref output) if output.is_success());
    if !ok {
        warn!("namespaces unavailable, skipped");
    }
    ok
}

/// The interpreter behind `python3`, resolved through any shim.
pub fn python3() -> Option<std::path::PathBuf> {
    let output = std::process::Command::new("python3")
        .args(&["-c", "import sys; sys.stdout.write(sys.executable)"])
        .output()
        .ok()?;
    if !output.status.success() || output.stdout.is_empty() {
        warn!("python3 not found, skipped");
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned().into())
}

/// Gone or a zombie.
pub fn is_dead(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rfind(')')
            .and_then(|i| stat[i + 1..].split_whitespace().next())
            .map_or(true, |state| state == "Z"),
        Err(_) => true,
    }
}
