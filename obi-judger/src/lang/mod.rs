pub mod c_cpp;
pub mod java;
pub mod pascal;
pub mod python;

use obi_sandbox::{Isolation, SandboxArgs, SandboxOutput};
use obi_utils::math::{roundup_div, MIB};
use obi_utils::os_cmd::OsCmd;

use std::path::Path;

use anyhow::Result;
use tracing::debug;

/// File names inside a work directory.
pub const COMPILE_STDOUT: &str = "compile.out";
pub const COMPILE_STDERR: &str = "compile.err";

/// Virtual memory granted above the submission's limit when the address
/// space is capped.
const ADDRESS_SPACE_SLACK: u64 = 16 * MIB;

pub trait Language: Send + Sync {
    fn lang(&self) -> obi_protocol::common::Language;

    fn toolchain(&self) -> &Path;

    fn needs_compile(&self) -> bool;
    fn src_name(&self) -> &str;

    /// Writes extra files the run step needs.
    fn prepare(&self, _workspace: &Path) -> Result<()> {
        Ok(())
    }

    fn compile(&self, workspace: &Path, hard_limit: &Limit) -> Result<SandboxOutput> {
        let _ = (workspace, hard_limit);
        anyhow::bail!("{} has no compile step", self.lang())
    }

    fn run(
        &self,
        workspace: &Path,
        stdin: &Path,
        stdout: &Path,
        stderr: &Path,
        hard_limit: &Limit,
    ) -> Result<SandboxOutput>;

    /// Memory the runtime needs on top of the submission's limit.
    fn memory_overhead(&self) -> u64 {
        0
    }

    /// Managed runtimes reserve far more virtual memory than they touch.
    fn limits_address_space(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct Limit {
    pub real_time: u64, // milliseconds
    pub cpu_time: u64,  // milliseconds
    pub memory: u64,    // bytes, whole process tree
    pub output: u64,    // bytes
    pub pids: Option<u64>,
    pub address_space: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub isolation: Isolation,
}

fn sandbox_exec(
    workspace: &Path,
    cmd: OsCmd,
    stdin: &Path,
    stdout: &Path,
    stderr: &Path,
    hard_limit: &Limit,
) -> Result<SandboxOutput> {
    let rlimit_as = if hard_limit.address_space {
        Some(hard_limit.memory + ADDRESS_SPACE_SLACK)
    } else {
        None
    };

    let args = SandboxArgs {
        bin: cmd.bin,
        args: cmd.args,
        env: cmd.env,
        work_dir: workspace.to_owned(),
        stdin: Some(workspace.join(stdin)),
        stdout: Some(workspace.join(stdout)),
        stderr: Some(workspace.join(stderr)),
        uid: hard_limit.uid,
        gid: hard_limit.gid,
        real_time_limit: Some(hard_limit.real_time),
        memory_limit: Some(hard_limit.memory),
        rlimit_cpu: Some(roundup_div(hard_limit.cpu_time, 1000) + 1),
        rlimit_as,
        rlimit_data: rlimit_as,
        rlimit_fsize: Some(hard_limit.output),
        // counted per user, so only meaningful for a dedicated one
        rlimit_nproc: hard_limit.uid.and(hard_limit.pids),
        pids_limit: hard_limit.pids,
        isolation: hard_limit.isolation.clone(),
    };

    debug!("sandbox exec: {:?}", args);
    obi_sandbox::run_bounded(&args)
}

/// Environment every sandboxed process starts from.
fn base_cmd(bin: &Path) -> OsCmd {
    let mut cmd = OsCmd::new(bin);
    cmd.add_env("PATH", "/usr/local/bin:/usr/bin:/bin");
    cmd.add_env("LANG", "C.UTF-8");
    cmd
}
