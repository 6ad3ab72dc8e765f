use crate::config::{self, Config};
use crate::lang::{Language, Limit, COMPILE_STDERR, COMPILE_STDOUT};

use obi_protocol::common::{ExecutionResult, Outcome, Submission, SubmissionId, TestCase};
use obi_sandbox::{Isolation, SandboxArgs, SandboxOutput};
use obi_utils::math::MIB;

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use nix::unistd::{self, Gid, Uid};
use tracing::{debug, info, warn};

const WORKDIR_PREFIX: &str = "sub-";

const INPUT_NAME: &str = "input";
const OUTPUT_NAME: &str = "output";
const ERROR_NAME: &str = "error";

/// Messages printed by runtimes that failed to allocate.
const ALLOC_FAILURES: &[&str] = &["std::bad_alloc", "MemoryError", "OutOfMemoryError"];

pub struct Executor {
    config: config::Executor,
    isolation: Isolation,
}

/// A per-submission directory, removed when dropped.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %err, "failed to remove work directory");
            }
        }
    }
}

impl Executor {
    pub fn new(config: &Config) -> Result<Self> {
        let workspace_root = &config.executor.workspace_root;
        if !workspace_root.exists() {
            fs::create_dir_all(workspace_root).with_context(|| {
                format!(
                    "failed to create workspace root: {}",
                    workspace_root.display()
                )
            })?;
        }
        let mut this = Self {
            config: config.executor.clone(),
            isolation: Isolation::default(),
        };
        this.sweep_stale()?;
        this.isolation = this.detect_isolation();
        info!(isolation = ?this.isolation, "sandbox isolation");
        Ok(this)
    }

    pub fn isolation(&self) -> &Isolation {
        &self.isolation
    }

    /// Keeps each configured confinement that works on this host.
    fn detect_isolation(&self) -> Isolation {
        let config = &self.config;
        let mut isolation = Isolation::default();

        if config.cgroup {
            match obi_sandbox::check_cgroup(&config.cgroup_root) {
                Ok(()) => isolation.cgroup_root = Some(config.cgroup_root.clone()),
                Err(err) => warn!(?err, "cgroups are unavailable, falling back to process groups"),
            }
        }

        if config.seccomp {
            let candidate = Isolation {
                seccomp: true,
                ..Isolation::default()
            };
            if self.try_isolation(&candidate) {
                isolation.seccomp = true;
            } else {
                warn!("seccomp is unavailable");
            }
        }

        if config.namespaces {
            let candidate = Isolation {
                unshare_network: true,
                hide_siblings: true,
                hidden_paths: config.hidden_paths.clone(),
                ..Isolation::default()
            };
            if self.try_isolation(&candidate) {
                isolation.unshare_network = true;
                isolation.hide_siblings = true;
                isolation.hidden_paths = candidate.hidden_paths;
            } else {
                warn!("namespaces are unavailable");
            }
        }

        isolation
    }

    fn try_isolation(&self, isolation: &Isolation) -> bool {
        let bin = match which::which("true") {
            Ok(bin) => bin,
            Err(err) => {
                warn!(%err, "cannot check the sandbox without `true`");
                return false;
            }
        };
        let work = match self.create_workspace(SubmissionId::new()) {
            Ok(work) => work,
            Err(err) => {
                warn!(?err, "failed to create trial directory");
                return false;
            }
        };
        let args = SandboxArgs {
            bin,
            work_dir: work.path().to_owned(),
            uid: self.config.uid,
            gid: self.config.gid,
            real_time_limit: Some(5000),
            isolation: isolation.clone(),
            ..SandboxArgs::default()
        };
        match obi_sandbox::run_bounded(&args) {
            Ok(output) if output.is_success() => true,
            Ok(output) => {
                debug!(?output, ?isolation, "confinement check failed");
                false
            }
            Err(err) => {
                debug!(?err, ?isolation, "confinement check failed");
                false
            }
        }
    }

    /// Removes work directories left behind by a crashed process.
    fn sweep_stale(&self) -> Result<()> {
        for entry in fs::read_dir(&self.config.workspace_root)? {
            let entry = entry?;
            let name = entry.file_name();
            let is_workdir = name
                .to_str()
                .map_or(false, |s| s.starts_with(WORKDIR_PREFIX));
            if is_workdir && entry.file_type()?.is_dir() {
                warn!(path = %entry.path().display(), "removing stale work directory");
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }

    pub fn create_workspace(&self, id: SubmissionId) -> Result<WorkDir> {
        let path = self
            .config
            .workspace_root
            .join(format!("{}{}", WORKDIR_PREFIX, id));
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir(&path)
            .with_context(|| format!("failed to create work directory: {}", path.display()))?;
        let work = WorkDir { path };

        if self.config.uid.is_some() || self.config.gid.is_some() {
            let uid = self.config.uid.map(Uid::from_raw);
            let gid = self.config.gid.map(Gid::from_raw);
            unistd::chown(work.path(), uid, gid)?;
        }

        Ok(work)
    }

    fn limit(&self, adapter: &dyn Language, time_limit: u64, memory: u64) -> Limit {
        Limit {
            real_time: time_limit + self.config.wall_grace,
            cpu_time: time_limit,
            memory,
            output: self.config.output_limit.as_u64(),
            pids: self.config.pids,
            address_space: adapter.limits_address_space(),
            uid: self.config.uid,
            gid: self.config.gid,
            isolation: self.isolation.clone(),
        }
    }

    /// Writes the source into `work` and compiles it if the language needs
    /// it. `Ok` carries either `Outcome::Ok` or `Outcome::CompileError`.
    #[tracing::instrument(skip_all, fields(language = %adapter.lang()))]
    pub fn compile(
        &self,
        work: &WorkDir,
        adapter: &dyn Language,
        source: &str,
    ) -> Result<ExecutionResult> {
        let src_path = work.path().join(adapter.src_name());
        fs::write(&src_path, source)
            .with_context(|| format!("failed to write source: {}", src_path.display()))?;

        adapter.prepare(work.path())?;

        if !adapter.needs_compile() {
            return Ok(empty_result(Outcome::Ok));
        }

        let limit = Limit {
            real_time: self.config.compile_time_limit,
            cpu_time: self.config.compile_time_limit,
            memory: self.config.compile_memory.as_u64(),
            ..self.limit(adapter, 0, 0)
        };

        let output = adapter.compile(work.path(), &limit)?;
        debug!(?output, "compiled");

        let retention = self.config.stderr_retention.as_u64() as usize;
        let mut message = read_truncated(&work.path().join(COMPILE_STDERR), retention)?;
        if message.len() < retention {
            let rest = read_truncated(
                &work.path().join(COMPILE_STDOUT),
                retention - message.len(),
            )?;
            message.push_str(&rest);
        }

        let outcome = if output.is_success() && !output.timed_out {
            Outcome::Ok
        } else {
            Outcome::CompileError
        };

        Ok(ExecutionResult {
            stderr: message,
            ..to_result(&output, outcome)
        })
    }

    /// Runs one test case. Internal failures are reported as
    /// `Outcome::InternalError`; a start failure is retried once.
    #[tracing::instrument(skip_all, fields(case = test_case.position))]
    pub fn run_one_test_case(
        &self,
        work: &WorkDir,
        submission: &Submission,
        test_case: &TestCase,
        adapter: &dyn Language,
    ) -> ExecutionResult {
        let mut last_err = None;
        for attempt in 0..2 {
            match self.try_run(work, submission, test_case, adapter) {
                Ok(result) => return result,
                Err(err) => {
                    warn!(attempt, ?err, "failed to run test case");
                    last_err = Some(err);
                }
            }
        }
        let message = last_err.map(|e| format!("{:#}", e)).unwrap_or_default();
        ExecutionResult::internal_error(message)
    }

    fn try_run(
        &self,
        work: &WorkDir,
        submission: &Submission,
        test_case: &TestCase,
        adapter: &dyn Language,
    ) -> Result<ExecutionResult> {
        let dir = work.path();
        fs::write(dir.join(INPUT_NAME), &test_case.input).context("failed to write input")?;

        let memory = submission.memory_limit * MIB;
        let limit = self.limit(adapter, submission.time_limit, memory);

        let output = adapter.run(
            dir,
            Path::new(INPUT_NAME),
            Path::new(OUTPUT_NAME),
            Path::new(ERROR_NAME),
            &limit,
        )?;
        debug!(?output, "ran");

        let retention = self.config.stderr_retention.as_u64() as usize;
        let stderr = read_truncated(&dir.join(ERROR_NAME), retention)?;
        let stdout = fs::read(dir.join(OUTPUT_NAME)).context("failed to read output")?;

        let ceiling = memory + adapter.memory_overhead();
        let outcome = classify(&output, &limit, ceiling, &stderr);

        Ok(ExecutionResult {
            stdout,
            stderr,
            ..to_result(&output, outcome)
        })
    }
}

/// Maps what the sandbox observed to an outcome. Output is compared later.
pub fn classify(output: &SandboxOutput, limit: &Limit, ceiling: u64, stderr: &str) -> Outcome {
    let cpu_exceeded = output.cpu_time > limit.cpu_time;
    if output.timed_out || output.signal == libc::SIGXCPU || cpu_exceeded {
        return Outcome::TimeLimit;
    }

    let peak_exceeded = output.memory * 1024 > ceiling;
    let alloc_failed = !output.is_success() && ALLOC_FAILURES.iter().any(|s| stderr.contains(s));
    if output.memory_exceeded || peak_exceeded || alloc_failed {
        return Outcome::MemoryLimit;
    }

    if !output.is_success() {
        return Outcome::RuntimeError;
    }

    Outcome::Ok
}

fn to_result(output: &SandboxOutput, outcome: Outcome) -> ExecutionResult {
    let signaled = output.is_signaled();
    ExecutionResult {
        outcome,
        exit_code: if signaled { None } else { Some(output.code) },
        signal: if signaled { Some(output.signal) } else { None },
        time: output.cpu_time,
        real_time: output.real_time,
        memory: output.memory,
        stdout: Vec::new(),
        stderr: String::new(),
    }
}

fn empty_result(outcome: Outcome) -> ExecutionResult {
    ExecutionResult {
        outcome,
        exit_code: Some(0),
        signal: None,
        time: 0,
        real_time: 0,
        memory: 0,
        stdout: Vec::new(),
        stderr: String::new(),
    }
}

/// Reads at most `limit` bytes, lossily decoded. A missing file is empty.
fn read_truncated(path: &Path, limit: usize) -> Result<String> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
        Err(err) => return Err(err.into()),
    };
    let mut buf = Vec::with_capacity(limit.min(64 * 1024));
    file.take(limit as u64).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(status: i32, cpu_time: u64, memory: u64) -> SandboxOutput {
        SandboxOutput {
            code: libc::WEXITSTATUS(status),
            signal: if libc::WIFSIGNALED(status) {
                libc::WTERMSIG(status)
            } else {
                0
            },
            status,
            real_time: cpu_time,
            sys_time: 0,
            user_time: cpu_time,
            cpu_time,
            memory,
            timed_out: false,
            memory_exceeded: false,
        }
    }

    fn limit() -> Limit {
        Limit {
            real_time: 1000,
            cpu_time: 1000,
            memory: 64 * MIB,
            output: MIB,
            pids: None,
            address_space: true,
            uid: None,
            gid: None,
            isolation: Isolation::default(),
        }
    }

    const EXIT_0: i32 = 0;
    const EXIT_1: i32 = 1 << 8;
    const KILLED: i32 = libc::SIGKILL;

    #[test]
    fn classification() {
        let l = limit();
        let ceiling = l.memory;

        assert_eq!(classify(&output(EXIT_0, 10, 1024), &l, ceiling, ""), Outcome::Ok);
        assert_eq!(
            classify(&output(EXIT_1, 10, 1024), &l, ceiling, ""),
            Outcome::RuntimeError
        );
        assert_eq!(
            classify(&output(EXIT_0, 1500, 1024), &l, ceiling, ""),
            Outcome::TimeLimit
        );
        assert_eq!(
            classify(&output(libc::SIGXCPU, 900, 1024), &l, ceiling, ""),
            Outcome::TimeLimit
        );

        let mut timed_out = output(KILLED, 20, 1024);
        timed_out.timed_out = true;
        assert_eq!(classify(&timed_out, &l, ceiling, ""), Outcome::TimeLimit);

        let mut oom = output(KILLED, 20, 1024);
        oom.memory_exceeded = true;
        assert_eq!(classify(&oom, &l, ceiling, ""), Outcome::MemoryLimit);

        assert_eq!(
            classify(&output(EXIT_0, 10, 70 * 1024), &l, ceiling, ""),
            Outcome::MemoryLimit
        );
    }

    #[test]
    fn allocation_failure_is_memory_limit() {
        let l = limit();
        let stderr = "terminate called after throwing an instance of 'std::bad_alloc'";
        assert_eq!(
            classify(&output(libc::SIGABRT, 10, 1024), &l, l.memory, stderr),
            Outcome::MemoryLimit
        );
        assert_eq!(
            classify(&output(EXIT_1, 10, 1024), &l, l.memory, "MemoryError"),
            Outcome::MemoryLimit
        );
        // a clean exit that merely prints the word is fine
        assert_eq!(
            classify(&output(EXIT_0, 10, 1024), &l, l.memory, "MemoryError"),
            Outcome::Ok
        );
    }

    #[test]
    fn stale_workdirs_are_swept() -> Result<()> {
        let root = tempfile::tempdir()?;
        let stale = root.path().join(format!("{}{}", WORKDIR_PREFIX, SubmissionId::new()));
        fs::create_dir(&stale)?;
        fs::write(stale.join("src.c"), "int main(){}")?;
        let unrelated = root.path().join("keep-me");
        fs::create_dir(&unrelated)?;

        let mut config = Config::default();
        config.executor.workspace_root = root.path().to_owned();
        let _executor = Executor::new(&config)?;

        assert!(!stale.exists());
        assert!(unrelated.exists());
        Ok(())
    }

    #[test]
    fn workdir_is_removed_on_drop() -> Result<()> {
        let root = tempfile::tempdir()?;
        let mut config = Config::default();
        config.executor.workspace_root = root.path().to_owned();
        let executor = Executor::new(&config)?;

        let work = executor.create_workspace(SubmissionId::new())?;
        let path = work.path().to_owned();
        fs::write(path.join("x"), "y")?;
        assert!(path.is_dir());
        drop(work);
        assert!(!path.exists());
        Ok(())
    }

    /// Reports success but leaves no output file behind.
    struct Vanishing(PathBuf);

    impl Language for Vanishing {
        fn lang(&self) -> obi_protocol::common::Language {
            obi_protocol::common::Language::Python3
        }

        fn toolchain(&self) -> &Path {
            &self.0
        }

        fn needs_compile(&self) -> bool {
            false
        }

        fn src_name(&self) -> &str {
            "src.py"
        }

        fn run(
            &self,
            workspace: &Path,
            _stdin: &Path,
            stdout: &Path,
            _stderr: &Path,
            _hard_limit: &Limit,
        ) -> Result<SandboxOutput> {
            let path = workspace.join(stdout);
            if path.exists() {
                fs::remove_file(path)?;
            }
            Ok(output(EXIT_0, 10, 1024))
        }
    }

    #[test]
    fn unreadable_output_is_internal_error() -> Result<()> {
        let root = tempfile::tempdir()?;
        let mut config = Config::default();
        config.executor.workspace_root = root.path().to_owned();
        let executor = Executor::new(&config)?;

        let submission = Submission::new(
            obi_protocol::common::Language::Python3,
            "print(3)",
            "p",
            1000,
            64,
        );
        let test_case = TestCase {
            position: 0,
            input: Vec::new(),
            output: Vec::new(),
        };
        let work = executor.create_workspace(submission.id)?;
        let adapter = Vanishing(PathBuf::from("/bin/true"));

        let result = executor.run_one_test_case(&work, &submission, &test_case, &adapter);
        assert_eq!(result.outcome, Outcome::InternalError);
        assert!(result.stderr.contains("failed to read output"), "{}", result.stderr);
        Ok(())
    }

    #[test]
    fn disabled_confinement_is_skipped() -> Result<()> {
        let root = tempfile::tempdir()?;
        let mut config = Config::default();
        config.executor.workspace_root = root.path().to_owned();
        config.executor.cgroup = false;
        config.executor.seccomp = false;
        config.executor.namespaces = false;
        let executor = Executor::new(&config)?;

        let isolation = executor.isolation();
        assert!(isolation.cgroup_root.is_none());
        assert!(!isolation.seccomp);
        assert!(!isolation.unshare_network && !isolation.hide_siblings);
        // no trial runs, so nothing is left behind
        assert_eq!(fs::read_dir(root.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn truncation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("err");
        fs::write(&path, "0123456789")?;
        assert_eq!(read_truncated(&path, 4)?, "0123");
        assert_eq!(read_truncated(&dir.path().join("missing"), 4)?, "");
        Ok(())
    }
}
