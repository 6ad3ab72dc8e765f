use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use ubyte::{ByteUnit, ToByteUnit};
use validator::Validate;

#[derive(Debug, Clone, Default, Validate, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[validate]
    pub engine: Engine,

    #[validate]
    pub executor: Executor,

    #[validate]
    pub toolchains: Toolchains,

    #[validate]
    pub java: Java,
}

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
#[serde(default)]
pub struct Engine {
    #[validate(range(min = 1, max = 256))]
    pub workers: usize,

    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,

    #[validate(range(max = 60000))]
    pub base_delay_ms: u64,

    #[validate(range(max = 600000))]
    pub max_delay_ms: u64,

    /// Final verdicts older than this are forgotten.
    pub retention_secs: u64,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            retention_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
#[serde(default)]
pub struct Executor {
    pub workspace_root: PathBuf,

    #[validate(range(min = 1000, max = 120000))]
    pub compile_time_limit: u64, // milliseconds

    pub compile_memory: ByteUnit,

    pub output_limit: ByteUnit,

    /// Tasks per run, threads included. Enforced by the run's cgroup, and
    /// by `RLIMIT_NPROC` as well when `uid` is set.
    pub pids: Option<u64>,

    #[validate(range(max = 10000))]
    pub wall_grace: u64, // milliseconds

    pub stderr_retention: ByteUnit,

    pub uid: Option<u32>,
    pub gid: Option<u32>,

    /// A fresh cgroup per run under this hierarchy. Disabled with a
    /// warning when it cannot be created.
    pub cgroup: bool,
    pub cgroup_root: PathBuf,

    pub seccomp: bool,

    /// Network and mount namespaces; hides other work directories.
    /// Disabled with a warning when unavailable.
    pub namespaces: bool,

    /// Replaced by an empty directory inside the sandbox.
    pub hidden_paths: Vec<PathBuf>,
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("obijudge"),
            compile_time_limit: 10000,
            compile_memory: 512.mebibytes(),
            output_limit: 64.mebibytes(),
            pids: Some(128),
            wall_grace: 0,
            stderr_retention: 4.kibibytes(),
            uid: None,
            gid: None,
            cgroup: true,
            cgroup_root: "/sys/fs/cgroup".into(),
            seccomp: true,
            namespaces: true,
            hidden_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
#[serde(default)]
pub struct Toolchains {
    pub gcc: PathBuf,
    pub gxx: PathBuf,
    pub fpc: PathBuf,
    pub python2: PathBuf,
    pub python3: PathBuf,
    pub javac: PathBuf,
    pub java: PathBuf,
}

impl Default for Toolchains {
    fn default() -> Self {
        Self {
            gcc: "gcc".into(),
            gxx: "g++".into(),
            fpc: "fpc".into(),
            python2: "python2".into(),
            python3: "python3".into(),
            javac: "javac".into(),
            java: "java".into(),
        }
    }
}

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
#[serde(default)]
pub struct Java {
    pub security_policy: bool,
    pub overhead: ByteUnit,
    pub stack_size: ByteUnit,
}

impl Default for Java {
    fn default() -> Self {
        Self {
            security_policy: true,
            overhead: 128.mebibytes(),
            stack_size: 64.mebibytes(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: path = {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_valid() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.engine.workers, 2);
        assert_eq!(config.executor.stderr_retention.as_u64(), 4096);
        assert!(config.java.security_policy);
        assert_eq!(config.engine.retention_secs, 3600);
        assert_eq!(config.executor.pids, Some(128));
        assert!(config.executor.seccomp);
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::from_toml(
            r#"
            [engine]
            workers = 8

            [executor]
            output_limit = "16 MiB"
            uid = 65534
            namespaces = false
            hidden_paths = ["/home"]

            [toolchains]
            python3 = "/opt/python/bin/python3"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.workers, 8);
        assert_eq!(config.engine.max_attempts, 3);
        assert_eq!(config.executor.output_limit.as_u64(), 16 << 20);
        assert_eq!(config.executor.uid, Some(65534));
        assert!(!config.executor.namespaces);
        assert_eq!(config.executor.hidden_paths, vec![PathBuf::from("/home")]);
        assert_eq!(config.toolchains.python3, Path::new("/opt/python/bin/python3"));
        assert_eq!(config.toolchains.gcc, Path::new("gcc"));
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert!(Config::from_toml("[engine]\nworkers = 0").is_err());
        assert!(Config::from_toml("[executor]\ncompile_time_limit = 10").is_err());
    }
}
