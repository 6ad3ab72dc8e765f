use super::*;

use obi_protocol::common::Language as Lang;

use std::path::PathBuf;

pub struct Python {
    pub python: PathBuf,
    pub version: PythonVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PythonVersion {
    V2,
    V3,
}

impl Language for Python {
    fn lang(&self) -> Lang {
        match self.version {
            PythonVersion::V2 => Lang::Python2,
            PythonVersion::V3 => Lang::Python3,
        }
    }

    fn toolchain(&self) -> &Path {
        &self.python
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
        stdin: &Path,
        stdout: &Path,
        stderr: &Path,
        hard_limit: &Limit,
    ) -> Result<SandboxOutput> {
        let mut cmd = base_cmd(&self.python);

        cmd.arg("-B"); // no .pyc
        cmd.arg("-E"); // ignore PYTHON* variables
        cmd.arg("-S"); // no site-packages
        cmd.arg(self.src_name());

        sandbox_exec(workspace, cmd, stdin, stdout, stderr, hard_limit)
    }
}
