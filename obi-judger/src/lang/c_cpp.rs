use super::*;

use obi_protocol::common::Language as Lang;

use std::path::PathBuf;

#[derive(Debug, Clone, Copy)]
pub enum CCppStd {
    C11,
    Cpp17,
}

impl CCppStd {
    fn as_str_gnu(&self) -> &str {
        match self {
            CCppStd::C11 => "gnu11",
            CCppStd::Cpp17 => "gnu++17",
        }
    }

    fn is_cpp(&self) -> bool {
        matches!(self, CCppStd::Cpp17)
    }
}

pub struct CCpp {
    pub cc: PathBuf,
    pub std: CCppStd,
    pub o2: bool,
}

impl CCpp {
    fn exe_name(&self) -> &str {
        "src"
    }
}

impl Language for CCpp {
    fn lang(&self) -> Lang {
        if self.std.is_cpp() {
            Lang::Cpp
        } else {
            Lang::C
        }
    }

    fn toolchain(&self) -> &Path {
        &self.cc
    }

    fn needs_compile(&self) -> bool {
        true
    }

    fn src_name(&self) -> &str {
        if self.std.is_cpp() {
            "src.cpp"
        } else {
            "src.c"
        }
    }

    fn compile(&self, workspace: &Path, hard_limit: &Limit) -> Result<SandboxOutput> {
        let is_cpp = self.std.is_cpp();

        let mut cmd = base_cmd(&self.cc);

        cmd.arg(format!("-std={}", self.std.as_str_gnu()));
        cmd.arg_if(self.o2, "-O2");
        cmd.arg("-w");

        cmd.arg("-o").arg(self.exe_name());
        cmd.arg(self.src_name());

        // https://stackoverflow.com/questions/5419366/why-do-i-have-to-explicitly-link-with-libm
        cmd.arg_if(!is_cpp, "-lm");

        sandbox_exec(
            workspace,
            cmd,
            Path::new("/dev/null"),
            Path::new(COMPILE_STDOUT),
            Path::new(COMPILE_STDERR),
            hard_limit,
        )
    }

    fn run(
        &self,
        workspace: &Path,
        stdin: &Path,
        stdout: &Path,
        stderr: &Path,
        hard_limit: &Limit,
    ) -> Result<SandboxOutput> {
        let cmd = base_cmd(&workspace.join(self.exe_name()));
        sandbox_exec(workspace, cmd, stdin, stdout, stderr, hard_limit)
    }
}
