use super::*;

use obi_protocol::common::Language as Lang;

use std::path::PathBuf;

pub struct Pascal {
    pub fpc: PathBuf,
}

impl Language for Pascal {
    fn lang(&self) -> Lang {
        Lang::Pascal
    }

    fn toolchain(&self) -> &Path {
        &self.fpc
    }

    fn needs_compile(&self) -> bool {
        true
    }

    fn src_name(&self) -> &str {
        "src.pas"
    }

    fn compile(&self, workspace: &Path, hard_limit: &Limit) -> Result<SandboxOutput> {
        let mut cmd = base_cmd(&self.fpc);

        cmd.arg("-O2");
        cmd.arg("-Sg"); // allow goto
        cmd.arg("-XS"); // static
        cmd.arg("-vw"); // warnings and errors only
        cmd.arg("-osrc");
        cmd.arg(self.src_name());

        // fpc reports errors on stdout
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
        let cmd = base_cmd(&workspace.join("src"));
        sandbox_exec(workspace, cmd, stdin, stdout, stderr, hard_limit)
    }
}
