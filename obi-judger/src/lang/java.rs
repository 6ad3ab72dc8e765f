use super::*;

use obi_protocol::common::Language as Lang;
use obi_utils::math::KIB;

use std::fs;
use std::path::PathBuf;

use anyhow::Context as _;

pub const POLICY_NAME: &str = "java.policy";

pub struct Java {
    pub javac: PathBuf,
    pub java: PathBuf,
    pub security_policy: bool,
    pub overhead: u64,   // bytes
    pub stack_size: u64, // bytes
}

/// Read access to the work directory and nothing else: no sockets, no
/// reflection, no process creation.
fn policy(workspace: &Path) -> String {
    format!(
        "grant {{\n    permission java.io.FilePermission \"{}/-\", \"read\";\n}};\n",
        workspace.display()
    )
}

impl Language for Java {
    fn lang(&self) -> Lang {
        Lang::Java
    }

    fn toolchain(&self) -> &Path {
        &self.java
    }

    fn needs_compile(&self) -> bool {
        true
    }

    fn src_name(&self) -> &str {
        "Main.java"
    }

    fn prepare(&self, workspace: &Path) -> Result<()> {
        if self.security_policy {
            let path = workspace.join(POLICY_NAME);
            fs::write(&path, policy(workspace))
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        Ok(())
    }

    fn compile(&self, workspace: &Path, hard_limit: &Limit) -> Result<SandboxOutput> {
        let mut cmd = base_cmd(&self.javac);

        cmd.arg("-J-Xms64m");
        cmd.arg(format!("-J-Xmx{}m", hard_limit.memory / MIB));
        cmd.args(&["-encoding", "UTF-8", "-sourcepath", "."]);
        cmd.arg(self.src_name());

        // javac writes diagnostics to stdout
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
        let heap_mb = (hard_limit.memory / MIB).max(1);

        let mut cmd = base_cmd(&self.java);
        cmd.arg("-cp").arg(".");
        cmd.arg("-XX:+UseSerialGC");
        if self.security_policy {
            cmd.arg("-Djava.security.manager=default");
            cmd.arg(format!(
                "-Djava.security.policy=={}",
                workspace.join(POLICY_NAME).display()
            ));
        }
        cmd.arg(format!("-Xss{}k", self.stack_size / KIB));
        cmd.arg(format!("-Xms{}m", heap_mb.min(64)));
        cmd.arg(format!("-Xmx{}m", heap_mb));
        cmd.arg("Main");

        let os_limit = Limit {
            memory: hard_limit.memory + self.overhead,
            ..hard_limit.clone()
        };

        sandbox_exec(workspace, cmd, stdin, stdout, stderr, &os_limit)
    }

    fn memory_overhead(&self) -> u64 {
        self.overhead
    }

    fn limits_address_space(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_grants_read_on_workspace_only() {
        let p = policy(Path::new("/tmp/obijudge/abc"));
        assert!(p.contains("\"/tmp/obijudge/abc/-\", \"read\""));
        assert!(!p.contains("SocketPermission"));
        assert!(!p.contains("ReflectPermission"));
    }
}
