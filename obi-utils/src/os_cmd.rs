use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;

/// A command line with an explicit environment. Nothing is inherited.
#[derive(Clone)]
pub struct OsCmd {
    pub bin: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl OsCmd {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(&mut self, a: impl Into<OsString>) -> &mut Self {
        self.args.push(a.into());
        self
    }

    pub fn arg_if(&mut self, cond: bool, a: impl Into<OsString>) -> &mut Self {
        if cond {
            self.arg(a)
        } else {
            self
        }
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn add_env(&mut self, k: impl Into<OsString>, v: impl AsRef<OsStr>) -> &mut Self {
        self.env.push((k.into(), v.as_ref().to_owned()));
        self
    }
}

impl fmt::Debug for OsCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bin.display())?;
        for a in &self.args {
            write!(f, " {}", a.to_string_lossy())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let mut cmd = OsCmd::new("/usr/bin/gcc");
        cmd.arg("main.c")
            .arg_if(false, "-static")
            .args(&["-o", "main"])
            .add_env("PATH", "/usr/bin");

        assert_eq!(cmd.args, ["main.c", "-o", "main"]);
        assert_eq!(cmd.env, [("PATH".into(), "/usr/bin".into())]);
        assert_eq!(format!("{:?}", cmd), "/usr/bin/gcc main.c -o main");
    }
}
