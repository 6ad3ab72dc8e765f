use crate::config::Config;
use crate::lang::c_cpp::{CCpp, CCppStd};
use crate::lang::java::Java;
use crate::lang::pascal::Pascal;
use crate::lang::python::{Python, PythonVersion};
use crate::lang::Language;

use obi_protocol::common::Language as Lang;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

/// Adapters keyed by language, resolved once at startup.
#[derive(Default, Clone)]
pub struct Registry {
    adapters: HashMap<Lang, Arc<dyn Language>>,
}

/// Absolute path of a toolchain binary, if it is installed.
pub fn resolve_toolchain(path: &Path) -> Option<PathBuf> {
    if path.is_absolute() {
        return if path.is_file() {
            Some(path.to_owned())
        } else {
            None
        };
    }
    which::which(path).ok()
}

fn build_adapter(config: &Config, lang: Lang, mut paths: Vec<PathBuf>) -> Arc<dyn Language> {
    let first = paths.swap_remove(0);
    match lang {
        Lang::C | Lang::Cpp => Arc::new(CCpp {
            cc: first,
            std: if lang == Lang::Cpp {
                CCppStd::Cpp17
            } else {
                CCppStd::C11
            },
            o2: true,
        }),
        Lang::Pascal => Arc::new(Pascal { fpc: first }),
        Lang::Python2 | Lang::Python3 => Arc::new(Python {
            python: first,
            version: if lang == Lang::Python2 {
                PythonVersion::V2
            } else {
                PythonVersion::V3
            },
        }),
        Lang::Java => Arc::new(Java {
            java: first,
            javac: paths.pop().unwrap_or_default(),
            security_policy: config.java.security_policy,
            overhead: config.java.overhead.as_u64(),
            stack_size: config.java.stack_size.as_u64(),
        }),
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let tc = &config.toolchains;
        let mut registry = Self::new();

        for &lang in Lang::ALL {
            let paths: Vec<&Path> = match lang {
                Lang::C => vec![tc.gcc.as_path()],
                Lang::Cpp => vec![tc.gxx.as_path()],
                Lang::Pascal => vec![tc.fpc.as_path()],
                Lang::Python2 => vec![tc.python2.as_path()],
                Lang::Python3 => vec![tc.python3.as_path()],
                Lang::Java => vec![tc.java.as_path(), tc.javac.as_path()],
            };

            let resolved: Option<Vec<PathBuf>> =
                paths.iter().map(|p| resolve_toolchain(p)).collect();

            match resolved {
                Some(resolved) => {
                    info!(%lang, toolchain = %resolved[0].display(), "language registered");
                    registry.insert(build_adapter(config, lang, resolved));
                }
                None => warn!(%lang, ?paths, "toolchain not found, language disabled"),
            }
        }

        registry
    }

    pub fn insert(&mut self, adapter: Arc<dyn Language>) -> Option<Arc<dyn Language>> {
        self.adapters.insert(adapter.lang(), adapter)
    }

    pub fn get(&self, lang: Lang) -> Option<&Arc<dyn Language>> {
        self.adapters.get(&lang)
    }

    pub fn contains(&self, lang: Lang) -> bool {
        self.adapters.contains_key(&lang)
    }

    pub fn languages(&self) -> Vec<Lang> {
        let mut langs: Vec<Lang> = self.adapters.keys().copied().collect();
        langs.sort_by_key(|l| l.as_str());
        langs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Toolchains;

    #[test]
    fn missing_toolchains_are_not_registered() {
        let mut config = Config::default();
        config.toolchains = Toolchains {
            gcc: "/nonexistent/gcc".into(),
            gxx: "/nonexistent/g++".into(),
            fpc: "obi-no-such-fpc".into(),
            python2: "/nonexistent/python2".into(),
            python3: "/nonexistent/python3".into(),
            javac: "/nonexistent/javac".into(),
            java: "/nonexistent/java".into(),
        };
        let registry = Registry::from_config(&config);
        assert!(registry.languages().is_empty());
        assert!(registry.get(Lang::Cpp).is_none());
    }

    #[test]
    fn absolute_path_must_be_a_file() {
        assert!(resolve_toolchain(Path::new("/")).is_none());
        assert_eq!(
            resolve_toolchain(Path::new("/bin/sh")),
            Some(PathBuf::from("/bin/sh"))
        );
    }
}
