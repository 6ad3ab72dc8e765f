use obi_judger::data::{MemoryStore, Problem};
use obi_judger::registry::resolve_toolchain;
use obi_judger::{Config, JudgeEngine, Registry};
use obi_protocol::common::{Language as Lang, Submission, TestCase, Verdict, VerdictStatus};

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use tracing::{debug, warn};

fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn has_toolchain(name: &str) -> bool {
    let found = resolve_toolchain(Path::new(name)).is_some();
    if !found {
        warn!("{} not found, skipped", name);
    }
    found
}

/// The interpreter behind `name`, resolved through any version shim, if
/// it reports the expected major version.
fn interpreter(name: &str, major: u32) -> Option<PathBuf> {
    let script = "import sys; sys.stdout.write('%d %s' % (sys.version_info[0], sys.executable))";
    let found = Command::new(name)
        .args(&["-c", script])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| {
            let text = String::from_utf8_lossy(&out.stdout).into_owned();
            let mut parts = text.splitn(2, ' ');
            let version: u32 = parts.next()?.parse().ok()?;
            let path = parts.next()?;
            if version == major && !path.is_empty() {
                Some(PathBuf::from(path))
            } else {
                None
            }
        });
    if found.is_none() {
        warn!("{} not found, skipped", name);
    }
    found
}

fn judge(lang: Lang, source: &str, time_limit: u64, tests: &[(&str, &str)]) -> Result<(Verdict, Duration)> {
    judge_with(lang, source, time_limit, tests, |_| {})
}

fn judge_with(
    lang: Lang,
    source: &str,
    time_limit: u64,
    tests: &[(&str, &str)],
    tweak: impl FnOnce(&mut Config),
) -> Result<(Verdict, Duration)> {
    init();

    let root = tempfile::tempdir()?;
    let mut config = Config::default();
    config.executor.workspace_root = root.path().to_owned();
    tweak(&mut config);

    let registry = Registry::from_config(&config);

    let mut store = MemoryStore::new();
    store.insert(Problem {
        id: "p".into(),
        name: "p".into(),
        time_limit,
        memory_limit: 256,
        tests: tests
            .iter()
            .enumerate()
            .map(|(i, (input, output))| TestCase {
                position: i,
                input: input.as_bytes().to_vec(),
                output: output.as_bytes().to_vec(),
            })
            .collect(),
    });

    let engine = JudgeEngine::new(&config, registry, Arc::new(store))?;
    engine.start(1)?;

    let t0 = Instant::now();
    let id = engine.enqueue(Submission::new(lang, source, "p", time_limit, 256))?;
    let verdict = loop {
        let verdict = engine.status(id).unwrap();
        if verdict.status.is_final() {
            break verdict;
        }
        assert!(t0.elapsed() < Duration::from_secs(60));
        thread::sleep(Duration::from_millis(10));
    };
    let elapsed = t0.elapsed();
    engine.stop();

    debug!(?verdict, ?elapsed);
    Ok((verdict, elapsed))
}

fn python3() -> Option<impl FnOnce(&mut Config)> {
    let python = interpreter("python3", 3)?;
    Some(move |config: &mut Config| config.toolchains.python3 = python)
}

#[test]
fn python3_accepted() -> Result<()> {
    let toolchain = match python3() {
        Some(t) => t,
        None => return Ok(()),
    };

    let (verdict, _) = judge_with(Lang::Python3, "print(1+1)", 2000, &[("", "2\n")], toolchain)?;
    assert_eq!(verdict.status, VerdictStatus::Accepted);
    assert_eq!(verdict.cases_run, 1);
    Ok(())
}

#[test]
fn python3_reads_stdin() -> Result<()> {
    let toolchain = match python3() {
        Some(t) => t,
        None => return Ok(()),
    };

    let source = "a, b = map(int, input().split())\nprint(a + b)\n";
    let tests = [("1 2\n", "3\n"), ("5 5\n", "11\n")];
    let (verdict, _) = judge_with(Lang::Python3, source, 2000, &tests, toolchain)?;
    assert_eq!(verdict.status, VerdictStatus::WrongAnswer);
    assert_eq!(verdict.failed_case, Some(1));
    Ok(())
}

#[test]
fn python3_memory_error() -> Result<()> {
    let toolchain = match python3() {
        Some(t) => t,
        None => return Ok(()),
    };

    let source = "x = b'x' * (1 << 34)\nprint(len(x))\n";
    let (verdict, _) = judge_with(Lang::Python3, source, 5000, &[("", "0\n")], toolchain)?;
    assert_eq!(verdict.status, VerdictStatus::MemoryLimitExceeded);
    Ok(())
}

#[test]
fn python3_asserts_are_checked() -> Result<()> {
    let toolchain = match python3() {
        Some(t) => t,
        None => return Ok(()),
    };

    let source = "assert 1 + 1 == 3\nprint(2)\n";
    let (verdict, _) = judge_with(Lang::Python3, source, 2000, &[("", "2\n")], toolchain)?;
    assert_eq!(verdict.status, VerdictStatus::RuntimeError);
    Ok(())
}

#[test]
fn python3_network_is_refused() -> Result<()> {
    let toolchain = match python3() {
        Some(t) => t,
        None => return Ok(()),
    };

    let source = "import socket\nsocket.create_connection(('127.0.0.1', 9), timeout=1)\nprint(1)\n";
    let (verdict, _) = judge_with(Lang::Python3, source, 2000, &[("", "1\n")], toolchain)?;
    assert_eq!(verdict.status, VerdictStatus::RuntimeError);
    Ok(())
}

#[test]
fn python2_accepted() -> Result<()> {
    let python = match interpreter("python2", 2) {
        Some(p) => p,
        None => return Ok(()),
    };

    let source = "a, b = map(int, raw_input().split())\nprint a + b\n";
    let (verdict, _) = judge_with(Lang::Python2, source, 2000, &[("1 2\n", "3\n")], |config| {
        config.toolchains.python2 = python
    })?;
    assert_eq!(verdict.status, VerdictStatus::Accepted);
    Ok(())
}

#[test]
fn java_accepted() -> Result<()> {
    if !has_toolchain("javac") || !has_toolchain("java") {
        return Ok(());
    }

    let source = r#"
        import java.util.Scanner;

        public class Main {
            public static void main(String[] args) {
                Scanner in = new Scanner(System.in);
                long a = in.nextLong(), b = in.nextLong();
                System.out.println(a + b);
            }
        }
    "#;
    let (verdict, _) = judge(Lang::Java, source, 5000, &[("1 2\n", "3\n"), ("40 2\n", "42\n")])?;
    assert_eq!(verdict.status, VerdictStatus::Accepted);
    assert_eq!(verdict.cases_run, 2);
    Ok(())
}

#[test]
fn java_socket_is_refused() -> Result<()> {
    if !has_toolchain("javac") || !has_toolchain("java") {
        return Ok(());
    }

    let source = r#"
        public class Main {
            public static void main(String[] args) throws Exception {
                new java.net.Socket("127.0.0.1", 9).close();
                System.out.println("connected");
            }
        }
    "#;
    let (verdict, _) = judge(Lang::Java, source, 5000, &[("", "connected\n")])?;
    assert_eq!(verdict.status, VerdictStatus::RuntimeError);
    Ok(())
}

#[test]
fn java_heap_is_bounded() -> Result<()> {
    if !has_toolchain("javac") || !has_toolchain("java") {
        return Ok(());
    }

    // 800 MB against a 256 MB heap
    let source = r#"
        public class Main {
            public static void main(String[] args) {
                long[] big = new long[100_000_000];
                System.out.println(big.length);
            }
        }
    "#;
    let (verdict, _) = judge(Lang::Java, source, 5000, &[("", "100000000\n")])?;
    assert_eq!(verdict.status, VerdictStatus::MemoryLimitExceeded);
    Ok(())
}

#[test]
fn pascal_accepted() -> Result<()> {
    if !has_toolchain("fpc") {
        return Ok(());
    }

    let source = "var a, b: longint;\nbegin\n  readln(a, b);\n  writeln(a + b);\nend.\n";
    let (verdict, _) = judge(Lang::Pascal, source, 2000, &[("1 2\n", "3\n"), ("40 2\n", "42\n")])?;
    assert_eq!(verdict.status, VerdictStatus::Accepted);
    Ok(())
}

#[test]
fn cpp_infinite_loop_is_time_limit() -> Result<()> {
    if !has_toolchain("g++") {
        return Ok(());
    }

    let source = r#"
        #include <cstdio>
        int main() {
            volatile unsigned long x = 0;
            for (;;) { x++; }
            return 0;
        }
    "#;
    let (verdict, elapsed) = judge(Lang::Cpp, source, 1000, &[("", "")])?;
    assert_eq!(verdict.status, VerdictStatus::TimeLimitExceeded);
    assert_eq!(verdict.failed_case, Some(0));
    // compile time plus the limit plus overhead
    assert!(elapsed < Duration::from_secs(20));
    Ok(())
}

#[test]
fn time_limit_leaves_no_process_behind() -> Result<()> {
    if !has_toolchain("gcc") {
        return Ok(());
    }

    // outside the workspace root, which the sandbox may hide
    let scratch = tempfile::tempdir()?;
    let pid_file = scratch.path().join("pids");
    let source = format!(
        r#"
        #include <stdio.h>
        #include <unistd.h>
        int main(void) {{
            fork();
            FILE *f = fopen("{}", "a");
            if (f) {{ fprintf(f, "%d\n", (int)getpid()); fclose(f); }}
            for (;;) {{}}
        }}
    "#,
        pid_file.display()
    );
    let (verdict, _) = judge(Lang::C, &source, 1000, &[("", "")])?;
    assert_eq!(verdict.status, VerdictStatus::TimeLimitExceeded);

    let pids: Vec<i32> = fs::read_to_string(&pid_file)?
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect();
    assert!(!pids.is_empty());
    for pid in pids {
        assert_eq!(signal::killpg(Pid::from_raw(pid), None), Err(Errno::ESRCH));
        let alive = fs::read_to_string(format!("/proc/{}/stat", pid))
            .map(|stat| !stat.contains(") Z "))
            .unwrap_or(false);
        assert!(!alive, "pid {} survived", pid);
    }
    Ok(())
}

#[test]
fn cpp_accepted() -> Result<()> {
    if !has_toolchain("g++") {
        return Ok(());
    }

    let source = r#"
        #include<bits/stdc++.h>
        int main() {
            long long a, b;
            std::cin >> a >> b;
            std::cout << a + b << std::endl;
            return 0;
        }
    "#;
    let (verdict, _) = judge(Lang::Cpp, source, 1000, &[("1 2", "3"), ("40 2", "42")])?;
    assert_eq!(verdict.status, VerdictStatus::Accepted);
    Ok(())
}

#[test]
fn c_syntax_error_is_compile_error() -> Result<()> {
    if !has_toolchain("gcc") {
        return Ok(());
    }

    let source = "int main() { return 0 }";
    let (verdict, _) = judge(Lang::C, source, 1000, &[("", "")])?;
    assert_eq!(verdict.status, VerdictStatus::CompileError);
    assert_eq!(verdict.cases_run, 0);
    assert_eq!(verdict.failed_case, None);
    let message = verdict.compile_message.unwrap_or_default();
    assert!(message.contains("error"), "message: {}", message);
    Ok(())
}

#[test]
fn c_runtime_error() -> Result<()> {
    if !has_toolchain("gcc") {
        return Ok(());
    }

    let source = "int main() { return 3; }";
    let (verdict, _) = judge(Lang::C, source, 1000, &[("", "")])?;
    assert_eq!(verdict.status, VerdictStatus::RuntimeError);
    Ok(())
}
