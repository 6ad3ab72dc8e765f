use crate::libc_call;
use crate::SandboxArgs;

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;

use anyhow::{Context as _, Result};
use rlimit::Resource;
use seccompiler::BpfProgram;

/// Everything needed after fork, prepared by the parent. Nothing here
/// allocates once the child is running.
#[derive(Debug)]
pub struct ChildSetup {
    uid: Option<u32>,
    gid: Option<u32>,
    rlimit_cpu: Option<u64>,
    rlimit_as: Option<u64>,
    rlimit_data: Option<u64>,
    rlimit_fsize: Option<u64>,
    rlimit_nproc: Option<u64>,

    cgroup_procs: Vec<RawFd>,
    namespaces: libc::c_int,
    hidden: Vec<CString>,
    siblings: Option<Siblings>,
    filters: Vec<BpfProgram>,
}

/// The work directory is re-attached under an empty tmpfs laid over its
/// parent.
#[derive(Debug)]
struct Siblings {
    parent: CString,
    work_dir: CString,
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path contains a nul byte: {}", path.display()))
}

impl ChildSetup {
    pub fn new(
        args: &SandboxArgs,
        cgroup_procs: Vec<RawFd>,
        filters: Vec<BpfProgram>,
    ) -> Result<Self> {
        let isolation = &args.isolation;

        let mut hidden = Vec::new();
        for path in &isolation.hidden_paths {
            // a missing path has nothing to hide
            if path.is_dir() {
                hidden.push(c_path(path)?);
            }
        }

        let siblings = if isolation.hide_siblings {
            let work_dir = args.work_dir.canonicalize().with_context(|| {
                format!("failed to resolve work dir: {}", args.work_dir.display())
            })?;
            let parent = work_dir
                .parent()
                .context("work dir has no parent")?
                .to_owned();
            Some(Siblings {
                parent: c_path(&parent)?,
                work_dir: c_path(&work_dir)?,
            })
        } else {
            None
        };

        let mut namespaces = 0;
        if isolation.unshare_network {
            namespaces |= libc::CLONE_NEWNET;
        }
        if !hidden.is_empty() || siblings.is_some() {
            namespaces |= libc::CLONE_NEWNS | libc::CLONE_NEWIPC;
        }

        Ok(Self {
            uid: args.uid,
            gid: args.gid,
            rlimit_cpu: args.rlimit_cpu,
            rlimit_as: args.rlimit_as,
            rlimit_data: args.rlimit_data,
            rlimit_fsize: args.rlimit_fsize,
            rlimit_nproc: args.rlimit_nproc,
            cgroup_procs,
            namespaces,
            hidden,
            siblings,
            filters,
        })
    }
}

fn join_cgroups(fds: &[RawFd]) -> io::Result<()> {
    // "0" names the writing process
    for &fd in fds {
        let ret = unsafe { libc::write(fd, b"0".as_ptr().cast(), 1) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn mount(
    source: *const libc::c_char,
    target: &CString,
    fstype: *const libc::c_char,
    flags: libc::c_ulong,
    data: *const libc::c_char,
) -> io::Result<()> {
    libc_call(|| unsafe { libc::mount(source, target.as_ptr(), fstype, flags, data.cast()) })?;
    Ok(())
}

const TMPFS: &[u8] = b"tmpfs\0";
const EMPTY_OPTS: &[u8] = b"size=4k,mode=755\0";
const PROC_CWD: &[u8] = b"/proc/self/cwd\0";

fn isolate(setup: &ChildSetup) -> io::Result<()> {
    if setup.namespaces == 0 {
        return Ok(());
    }
    libc_call(|| unsafe { libc::unshare(setup.namespaces) })?;

    if setup.namespaces & libc::CLONE_NEWNS == 0 {
        return Ok(());
    }

    // keep our mounts out of the parent namespace
    let root = b"/\0";
    libc_call(|| unsafe {
        libc::mount(
            ptr::null(),
            root.as_ptr().cast(),
            ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            ptr::null(),
        )
    })?;

    let tmpfs = TMPFS.as_ptr().cast();
    let opts = EMPTY_OPTS.as_ptr().cast();
    let ro = libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC;

    for path in &setup.hidden {
        mount(tmpfs, path, tmpfs, ro, opts)?;
    }

    if let Some(ref siblings) = setup.siblings {
        // cwd still points at the real work dir underneath
        mount(tmpfs, &siblings.parent, tmpfs, libc::MS_NOSUID | libc::MS_NODEV, opts)?;
        libc_call(|| unsafe { libc::mkdir(siblings.work_dir.as_ptr(), 0o755) })?;
        mount(
            PROC_CWD.as_ptr().cast(),
            &siblings.work_dir,
            ptr::null(),
            libc::MS_BIND | libc::MS_REC,
            ptr::null(),
        )?;
        libc_call(|| unsafe { libc::chdir(siblings.work_dir.as_ptr()) })?;
    }

    Ok(())
}

fn seccomp_error(err: seccompiler::Error) -> io::Error {
    match err {
        seccompiler::Error::Prctl(e) | seccompiler::Error::Seccomp(e) => e,
        _ => io::Error::from_raw_os_error(libc::EINVAL),
    }
}

/// Runs between fork and exec. Must not allocate.
pub fn setup(setup: &ChildSetup) -> io::Result<()> {
    libc_call(|| unsafe { libc::setpgid(0, 0) })?;
    libc_call(|| unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) })?;

    join_cgroups(&setup.cgroup_procs)?;
    isolate(setup)?;

    Resource::CORE.set(0, 0)?;
    let (_, stack_hard) = Resource::STACK.get()?;
    Resource::STACK.set(stack_hard, stack_hard)?;

    if let Some(secs) = setup.rlimit_cpu {
        // SIGXCPU at the soft limit, SIGKILL one second later
        Resource::CPU.set(secs, secs + 1)?;
    }

    if let Some(bytes) = setup.rlimit_as {
        Resource::AS.set(bytes, bytes)?;
    }

    if let Some(bytes) = setup.rlimit_data {
        Resource::DATA.set(bytes, bytes)?;
    }

    if let Some(bytes) = setup.rlimit_fsize {
        Resource::FSIZE.set(bytes, bytes)?;
    }

    if let Some(n) = setup.rlimit_nproc {
        Resource::NPROC.set(n, n)?;
    }

    if let Some(gid) = setup.gid {
        let groups = [gid as libc::gid_t];
        libc_call(|| unsafe { libc::setgroups(1, groups.as_ptr()) })?;
        libc_call(|| unsafe { libc::setgid(gid) })?;
    }

    if let Some(uid) = setup.uid {
        libc_call(|| unsafe { libc::setuid(uid) })?;
    }

    // last, since it refuses the calls above
    for filter in &setup.filters {
        seccompiler::apply_filter(filter).map_err(seccomp_error)?;
    }

    Ok(())
}
