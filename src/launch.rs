use crate::{
    error::PipelineError,
    helper::{close_quietly, exit_child, syscall, write_stderr},
    pipe::WiringPlan,
    redirect::RedirectionSpec,
};
use nix::{
    errno::Errno,
    fcntl::{FcntlArg, FdFlag, OFlag, fcntl, open},
    libc,
    sys::{
        signal::{SigHandler, SigSet, SigmaskHow, Signal, signal, sigprocmask},
        stat::Mode,
    },
    unistd::{ForkResult, Pid, dup2, fork, setpgid},
};
use std::{
    collections::BTreeMap,
    ffi::{CStr, CString, OsStr, OsString},
    os::unix::{ffi::OsStrExt, fs::PermissionsExt, io::RawFd},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Search path used when PATH is unset.
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Exit status of a child whose redirection file could not be opened.
pub const EXIT_REDIRECT_FAILED: i32 = 1;
/// Exit status of a child whose executable exists but cannot be run.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;
/// Exit status of a child whose executable was not found.
pub const EXIT_NOT_FOUND: i32 = 127;

/// Process group placement of a spawned child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessGroup {
    /// Stay in the caller's group.
    Inherit,
    /// Join this group. `Pid::from_raw(0)` makes the child lead a new group.
    Join(Pid),
}

/// Everything needed to start one pipeline position.
///
/// All allocation happens here, in the parent. Between `fork` and `execve`
/// the child only issues raw system calls, since another thread of the
/// parent may hold the allocator lock at the time of the fork.
#[derive(Debug)]
pub(crate) struct Launch {
    position: usize,
    program: String,
    executable: Option<CString>, // None if the PATH search failed
    argv: Vec<CString>,
    input: Option<CString>,
    output: Option<CString>,
    append: bool,
    msg_prefix: Vec<u8>, // "pipesh: <program>: "
}

impl Launch {
    pub(crate) fn prepare(
        position: usize,
        args: &[String],
        redirect: &RedirectionSpec,
        search_path: &OsStr,
    ) -> Result<Self, PipelineError> {
        let program = args[0].clone();
        let argv = args.iter().map(|a| to_cstring(a.as_bytes())).collect::<Result<Vec<_>, _>>()?;
        let executable = match find_executable(search_path, Path::new(&program)) {
            Some(path) => Some(to_cstring(path.as_os_str().as_bytes())?),
            None => None,
        };
        let input = match redirect.input() {
            Some(p) => Some(to_cstring(p.as_os_str().as_bytes())?),
            None => None,
        };
        let output = match redirect.output() {
            Some(p) => Some(to_cstring(p.as_os_str().as_bytes())?),
            None => None,
        };

        Ok(Launch {
            position,
            msg_prefix: format!("pipesh: {program}: ").into_bytes(),
            program,
            executable,
            argv,
            input,
            output,
            append: redirect.append,
        })
    }

    pub(crate) fn program(&self) -> &str {
        &self.program
    }

    /// Forks a child wired according to `plan` and executes the program in it.
    ///
    /// Returns the child's pid. Failures inside the child only end that child.
    pub(crate) fn spawn(
        &self,
        plan: &WiringPlan,
        envp: &[CString],
        group: ProcessGroup,
    ) -> Result<Pid, Errno> {
        debug_assert_eq!(plan.position, self.position);

        // Null-terminated pointer arrays for execve, built before forking.
        let argv_ptrs = null_terminated(&self.argv);
        let envp_ptrs = null_terminated(envp);

        match syscall(|| unsafe { fork() })? {
            ForkResult::Parent { child, .. } => {
                // Set the group from both sides; whichever runs first wins.
                // The child may already have exec'd, so failure here is expected.
                if let ProcessGroup::Join(pgid) = group {
                    let pgid = if pgid.as_raw() == 0 { child } else { pgid };
                    let _ = setpgid(child, pgid);
                }
                debug!(position = self.position, program = %self.program, pid = %child, "spawned");
                Ok(child)
            }
            ForkResult::Child => self.exec_child(plan, &argv_ptrs, &envp_ptrs, group),
        }
    }

    /// Runs in the forked child. Never returns.
    fn exec_child(
        &self,
        plan: &WiringPlan,
        argv: &[*const libc::c_char],
        envp: &[*const libc::c_char],
        group: ProcessGroup,
    ) -> ! {
        // The Rust runtime ignores SIGPIPE, and an ignored disposition survives exec.
        let _ = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) };
        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);

        if let ProcessGroup::Join(pgid) = group {
            let _ = setpgid(Pid::from_raw(0), pgid);
        }

        // A redirection file takes precedence over the pipe.
        if let Some(path) = &self.input {
            let fd = match syscall(|| open(path.as_c_str(), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())) {
                Ok(fd) => fd,
                Err(e) => self.die(path, e, EXIT_REDIRECT_FAILED),
            };
            if let Err(e) = move_onto(fd, libc::STDIN_FILENO) {
                self.die(path, e, EXIT_REDIRECT_FAILED);
            }
        } else if let Some(fd) = plan.stdin {
            if let Err(e) = syscall(|| dup2(fd, libc::STDIN_FILENO)) {
                self.die(c"stdin", e, EXIT_REDIRECT_FAILED);
            }
        }

        if let Some(path) = &self.output {
            let mode = if self.append { OFlag::O_APPEND } else { OFlag::O_TRUNC };
            let flags = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_CLOEXEC | mode;
            let perm = Mode::from_bits_truncate(0o666);
            let fd = match syscall(|| open(path.as_c_str(), flags, perm)) {
                Ok(fd) => fd,
                Err(e) => self.die(path, e, EXIT_REDIRECT_FAILED),
            };
            if let Err(e) = move_onto(fd, libc::STDOUT_FILENO) {
                self.die(path, e, EXIT_REDIRECT_FAILED);
            }
        } else if let Some(fd) = plan.stdout {
            if let Err(e) = syscall(|| dup2(fd, libc::STDOUT_FILENO)) {
                self.die(c"stdout", e, EXIT_REDIRECT_FAILED);
            }
        }

        // Every pipe end is now either duplicated onto stdio or unused.
        // A write end left open here would keep the next reader from ever seeing EOF.
        for &fd in plan.close.iter().chain(&plan.stdin).chain(&plan.stdout) {
            close_quietly(fd);
        }

        let Some(executable) = &self.executable else {
            write_stderr(&self.msg_prefix);
            write_stderr(b"command not found\n");
            exit_child(EXIT_NOT_FOUND);
        };

        // SAFETY: both arrays are null-terminated and point into CStrings that
        // outlive this call; execve only returns on failure.
        unsafe { libc::execve(executable.as_ptr(), argv.as_ptr(), envp.as_ptr()) };

        let errno = Errno::last();
        let code = match errno {
            Errno::ENOENT | Errno::ENOTDIR => EXIT_NOT_FOUND,
            _ => EXIT_NOT_EXECUTABLE,
        };
        write_stderr(&self.msg_prefix);
        write_stderr(errno.desc().as_bytes());
        write_stderr(b"\n");
        exit_child(code);
    }

    /// Reports a failure on `what` and terminates the child.
    fn die(&self, what: &CStr, errno: Errno, code: i32) -> ! {
        write_stderr(&self.msg_prefix);
        write_stderr(what.to_bytes());
        write_stderr(b": ");
        write_stderr(errno.desc().as_bytes());
        write_stderr(b"\n");
        exit_child(code);
    }
}

/// Duplicates `fd` onto `target` and closes the original.
fn move_onto(fd: RawFd, target: RawFd) -> Result<(), Errno> {
    if fd == target {
        // dup2 is a no-op here and would leave close-on-exec set.
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
        return Ok(());
    }
    syscall(|| dup2(fd, target))?;
    close_quietly(fd);
    Ok(())
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

fn to_cstring(bytes: &[u8]) -> Result<CString, PipelineError> {
    CString::new(bytes)
        .map_err(|_| PipelineError::InvalidArgument(String::from_utf8_lossy(bytes).into_owned()))
}

/// Builds the environment block for children: the process environment with
/// `overlay` applied on top.
pub(crate) fn environment_block(overlay: &BTreeMap<String, String>) -> Result<Vec<CString>, PipelineError> {
    let mut vars: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
    for (k, v) in overlay {
        vars.insert(k.into(), v.into());
    }

    vars.iter()
        .map(|(k, v)| {
            let mut entry = k.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(v.as_bytes());
            to_cstring(&entry)
        })
        .collect()
}

/// The PATH that children are searched in: `overlay` first, then the process environment.
pub(crate) fn search_path(overlay: &BTreeMap<String, String>) -> OsString {
    overlay
        .get("PATH")
        .map(OsString::from)
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_else(|| DEFAULT_PATH.into())
}

/// Resolves a command name the way `execvp` does.
///
/// - A name containing `/` is used as is.
/// - Otherwise each PATH directory is searched; the first executable regular
///   file wins. A match that exists but is not executable is returned only
///   if nothing executable is found, so that running it fails with EACCES.
/// - An empty name resolves to nothing.
pub fn find_executable(search_path: &OsStr, program: &Path) -> Option<PathBuf> {
    if program.as_os_str().is_empty() {
        return None;
    }
    if program.as_os_str().as_bytes().contains(&b'/') {
        return Some(program.to_path_buf());
    }

    let mut fallback = None;
    for dir in std::env::split_paths(search_path) {
        // An empty PATH entry means the current directory.
        let dir = if dir.as_os_str().is_empty() { PathBuf::from(".") } else { dir };
        let candidate = dir.join(program);
        let Ok(meta) = candidate.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        if meta.permissions().mode() & 0o111 != 0 {
            return Some(candidate);
        }
        fallback.get_or_insert(candidate);
    }
    fallback
}
