use crate::error::PipelineError;
use nix::{
    errno::Errno,
    fcntl::{FcntlArg, fcntl},
    libc,
};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::debug;

/// A pipe connecting pipeline position `i` to position `i + 1`.
///
/// Both ends are close-on-exec and are closed exactly once, when the endpoint is dropped.
#[derive(Debug)]
pub struct PipeEndpoint {
    read: OwnedFd,
    write: OwnedFd,
}

impl PipeEndpoint {
    pub fn new() -> Result<Self, Errno> {
        let (read, write) = open_pipe()?;
        Ok(PipeEndpoint {
            read: lift_above_stdio(read)?,
            write: lift_above_stdio(write)?,
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn open_pipe() -> Result<(OwnedFd, OwnedFd), Errno> {
    use nix::{fcntl::OFlag, unistd::pipe2};

    let (r, w) = pipe2(OFlag::O_CLOEXEC)?;
    // SAFETY: pipe2 just returned these descriptors and nothing else owns them.
    Ok(unsafe { (OwnedFd::from_raw_fd(r), OwnedFd::from_raw_fd(w)) })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn open_pipe() -> Result<(OwnedFd, OwnedFd), Errno> {
    use nix::{fcntl::FdFlag, unistd::pipe};

    let (r, w) = pipe()?;
    // SAFETY: pipe just returned these descriptors and nothing else owns them.
    let (r, w) = unsafe { (OwnedFd::from_raw_fd(r), OwnedFd::from_raw_fd(w)) };
    for fd in [&r, &w] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((r, w))
}

/// Moves `fd` above the standard streams so that a later `dup2` onto
/// stdin or stdout can never clobber another pipe end.
fn lift_above_stdio(fd: OwnedFd) -> Result<OwnedFd, Errno> {
    if fd.as_raw_fd() > libc::STDERR_FILENO {
        return Ok(fd);
    }
    let lifted = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(libc::STDERR_FILENO + 1))?;
    // SAFETY: fcntl(F_DUPFD_CLOEXEC) returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(lifted) })
}

/// Which descriptors one pipeline position uses, and which ones it must close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WiringPlan {
    pub position: usize,
    pub stdin: Option<RawFd>,  // read end of the previous pipe
    pub stdout: Option<RawFd>, // write end of the next pipe
    pub close: Vec<RawFd>,     // every other pipe descriptor
}

/// All pipes of one pipeline.
#[derive(Debug)]
pub struct PipeSet {
    commands: usize,
    endpoints: Vec<PipeEndpoint>,
}

impl PipeSet {
    /// Creates the `commands - 1` pipes for a pipeline of `commands` processes.
    ///
    /// On failure every pipe created so far is closed before the error is returned.
    pub fn allocate(commands: usize) -> Result<Self, PipelineError> {
        let count = commands.saturating_sub(1);
        let mut endpoints = Vec::with_capacity(count);
        for _ in 0..count {
            match PipeEndpoint::new() {
                Ok(p) => endpoints.push(p),
                Err(e) => {
                    debug!(created = endpoints.len(), "pipe allocation failed: {e}");
                    return Err(PipelineError::PipeCreationFailed(e)); // `endpoints` closes on drop
                }
            }
        }

        debug!(commands, pipes = endpoints.len(), "pipes allocated");
        Ok(PipeSet {
            commands,
            endpoints,
        })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Every descriptor held by this set.
    pub fn fds(&self) -> Vec<RawFd> {
        self.endpoints
            .iter()
            .flat_map(|p| [p.read_fd(), p.write_fd()])
            .collect()
    }

    /// Computes the wiring of `position`.
    pub fn plan(&self, position: usize) -> WiringPlan {
        assert!(position < self.commands);

        let stdin = position.checked_sub(1).map(|i| self.endpoints[i].read_fd());
        let stdout = (position + 1 < self.commands).then(|| self.endpoints[position].write_fd());
        let close = self
            .fds()
            .into_iter()
            .filter(|fd| Some(*fd) != stdin && Some(*fd) != stdout)
            .collect();

        WiringPlan {
            position,
            stdin,
            stdout,
            close,
        }
    }
}
