use nix::{libc, unistd};
use std::os::unix::io::RawFd;

pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Wrapper for system calls. Retries while the call fails with EINTR.
pub(crate) fn syscall<F, T>(f: F) -> Result<T, nix::Error>
where
    F: Fn() -> Result<T, nix::Error>,
{
    loop {
        match f() {
            Err(nix::Error::EINTR) => (), // retry
            result => return result,
        }
    }
}

/// Writes `msg` to stderr without allocating. Safe to call between fork and exec.
pub(crate) fn write_stderr(msg: &[u8]) {
    let mut rest = msg;
    while !rest.is_empty() {
        match syscall(|| unistd::write(libc::STDERR_FILENO, rest)) {
            Ok(0) | Err(_) => return,
            Ok(n) => rest = &rest[n..],
        }
    }
}

/// Closes `fd`, ignoring errors. Only used in a forked child.
pub(crate) fn close_quietly(fd: RawFd) {
    // close is not retried on EINTR: the descriptor is released either way on Linux
    let _ = unistd::close(fd);
}

/// Terminates a forked child at once, skipping atexit handlers and stdio flushes.
pub(crate) fn exit_child(code: i32) -> ! {
    // SAFETY: _exit is async-signal-safe and never returns.
    unsafe { libc::_exit(code) }
}
