use crate::helper::syscall;
use nix::{
    errno::Errno,
    sys::{
        signal::Signal,
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Pid,
};
use std::fmt;
use tracing::{debug, warn};

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Success,
    Exited(i32),      // non-zero exit code
    Signaled(Signal), // killed by a signal
    Lost(Errno),      // waitpid failed; the status is unknown
}

impl ProcessExit {
    fn from_wait(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, 0) => Some(ProcessExit::Success),
            WaitStatus::Exited(_, code) => Some(ProcessExit::Exited(code)),
            WaitStatus::Signaled(_, sig, _) => Some(ProcessExit::Signaled(sig)),
            _ => None, // still running, stopped or continued
        }
    }

    /// Shell-style status: the exit code, or 128 + signal number.
    pub fn code(&self) -> i32 {
        match self {
            ProcessExit::Success => 0,
            ProcessExit::Exited(code) => *code,
            ProcessExit::Signaled(sig) => 128 + *sig as i32,
            ProcessExit::Lost(_) => 255,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Success)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Success => write!(f, "exited with 0"),
            ProcessExit::Exited(code) => write!(f, "exited with {code}"),
            ProcessExit::Signaled(sig) => write!(f, "killed by {sig}"),
            ProcessExit::Lost(e) => write!(f, "status lost: {e}"),
        }
    }
}

/// A child that has been spawned but not necessarily reaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Child {
    pub pid: Pid,
    pub program: String,
}

/// A reaped child and its exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaped {
    pub pid: Pid,
    pub program: String,
    pub exit: ProcessExit,
}

/// Waits for one child. With `nohang`, returns `None` while it is still running.
fn wait_one(child: &Child, nohang: bool) -> Option<ProcessExit> {
    let flag = nohang.then_some(WaitPidFlag::WNOHANG);
    loop {
        match syscall(|| waitpid(child.pid, flag)) {
            Ok(WaitStatus::StillAlive) => return None,
            Ok(status) => {
                if let Some(exit) = ProcessExit::from_wait(status) {
                    log_exit(child, exit);
                    return Some(exit);
                }
                // stopped or continued: not terminated yet
                if nohang {
                    return None;
                }
            }
            Err(e) => {
                // ECHILD means someone else reaped it; either way there is nothing left to wait for.
                warn!(pid = %child.pid, program = %child.program, "waitpid failed: {e}");
                return Some(ProcessExit::Lost(e));
            }
        }
    }
}

fn log_exit(child: &Child, exit: ProcessExit) {
    if exit.success() {
        debug!(pid = %child.pid, program = %child.program, "reaped");
    } else {
        warn!(pid = %child.pid, program = %child.program, "{exit}");
    }
}

/// Blocks until every child has terminated and returns their statuses in
/// the order given. Each pid is waited on exactly once; a failing child does
/// not stop the collection of the others.
pub fn reap_all(children: &[Child]) -> Vec<Reaped> {
    children
        .iter()
        .map(|child| {
            let exit = wait_one(child, false).unwrap_or(ProcessExit::Lost(Errno::ECHILD));
            Reaped {
                pid: child.pid,
                program: child.program.clone(),
                exit,
            }
        })
        .collect()
}

/// The processes of a pipeline running in the background.
///
/// Nothing is waited on at launch. The owner reaps them later with
/// [`ProcessHandles::try_reap`] or [`ProcessHandles::wait`].
///
/// Dropping the handles detaches the pipeline: the processes keep running
/// and are never waited on from here. Until the owning process exits they
/// stay zombies once they terminate; after that init reaps them.
#[derive(Debug)]
pub struct ProcessHandles {
    pgid: Pid,
    children: Vec<Child>,
    exits: Vec<Option<ProcessExit>>,
}

impl ProcessHandles {
    pub(crate) fn new(pgid: Pid, children: Vec<Child>) -> Self {
        let exits = vec![None; children.len()];
        ProcessHandles {
            pgid,
            children,
            exits,
        }
    }

    /// Process group shared by every process of the pipeline.
    pub fn pgid(&self) -> Pid {
        self.pgid
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.children.iter().map(|c| c.pid).collect()
    }

    pub fn children(&self) -> &[Child] {
        &self.children
    }

    pub fn is_finished(&self) -> bool {
        self.exits.iter().all(Option::is_some)
    }

    /// Reaps whatever has terminated without blocking. Returns `true` once
    /// every process has been reaped.
    pub fn try_reap(&mut self) -> bool {
        for (child, exit) in self.children.iter().zip(self.exits.iter_mut()) {
            if exit.is_none() {
                *exit = wait_one(child, true);
            }
        }
        self.is_finished()
    }

    /// Blocks until every process has terminated.
    pub fn wait(mut self) -> Vec<Reaped> {
        for (child, exit) in self.children.iter().zip(self.exits.iter_mut()) {
            if exit.is_none() {
                *exit = Some(wait_one(child, false).unwrap_or(ProcessExit::Lost(Errno::ECHILD)));
            }
        }
        self.into_reaped()
    }

    /// Statuses collected so far. `None` for processes still running.
    pub fn exits(&self) -> &[Option<ProcessExit>] {
        &self.exits
    }

    fn into_reaped(mut self) -> Vec<Reaped> {
        let children = std::mem::take(&mut self.children);
        let exits = std::mem::take(&mut self.exits);
        children
            .into_iter()
            .zip(exits)
            .map(|(child, exit)| Reaped {
                pid: child.pid,
                program: child.program,
                exit: exit.unwrap_or(ProcessExit::Lost(Errno::ECHILD)),
            })
            .collect()
    }
}

impl Drop for ProcessHandles {
    fn drop(&mut self) {
        if !self.is_finished() {
            let running = self.exits.iter().filter(|e| e.is_none()).count();
            debug!(pgid = %self.pgid, running, "background pipeline detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CommandSet, run_background};
    use std::time::{Duration, Instant};

    #[test]
    fn codes_follow_shell_conventions() {
        assert_eq!(ProcessExit::Success.code(), 0);
        assert_eq!(ProcessExit::Exited(3).code(), 3);
        assert_eq!(ProcessExit::Signaled(Signal::SIGKILL).code(), 137);
        assert!(!ProcessExit::Exited(1).success());
    }

    #[test]
    fn wait_statuses_map_to_exits() {
        let pid = Pid::from_raw(1);
        assert_eq!(ProcessExit::from_wait(WaitStatus::Exited(pid, 0)), Some(ProcessExit::Success));
        assert_eq!(ProcessExit::from_wait(WaitStatus::Exited(pid, 2)), Some(ProcessExit::Exited(2)));
        assert_eq!(
            ProcessExit::from_wait(WaitStatus::Signaled(pid, Signal::SIGPIPE, false)),
            Some(ProcessExit::Signaled(Signal::SIGPIPE))
        );
        assert_eq!(ProcessExit::from_wait(WaitStatus::StillAlive), None);
        assert_eq!(ProcessExit::from_wait(WaitStatus::Continued(pid)), None);
    }

    #[test]
    fn reaping_unknown_pid_is_lost_not_fatal() {
        // pid 1 is never our child
        let children = vec![Child {
            pid: Pid::from_raw(1),
            program: "init".into(),
        }];
        let reaped = reap_all(&children);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].exit, ProcessExit::Lost(Errno::ECHILD));
    }

    #[test]
    fn dropped_handles_detach_without_reaping() {
        let set: CommandSet = ["sleep 0.3"].into_iter().collect();
        let handles = run_background(&set).unwrap();
        let pid = handles.pids()[0];

        let start = Instant::now();
        drop(handles);
        assert!(start.elapsed() < Duration::from_millis(300));

        // Still ours to wait on: neither killed nor reaped by the drop.
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
    }
}
