use crate::{
    config::Config,
    env::Environment,
    helper::DynError,
    pipeline::{CommandSet, Pipeline},
    reap::ProcessHandles,
    tokenize::tokenize,
};
use rustyline::{Editor, error::ReadlineError};
use signal_hook::{
    consts::{SIGCHLD, SIGINT},
    flag,
    iterator::Signals,
};
use std::{
    collections::BTreeMap,
    process::exit,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, Sender, SyncSender, channel, sync_channel},
    },
    thread,
};
use tracing::{debug, error};

/// Built-ins run as soon as their line is entered, without waiting for the blank line.
const IMMEDIATE_BUILTINS: [&str; 4] = ["exit", "env", "set", "jobs"];

/// Message received by the worker thread.
enum WorkerMsg {
    Signal(i32),     // signal received
    Cmd(CommandSet), // command set entered
}

/// Message received by the main thread.
enum ShellMsg {
    Continue(i32), // resume reading. i32 is the last exit status
    Quit(i32),     // quit the shell. i32 is the shell's exit status
}

#[derive(Debug)]
pub struct Shell {
    config: Config,
}

impl Shell {
    pub fn new(config: Config) -> Self {
        Shell { config }
    }

    /// Main thread: reads command sets and hands them to the worker.
    ///
    /// A SIGINT delivered to the shell process only sets a flag; running
    /// children are left alone and the shell exits once the current
    /// pipeline has been reaped. Ctrl+C typed at a terminal is different:
    /// the kernel sends it to the whole foreground process group, and
    /// foreground pipelines share the shell's group, so their processes get
    /// it too. Background pipelines have their own group and are not affected.
    pub fn run(&self) -> Result<(), DynError> {
        let interrupted = Arc::new(AtomicBool::new(false));
        flag::register(SIGINT, Arc::clone(&interrupted))?;

        let mut rl = Editor::<()>::new()?;
        if let Some(history) = &self.config.history {
            if let Err(e) = rl.load_history(history) {
                debug!("no history loaded from {}: {e}", history.display());
            }
        }

        let (worker_tx, worker_rx) = channel();
        let (shell_tx, shell_rx) = sync_channel(0);
        spawn_sig_handler(worker_tx.clone())?;
        Worker::new(self.config.max_commands).spawn(worker_rx, shell_tx);

        let exit_val; // exit status of the shell
        let mut prev = 0; // last exit status
        loop {
            match self.read_command_set(&mut rl, prev) {
                Ok(set) => {
                    if set.is_empty() {
                        continue; // nothing entered, prompt again
                    }

                    worker_tx.send(WorkerMsg::Cmd(set))?;
                    match shell_rx.recv()? {
                        ShellMsg::Continue(n) => prev = n,
                        ShellMsg::Quit(n) => {
                            exit_val = n;
                            break;
                        }
                    }

                    // SIGINT arrived while the pipeline ran: finish instead of prompting again.
                    if interrupted.swap(false, Ordering::SeqCst) {
                        println!("\nReceived Ctrl+C. Exiting...");
                        exit_val = 0;
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("\nReceived Ctrl+C. Exiting...");
                    exit_val = 0;
                    break;
                }
                Err(ReadlineError::Eof) => {
                    worker_tx.send(WorkerMsg::Cmd(CommandSet::from_iter(["exit"])))?;
                    match shell_rx.recv()? {
                        ShellMsg::Quit(n) => {
                            exit_val = n;
                            break;
                        }
                        ShellMsg::Continue(_) => return Err("exit did not terminate the shell".into()),
                    }
                }
                Err(e) => {
                    eprintln!("pipesh: read error\n{e}");
                    exit_val = 1;
                    break;
                }
            }
        }

        if let Some(history) = &self.config.history {
            if let Err(e) = rl.save_history(history) {
                eprintln!("pipesh: failed to write history file: {e}");
            }
        }
        exit(exit_val);
    }

    /// Reads lines until a blank line and collects them into one command set.
    ///
    /// `|` inside a line splits it into several commands. An immediate
    /// built-in on the first line ends the set at once.
    fn read_command_set(&self, rl: &mut Editor<()>, prev: i32) -> Result<CommandSet, ReadlineError> {
        let face = if prev == 0 { '\u{1F642}' } else { '\u{1F480}' };
        let first_prompt = format!("{} {} %> ", self.config.prompt, face);

        let mut set = CommandSet::new();
        loop {
            let prompt = if set.is_empty() { first_prompt.as_str() } else { "... > " };
            let line = rl.readline(prompt)?;
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            rl.add_history_entry(line);

            let immediate = set.is_empty() && is_immediate_builtin(line);
            for cmd in split_pipes(line) {
                set.push(cmd);
            }
            if immediate {
                break;
            }
        }
        Ok(set)
    }
}

/// Splits one line at `|` into separate commands.
fn split_pipes(line: &str) -> Vec<&str> {
    line.split('|').map(str::trim).collect()
}

fn is_immediate_builtin(line: &str) -> bool {
    line.split_whitespace()
        .next()
        .is_some_and(|cmd| IMMEDIATE_BUILTINS.contains(&cmd))
}

/// Signal handler thread: forwards SIGCHLD to the worker.
fn spawn_sig_handler(tx: Sender<WorkerMsg>) -> Result<(), DynError> {
    let mut signals = Signals::new([SIGCHLD])?;
    thread::spawn(move || {
        for sig in signals.forever() {
            if tx.send(WorkerMsg::Signal(sig)).is_err() {
                break; // worker has gone away
            }
        }
    });

    Ok(())
}

/// A pipeline running in the background.
#[derive(Debug)]
struct Job {
    line: String,
    handles: ProcessHandles,
}

#[derive(Debug)]
struct Worker {
    exit_val: i32,             // last exit status
    max_commands: usize,       // longest accepted pipeline
    env: Environment,          // variables from `set`
    jobs: BTreeMap<usize, Job>, // job id -> background pipeline
}

impl Worker {
    fn new(max_commands: usize) -> Self {
        Worker {
            exit_val: 0,
            max_commands,
            env: Environment::new(),
            jobs: BTreeMap::new(),
        }
    }

    /// Starts the worker thread.
    fn spawn(mut self, worker_rx: Receiver<WorkerMsg>, shell_tx: SyncSender<ShellMsg>) {
        thread::spawn(move || {
            for msg in worker_rx.iter() {
                let reply = match msg {
                    WorkerMsg::Cmd(set) => self.handle(&set),
                    WorkerMsg::Signal(SIGCHLD) => {
                        self.wait_background();
                        continue;
                    }
                    WorkerMsg::Signal(_) => continue,
                };

                if shell_tx.send(reply).is_err() {
                    break; // main thread has gone away
                }
                // Background jobs may have finished while a foreground pipeline ran.
                self.wait_background();
            }
        });
    }

    /// Runs one command set and tells the main thread how to go on.
    fn handle(&mut self, set: &CommandSet) -> ShellMsg {
        if let Some(msg) = self.built_in_cmd(set) {
            return msg;
        }
        self.run_foreground(set);
        ShellMsg::Continue(self.exit_val)
    }

    /// Dispatches built-ins. Returns `None` if the set is an ordinary pipeline.
    fn built_in_cmd(&mut self, set: &CommandSet) -> Option<ShellMsg> {
        let first = tokenize(set.lines().first()?).ok()?;
        let name = first.program();

        if IMMEDIATE_BUILTINS.contains(&name) && set.len() > 1 {
            eprintln!("pipesh: {name}: built-ins cannot be part of a pipeline");
            self.exit_val = 1;
            return Some(ShellMsg::Continue(self.exit_val));
        }

        let args = &first.tokens()[1..];
        match name {
            "exit" => Some(self.run_exit(args)),
            "env" => Some(self.run_env()),
            "set" => Some(self.run_set(args)),
            "jobs" => Some(self.run_jobs()),
            "bg" => Some(self.run_bg(args, set)),
            _ => None,
        }
    }

    fn run_foreground(&mut self, set: &CommandSet) {
        let result = Pipeline::parse(set, self.max_commands)
            .and_then(|p| p.envs(self.env.iter()).run_foreground());

        match result {
            Ok(result) => {
                for p in result.processes.iter().filter(|p| !p.exit.success()) {
                    eprintln!("pipesh: {} (pid {}) {}", p.program, p.pid, p.exit);
                }
                self.exit_val = result.code();
            }
            Err(e) => {
                eprintln!("pipesh: {e}");
                self.exit_val = 1;
            }
        }
    }

    /// Runs the `exit` command.
    fn run_exit(&mut self, args: &[String]) -> ShellMsg {
        let exit_val = match args.first() {
            None => self.exit_val,
            Some(s) => match s.parse::<i32>() {
                Ok(n) => n,
                Err(_) => {
                    eprintln!("pipesh: exit: {s} is not a valid exit status");
                    self.exit_val = 1;
                    return ShellMsg::Continue(self.exit_val);
                }
            },
        };

        self.wait_background();
        if !self.jobs.is_empty() {
            // init adopts and reaps them once we are gone
            eprintln!("pipesh: leaving {} background job(s) running", self.jobs.len());
        }
        ShellMsg::Quit(exit_val)
    }

    /// Runs the `env` command.
    fn run_env(&mut self) -> ShellMsg {
        println!("Environment Variables:");
        for (name, value) in self.env.iter() {
            println!("{name}={value}");
        }
        self.exit_val = 0;
        ShellMsg::Continue(self.exit_val)
    }

    /// Runs the `set` command.
    fn run_set(&mut self, args: &[String]) -> ShellMsg {
        if args.is_empty() {
            eprintln!("usage: set NAME=VALUE...");
            self.exit_val = 1;
            return ShellMsg::Continue(self.exit_val);
        }

        self.exit_val = 0;
        for assignment in args {
            if let Err(e) = self.env.assign(assignment) {
                eprintln!("pipesh: set: {e}");
                self.exit_val = 1;
            }
        }
        ShellMsg::Continue(self.exit_val)
    }

    /// Runs the `jobs` command.
    fn run_jobs(&mut self) -> ShellMsg {
        self.wait_background();
        for (id, job) in &self.jobs {
            let pids: Vec<String> = job.handles.pids().iter().map(|p| p.to_string()).collect();
            println!("[{id}] Running\t{}\t{}", pids.join(" "), job.line);
        }
        self.exit_val = 0;
        ShellMsg::Continue(self.exit_val)
    }

    /// Runs the `bg` command: the rest of the set goes to the background.
    fn run_bg(&mut self, args: &[String], set: &CommandSet) -> ShellMsg {
        self.exit_val = 1;
        if args.is_empty() {
            eprintln!("usage: bg <command> [args...]");
            return ShellMsg::Continue(self.exit_val);
        }

        let Some(job_id) = self.get_new_job_id() else {
            eprintln!("pipesh: too many background jobs");
            return ShellMsg::Continue(self.exit_val);
        };

        let mut bg_set = CommandSet::new();
        bg_set.push(args.join(" "));
        for line in &set.lines()[1..] {
            bg_set.push(line.as_str());
        }

        let result = Pipeline::parse(&bg_set, self.max_commands)
            .and_then(|p| p.envs(self.env.iter()).run_background());
        match result {
            Ok(handles) => {
                let pids: Vec<String> = handles.pids().iter().map(|p| p.to_string()).collect();
                println!("[{job_id}] Background process started with PID: {}", pids.join(" "));
                let line = bg_set.lines().join(" | ");
                self.jobs.insert(job_id, Job { line, handles });
                self.exit_val = 0;
            }
            Err(e) => eprintln!("pipesh: bg: {e}"),
        }
        ShellMsg::Continue(self.exit_val)
    }

    /// Reaps finished background jobs without blocking.
    fn wait_background(&mut self) {
        let done: Vec<usize> = self
            .jobs
            .iter_mut()
            .filter_map(|(id, job)| job.handles.try_reap().then_some(*id))
            .collect();

        for id in done {
            if let Some(job) = self.jobs.remove(&id) {
                let failed = job.handles.exits().iter().flatten().any(|e| !e.success());
                let state = if failed { "Exit" } else { "Done" };
                eprintln!("[{id}] {state}\t{}", job.line);
                if failed {
                    error!(job = id, "background job failed: {:?}", job.handles.exits());
                }
            }
        }
    }

    /// Returns the smallest unused job id.
    fn get_new_job_id(&self) -> Option<usize> {
        (1..=usize::MAX).find(|id| !self.jobs.contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::{
        sys::signal::{Signal, kill},
        unistd::getpid,
    };
    use std::time::{Duration, Instant};

    #[test]
    fn splits_inline_pipes() {
        assert_eq!(split_pipes("echo hello | tr a-z A-Z"), ["echo hello", "tr a-z A-Z"]);
        assert_eq!(split_pipes("ls"), ["ls"]);
    }

    #[test]
    fn recognizes_immediate_builtins() {
        assert!(is_immediate_builtin("exit 3"));
        assert!(is_immediate_builtin("  set A=1"));
        assert!(!is_immediate_builtin("bg sleep 1"));
        assert!(!is_immediate_builtin("exitcode"));
        assert!(!is_immediate_builtin(""));
    }

    fn cmd(lines: &[&str]) -> CommandSet {
        lines.iter().copied().collect()
    }

    #[test]
    fn set_and_env_update_the_environment() {
        let mut worker = Worker::new(8);
        assert!(matches!(worker.handle(&cmd(&["set A=1 B=two"])), ShellMsg::Continue(0)));
        assert_eq!(worker.env.get("A"), Some("1"));
        assert_eq!(worker.env.get("B"), Some("two"));

        assert!(matches!(worker.handle(&cmd(&["set broken"])), ShellMsg::Continue(1)));
        assert!(matches!(worker.handle(&cmd(&["env"])), ShellMsg::Continue(0)));
    }

    #[test]
    fn exit_uses_argument_or_last_status() {
        let mut worker = Worker::new(8);
        assert!(matches!(worker.handle(&cmd(&["exit 3"])), ShellMsg::Quit(3)));
        assert!(matches!(worker.handle(&cmd(&["exit nope"])), ShellMsg::Continue(1)));
        assert!(matches!(worker.handle(&cmd(&["exit"])), ShellMsg::Quit(1)));
    }

    #[test]
    fn builtins_cannot_be_piped() {
        let mut worker = Worker::new(8);
        assert!(matches!(worker.handle(&cmd(&["exit", "cat"])), ShellMsg::Continue(1)));
    }

    #[test]
    fn foreground_status_is_last_command() {
        let mut worker = Worker::new(8);
        assert!(matches!(worker.handle(&cmd(&["true", "false"])), ShellMsg::Continue(1)));
        assert!(matches!(worker.handle(&cmd(&["false", "true"])), ShellMsg::Continue(0)));
        assert!(matches!(worker.handle(&cmd(&["cat <"])), ShellMsg::Continue(1)));
    }

    #[test]
    fn sigint_to_the_shell_leaves_children_running() {
        let interrupted = Arc::new(AtomicBool::new(false));
        flag::register(SIGINT, Arc::clone(&interrupted)).unwrap();

        let sender = thread::spawn(|| {
            thread::sleep(Duration::from_millis(100));
            kill(getpid(), Signal::SIGINT).unwrap();
        });
        let mut worker = Worker::new(8);
        let reply = worker.handle(&cmd(&["sleep 0.4"]));
        sender.join().unwrap();

        assert!(matches!(reply, ShellMsg::Continue(0)));
        assert!(interrupted.load(Ordering::SeqCst));
    }

    #[test]
    fn set_variables_reach_children() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");

        let mut worker = Worker::new(8);
        worker.handle(&cmd(&["set PIPESH_GREETING=hi"]));
        let line = format!("printenv PIPESH_GREETING > {}", out.display());
        assert!(matches!(worker.handle(&cmd(&[line.as_str()])), ShellMsg::Continue(0)));
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hi\n");
    }

    #[test]
    fn bg_registers_and_reaps_a_job() {
        let mut worker = Worker::new(8);
        assert!(matches!(worker.handle(&cmd(&["bg sleep 0.2"])), ShellMsg::Continue(0)));
        assert_eq!(worker.jobs.len(), 1);
        assert_eq!(worker.get_new_job_id(), Some(2));

        let deadline = Instant::now() + Duration::from_secs(10);
        while !worker.jobs.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
            worker.wait_background();
        }
        assert!(worker.jobs.is_empty());
        assert_eq!(worker.get_new_job_id(), Some(1));
    }

    #[test]
    fn bg_without_command_fails() {
        let mut worker = Worker::new(8);
        assert!(matches!(worker.handle(&cmd(&["bg"])), ShellMsg::Continue(1)));
        assert!(worker.jobs.is_empty());
    }
}
