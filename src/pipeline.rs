use crate::{
    error::PipelineError,
    launch::{self, Launch, ProcessGroup},
    pipe::PipeSet,
    reap::{self, Child, ProcessExit, ProcessHandles, Reaped},
    redirect::{self, RedirectionSpec},
    tokenize::tokenize,
};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Default upper bound on the number of commands in one pipeline.
pub const MAX_COMMANDS: usize = 100;

/// The raw command lines of one pipeline, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSet {
    lines: Vec<String>,
}

impl CommandSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl<S: Into<String>> FromIterator<S> for CommandSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        CommandSet {
            lines: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// One position of a parsed pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub args: Vec<String>,
    pub redirect: RedirectionSpec,
}

/// The outcome of a foreground pipeline, in pipeline order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineResult {
    pub processes: Vec<Reaped>,
}

impl PipelineResult {
    pub fn pids(&self) -> Vec<Pid> {
        self.processes.iter().map(|p| p.pid).collect()
    }

    pub fn exits(&self) -> Vec<ProcessExit> {
        self.processes.iter().map(|p| p.exit).collect()
    }

    /// Shell-style status codes of every process.
    pub fn codes(&self) -> Vec<i32> {
        self.processes.iter().map(|p| p.exit.code()).collect()
    }

    /// Status of the pipeline as a whole: the status of its last command.
    pub fn code(&self) -> i32 {
        self.processes.last().map_or(0, |p| p.exit.code())
    }
}

/// A validated pipeline, ready to launch.
///
/// Parsing does all the checking; nothing is created in the kernel until
/// [`Pipeline::run_foreground`] or [`Pipeline::run_background`] is called.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    envs: BTreeMap<String, String>,
}

impl Pipeline {
    /// Tokenizes and resolves every command of `set`.
    ///
    /// Only the first command may redirect its input and only the last may
    /// redirect its output; anything else would fight with the pipes.
    pub fn parse(set: &CommandSet, max: usize) -> Result<Self, PipelineError> {
        if set.is_empty() {
            return Err(PipelineError::EmptyCommandSet);
        }
        if set.len() > max {
            return Err(PipelineError::TooManyCommands {
                count: set.len(),
                max,
            });
        }

        let last = set.len() - 1;
        let mut stages = Vec::with_capacity(set.len());
        for (position, line) in set.lines().iter().enumerate() {
            let (args, redirect) = redirect::resolve(tokenize(line)?)?;
            if args.is_empty() {
                return Err(PipelineError::EmptyCommand { position });
            }
            if redirect.input.is_some() && position != 0 {
                return Err(PipelineError::MisplacedRedirection {
                    position,
                    operator: "<",
                    allowed: "first",
                });
            }
            if redirect.output.is_some() && position != last {
                return Err(PipelineError::MisplacedRedirection {
                    position,
                    operator: redirect.output_operator(),
                    allowed: "last",
                });
            }
            stages.push(Stage { args, redirect });
        }

        Ok(Pipeline {
            stages,
            envs: BTreeMap::new(),
        })
    }

    /// Adds variables to the children's environment, overriding the inherited ones.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.envs
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs the pipeline and blocks until every process has terminated.
    pub fn run_foreground(&self) -> Result<PipelineResult, PipelineError> {
        let children = self.spawn_all(false)?;
        let processes = reap::reap_all(&children);
        Ok(PipelineResult { processes })
    }

    /// Starts the pipeline in its own process group and returns at once.
    pub fn run_background(&self) -> Result<ProcessHandles, PipelineError> {
        let children = self.spawn_all(true)?;
        let pgid = children[0].pid;
        debug!(%pgid, "pipeline running in background");
        Ok(ProcessHandles::new(pgid, children))
    }

    /// Prepares every position, allocates the pipes, forks all children and
    /// closes the parent's pipe ends.
    fn spawn_all(&self, isolate: bool) -> Result<Vec<Child>, PipelineError> {
        let path = launch::search_path(&self.envs);
        let envp = launch::environment_block(&self.envs)?;
        let launches = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| Launch::prepare(i, &s.args, &s.redirect, &path))
            .collect::<Result<Vec<_>, _>>()?;

        let pipes = PipeSet::allocate(launches.len())?;

        let mut children: Vec<Child> = Vec::with_capacity(launches.len());
        for (position, launch) in launches.iter().enumerate() {
            let group = match (isolate, children.first()) {
                (false, _) => ProcessGroup::Inherit,
                (true, None) => ProcessGroup::Join(Pid::from_raw(0)), // first child leads
                (true, Some(leader)) => ProcessGroup::Join(leader.pid),
            };

            let plan = pipes.plan(position);
            match launch.spawn(&plan, &envp, group) {
                Ok(pid) => children.push(Child {
                    pid,
                    program: launch.program().to_owned(),
                }),
                Err(errno) => {
                    warn!(position, program = launch.program(), "fork failed: {errno}");
                    // Close our pipe ends so the started children see EOF, then collect them.
                    drop(pipes);
                    reap::reap_all(&children);
                    return Err(PipelineError::ForkFailed { position, errno });
                }
            }
        }

        // The children hold their own copies now.
        drop(pipes);
        Ok(children)
    }
}

/// Runs `set` in the foreground with the default command limit.
pub fn run_foreground(set: &CommandSet) -> Result<PipelineResult, PipelineError> {
    Pipeline::parse(set, MAX_COMMANDS)?.run_foreground()
}

/// Runs `set` in the background with the default command limit.
pub fn run_background(set: &CommandSet) -> Result<ProcessHandles, PipelineError> {
    Pipeline::parse(set, MAX_COMMANDS)?.run_background()
}
