use nix::errno::Errno;
use thiserror::Error;

/// Errors raised in the controlling process before or while a pipeline is launched.
///
/// Failures that happen inside a child after `fork` (a redirection file that
/// cannot be opened, an executable that cannot be run) never show up here:
/// they terminate only that child and surface as its exit status.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The line holds no tokens. Terminates a command set rather than failing it.
    #[error("empty command line")]
    TokenizeEmpty,

    #[error("no commands to run")]
    EmptyCommandSet,

    /// A command consisted only of redirections.
    #[error("command {position}: nothing to execute")]
    EmptyCommand { position: usize },

    #[error("pipeline of {count} commands exceeds the limit of {max}")]
    TooManyCommands { count: usize, max: usize },

    #[error("missing file after '{operator}'")]
    MissingRedirectionTarget { operator: &'static str },

    /// Input redirection on a position other than the first, or output
    /// redirection on a position other than the last.
    #[error("command {position}: '{operator}' is only allowed on the {allowed} command of a pipeline")]
    MisplacedRedirection {
        position: usize,
        operator: &'static str,
        allowed: &'static str,
    },

    #[error("argument contains a NUL byte: {0:?}")]
    InvalidArgument(String),

    #[error("failed to create pipe: {0}")]
    PipeCreationFailed(Errno),

    #[error("failed to fork command {position}: {errno}")]
    ForkFailed { position: usize, errno: Errno },
}
