use crate::{helper::DynError, pipeline::MAX_COMMANDS};
use argh::FromArgs;
use std::path::PathBuf;

const HISTORY_FILE: &str = ".pipesh_history";

#[derive(FromArgs, Debug)]
/// Read command sets from the terminal and run each one as a pipeline.
/// Enter one command per line and finish the set with an empty line.
pub struct Args {
    /// history file (default: ~/.pipesh_history)
    #[argh(option)]
    pub history: Option<PathBuf>,

    /// neither load nor save history
    #[argh(switch)]
    pub no_history: bool,

    /// maximum number of commands in one pipeline
    #[argh(option, default = "MAX_COMMANDS")]
    pub max_commands: usize,

    /// text shown at the start of the prompt
    #[argh(option, default = "String::from(\"pipesh\")")]
    pub prompt: String,
}

/// Settings of an interactive session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub history: Option<PathBuf>, // None disables history
    pub max_commands: usize,
    pub prompt: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            history: default_history(),
            max_commands: MAX_COMMANDS,
            prompt: "pipesh".to_string(),
        }
    }
}

impl TryFrom<Args> for Config {
    type Error = DynError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if args.max_commands == 0 {
            return Err("--max-commands must be at least 1".into());
        }

        let history = if args.no_history {
            None
        } else {
            args.history.or_else(default_history)
        };

        Ok(Config {
            history,
            max_commands: args.max_commands,
            prompt: args.prompt,
        })
    }
}

fn default_history() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(HISTORY_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::from_args(&["pipesh"], args).unwrap()
    }

    #[test]
    fn defaults() {
        let config = Config::try_from(parse(&[])).unwrap();
        assert_eq!(config.max_commands, MAX_COMMANDS);
        assert_eq!(config.prompt, "pipesh");
        assert_eq!(config.history, default_history());
    }

    #[test]
    fn options_override_defaults() {
        let config = Config::try_from(parse(&[
            "--history",
            "/tmp/h",
            "--max-commands",
            "4",
            "--prompt",
            "gopipe",
        ]))
        .unwrap();
        assert_eq!(config.history, Some(PathBuf::from("/tmp/h")));
        assert_eq!(config.max_commands, 4);
        assert_eq!(config.prompt, "gopipe");
    }

    #[test]
    fn no_history_wins() {
        let config = Config::try_from(parse(&["--history", "/tmp/h", "--no-history"])).unwrap();
        assert_eq!(config.history, None);
    }

    #[test]
    fn zero_commands_is_rejected() {
        assert!(Config::try_from(parse(&["--max-commands", "0"])).is_err());
    }
}
