//! Command pipelines built directly on `fork`, `pipe`, `dup2` and `execve`.
//!
//! A [`CommandSet`] holds one raw command line per pipeline position. Each
//! line is tokenized on whitespace and may carry `<`, `>` or `>>`
//! redirections on the first (input) and last (output) command. The
//! pipeline is then wired so that every command's stdout feeds the next
//! command's stdin, and every spawned process is reaped.
//!
//! ```no_run
//! use pipesh::{CommandSet, run_foreground};
//!
//! let set: CommandSet = ["echo hello", "tr a-z A-Z"].into_iter().collect();
//! let result = run_foreground(&set).unwrap();
//! assert_eq!(result.codes(), [0, 0]);
//! ```
//!
//! The [`shell`] module contains the interactive driver used by the binary.

pub mod config;
pub mod env;
pub mod error;
pub mod helper;
mod launch;
pub mod logging;
pub mod pipe;
pub mod pipeline;
pub mod reap;
pub mod redirect;
pub mod shell;
pub mod tokenize;

pub use error::PipelineError;
pub use launch::{EXIT_NOT_EXECUTABLE, EXIT_NOT_FOUND, EXIT_REDIRECT_FAILED, find_executable};
pub use pipeline::{CommandSet, MAX_COMMANDS, Pipeline, PipelineResult, run_background, run_foreground};
pub use reap::{ProcessExit, ProcessHandles, Reaped};
pub use redirect::RedirectionSpec;
pub use tokenize::{CommandSpec, tokenize};
