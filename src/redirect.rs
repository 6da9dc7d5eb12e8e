use crate::{error::PipelineError, tokenize::CommandSpec};
use std::path::{Path, PathBuf};

/// File redirections attached to one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectionSpec {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub append: bool, // `>>` instead of `>`
}

impl RedirectionSpec {
    pub fn is_empty(&self) -> bool {
        self.input.is_none() && self.output.is_none()
    }

    pub fn input(&self) -> Option<&Path> {
        self.input.as_deref()
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    /// The operator that produced the output redirection.
    pub fn output_operator(&self) -> &'static str {
        if self.append { ">>" } else { ">" }
    }
}

/// Removes `<`, `>` and `>>` together with their target from the command.
///
/// Returns the remaining arguments in their original order and the
/// redirections found. A second redirection in the same direction replaces
/// the first one.
pub fn resolve(cmd: CommandSpec) -> Result<(Vec<String>, RedirectionSpec), PipelineError> {
    let mut args = Vec::new();
    let mut redirect = RedirectionSpec::default();

    let mut tokens = cmd.into_tokens().into_iter();
    while let Some(token) = tokens.next() {
        let operator = match token.as_str() {
            "<" => "<",
            ">" => ">",
            ">>" => ">>",
            _ => {
                args.push(token);
                continue;
            }
        };

        let target = tokens
            .next()
            .ok_or(PipelineError::MissingRedirectionTarget { operator })?;

        match operator {
            "<" => redirect.input = Some(PathBuf::from(target)),
            _ => {
                redirect.output = Some(PathBuf::from(target));
                redirect.append = operator == ">>";
            }
        }
    }

    Ok((args, redirect))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenize::tokenize;

    fn resolve_line(line: &str) -> Result<(Vec<String>, RedirectionSpec), PipelineError> {
        resolve(tokenize(line).unwrap())
    }

    #[test]
    fn no_redirection() {
        let (args, redirect) = resolve_line("grep -v foo").unwrap();
        assert_eq!(args, ["grep", "-v", "foo"]);
        assert!(redirect.is_empty());
    }

    #[test]
    fn input_and_output() {
        let (args, redirect) = resolve_line("sort < in.txt -r > out.txt").unwrap();
        assert_eq!(args, ["sort", "-r"]);
        assert_eq!(redirect.input(), Some(Path::new("in.txt")));
        assert_eq!(redirect.output(), Some(Path::new("out.txt")));
        assert!(!redirect.append);
    }

    #[test]
    fn append_mode() {
        let (args, redirect) = resolve_line("echo hi >> log").unwrap();
        assert_eq!(args, ["echo", "hi"]);
        assert_eq!(redirect.output(), Some(Path::new("log")));
        assert!(redirect.append);
        assert_eq!(redirect.output_operator(), ">>");
    }

    #[test]
    fn later_redirection_wins() {
        let (args, redirect) = resolve_line("echo a >> first > second").unwrap();
        assert_eq!(args, ["echo", "a"]);
        assert_eq!(redirect.output(), Some(Path::new("second")));
        assert!(!redirect.append);

        let (_, redirect) = resolve_line("cat < a < b").unwrap();
        assert_eq!(redirect.input(), Some(Path::new("b")));
    }

    #[test]
    fn trailing_operator_is_rejected() {
        assert_eq!(
            resolve_line("cat <"),
            Err(PipelineError::MissingRedirectionTarget { operator: "<" })
        );
        assert_eq!(
            resolve_line("echo x >>"),
            Err(PipelineError::MissingRedirectionTarget { operator: ">>" })
        );
    }

    #[test]
    fn operator_glued_to_word_is_an_argument() {
        let (args, redirect) = resolve_line("echo >out").unwrap();
        assert_eq!(args, ["echo", ">out"]);
        assert!(redirect.is_empty());
    }
}
