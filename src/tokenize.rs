use crate::error::PipelineError;

/// One command as typed by the user: the executable name followed by its
/// arguments and any redirection operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    tokens: Vec<String>,
}

impl CommandSpec {
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<String> {
        self.tokens
    }

    /// The executable name.
    pub fn program(&self) -> &str {
        &self.tokens[0]
    }
}

/// Splits a line into whitespace-delimited tokens.
///
/// Runs of whitespace collapse into a single delimiter. There is no quoting,
/// so a token can never contain whitespace.
///
/// # Example
///
/// `"echo  abc def"` yields `["echo", "abc", "def"]`.
pub fn tokenize(line: &str) -> Result<CommandSpec, PipelineError> {
    let tokens: Vec<String> = line.split_whitespace().map(str::to_owned).collect();
    if tokens.is_empty() {
        Err(PipelineError::TokenizeEmpty)
    } else {
        Ok(CommandSpec { tokens })
    }
}
