use std::collections::BTreeMap;
use thiserror::Error;

/// Variables defined with the `set` built-in.
///
/// Owned by the worker thread and handed to built-ins by reference. Every
/// pipeline started afterwards sees these variables on top of the
/// inherited process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssignError {
    #[error("expected NAME=VALUE, got '{0}'")]
    MissingEquals(String),
    #[error("'{0}' is not a valid variable name")]
    InvalidName(String),
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Applies an assignment of the form `NAME=VALUE`. The value may be empty.
    pub fn assign(&mut self, assignment: &str) -> Result<(), AssignError> {
        let (name, value) = assignment
            .split_once('=')
            .ok_or_else(|| AssignError::MissingEquals(assignment.to_string()))?;
        if !is_valid_name(name) {
            return Err(AssignError::InvalidName(name.to_string()));
        }
        self.set(name, value);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
