//! Error taxonomy. Every fatal path surfaces a [`ModsError`]: a wrapped
//! cause plus a human-facing reason, rendered as a two-line report on
//! stderr. Flag-parse failures carry the offending flag so CLI feedback
//! stays uniform.

use std::fmt;
use std::io::Read;

use clap::error::{ContextKind, ContextValue, ErrorKind};
use thiserror::Error;

use crate::term::is_input_tty;

/// A wrapped cause with a user-facing reason.
#[derive(Debug)]
pub struct ModsError {
    reason: String,
    source: anyhow::Error,
}

impl ModsError {
    pub fn new(reason: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self {
            reason: reason.into(),
            source: source.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn detail(&self) -> String {
        self.source.to_string()
    }
}

impl fmt::Display for ModsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for ModsError {}

/// A bare user-facing message with no underlying cause.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct UserError(pub String);

pub fn user_error(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(UserError(msg.into()))
}

/// A CLI parse failure, carrying the offending flag and a parameterized
/// reason template.
#[derive(Debug)]
pub struct FlagParseError {
    flag: String,
    template: &'static str,
    source: clap::Error,
}

impl FlagParseError {
    pub fn flag(&self) -> &str {
        &self.flag
    }

    pub fn reason(&self) -> String {
        self.template.replace("{flag}", &self.flag)
    }
}

impl fmt::Display for FlagParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source.render())
    }
}

impl std::error::Error for FlagParseError {}

fn invalid_arg(err: &clap::Error) -> String {
    err.get(ContextKind::InvalidArg)
        .and_then(|value| match value {
            ContextValue::String(flag) => Some(flag.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

pub fn flag_parse_error(err: clap::Error) -> FlagParseError {
    let (flag, template) = match err.kind() {
        ErrorKind::UnknownArgument => (invalid_arg(&err), "Flag {flag} does not exist."),
        ErrorKind::InvalidValue | ErrorKind::ValueValidation => {
            (invalid_arg(&err), "Invalid argument for flag {flag}.")
        }
        ErrorKind::MissingRequiredArgument => {
            (invalid_arg(&err), "Flag {flag} needs an argument.")
        }
        ErrorKind::ArgumentConflict => (
            invalid_arg(&err),
            "Flag {flag} cannot be combined with the other given flags.",
        ),
        _ => (String::new(), "{flag}"),
    };
    FlagParseError {
        flag,
        template,
        source: err,
    }
}

/// Renders a fatal error to stderr: reason first, detail second. Piped
/// stdin is drained so the writing end never sees a broken pipe.
pub fn handle_error(err: &anyhow::Error) {
    if !is_input_tty() {
        let mut sink = Vec::new();
        let _ = std::io::stdin().read_to_end(&mut sink);
    }

    if let Some(ferr) = err.downcast_ref::<FlagParseError>() {
        eprintln!("\nCheck mods -h for help.\n");
        let reason = ferr.reason();
        if reason.is_empty() {
            eprintln!("{ferr}\n");
        } else {
            eprintln!("{reason}\n");
        }
        return;
    }
    if let Some(merr) = err.downcast_ref::<ModsError>() {
        eprintln!("\n  ERROR  {}\n", merr.reason());
        eprintln!("  {}\n", merr.detail());
        return;
    }
    eprintln!("\n{err}\n");
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct Probe {
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temp: Option<f64>,
    }

    #[test]
    fn unknown_flags_are_named() {
        let err = Probe::try_parse_from(["mods", "--does-not-exist"]).unwrap_err();
        let ferr = flag_parse_error(err);
        assert_eq!(ferr.flag(), "--does-not-exist");
        assert_eq!(ferr.reason(), "Flag --does-not-exist does not exist.");
    }

    #[test]
    fn invalid_values_are_named() {
        let err = Probe::try_parse_from(["mods", "--temp", "warm"]).unwrap_err();
        let ferr = flag_parse_error(err);
        assert!(ferr.flag().contains("--temp"));
        assert!(ferr.reason().contains("Invalid argument"));
    }

    #[test]
    fn mods_error_keeps_reason_and_detail() {
        let err = ModsError::new(
            "Could not open the database.",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only fs"),
        );
        assert_eq!(err.reason(), "Could not open the database.");
        assert_eq!(err.detail(), "read-only fs");
    }
}
