use crate::command::{Command, OutputRedirect, Pipeline};
use crate::env::Environment;
use crate::lexer::{self, Token};
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use thiserror::Error;

static VARIABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_]+$").expect("variable name pattern is valid"));

/// Errors that can occur while parsing a line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParsingError {
    /// The text before `=` in an assignment line is not a valid variable name.
    #[error("invalid variable name '{0}'")]
    InvalidVariableName(String),

    /// A redirection operator was the last word of its segment, or was followed
    /// by another operator.
    #[error("missing file name after '{0}'")]
    MissingRedirectTarget(&'static str),
}

/// Whether `name` may be assigned to: non-empty, ASCII letters and underscores only.
pub fn is_valid_variable_name(name: &str) -> bool {
    VARIABLE_NAME.is_match(name)
}

/// Parse one input line.
///
/// Returns `Ok(None)` when there is nothing to execute: the line is blank, or it was
/// an assignment (which is applied to `env` right away). Any line containing `=` is
/// an assignment, so the value may contain `|`, `<` and `>` literally.
pub fn parse(line: &str, env: &mut Environment) -> Result<Option<Pipeline>, ParsingError> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    if let Some((name, value)) = line.split_once('=') {
        assign(name.trim_start(), value, env)?;
        return Ok(None);
    }

    let stages = line
        .split('|')
        .map(|segment| parse_command(segment, env))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(Pipeline::new(stages)))
}

fn assign(name: &str, value: &str, env: &mut Environment) -> Result<(), ParsingError> {
    if !is_valid_variable_name(name) {
        return Err(ParsingError::InvalidVariableName(name.to_string()));
    }
    tracing::debug!(name, value, "assign variable");
    env.set_var(name, value);
    Ok(())
}

/// Parse a command: (word | redirect)*
///
/// A segment without any word yields a command with an empty `argv`; rejecting it is
/// left to the executor.
fn parse_command(segment: &str, env: &Environment) -> Result<Command, ParsingError> {
    let mut command = Command::default();
    let mut tokens = lexer::split_into_tokens(segment).into_iter();

    while let Some(token) = tokens.next() {
        match token {
            Token::Word(word) => command.argv.push(substitute(word, env)),
            Token::RedirectLeft => {
                command.stdin = Some(redirect_target(tokens.next(), "<")?);
            }
            Token::RedirectRight => {
                command.stdout = Some(OutputRedirect {
                    path: redirect_target(tokens.next(), ">")?,
                    append: false,
                });
            }
            Token::RedirectAppend => {
                command.stdout = Some(OutputRedirect {
                    path: redirect_target(tokens.next(), ">>")?,
                    append: true,
                });
            }
        }
    }

    Ok(command)
}

fn redirect_target(token: Option<Token<'_>>, operator: &'static str) -> Result<PathBuf, ParsingError> {
    match token {
        Some(Token::Word(path)) => Ok(PathBuf::from(path)),
        _ => Err(ParsingError::MissingRedirectTarget(operator)),
    }
}

/// `$NAME` is replaced wholly by the value of `NAME`, or by the empty string when
/// unset. Any other word is copied unchanged.
fn substitute(word: &str, env: &Environment) -> String {
    match word.strip_prefix('$') {
        Some(name) => env.get_var(name).unwrap_or_default(),
        None => word.to_string(),
    }
}
