//! A small line-oriented shell.
//!
//! Each input line is either a variable assignment (`NAME=value`) or a pipeline of
//! programs joined by `|`, with optional `<`, `>` and `>>` file redirections and
//! `$NAME` substitution. Pipelines run as real processes wired together with pipes;
//! `cd` and `exit` run inside the shell itself.
//!
//! The main entry point is [`Interpreter`], which reads lines from a [`LineSource`]
//! and keeps the variable store ([`env::Environment`]) between them. The lower-level
//! pieces are public too: [`parser::parse`] turns a line into a
//! [`command::Pipeline`], and [`Executor`] runs one.

mod builtin;
pub mod command;
pub mod env;
mod executor;
mod external;
mod interpreter;
mod io_adapters;
mod lexer;
pub mod parser;

pub use builtin::Builtins;
pub use executor::Executor;
pub use external::find_command_path;
/// Just a convenient re-export of the interactive command runner.
///
/// See [`Interpreter`] for the high-level API and examples.
pub use interpreter::{Interpreter, LineSource, PromptSource, ScriptSource};
