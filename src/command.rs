use crate::env::Environment;
use anyhow::Result;
use std::io::Write;
use std::path::PathBuf;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// This mirrors the convention used by POSIX shells and many command-line tools.
pub type ExitCode = i32;

/// Where a stage's standard output goes when it is redirected to a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRedirect {
    /// File to write to; created when missing.
    pub path: PathBuf,
    /// `>>` appends to the file, `>` truncates it first.
    pub append: bool,
}

/// One stage of a pipeline.
///
/// `argv[0]` is the program or built-in name. Redirection operators never appear in
/// `argv`; the parser moves their targets into `stdin` and `stdout`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub argv: Vec<String>,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<OutputRedirect>,
}

impl Command {
    /// Program or built-in name, `None` for a stage without arguments.
    pub fn name(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

/// Stages parsed from one input line, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Command>,
}

impl Pipeline {
    pub fn new(stages: Vec<Command>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Command] {
        &self.stages
    }
}

impl IntoIterator for Pipeline {
    type Item = Command;
    type IntoIter = std::vec::IntoIter<Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.stages.into_iter()
    }
}

/// Object-safe trait for any command that runs inside the shell process.
///
/// Built-ins implement it through a blanket impl; see [`crate::builtin`].
pub trait ExecutableCommand {
    /// Executes the command.
    ///
    /// `diagnostics` receives user-facing error messages.
    fn execute(
        self: Box<Self>,
        diagnostics: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode>;
}

/// Factory that tries to create a command from a name and its arguments.
///
/// Returns `None` when the factory doesn't recognize the `name`.
pub trait CommandFactory {
    /// Attempt to create a command instance for the provided name and arguments.
    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>>;
}
