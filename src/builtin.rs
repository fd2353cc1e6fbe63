use crate::command::{CommandFactory, ExecutableCommand, ExitCode};
use crate::env::Environment;
use anyhow::{Context, Result};
use argh::{EarlyExit, FromArgs};
use std::env;
use std::io::Write;
use std::path::PathBuf;

/// Built-in commands whose arguments are parsed with [`argh`] (`FromArgs`).
///
/// They are executed directly in-process without spawning a child process.
pub(crate) trait BuiltinCommand: Sized + FromArgs {
    /// Canonical name of the command, e.g. "cd".
    fn name() -> &'static str;

    /// Executes the command against the shell's own state.
    ///
    /// Return value should follow shell conventions: 0 for success, non-zero for error.
    fn execute(self, env: &mut Environment) -> Result<ExitCode>;
}

impl<T: BuiltinCommand> ExecutableCommand for T {
    fn execute(
        self: Box<Self>,
        diagnostics: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        match T::execute(*self, env) {
            Ok(x) => Ok(x),
            Err(e) => {
                writeln!(diagnostics, "{:#}", e)?;
                Ok(1)
            }
        }
    }
}

struct InvalidArgs {
    output: String,
    is_error: bool,
}

impl ExecutableCommand for InvalidArgs {
    fn execute(
        self: Box<Self>,
        diagnostics: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        writeln!(diagnostics, "{}", self.output.trim_end())?;
        Ok(if self.is_error { 1 } else { 0 })
    }
}

/// Factory allows creating instances of a [`BuiltinCommand`] by name.
pub(crate) struct Factory<T> {
    _phantom: std::marker::PhantomData<T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<T: BuiltinCommand + 'static> CommandFactory for Factory<T> {
    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>> {
        if name == T::name() {
            Some(match T::from_args(&[name], args) {
                Ok(cmd) => Box::new(cmd),
                Err(EarlyExit { output, status }) => Box::new(InvalidArgs {
                    output,
                    is_error: status.is_err(),
                }),
            })
        } else {
            None
        }
    }
}

/// Registry of commands that run inside the shell process.
///
/// The executor asks the registry about every stage before forking; a stage whose
/// name no factory recognizes is run as an external program.
pub struct Builtins {
    factories: Vec<Box<dyn CommandFactory>>,
}

impl Builtins {
    /// Create a registry from a custom set of factories.
    pub fn new(factories: Vec<Box<dyn CommandFactory>>) -> Self {
        Self { factories }
    }

    /// Add another factory. Earlier registrations win on name clashes.
    pub fn register(&mut self, factory: Box<dyn CommandFactory>) {
        self.factories.push(factory);
    }

    /// Create the built-in for `argv`, if any factory knows `argv[0]`.
    pub fn lookup(&self, argv: &[String]) -> Option<Box<dyn ExecutableCommand>> {
        let (name, rest) = argv.split_first()?;
        let args: Vec<&str> = rest.iter().map(String::as_str).collect();
        self.factories
            .iter()
            .find_map(|factory| factory.try_create(name, &args))
    }
}

impl Default for Builtins {
    /// The standard built-ins: `cd` and `exit`.
    fn default() -> Self {
        Self::new(vec![
            Box::new(CdFactory),
            Box::new(Factory::<Exit>::default()),
        ])
    }
}

/// Change the current working directory.
///
/// Arguments are taken as they are, never as options or help requests: the last one
/// is the target, and without any `cd` changes to `$HOME`.
pub(crate) struct Cd {
    target: Option<String>,
}

impl Cd {
    const NAME: &'static str = "cd";

    fn change_dir(&self, env: &Environment) -> Result<()> {
        let target = match &self.target {
            Some(t) => PathBuf::from(t),
            None => PathBuf::from(
                env.get_var("HOME")
                    .context("cd: no target and HOME not set")?,
            ),
        };

        env::set_current_dir(&target)
            .with_context(|| format!("cd: can't chdir to {}", target.display()))?;
        tracing::debug!(dir = %target.display(), "changed directory");
        Ok(())
    }
}

impl ExecutableCommand for Cd {
    fn execute(
        self: Box<Self>,
        diagnostics: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        match self.change_dir(env) {
            Ok(()) => Ok(0),
            Err(e) => {
                writeln!(diagnostics, "{:#}", e)?;
                Ok(1)
            }
        }
    }
}

/// Creates [`Cd`] from the raw words that follow `cd`.
pub(crate) struct CdFactory;

impl CommandFactory for CdFactory {
    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>> {
        if name != Cd::NAME {
            return None;
        }
        Some(Box::new(Cd {
            target: args.last().map(|arg| arg.to_string()),
        }))
    }
}

#[derive(FromArgs)]
/// Exit the shell after the current line.
pub struct Exit {
    #[argh(positional)]
    /// exit status of the shell, 0 when omitted.
    pub code: Option<ExitCode>,
}

impl BuiltinCommand for Exit {
    fn name() -> &'static str {
        "exit"
    }

    fn execute(self, env: &mut Environment) -> Result<ExitCode> {
        let code = self.code.unwrap_or(0);
        env.request_exit(code);
        Ok(code)
    }
}
