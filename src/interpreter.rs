use crate::builtin::Builtins;
use crate::command::ExitCode;
use crate::env::Environment;
use crate::executor::Executor;
use crate::parser;
use anyhow::{Context, Result};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

/// Somewhere to read command lines from.
pub trait LineSource {
    /// Next line without its line terminator, or `None` at end of input.
    fn next_line(&mut self) -> Result<Option<String>>;
}

/// Lines read from a script file, without any prompt.
pub struct ScriptSource<R> {
    reader: R,
}

impl ScriptSource<BufReader<File>> {
    /// Open the script at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("can't open script {}", path.display()))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> ScriptSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> LineSource for ScriptSource<R> {
    fn next_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(strip_line_ending(&line).to_string()))
    }
}

/// Interactive input with a `<cwd> > ` prompt before every line.
pub struct PromptSource {
    editor: DefaultEditor,
}

impl PromptSource {
    pub fn new() -> Result<Self> {
        Ok(Self {
            editor: DefaultEditor::new()?,
        })
    }

    fn prompt() -> Result<String> {
        let cwd = std::env::current_dir().context("can't determine current directory")?;
        Ok(format!("{} > ", cwd.display()))
    }
}

impl LineSource for PromptSource {
    fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            match self.editor.readline(&Self::prompt()?) {
                Ok(line) => return Ok(Some(line)),
                // Ctrl-C drops the line being typed and asks again.
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// A line-oriented shell: parses each line into a pipeline and runs it.
///
/// The interpreter owns the variable store and the built-in registry, and reports
/// user errors (bad assignments, dangling redirections, failing built-ins) to its
/// diagnostics stream, which is standard error unless replaced.
///
/// Example
/// ```no_run
/// use snail_shell::Interpreter;
/// let mut sh = Interpreter::default();
/// sh.run_line("GREETING=hello").unwrap();
/// let code = sh.run_line("echo $GREETING | cat").unwrap();
/// assert_eq!(code, Some(0));
/// ```
pub struct Interpreter {
    env: Environment,
    builtins: Builtins,
    diagnostics: Box<dyn Write>,
}

impl Interpreter {
    /// Create a new interpreter with a custom store and set of built-ins.
    pub fn new(env: Environment, builtins: Builtins) -> Self {
        Self {
            env,
            builtins,
            diagnostics: Box::new(io::stderr()),
        }
    }

    /// Send user-facing error messages somewhere other than standard error.
    pub fn with_diagnostics(mut self, diagnostics: Box<dyn Write>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Parse and run one line.
    ///
    /// Returns the pipeline's exit code, or `None` when the line ran nothing (blank
    /// line, assignment, parse error). An `Err` is fatal for the shell.
    pub fn run_line(&mut self, line: &str) -> Result<Option<ExitCode>> {
        let pipeline = match parser::parse(strip_line_ending(line), &mut self.env) {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => return Ok(None),
            Err(e) => {
                writeln!(self.diagnostics, "snail_shell: {}", e)?;
                return Ok(None);
            }
        };
        tracing::debug!(?pipeline, "parsed line");

        let mut executor = Executor::new(&mut self.env, &self.builtins, &mut *self.diagnostics);
        executor.execute(pipeline).map(Some)
    }

    /// Read-eval loop: run every line from `source` until end of input or `exit`.
    ///
    /// Returns 0 at end of input, or the code passed to `exit`.
    pub fn run(&mut self, source: &mut dyn LineSource) -> Result<ExitCode> {
        while let Some(line) = source.next_line()? {
            self.run_line(&line)?;
            if let Some(code) = self.env.pending_exit() {
                return Ok(code);
            }
        }
        Ok(0)
    }

    /// Run the commands of a script file.
    pub fn run_script(&mut self, path: &Path) -> Result<ExitCode> {
        let mut source = ScriptSource::open(path)?;
        self.run(&mut source)
    }

    /// Interactive read-eval loop on the terminal.
    pub fn repl(&mut self) -> Result<ExitCode> {
        let mut source = PromptSource::new()?;
        self.run(&mut source)
    }
}

impl Default for Interpreter {
    /// An interpreter over the process environment with the standard built-ins.
    fn default() -> Self {
        Self::new(Environment::new(), Builtins::default())
    }
}
