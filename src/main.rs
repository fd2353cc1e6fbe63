use argh::{EarlyExit, FromArgs};
use snail_shell::Interpreter;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(FromArgs)]
/// A line-oriented shell. Reads commands from standard input with a prompt, or from
/// a script file.
struct Args {
    #[argh(option, short = 's')]
    /// run the commands in this file instead of reading standard input; also accepted
    /// as --script=<path>
    script: Option<PathBuf>,
}

/// argh has no `--option=value` syntax, so split it into two arguments.
fn split_inline_values(args: impl Iterator<Item = String>) -> Vec<String> {
    args.flat_map(|arg| match arg.strip_prefix("--script=") {
        Some(path) => vec!["--script".to_string(), path.to_string()],
        None => vec![arg],
    })
    .collect()
}

fn setup_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> ExitCode {
    let mut raw = std::env::args();
    let program = raw.next().unwrap_or_else(|| "snail_shell".to_string());
    let args = split_inline_values(raw);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    let args = match Args::from_args(&[program.as_str()], &arg_refs) {
        Ok(args) => args,
        Err(EarlyExit { output, status }) => {
            return match status {
                Ok(()) => {
                    println!("{}", output);
                    ExitCode::SUCCESS
                }
                Err(()) => {
                    eprintln!("{}", output);
                    ExitCode::FAILURE
                }
            };
        }
    };

    setup_logging();

    let mut sh = Interpreter::default();
    let result = match &args.script {
        Some(path) => sh.run_script(path),
        None => sh.repl(),
    };
    match result {
        Ok(code) => ExitCode::from((code & 0xff) as u8),
        Err(e) => {
            eprintln!("snail_shell: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
