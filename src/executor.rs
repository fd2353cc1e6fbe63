use crate::builtin::Builtins;
use crate::command::{ExitCode, Pipeline};
use crate::env::Environment;
use crate::external::{self, ExternalCommand};
use crate::io_adapters::Pipe;
use anyhow::Result;
use nix::unistd::Pid;
use std::io::Write;
use std::os::fd::{AsFd, OwnedFd};

/// Exit status of a pipeline rejected before anything ran.
pub const USAGE_ERROR: ExitCode = 2;

/// What became of one stage after it was started.
#[derive(Debug)]
enum StageOutcome {
    /// Ran inside the shell, or failed before a child could be created.
    Done(ExitCode),
    /// A child process that still has to be waited for.
    Running(Pid),
}

/// Runs parsed pipelines.
///
/// Stages are started left to right: built-ins run in place, every other stage is
/// forked with its stdin and stdout wired to the neighbouring pipes. All children
/// are started before the executor waits for any of them.
pub struct Executor<'a> {
    env: &'a mut Environment,
    builtins: &'a Builtins,
    diagnostics: &'a mut dyn Write,
}

impl<'a> Executor<'a> {
    pub fn new(
        env: &'a mut Environment,
        builtins: &'a Builtins,
        diagnostics: &'a mut dyn Write,
    ) -> Self {
        Self {
            env,
            builtins,
            diagnostics,
        }
    }

    /// Run `pipeline` to completion and return the status of its last stage.
    ///
    /// Failures of a child (missing program, unopenable redirect) only show up in that
    /// child's exit status. An `Err` means the shell's own descriptor or process state
    /// is broken (pipe, fork or wait failed) or diagnostics could not be written. The
    /// children started before the failure have been waited for either way.
    pub fn execute(&mut self, pipeline: Pipeline) -> Result<ExitCode> {
        if let Some(index) = pipeline.stages().iter().position(|s| s.argv.is_empty()) {
            writeln!(
                self.diagnostics,
                "snail_shell: empty command in pipeline (stage {})",
                index + 1
            )?;
            return Ok(USAGE_ERROR);
        }

        let mut outcomes = Vec::with_capacity(pipeline.stages().len());
        let started = self.start_stages(pipeline, &mut outcomes);
        // Children that did start are waited for even when a later stage failed.
        let status = wait_all(outcomes);
        started.and(status)
    }

    /// Start every stage left to right, recording each outcome as soon as it exists.
    ///
    /// Pipe ends still held here are closed on return, on success or failure alike.
    fn start_stages(
        &mut self,
        pipeline: Pipeline,
        outcomes: &mut Vec<StageOutcome>,
    ) -> Result<()> {
        let last = pipeline.stages().len().saturating_sub(1);
        // Read end of the previous stage's pipe, not yet handed to a child.
        let mut upstream: Option<OwnedFd> = None;

        for (index, stage) in pipeline.into_iter().enumerate() {
            if let Some(builtin) = self.builtins.lookup(&stage.argv) {
                tracing::debug!(name = stage.name().unwrap_or_default(), "running built-in");
                let code = builtin.execute(&mut *self.diagnostics, &mut *self.env)?;
                outcomes.push(StageOutcome::Done(code));
                continue;
            }

            let (next_upstream, downstream) = if index < last {
                let Pipe { read, write } = Pipe::new()?;
                (Some(read), Some(write))
            } else {
                (None, None)
            };

            match ExternalCommand::prepare(stage, &*self.env) {
                Ok(command) => outcomes.push(StageOutcome::Running(command.spawn(
                    upstream.as_ref().map(AsFd::as_fd),
                    downstream.as_ref().map(AsFd::as_fd),
                )?)),
                Err(e) => {
                    outcomes.push(StageOutcome::Done(1));
                    writeln!(self.diagnostics, "snail_shell: {:#}", e)?;
                }
            }

            // The child has its own copies now; keep only what feeds the next stage.
            drop(downstream);
            upstream = next_upstream;
        }
        Ok(())
    }
}

/// Wait for every running child in order and return the last stage's status.
///
/// A failed wait does not stop the others from being reaped; the first failure is
/// returned.
fn wait_all(outcomes: Vec<StageOutcome>) -> Result<ExitCode> {
    let mut status = Ok(0);
    for outcome in outcomes {
        let code = match outcome {
            StageOutcome::Done(code) => Ok(code),
            StageOutcome::Running(pid) => external::wait_for(pid)
                .inspect(|code| tracing::debug!(%pid, code, "stage finished")),
        };
        status = match status {
            Err(e) => Err(e),
            Ok(_) => code,
        };
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::parser;
    use std::fs;
    use std::path::Path;

    struct Run {
        status: ExitCode,
        diagnostics: String,
    }

    fn run_line(line: &str, env: &mut Environment) -> Run {
        let pipeline = parser::parse(line, env).unwrap().unwrap();
        let builtins = Builtins::default();
        let mut diagnostics = Vec::new();
        let status = Executor::new(env, &builtins, &mut diagnostics)
            .execute(pipeline)
            .unwrap();
        Run {
            status,
            diagnostics: String::from_utf8(diagnostics).unwrap(),
        }
    }

    fn run(line: &str) -> Run {
        run_line(line, &mut Environment::new())
    }

    fn p(path: &Path) -> &str {
        path.to_str().unwrap()
    }

    #[test]
    fn test_output_redirect_truncates_then_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.txt");
        fs::write(&out, "stale\n").unwrap();

        assert_eq!(run(&format!("echo hi > {}", p(&out))).status, 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "hi\n");

        assert_eq!(run(&format!("echo hi >> {}", p(&out))).status, 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "hi\nhi\n");
    }

    #[test]
    fn test_two_stage_pipeline() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.txt");

        let result = run(&format!("echo hi | cat > {}", p(&out)));
        assert_eq!(result.status, 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "hi\n");
    }

    #[test]
    fn test_three_stage_pipeline() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.txt");

        let result = run(&format!("echo snail shell | tr a-z A-Z | cat > {}", p(&out)));
        assert_eq!(result.status, 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "SNAIL SHELL\n");
    }

    #[test]
    fn test_input_redirect() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("in.txt");
        let out = tmp.path().join("out.txt");
        fs::write(&input, "b\na\nc\n").unwrap();

        let result = run(&format!("sort < {} > {}", p(&input), p(&out)));
        assert_eq!(result.status, 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "a\nb\nc\n");
    }

    #[test]
    fn test_input_redirect_wins_over_pipe() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("in.txt");
        let out = tmp.path().join("out.txt");
        fs::write(&input, "from file\n").unwrap();

        run(&format!("echo from pipe | cat < {} > {}", p(&input), p(&out)));
        assert_eq!(fs::read_to_string(&out).unwrap(), "from file\n");
    }

    #[test]
    fn test_output_redirect_wins_over_pipe() {
        let tmp = tempfile::tempdir().unwrap();
        let first = tmp.path().join("first.txt");
        let second = tmp.path().join("second.txt");

        let result = run(&format!("echo hi > {} | cat > {}", p(&first), p(&second)));
        assert_eq!(result.status, 0);
        assert_eq!(fs::read_to_string(&first).unwrap(), "hi\n");
        assert_eq!(fs::read_to_string(&second).unwrap(), "");
    }

    #[test]
    fn test_large_output_does_not_deadlock() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.txt");

        // Far more than a pipe buffer holds.
        let result = run(&format!("seq 1 200000 | wc -l > {}", p(&out)));
        assert_eq!(result.status, 0);
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "200000");
    }

    #[test]
    fn test_missing_program_does_not_stop_pipeline() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.txt");

        let result = run(&format!("snail_no_such_program_xyz | cat > {}", p(&out)));
        assert_eq!(result.status, 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "");

        let result = run("snail_no_such_program_xyz");
        assert_eq!(result.status, external::NOT_FOUND);
    }

    #[test]
    fn test_status_is_last_stage() {
        assert_eq!(run("true | false").status, 1);
        assert_eq!(run("false | true").status, 0);
    }

    #[test]
    fn test_unopenable_output_fails_only_that_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let bad = tmp.path().join("missing_dir").join("out.txt");
        let out = tmp.path().join("out.txt");

        let result = run(&format!("echo hi > {} | cat > {}", p(&bad), p(&out)));
        assert_eq!(result.status, 0);
        assert!(!bad.exists());
        assert_eq!(fs::read_to_string(&out).unwrap(), "");

        assert_eq!(run(&format!("echo hi > {}", p(&bad))).status, external::REDIRECT_FAILED);
    }

    #[test]
    fn test_empty_stage_is_rejected_before_running() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.txt");

        let result = run(&format!("echo hi > {} |", p(&out)));
        assert_eq!(result.status, USAGE_ERROR);
        assert!(result.diagnostics.contains("empty command"), "{}", result.diagnostics);
        assert!(!out.exists());
    }

    #[test]
    fn test_substituted_arguments_reach_program() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.txt");
        let mut env = Environment::new();

        assert_eq!(parser::parse("WORD=snail", &mut env), Ok(None));
        run_line(&format!("echo $WORD $MISSING_SNAIL_VAR end > {}", p(&out)), &mut env);
        assert_eq!(fs::read_to_string(&out).unwrap(), "snail  end\n");
    }

    #[test]
    fn test_builtin_failure_is_reported_and_pipeline_continues() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.txt");

        let result = run(&format!("cd /nonexistent_dir_xyz | echo after > {}", p(&out)));
        assert_eq!(result.status, 0);
        assert!(result.diagnostics.contains("cd:"), "{}", result.diagnostics);
        assert_eq!(fs::read_to_string(&out).unwrap(), "after\n");
    }

    #[test]
    fn test_upstream_passes_through_builtin() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.txt");

        // `exit` runs in place; `cat` still reads what `echo` wrote.
        let result = run(&format!("echo kept | exit 0 | cat > {}", p(&out)));
        assert_eq!(result.status, 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "kept\n");
    }

    /// Diagnostics stream that refuses every write.
    struct ClosedStream;

    impl Write for ClosedStream {
        fn write(&mut self, _data: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn stage(argv: &[&str]) -> Command {
        Command {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            ..Command::default()
        }
    }

    #[test]
    fn test_started_children_are_waited_for_when_a_later_stage_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.txt");
        let slow = format!("sleep 0.3; echo finished > {}", p(&out));
        let pipeline = Pipeline::new(vec![
            stage(&["sh", "-c", &slow]),
            stage(&["cd", "/nonexistent_dir_xyz"]),
        ]);

        let mut env = Environment::new();
        let builtins = Builtins::default();
        let mut diagnostics = ClosedStream;
        let result = Executor::new(&mut env, &builtins, &mut diagnostics).execute(pipeline);

        assert!(result.is_err());
        // The first stage ran to completion before `execute` returned.
        assert_eq!(fs::read_to_string(&out).unwrap(), "finished\n");
    }

    /// Descriptor numbers that `ls -l /proc/self/fd` lists as pipes.
    #[cfg(target_os = "linux")]
    fn pipe_descriptors(listing: &str) -> std::collections::BTreeSet<String> {
        listing
            .lines()
            .filter_map(|line| line.split_once(" -> "))
            .filter(|(_, target)| target.starts_with("pipe:"))
            .filter_map(|(left, _)| left.rsplit(' ').next())
            .map(str::to_string)
            .collect()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_no_pipe_descriptors_leak_into_children() {
        let tmp = tempfile::tempdir().unwrap();
        let baseline = tmp.path().join("baseline.txt");
        let listing = tmp.path().join("fds.txt");

        // Pipes the test process inherited without close-on-exec reach every child.
        run(&format!("ls -l /proc/self/fd > {}", p(&baseline)));
        let inherited = pipe_descriptors(&fs::read_to_string(&baseline).unwrap());

        // The middle stage lists its own descriptors: stdin and stdout are pipes,
        // nothing else the shell created may be one.
        run(&format!(
            "echo x | ls -l /proc/self/fd | cat > {}",
            p(&listing)
        ));
        let text = fs::read_to_string(&listing).unwrap();
        let pipes = pipe_descriptors(&text);
        assert!(pipes.contains("0"), "{text}");
        assert!(pipes.contains("1"), "{text}");
        let leaked: Vec<&String> = pipes
            .iter()
            .filter(|fd| !matches!(fd.as_str(), "0" | "1" | "2"))
            .filter(|fd| !inherited.contains(*fd))
            .collect();
        assert!(leaked.is_empty(), "unexpected pipe descriptors {leaked:?}: {text}");
    }
}
