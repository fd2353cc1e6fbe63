use crate::command::{Command, ExitCode};
use crate::env::Environment;
use crate::io_adapters;
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::borrow::Cow;
use std::convert::Infallible;
use std::ffi::{c_char, CString, OsStr};
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::ptr;

/// Search path used when the store has no `PATH`, as `execvp` does.
const DEFAULT_PATH: &str = "/bin:/usr/bin";

/// Exit status of a stage whose program cannot be found.
pub const NOT_FOUND: ExitCode = 127;
/// Exit status of a stage whose program was found but could not be executed.
pub const NOT_EXECUTABLE: ExitCode = 126;
/// Exit status of a stage whose redirections could not be set up.
pub const REDIRECT_FAILED: ExitCode = 1;

/// Messages a child may need to print, formatted before the fork.
struct ChildMessages {
    not_found: Vec<u8>,
    exec_failed: Vec<u8>,
    stdin_failed: Vec<u8>,
    stdout_failed: Vec<u8>,
}

/// A pipeline stage that runs as a separate program.
///
/// Everything the child needs is allocated by [`ExternalCommand::prepare`] in the
/// parent, down to the pointer arrays handed to `execve`. After `fork` the child only
/// issues system calls: it wires its standard streams, then replaces its image with
/// the program or exits.
pub(crate) struct ExternalCommand {
    name: String,
    program: Option<CString>,
    // The pointer arrays point into these buffers, which never move or change.
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
    stdin: Option<CString>,
    stdout: Option<(CString, bool)>,
    messages: ChildMessages,
}

impl ExternalCommand {
    /// Resolve the program through the store's `PATH` and build the C strings for
    /// `execve`. The whole store becomes the program's environment.
    pub fn prepare(command: Command, env: &Environment) -> Result<Self> {
        let Command { argv, stdin, stdout } = command;
        let name = argv.first().cloned().context("empty command")?;

        let search_paths = env.get_var("PATH").unwrap_or_else(|| DEFAULT_PATH.to_string());
        let program = find_command_path(OsStr::new(&search_paths), Path::new(&name))
            .map(|path| c_path(&path))
            .transpose()
            .with_context(|| format!("{name}: program path contains a NUL byte"))?;

        let argv = argv
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("{name}: argument contains a NUL byte"))?;

        let envp: Vec<CString> = env
            .vars()
            .filter_map(|(k, v)| match CString::new(format!("{k}={v}")) {
                Ok(entry) => Some(entry),
                Err(_) => {
                    tracing::warn!(name = k, "variable contains a NUL byte, not exported");
                    None
                }
            })
            .collect();

        let messages = ChildMessages {
            not_found: format!("snail_shell: {name}: command not found\n").into_bytes(),
            exec_failed: format!("snail_shell: {name}: ").into_bytes(),
            stdin_failed: stdin
                .as_ref()
                .map(|p| format!("snail_shell: {}: ", p.display()).into_bytes())
                .unwrap_or_default(),
            stdout_failed: stdout
                .as_ref()
                .map(|r| format!("snail_shell: {}: ", r.path.display()).into_bytes())
                .unwrap_or_default(),
        };

        let stdin = stdin
            .map(|path| c_path(&path))
            .transpose()
            .with_context(|| format!("{name}: input file name contains a NUL byte"))?;
        let stdout = stdout
            .map(|r| c_path(&r.path).map(|path| (path, r.append)))
            .transpose()
            .with_context(|| format!("{name}: output file name contains a NUL byte"))?;

        Ok(Self {
            name,
            program,
            argv_ptrs: exec_array(&argv),
            envp_ptrs: exec_array(&envp),
            _argv: argv,
            _envp: envp,
            stdin,
            stdout,
            messages,
        })
    }

    /// Fork a child running this stage.
    ///
    /// `upstream` is the read end of the previous stage's pipe, `downstream` the write
    /// end of the pipe to the next stage. File redirections take precedence over both.
    pub fn spawn(
        &self,
        upstream: Option<BorrowedFd<'_>>,
        downstream: Option<BorrowedFd<'_>>,
    ) -> Result<Pid> {
        // SAFETY: the child only makes system calls on memory prepared before the
        // fork, then calls `execve` or `_exit`.
        match unsafe { fork() }.context("failed to fork")? {
            ForkResult::Parent { child } => {
                tracing::debug!(pid = %child, program = %self.name, "spawned stage");
                Ok(child)
            }
            ForkResult::Child => {
                let code = match self.replace_image(upstream, downstream) {
                    Ok(never) => match never {},
                    Err(code) => code,
                };
                // SAFETY: `_exit` skips atexit handlers and stdio flushing, which
                // belong to the parent.
                unsafe { libc::_exit(code) }
            }
        }
    }

    /// Child side: wire stdin and stdout, then exec. Only returns on failure.
    fn replace_image(
        &self,
        upstream: Option<BorrowedFd<'_>>,
        downstream: Option<BorrowedFd<'_>>,
    ) -> Result<Infallible, ExitCode> {
        match &self.stdin {
            Some(path) => {
                let fail = |e| child_failure(&self.messages.stdin_failed, e, REDIRECT_FAILED);
                let file = io_adapters::open_input(path).map_err(fail)?;
                io_adapters::redirect(file.as_fd(), libc::STDIN_FILENO).map_err(fail)?;
                // Left open: exec closes it, unless it already is stdin.
                let _ = file.into_raw_fd();
            }
            None => {
                if let Some(fd) = upstream {
                    io_adapters::redirect(fd, libc::STDIN_FILENO).map_err(|e| {
                        child_failure(b"snail_shell: stdin: ", e, REDIRECT_FAILED)
                    })?;
                }
            }
        }

        match &self.stdout {
            Some((path, append)) => {
                let fail = |e| child_failure(&self.messages.stdout_failed, e, REDIRECT_FAILED);
                let file = io_adapters::open_output(path, *append).map_err(fail)?;
                io_adapters::redirect(file.as_fd(), libc::STDOUT_FILENO).map_err(fail)?;
                let _ = file.into_raw_fd();
            }
            None => {
                if let Some(fd) = downstream {
                    io_adapters::redirect(fd, libc::STDOUT_FILENO).map_err(|e| {
                        child_failure(b"snail_shell: stdout: ", e, REDIRECT_FAILED)
                    })?;
                }
            }
        }

        let Some(program) = &self.program else {
            write_stderr(&self.messages.not_found);
            return Err(NOT_FOUND);
        };
        // SAFETY: both arrays are null-terminated and point into `_argv` and `_envp`,
        // which live as long as `self`.
        unsafe {
            libc::execve(
                program.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            )
        };
        Err(child_failure(&self.messages.exec_failed, Errno::last(), NOT_EXECUTABLE))
    }
}

fn c_path(path: &Path) -> Result<CString, std::ffi::NulError> {
    CString::new(path.as_os_str().as_bytes())
}

/// Null-terminated array of pointers into `strings`, the layout `execve` expects.
fn exec_array(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Report a failure from a forked child. Uses only `write(2)`.
fn child_failure(prefix: &[u8], errno: Errno, code: ExitCode) -> ExitCode {
    write_stderr(prefix);
    write_stderr(errno.desc().as_bytes());
    write_stderr(b"\n");
    code
}

fn write_stderr(bytes: &[u8]) {
    // SAFETY: `bytes` is a valid buffer for its whole length.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
}

/// Block until `pid` terminates and translate its status into an exit code.
///
/// A child killed by a signal reports `128 + signal`, like POSIX shells do.
pub(crate) fn wait_for(pid: Pid) -> Result<ExitCode> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).with_context(|| format!("failed to wait for {pid}")),
        }
    }
}

/// Resolve a command path the way a typical shell would.
///
/// Behavior:
/// - A path containing a separator (`/bin/sh`, `bin/sh`, `./foo`): returns it if it is
///   an executable file, relative paths being resolved against the current directory.
/// - Single path component (no separators): search each directory in `search_paths` (PATH)
///   and return the first executable match.
/// - Empty path: returns `None`.
///
/// Returns either a borrowed reference to the provided `path` or an owned `PathBuf`
/// when the result is discovered via PATH lookup.
pub fn find_command_path<'a>(search_paths: &OsStr, path: &'a Path) -> Option<Cow<'a, Path>> {
    let mut components = path.components();
    let first = components.next();
    let second = components.next();
    match (first, second) {
        // Empty path -> not found
        (None, _) => None,
        // Single component without a separator -> search in PATH
        (Some(x), None) if !path.as_os_str().as_bytes().contains(&b'/') => {
            find_in_path(search_paths, x.as_os_str()).map(Cow::Owned)
        }
        _ => find_by_path(path).map(Cow::Borrowed),
    }
}

fn find_in_path(search_paths: &OsStr, cmd: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_paths)
        .map(|dir| dir.join(cmd))
        .find(|path| find_by_path(path).is_some())
}

fn find_by_path(path: &Path) -> Option<&Path> {
    let metadata = path.metadata().ok()?;
    if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
        Some(path)
    } else {
        None
    }
}
