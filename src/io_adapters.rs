//! Descriptor plumbing between pipeline stages.
//!
//! Every descriptor the shell owns is an [`OwnedFd`], so it is closed
//! on every exit path. Pipe ends are created close-on-exec: a child keeps only what
//! was duplicated onto its standard input and output.

use anyhow::{Context, Result};
use nix::fcntl::{self, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;
use std::ffi::CStr;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Both ends of a pipe connecting one stage to the next.
#[derive(Debug)]
pub(crate) struct Pipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl Pipe {
    /// Create a close-on-exec pipe.
    pub fn new() -> Result<Self> {
        let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC).context("failed to create pipe")?;
        Ok(Self { read, write })
    }
}

/// Open the file named by `<` for reading.
///
/// Takes a prepared C string so a forked child can call it without allocating.
pub(crate) fn open_input(path: &CStr) -> nix::Result<OwnedFd> {
    open(path, OFlag::O_RDONLY, Mode::empty())
}

/// Open the file named by `>` (truncating) or `>>` (appending), creating it when
/// missing.
pub(crate) fn open_output(path: &CStr, append: bool) -> nix::Result<OwnedFd> {
    let mode = if append { OFlag::O_APPEND } else { OFlag::O_TRUNC };
    open(
        path,
        OFlag::O_WRONLY | OFlag::O_CREAT | mode,
        Mode::from_bits_truncate(0o666),
    )
}

fn open(path: &CStr, flags: OFlag, mode: Mode) -> nix::Result<OwnedFd> {
    let fd = fcntl::open(path, flags | OFlag::O_CLOEXEC, mode)?;
    // SAFETY: `open` just returned this descriptor and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Make `target` (0 or 1) refer to the same open file as `fd`.
///
/// The result does not have close-on-exec set, so it survives `execve`.
pub(crate) fn redirect(fd: BorrowedFd<'_>, target: RawFd) -> nix::Result<()> {
    if fd.as_raw_fd() == target {
        // dup2 onto itself is a no-op and would keep the flag.
        fcntl::fcntl(target, FcntlArg::F_SETFD(FdFlag::empty())).map(drop)
    } else {
        unistd::dup2(fd.as_raw_fd(), target).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use nix::fcntl::fcntl;
    use std::ffi::CString;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;
    use std::os::unix::ffi::OsStrExt;

    fn c_path(path: &std::path::Path) -> CString {
        CString::new(path.as_os_str().as_bytes()).unwrap()
    }

    fn is_close_on_exec(fd: RawFd) -> bool {
        let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
        FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn test_pipe_ends_are_close_on_exec() {
        let pipe = Pipe::new().unwrap();
        for fd in [&pipe.read, &pipe.write] {
            assert!(is_close_on_exec(fd.as_raw_fd()));
        }
    }

    #[test]
    fn test_pipe_carries_bytes_until_writer_closes() {
        let pipe = Pipe::new().unwrap();
        let mut writer = File::from(pipe.write);
        writer.write_all(b"hi\n").unwrap();
        drop(writer);

        let mut reader = File::from(pipe.read);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hi\n");
    }

    #[test]
    fn test_open_output_truncates_or_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.txt");
        std::fs::write(&path, "old contents\n").unwrap();

        let file = open_output(&c_path(&path), false).unwrap();
        File::from(file).write_all(b"one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\n");

        let file = open_output(&c_path(&path), true).unwrap();
        File::from(file).write_all(b"two\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_open_output_creates_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("new.txt");

        let file = open_output(&c_path(&path), true).unwrap();
        assert!(is_close_on_exec(file.as_raw_fd()));
        drop(file);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_open_input_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = open_input(&c_path(&tmp.path().join("missing"))).unwrap_err();
        assert_eq!(err, Errno::ENOENT);
    }

    #[test]
    fn test_open_input_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("in.txt");
        std::fs::write(&path, "contents\n").unwrap();

        let mut out = String::new();
        File::from(open_input(&c_path(&path)).unwrap())
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "contents\n");
    }

    #[test]
    fn test_redirect_onto_itself_clears_close_on_exec() {
        let pipe = Pipe::new().unwrap();
        let fd = pipe.read.as_raw_fd();
        assert!(is_close_on_exec(fd));

        redirect(pipe.read.as_fd(), fd).unwrap();
        assert!(!is_close_on_exec(fd));
    }

    #[test]
    fn test_redirect_duplicates_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dup.txt");
        let file = File::create(&path).unwrap();
        let pipe = Pipe::new().unwrap();

        // Point the pipe's write end at the file, then write through it.
        redirect(file.as_fd(), pipe.write.as_raw_fd()).unwrap();
        let mut writer = File::from(pipe.write);
        writer.write_all(b"through dup\n").unwrap();
        drop(writer);
        drop(file);

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "through dup\n");
    }
}
