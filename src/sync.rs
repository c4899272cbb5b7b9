//! Sync spawn engine: blocking spawn with capture buffers and a timeout.
//!
//! The calling thread owns the whole child lifetime. Termination
//! detection rides a SIGCHLD self-pipe so that signal context does
//! nothing but write one byte; the multiplexing loop sees the child's
//! death as an ordinary readiness event next to the data pipes.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, fork, ForkResult, Pid};
use tracing::{debug, warn};

use crate::errors::{SpawnError, SpawnResult};
use crate::pipe::{set_nonblocking, StdioPipe};
use crate::process::{exec_child, nul_terminated, ExecPlan};
use crate::signal::{send_signal, SigChldPipe};
use crate::status;
use crate::utils::to_cstring;

/// Blocking spawn request.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use reactor_process_rs::SyncSpawn;
///
/// let outcome = SyncSpawn::new("echo")
///     .arg("hello")
///     .capture_stdout(64)
///     .timeout(Duration::from_secs(1))
///     .run()?;
/// assert_eq!(outcome.exit_code, 0);
/// # Ok::<(), reactor_process_rs::SpawnError>(())
/// ```
pub struct SyncSpawn {
    file: String,
    args: Vec<String>,
    input: Option<Vec<u8>>,
    stdout_capacity: Option<usize>,
    stderr_capacity: Option<usize>,
    combine: bool,
    timeout: Option<Duration>,
}

/// Outcome of a completed sync spawn. A timeout is a normal outcome,
/// reported through `timed_out`, never an error.
#[derive(Debug)]
pub struct SyncOutcome {
    pub pid: Pid,
    /// Meaningful only on a normal exit; zero otherwise.
    pub exit_code: i32,
    /// Meaningful only on a signaled death; zero otherwise.
    pub term_signal: i32,
    /// Bytes actually fed to the child's stdin.
    pub stdin_written: usize,
    /// Captured stdout; its length is the read count.
    pub stdout: Vec<u8>,
    /// Captured stderr; its length is the read count.
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl SyncSpawn {
    pub fn new<S: Into<String>>(file: S) -> Self {
        Self {
            file: file.into(),
            args: Vec::new(),
            input: None,
            stdout_capacity: None,
            stderr_capacity: None,
            combine: false,
            timeout: None,
        }
    }

    /// Add an argument to the command
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments to the command
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed these bytes to the child's stdin; the pipe closes once they
    /// are fully sent, so the child observes end-of-file.
    pub fn input<B: Into<Vec<u8>>>(mut self, bytes: B) -> Self {
        self.input = Some(bytes.into());
        self
    }

    /// Capture the child's stdout into a buffer of at most `capacity`
    /// bytes. Output beyond the capacity is a `BufferOverflow` error.
    pub fn capture_stdout(mut self, capacity: usize) -> Self {
        self.stdout_capacity = Some(capacity);
        self
    }

    /// Capture the child's stderr into a separate buffer. Mutually
    /// exclusive with `combine_stderr`.
    pub fn capture_stderr(mut self, capacity: usize) -> Self {
        self.stderr_capacity = Some(capacity);
        self
    }

    /// Merge the child's stderr onto the stdout capture pipe instead of
    /// allocating a separate one.
    pub fn combine_stderr(mut self) -> Self {
        self.combine = true;
        self
    }

    /// Give up after `timeout`, force-killing the child. Without one the
    /// call blocks until the child exits.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Spawn the child and block until it exits, the timeout elapses, or
    /// an unrecoverable I/O error occurs. No pipe or zombie outlives the
    /// call on any path.
    pub fn run(&self) -> SpawnResult<SyncOutcome> {
        if self.combine && self.stderr_capacity.is_some() {
            return Err(SpawnError::InvalidConfig(
                "combine_stderr is mutually exclusive with a separate stderr capture".into(),
            ));
        }
        if self.combine && self.stdout_capacity.is_none() {
            return Err(SpawnError::InvalidConfig(
                "combine_stderr requires a stdout capture".into(),
            ));
        }

        let file_c = to_cstring(&self.file)?;
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(file_c.clone());
        for arg in &self.args {
            argv.push(to_cstring(arg)?);
        }
        let argv_ptrs = nul_terminated(&argv);

        let stdin_pipe = match &self.input {
            Some(_) => Some(StdioPipe::for_stdin()?),
            None => None,
        };
        let stdout_pipe = match self.stdout_capacity {
            Some(_) => Some(StdioPipe::for_output()?),
            None => None,
        };
        let stderr_pipe = match self.stderr_capacity {
            Some(_) => Some(StdioPipe::for_output()?),
            None => None,
        };

        // Installed before fork: an instantly-exiting child still lands
        // a byte on the self-pipe.
        let sigchld = SigChldPipe::install()?;

        let mut redirects = Vec::with_capacity(4);
        if let Some(p) = &stdin_pipe {
            redirects.push((p.parent_fd_raw(), p.child_fd(), libc::STDIN_FILENO));
        }
        if let Some(p) = &stdout_pipe {
            redirects.push((p.parent_fd_raw(), p.child_fd(), libc::STDOUT_FILENO));
            if self.combine {
                redirects.push((p.parent_fd_raw(), p.child_fd(), libc::STDERR_FILENO));
            }
        }
        if let Some(p) = &stderr_pipe {
            redirects.push((p.parent_fd_raw(), p.child_fd(), libc::STDERR_FILENO));
        }

        let plan = ExecPlan {
            file: &file_c,
            argv: &argv_ptrs,
            envp: None,
            cwd: None,
            redirects: &redirects,
        };

        let child = match unsafe { fork() }? {
            ForkResult::Child => exec_child(&plan),
            ForkResult::Parent { child } => child,
        };
        let start = Instant::now();
        let mut guard = ReapGuard::new(child);
        debug!(pid = child.as_raw(), file = %self.file, "spawned child (sync)");

        let input: &[u8] = self.input.as_deref().unwrap_or(&[]);
        let mut written = 0usize;
        let mut stdin_fd = stdin_pipe.map(StdioPipe::into_parent_end);
        if let Some(fd) = &stdin_fd {
            // A full pipe must yield a short count back to the loop, not
            // wedge the thread while the child waits for its output to
            // be drained.
            set_nonblocking(fd.as_raw_fd())?;
        }
        if input.is_empty() {
            // Nothing to send; close immediately so the child sees EOF.
            stdin_fd = None;
        }
        let mut stdout_cap = self
            .stdout_capacity
            .map(|cap| Capture::new("stdout", cap, stdout_pipe.map(StdioPipe::into_parent_end)));
        let mut stderr_cap = self
            .stderr_capacity
            .map(|cap| Capture::new("stderr", cap, stderr_pipe.map(StdioPipe::into_parent_end)));

        loop {
            let budget = self.timeout.map(|t| t.saturating_sub(start.elapsed()));

            let mut fds = Vec::with_capacity(4);
            let stdin_slot = stdin_fd.as_ref().map(|fd| {
                fds.push(PollFd::new(fd.as_fd(), PollFlags::POLLOUT));
                fds.len() - 1
            });
            let stdout_slot = stdout_cap.as_ref().and_then(Capture::poll_fd).map(|fd| {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
                fds.len() - 1
            });
            let stderr_slot = stderr_cap.as_ref().and_then(Capture::poll_fd).map(|fd| {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
                fds.len() - 1
            });
            let chld_slot = {
                fds.push(PollFd::new(sigchld.read_fd(), PollFlags::POLLIN));
                fds.len() - 1
            };

            let ready = match poll(&mut fds, poll_budget(budget)) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };

            if ready == 0 {
                // Budget exhausted. A timeout is a normal outcome: close
                // everything, force-kill, reap, report.
                drop(fds);
                debug!(pid = child.as_raw(), "sync spawn timed out, killing child");
                stdin_fd = None;
                if let Some(c) = &mut stdout_cap {
                    c.deactivate();
                }
                if let Some(c) = &mut stderr_cap {
                    c.deactivate();
                }
                let termination = status::decode(guard.kill_and_reap()?);
                return Ok(SyncOutcome {
                    pid: child,
                    exit_code: termination.exit_code,
                    term_signal: termination.term_signal,
                    stdin_written: written,
                    stdout: stdout_cap.map(Capture::into_bytes).unwrap_or_default(),
                    stderr: stderr_cap.map(Capture::into_bytes).unwrap_or_default(),
                    timed_out: true,
                });
            }

            let is_ready = |slot: Option<usize>| {
                slot.is_some_and(|i| fds[i].revents().is_some_and(|r| !r.is_empty()))
            };
            let stdin_ready = is_ready(stdin_slot);
            let stdout_ready = is_ready(stdout_slot);
            let stderr_ready = is_ready(stderr_slot);
            let chld_ready = fds[chld_slot].revents().is_some_and(|r| !r.is_empty());
            drop(fds);

            if stdin_ready {
                if let Some(fd) = &stdin_fd {
                    match unistd::write(fd, &input[written..]) {
                        Ok(n) => written += n,
                        Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                if written == input.len() {
                    // Fully sent: close the write end so the child sees
                    // EOF, and drop the permanently-writable descriptor
                    // from the wait set.
                    stdin_fd = None;
                }
            }

            if stdout_ready {
                if let Some(c) = &mut stdout_cap {
                    c.fill()?;
                }
            }
            if stderr_ready {
                if let Some(c) = &mut stderr_cap {
                    c.fill()?;
                }
            }

            if chld_ready {
                sigchld.drain();
                match waitpid(child, Some(WaitPidFlag::WNOHANG))? {
                    // SIGCHLD for an unrelated child; spurious wakeup.
                    WaitStatus::StillAlive => {}
                    raw_status => {
                        guard.disarm();
                        // The child can no longer write; anything it left
                        // buffered is drained before the endpoints close.
                        if let Some(c) = &mut stdout_cap {
                            c.drain_to_eof()?;
                        }
                        if let Some(c) = &mut stderr_cap {
                            c.drain_to_eof()?;
                        }
                        stdin_fd = None;
                        let termination = status::decode(raw_status);
                        debug!(
                            pid = child.as_raw(),
                            exit_code = termination.exit_code,
                            term_signal = termination.term_signal,
                            "child reaped"
                        );
                        return Ok(SyncOutcome {
                            pid: child,
                            exit_code: termination.exit_code,
                            term_signal: termination.term_signal,
                            stdin_written: written,
                            stdout: stdout_cap.map(Capture::into_bytes).unwrap_or_default(),
                            stderr: stderr_cap.map(Capture::into_bytes).unwrap_or_default(),
                            timed_out: false,
                        });
                    }
                }
            }
        }
    }
}

fn poll_budget(remaining: Option<Duration>) -> PollTimeout {
    match remaining {
        None => PollTimeout::NONE,
        Some(d) => {
            let millis = i32::try_from(d.as_millis()).unwrap_or(i32::MAX);
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
        }
    }
}

/// Fixed-capacity capture buffer with its pipe's read end. The pipe
/// leaves the wait set (`poll_fd` turns `None`) once end-of-stream is
/// observed, so a half-closed stream cannot busy-loop the poll.
struct Capture {
    name: &'static str,
    data: Vec<u8>,
    len: usize,
    pipe: Option<OwnedFd>,
}

impl Capture {
    fn new(name: &'static str, capacity: usize, pipe: Option<OwnedFd>) -> Self {
        Self {
            name,
            data: vec![0; capacity],
            len: 0,
            pipe,
        }
    }

    fn poll_fd(&self) -> Option<std::os::fd::BorrowedFd<'_>> {
        self.pipe.as_ref().map(AsFd::as_fd)
    }

    fn deactivate(&mut self) {
        self.pipe = None;
    }

    /// Read once into the remaining capacity. Zero bytes is end-of-stream
    /// and deactivates the pipe. A full buffer with more data pending is
    /// an overflow error; a full buffer at end-of-stream is an exact fit.
    fn fill(&mut self) -> SpawnResult<()> {
        let Some(pipe) = &self.pipe else {
            return Ok(());
        };
        if self.len == self.data.len() {
            let mut probe = [0u8; 1];
            return match unistd::read(pipe.as_raw_fd(), &mut probe) {
                Ok(0) => {
                    self.pipe = None;
                    Ok(())
                }
                Ok(_) => Err(SpawnError::BufferOverflow { stream: self.name }),
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        match unistd::read(pipe.as_raw_fd(), &mut self.data[self.len..]) {
            Ok(0) => self.pipe = None,
            Ok(n) => self.len += n,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Read until end-of-stream; used once the child is gone and all its
    /// output sits buffered in the pipe.
    fn drain_to_eof(&mut self) -> SpawnResult<()> {
        while self.pipe.is_some() {
            self.fill()?;
        }
        Ok(())
    }

    fn into_bytes(mut self) -> Vec<u8> {
        self.data.truncate(self.len);
        self.data
    }
}

/// Kills and reaps the child unless disarmed: error exits must leave
/// neither a running child nor a zombie behind.
struct ReapGuard {
    pid: Pid,
    armed: bool,
}

impl ReapGuard {
    fn new(pid: Pid) -> Self {
        Self { pid, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// SIGKILL and reap; the timeout path's enforcement mechanism.
    fn kill_and_reap(&mut self) -> SpawnResult<WaitStatus> {
        self.armed = false;
        send_signal(self.pid, Signal::SIGKILL)?;
        Ok(waitpid(self.pid, None)?)
    }
}

impl Drop for ReapGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = send_signal(self.pid, Signal::SIGKILL) {
            warn!(pid = self.pid.as_raw(), error = %e, "failed to kill child during cleanup");
        }
        if let Err(e) = waitpid(self.pid, None) {
            warn!(pid = self.pid.as_raw(), error = %e, "failed to reap child during cleanup");
        }
    }
}
