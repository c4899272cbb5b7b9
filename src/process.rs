//! Async spawn engine: process creation for the event loop.
//!
//! `SpawnOptions` describes the child; `SpawnOptions::spawn` creates it
//! through the race-avoidance protocol and registers it with the
//! reactor's child watch, which later drives the exit callback. The call
//! never blocks past the synchronization-pipe wait, which completes as
//! soon as the child execs or dies.

use std::ffi::CStr;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use nix::unistd::{fork, ForkResult, Pid};
use tracing::debug;

use crate::errors::{SpawnError, SpawnResult};
use crate::pipe::{set_nonblocking, StdioPipe};
use crate::reactor::ChildWatch;
use crate::signal::send_signal;
use crate::status::{self, Termination};
use crate::stream::{Stream, StreamDirection};
use crate::utils::{os_to_cstring, to_cstring};

/// Exit callback owned by a process handle, invoked at most once.
pub type ExitCallback = Box<dyn FnOnce(Termination) + Send>;

static SPAWN_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of spawn attempts made by this process. Informational only.
pub fn spawn_count() -> u64 {
    SPAWN_COUNT.load(Ordering::Relaxed)
}

/// Environment handed to a spawned child.
#[derive(Debug, Clone, Default)]
pub enum Env {
    /// Child sees the parent's environment as of the exec.
    #[default]
    Inherit,
    /// Explicit name/value snapshot; nothing else is inherited.
    Explicit(Vec<(String, String)>),
}

/// One stdio slot of a spawn request: inherit the parent's descriptor,
/// or bind to a pipe-backed stream object.
pub enum StdioBinding<'a> {
    Inherit,
    Stream(&'a mut dyn Stream),
}

/// Builder for an async spawn request.
///
/// `args` become the child's argv after the program name itself, which
/// is always argv[0].
pub struct SpawnOptions<'a> {
    file: String,
    args: Vec<String>,
    env: Env,
    cwd: Option<PathBuf>,
    stdin: StdioBinding<'a>,
    stdout: StdioBinding<'a>,
    stderr: StdioBinding<'a>,
    on_exit: Option<ExitCallback>,
}

impl<'a> SpawnOptions<'a> {
    pub fn new<S: Into<String>>(file: S) -> Self {
        Self {
            file: file.into(),
            args: Vec::new(),
            env: Env::Inherit,
            cwd: None,
            stdin: StdioBinding::Inherit,
            stdout: StdioBinding::Inherit,
            stderr: StdioBinding::Inherit,
            on_exit: None,
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

    /// Set an environment variable. The first call switches the request
    /// from inheriting the parent environment to an explicit snapshot.
    pub fn env<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        match &mut self.env {
            Env::Explicit(vars) => vars.push((key.into(), value.into())),
            Env::Inherit => self.env = Env::Explicit(vec![(key.into(), value.into())]),
        }
        self
    }

    /// Set working directory
    pub fn current_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Bind the child's stdin to a stream; the parent end is writable.
    pub fn stdin(mut self, stream: &'a mut dyn Stream) -> Self {
        self.stdin = StdioBinding::Stream(stream);
        self
    }

    /// Bind the child's stdout to a stream; the parent end is readable.
    pub fn stdout(mut self, stream: &'a mut dyn Stream) -> Self {
        self.stdout = StdioBinding::Stream(stream);
        self
    }

    /// Bind the child's stderr to a stream; the parent end is readable.
    pub fn stderr(mut self, stream: &'a mut dyn Stream) -> Self {
        self.stderr = StdioBinding::Stream(stream);
        self
    }

    /// Register the exit callback, invoked exactly once by the reactor
    /// with the decoded termination.
    pub fn on_exit(mut self, callback: ExitCallback) -> Self {
        self.on_exit = Some(callback);
        self
    }

    /// Spawn the child and register it with `watch`.
    pub fn spawn<W: ChildWatch>(self, watch: &W) -> SpawnResult<Process> {
        Process::spawn(watch, self)
    }
}

/// Handle for one spawned child. Never reused across spawns.
#[derive(Debug)]
pub struct Process {
    pid: Option<Pid>,
}

impl Process {
    /// Create the child described by `options` and register it with the
    /// reactor's child watch.
    ///
    /// Returns once the child has begun executing the target program or
    /// has irrecoverably failed to (exec failure surfaces later as exit
    /// status 127 through the callback, not as an error here). On any
    /// error every descriptor opened during the attempt is closed and no
    /// child is left registered.
    pub fn spawn<W: ChildWatch>(watch: &W, mut options: SpawnOptions<'_>) -> SpawnResult<Process> {
        SPAWN_COUNT.fetch_add(1, Ordering::Relaxed);

        // Reject bad bindings before any OS resource is allocated.
        for binding in [&options.stdin, &options.stdout, &options.stderr] {
            if let StdioBinding::Stream(stream) = binding {
                let kind = stream.kind();
                if kind != crate::stream::StreamKind::Pipe {
                    return Err(SpawnError::InvalidStdio { kind });
                }
            }
        }

        let stdin_pipe = match &options.stdin {
            StdioBinding::Stream(_) => Some(StdioPipe::for_stdin()?),
            StdioBinding::Inherit => None,
        };
        let stdout_pipe = match &options.stdout {
            StdioBinding::Stream(_) => Some(StdioPipe::for_output()?),
            StdioBinding::Inherit => None,
        };
        let stderr_pipe = match &options.stderr {
            StdioBinding::Stream(_) => Some(StdioPipe::for_output()?),
            StdioBinding::Inherit => None,
        };

        // Synchronization pipe: both ends close-on-exec and non-blocking.
        // The parent may not act on the child's pid until the child has
        // either replaced its image (closing the pipe via close-on-exec)
        // or died (closing it by exiting); the pipe carries no data.
        let sync_pipe = crate::pipe::PipePair::cloexec_nonblocking()?;

        // Everything the child touches is materialized before fork; the
        // child branch performs only async-signal-safe calls.
        let file_c = to_cstring(&options.file)?;
        let mut argv = Vec::with_capacity(options.args.len() + 1);
        argv.push(file_c.clone());
        for arg in &options.args {
            argv.push(to_cstring(arg)?);
        }
        let argv_ptrs = nul_terminated(&argv);

        let envp = match &options.env {
            Env::Inherit => None,
            Env::Explicit(vars) => {
                let mut entries = Vec::with_capacity(vars.len());
                for (key, value) in vars {
                    entries.push(to_cstring(&format!("{key}={value}"))?);
                }
                Some(entries)
            }
        };
        let envp_ptrs = envp.as_ref().map(|e| nul_terminated(e));

        let cwd_c = match &options.cwd {
            Some(dir) => Some(os_to_cstring(dir.as_os_str())?),
            None => None,
        };

        let mut redirects = Vec::with_capacity(3);
        if let Some(p) = &stdin_pipe {
            redirects.push((p.parent_fd_raw(), p.child_fd(), libc::STDIN_FILENO));
        }
        if let Some(p) = &stdout_pipe {
            redirects.push((p.parent_fd_raw(), p.child_fd(), libc::STDOUT_FILENO));
        }
        if let Some(p) = &stderr_pipe {
            redirects.push((p.parent_fd_raw(), p.child_fd(), libc::STDERR_FILENO));
        }

        let plan = ExecPlan {
            file: &file_c,
            argv: &argv_ptrs,
            envp: envp_ptrs.as_deref(),
            cwd: cwd_c.as_deref(),
            redirects: &redirects,
        };

        let child = match unsafe { fork() }? {
            ForkResult::Child => exec_child(&plan),
            ForkResult::Parent { child } => child,
        };

        // The child holds the write end's duplicate; ours must go first,
        // otherwise end-of-stream is never observable.
        let crate::pipe::PipePair {
            read: sync_read,
            write: sync_write,
        } = sync_pipe;
        drop(sync_write);
        wait_for_exec(&sync_read)?;
        drop(sync_read);

        debug!(pid = child.as_raw(), file = %options.file, "spawned child");

        if let Some(pipe) = stdin_pipe {
            if let StdioBinding::Stream(stream) = &mut options.stdin {
                let fd = pipe.into_parent_end();
                set_nonblocking(fd.as_raw_fd())?;
                stream.open(fd, StreamDirection::Writable);
            }
        }
        if let Some(pipe) = stdout_pipe {
            if let StdioBinding::Stream(stream) = &mut options.stdout {
                let fd = pipe.into_parent_end();
                set_nonblocking(fd.as_raw_fd())?;
                stream.open(fd, StreamDirection::Readable);
            }
        }
        if let Some(pipe) = stderr_pipe {
            if let StdioBinding::Stream(stream) = &mut options.stderr {
                let fd = pipe.into_parent_end();
                set_nonblocking(fd.as_raw_fd())?;
                stream.open(fd, StreamDirection::Readable);
            }
        }

        let on_exit = options.on_exit.take();
        watch.watch_child(
            child,
            Box::new(move |raw_status| {
                let termination = status::decode(raw_status);
                if let Some(callback) = on_exit {
                    callback(termination);
                }
            }),
        );

        Ok(Process { pid: Some(child) })
    }

    /// OS process identifier; `None` only for a handle whose spawn never
    /// completed.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Send `signal` to the child. Fails with `NoProcess` if the handle
    /// has no live pid; OS errors (ESRCH, EPERM) are surfaced verbatim.
    pub fn kill(&self, signal: Signal) -> SpawnResult<()> {
        let pid = self.pid.ok_or(SpawnError::NoProcess)?;
        send_signal(pid, signal)
    }
}

/// Block until the synchronization pipe reports end-of-stream: the child
/// has exec'd or died. Retries on interrupt; ENOMEM is transient for
/// poll(2) and retried the same way.
fn wait_for_exec(fd: &OwnedFd) -> SpawnResult<()> {
    let mut pfd = [PollFd::new(fd.as_fd(), PollFlags::POLLIN | PollFlags::POLLHUP)];
    loop {
        match poll(&mut pfd, PollTimeout::NONE) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) | Err(Errno::ENOMEM) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Build the NULL-terminated pointer array an exec call wants. Must
/// happen before fork; the pointers borrow from `strings`.
pub(crate) fn nul_terminated(strings: &[std::ffi::CString]) -> Vec<*const libc::c_char> {
    let mut ptrs: Vec<*const libc::c_char> = strings.iter().map(|s| s.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    ptrs
}

/// Everything the child branch needs, materialized before fork.
pub(crate) struct ExecPlan<'a> {
    pub(crate) file: &'a CStr,
    /// NULL-terminated argv pointer array.
    pub(crate) argv: &'a [*const libc::c_char],
    /// NULL-terminated envp; `None` inherits the parent environment.
    pub(crate) envp: Option<&'a [*const libc::c_char]>,
    pub(crate) cwd: Option<&'a CStr>,
    /// (parent end to close, child end, target stdio descriptor)
    pub(crate) redirects: &'a [(RawFd, RawFd, RawFd)],
}

/// Child branch of the fork: rebind stdio, change directory, replace the
/// image. Between fork and exec only async-signal-safe calls are
/// allowed, hence raw libc and no allocation; every argument was
/// materialized before the fork. Any failure exits with the 127
/// sentinel, which the parent observes as an ordinary exit code.
pub(crate) fn exec_child(plan: &ExecPlan<'_>) -> ! {
    unsafe {
        for &(parent_end, child_end, target) in plan.redirects {
            libc::close(parent_end);
            if libc::dup2(child_end, target) < 0 {
                libc::_exit(127);
            }
        }
        if let Some(dir) = plan.cwd {
            if libc::chdir(dir.as_ptr()) != 0 {
                libc::_exit(127);
            }
        }
        match plan.envp {
            Some(envp) => {
                libc::execvpe(plan.file.as_ptr(), plan.argv.as_ptr(), envp.as_ptr());
            }
            None => {
                libc::execvp(plan.file.as_ptr(), plan.argv.as_ptr());
            }
        }
        libc::_exit(127)
    }
}
