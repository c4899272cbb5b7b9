//! Pipe endpoints as owned resources.
//!
//! Every endpoint is an `OwnedFd`: a failed spawn attempt unwinds by
//! drop, and transferring an end to the parent side closes the child
//! side in the same move, so no descriptor survives past the point where
//! it is supposed to be closed.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use crate::errors::SpawnResult;

/// An anonymous unidirectional byte channel.
pub(crate) struct PipePair {
    pub(crate) read: OwnedFd,
    pub(crate) write: OwnedFd,
}

impl PipePair {
    /// Both ends close-on-exec. Endpoints dup2'd onto a child's stdio
    /// lose the flag in the copy, so the originals still vanish at exec.
    pub(crate) fn cloexec() -> SpawnResult<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(Self { read, write })
    }

    /// Close-on-exec and non-blocking; used for notification pipes that
    /// carry no data.
    pub(crate) fn cloexec_nonblocking() -> SpawnResult<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok(Self { read, write })
    }
}

/// One stdio pipe pair, tagged with which end the parent retains.
pub(crate) struct StdioPipe {
    pair: PipePair,
    parent_writes: bool,
}

impl StdioPipe {
    /// Pipe feeding the child's stdin; the parent keeps the write end.
    pub(crate) fn for_stdin() -> SpawnResult<Self> {
        Ok(Self {
            pair: PipePair::cloexec()?,
            parent_writes: true,
        })
    }

    /// Pipe capturing the child's stdout or stderr; the parent keeps the
    /// read end.
    pub(crate) fn for_output() -> SpawnResult<Self> {
        Ok(Self {
            pair: PipePair::cloexec()?,
            parent_writes: false,
        })
    }

    /// The end the child dup2s onto its stdio descriptor.
    pub(crate) fn child_fd(&self) -> RawFd {
        if self.parent_writes {
            self.pair.read.as_raw_fd()
        } else {
            self.pair.write.as_raw_fd()
        }
    }

    /// The parent-retained end, as seen from the child: closed there
    /// right after the fork point.
    pub(crate) fn parent_fd_raw(&self) -> RawFd {
        if self.parent_writes {
            self.pair.write.as_raw_fd()
        } else {
            self.pair.read.as_raw_fd()
        }
    }

    /// Transfer the parent end out; the child end is dropped (closed)
    /// in the same move.
    pub(crate) fn into_parent_end(self) -> OwnedFd {
        let PipePair { read, write } = self.pair;
        if self.parent_writes {
            drop(read);
            write
        } else {
            drop(write);
            read
        }
    }
}

/// Mark a descriptor non-blocking, preserving its other status flags.
pub(crate) fn set_nonblocking(fd: RawFd) -> SpawnResult<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}
