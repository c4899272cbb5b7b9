//! Stream seam consumed by the async spawn engine.
//!
//! The event loop's stream machinery lives outside this crate; spawning
//! only needs two things from it: a capability tag to validate that a
//! stdio binding is pipe-backed before any OS resource is committed, and
//! an open operation that binds a raw descriptor plus a direction to the
//! stream object.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

/// Capability tag of a stream object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Anonymous pipe; the only kind a stdio binding may target.
    Pipe,
    Tcp,
    Tty,
}

/// Direction of the parent-side endpoint handed to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Readable,
    Writable,
}

/// A higher-level stream object a spawned child's stdio can be wired to.
pub trait Stream {
    fn kind(&self) -> StreamKind;

    /// Bind a raw descriptor with its direction to this stream object.
    /// Called by the spawn engine after the child has begun executing;
    /// the descriptor is already non-blocking.
    fn open(&mut self, fd: OwnedFd, dir: StreamDirection);
}

/// Pipe-backed stream object.
///
/// Starts unbound; the async spawn engine fills it with the parent end
/// of the child's stdio pipe. The embedder (or a test) then drives the
/// descriptor through its own readiness machinery.
#[derive(Debug, Default)]
pub struct PipeStream {
    fd: Option<OwnedFd>,
    dir: Option<StreamDirection>,
}

impl PipeStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the bound descriptor, if any.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd)
    }

    pub fn direction(&self) -> Option<StreamDirection> {
        self.dir
    }

    /// Take ownership of the bound descriptor, leaving the stream unbound.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }
}

impl Stream for PipeStream {
    fn kind(&self) -> StreamKind {
        StreamKind::Pipe
    }

    fn open(&mut self, fd: OwnedFd, dir: StreamDirection) {
        self.fd = Some(fd);
        self.dir = Some(dir);
    }
}
