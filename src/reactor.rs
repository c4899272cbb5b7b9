//! Reactor seam: the child-termination watch this crate consumes.
//!
//! The event loop itself is an external collaborator. The async spawn
//! engine only needs one primitive from it: given a process identifier,
//! deliver its raw wait status to a reporter exactly once when the child
//! terminates.

use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// Reporter handed to the event loop for one watched child. Invoked at
/// most once, with the reaped wait status.
pub type StatusReporter = Box<dyn FnOnce(WaitStatus) + Send>;

pub trait ChildWatch {
    /// Start watching `pid`. The implementation reaps the child when its
    /// status becomes available, invokes `reporter` with it exactly
    /// once, and stops watching the identifier afterwards.
    fn watch_child(&self, pid: Pid, reporter: StatusReporter);
}
