//! Signal delivery and the SIGCHLD self-pipe used by the sync engine.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::sys::signal::{kill, Signal};
use nix::unistd::{self, Pid};
use signal_hook::consts::signal::SIGCHLD;
use signal_hook::SigId;

use crate::errors::SpawnResult;
use crate::pipe::PipePair;

/// Send `signal` to the process identified by `pid`.
///
/// Fire-and-forget: no retries, and the OS error (e.g. ESRCH once the
/// target has been reaped, or EPERM) is surfaced verbatim.
pub fn send_signal(pid: Pid, signal: Signal) -> SpawnResult<()> {
    kill(pid, signal)?;
    Ok(())
}

/// SIGCHLD notification pipe.
///
/// While this is alive, every SIGCHLD delivery writes one byte to the
/// write end from signal context; that is the only work done there. The
/// read end is an ordinary readiness source for the multiplexing loop.
/// Dropping unregisters the signal action.
pub(crate) struct SigChldPipe {
    read: OwnedFd,
    // Keeps the descriptor registered with the signal action open.
    _write: OwnedFd,
    id: SigId,
}

impl SigChldPipe {
    /// Install before fork, so an instantly-exiting child cannot slip
    /// past the notification.
    pub(crate) fn install() -> SpawnResult<Self> {
        let pair = PipePair::cloexec_nonblocking()?;
        let id = signal_hook::low_level::pipe::register_raw(SIGCHLD, pair.write.as_raw_fd())?;
        Ok(Self {
            read: pair.read,
            _write: pair.write,
            id,
        })
    }

    pub(crate) fn read_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }

    /// Drain pending notification bytes. Non-blocking read end, so this
    /// stops at EAGAIN.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 16];
        while matches!(unistd::read(self.read.as_raw_fd(), &mut buf), Ok(n) if n > 0) {}
    }
}

impl Drop for SigChldPipe {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use crate::errors::SpawnError;

    #[test]
    fn test_send_signal_to_nonexistent_pid() {
        // Far above any realistic pid_max.
        let err = send_signal(Pid::from_raw(i32::MAX), Signal::SIGTERM).unwrap_err();
        match err {
            SpawnError::Os(e) => assert_eq!(e, Errno::ESRCH),
            other => panic!("expected Os error, got: {other}"),
        }
    }

    #[test]
    fn test_sigchld_pipe_install_and_drop() {
        let pipe = SigChldPipe::install().unwrap();
        pipe.drain();
        drop(pipe);

        // Registration must be repeatable after unregister.
        let again = SigChldPipe::install().unwrap();
        drop(again);
    }
}
