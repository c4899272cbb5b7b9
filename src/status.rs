//! Wait-status decoding shared by both spawn engines.

use nix::sys::wait::WaitStatus;

/// How a child ended.
///
/// `exit_code` is meaningful only when the child exited normally,
/// `term_signal` only when it was killed by a signal; the other field is
/// zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Termination {
    pub exit_code: i32,
    pub term_signal: i32,
}

pub(crate) fn decode(status: WaitStatus) -> Termination {
    match status {
        WaitStatus::Exited(_, code) => Termination {
            exit_code: code,
            term_signal: 0,
        },
        WaitStatus::Signaled(_, signal, _) => Termination {
            exit_code: 0,
            term_signal: signal as i32,
        },
        _ => Termination::default(),
    }
}
