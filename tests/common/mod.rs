//! Shared helpers for the spawn integration tests.
#![allow(dead_code)] // not every test binary uses every helper

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Mutex;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use reactor_process_rs::{ChildWatch, StatusReporter};

/// Minimal blocking child watch standing in for the event loop: collects
/// registrations, then `run` reaps each watched pid and delivers its
/// status exactly once.
#[derive(Default)]
pub struct TestLoop {
    watched: Mutex<Vec<(Pid, StatusReporter)>>,
}

impl TestLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reap every watched pid and deliver its wait status. Blocks until
    /// all watched children have exited.
    pub fn run(&self) {
        let watched: Vec<_> = {
            let mut guard = self.watched.lock().unwrap();
            guard.drain(..).collect()
        };
        for (pid, reporter) in watched {
            let status = waitpid(pid, None).expect("waitpid on watched child");
            reporter(status);
        }
    }
}

impl ChildWatch for TestLoop {
    fn watch_child(&self, pid: Pid, reporter: StatusReporter) {
        self.watched.lock().unwrap().push((pid, reporter));
    }
}

/// Read a non-blocking descriptor to end-of-stream, polling between
/// EAGAINs.
pub fn read_to_end(fd: OwnedFd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match nix::unistd::read(fd.as_raw_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                let mut pfd = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
                poll(&mut pfd, PollTimeout::from(5000u16)).expect("poll for readable");
            }
            Err(e) => panic!("read failed: {e}"),
        }
    }
    out
}

/// Write all of `data` to a non-blocking descriptor, polling between
/// EAGAINs.
pub fn write_all(fd: &OwnedFd, data: &[u8]) {
    let mut written = 0;
    while written < data.len() {
        match nix::unistd::write(fd, &data[written..]) {
            Ok(n) => written += n,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                let mut pfd = [PollFd::new(fd.as_fd(), PollFlags::POLLOUT)];
                poll(&mut pfd, PollTimeout::from(5000u16)).expect("poll for writable");
            }
            Err(e) => panic!("write failed: {e}"),
        }
    }
}

/// Initialize test logging once; repeated calls are harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
