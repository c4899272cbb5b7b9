//! Integration tests for the sync spawn engine.

mod common;

use std::time::{Duration, Instant};

use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal::kill;
use reactor_process_rs::{SpawnError, SyncSpawn};

use common::init_tracing;

#[test]
fn captures_hello_within_timeout() -> Result<()> {
    init_tracing();
    let outcome = SyncSpawn::new("sh")
        .arg("-c")
        .arg("printf hello")
        .capture_stdout(16)
        .timeout(Duration::from_millis(1000))
        .run()?;

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.term_signal, 0);
    assert_eq!(outcome.stdout, b"hello");
    assert_eq!(outcome.stdout.len(), 5);
    assert!(!outcome.timed_out);
    Ok(())
}

#[test]
fn reports_exit_code() -> Result<()> {
    let outcome = SyncSpawn::new("sh")
        .arg("-c")
        .arg("exit 3")
        .timeout(Duration::from_secs(5))
        .run()?;

    assert_eq!(outcome.exit_code, 3);
    assert_eq!(outcome.term_signal, 0);
    assert!(!outcome.timed_out);
    Ok(())
}

#[test]
fn reports_termination_signal() -> Result<()> {
    let outcome = SyncSpawn::new("sh")
        .arg("-c")
        .arg("kill -KILL $$")
        .timeout(Duration::from_secs(5))
        .run()?;

    assert_eq!(outcome.term_signal, libc::SIGKILL);
    assert_eq!(outcome.exit_code, 0);
    assert!(!outcome.timed_out);
    Ok(())
}

#[test]
fn timeout_is_a_normal_outcome() -> Result<()> {
    init_tracing();
    let started = Instant::now();
    let outcome = SyncSpawn::new("sleep")
        .arg("5")
        .timeout(Duration::from_millis(100))
        .run()?;

    assert!(outcome.timed_out);
    assert!(started.elapsed() < Duration::from_secs(5));

    // Killed and reaped: the pid no longer names a process.
    assert_eq!(kill(outcome.pid, None).unwrap_err(), Errno::ESRCH);
    Ok(())
}

#[test]
fn overflowing_capture_is_an_error() {
    let err = SyncSpawn::new("sh")
        .arg("-c")
        .arg("printf 0123456789abcdef")
        .capture_stdout(4)
        .timeout(Duration::from_secs(5))
        .run()
        .unwrap_err();

    assert!(matches!(
        err,
        SpawnError::BufferOverflow { stream: "stdout" }
    ));
}

#[test]
fn exact_fit_capture_succeeds() -> Result<()> {
    let outcome = SyncSpawn::new("sh")
        .arg("-c")
        .arg("printf hello")
        .capture_stdout(5)
        .timeout(Duration::from_secs(5))
        .run()?;

    assert_eq!(outcome.stdout, b"hello");
    assert!(!outcome.timed_out);
    Ok(())
}

#[test]
fn stdin_feed_round_trips_through_cat() -> Result<()> {
    let payload = b"fed through the stdin pipe\n".to_vec();
    let outcome = SyncSpawn::new("cat")
        .input(payload.clone())
        .capture_stdout(256)
        .timeout(Duration::from_secs(5))
        .run()?;

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.stdin_written, payload.len());
    assert_eq!(outcome.stdout, payload);
    assert!(!outcome.timed_out);
    Ok(())
}

#[test]
fn large_stdin_feed_uses_partial_writes() -> Result<()> {
    // Larger than the default pipe buffer, so the feed takes several
    // writes interleaved with the child's reads.
    let payload = vec![b'x'; 256 * 1024];
    let outcome = SyncSpawn::new("cat")
        .input(payload.clone())
        .capture_stdout(payload.len())
        .timeout(Duration::from_secs(10))
        .run()?;

    assert_eq!(outcome.stdin_written, payload.len());
    assert_eq!(outcome.stdout.len(), payload.len());
    assert_eq!(outcome.stdout, payload);
    Ok(())
}

#[test]
fn combine_merges_stderr_into_stdout() -> Result<()> {
    let outcome = SyncSpawn::new("sh")
        .arg("-c")
        .arg("printf 'out\\n'; printf 'err\\n' >&2")
        .capture_stdout(64)
        .combine_stderr()
        .timeout(Duration::from_secs(5))
        .run()?;

    assert_eq!(outcome.stdout, b"out\nerr\n");
    assert!(outcome.stderr.is_empty());
    Ok(())
}

#[test]
fn separate_stderr_capture() -> Result<()> {
    let outcome = SyncSpawn::new("sh")
        .arg("-c")
        .arg("printf out; printf err >&2")
        .capture_stdout(64)
        .capture_stderr(64)
        .timeout(Duration::from_secs(5))
        .run()?;

    assert_eq!(outcome.stdout, b"out");
    assert_eq!(outcome.stderr, b"err");
    Ok(())
}

#[test]
fn combine_with_stderr_capture_is_rejected() {
    let err = SyncSpawn::new("true")
        .capture_stdout(16)
        .capture_stderr(16)
        .combine_stderr()
        .run()
        .unwrap_err();
    assert!(matches!(err, SpawnError::InvalidConfig(_)));
}

#[test]
fn nonexistent_executable_exits_127() -> Result<()> {
    let outcome = SyncSpawn::new("definitely-not-a-real-binary-4242")
        .timeout(Duration::from_secs(5))
        .run()?;

    assert_eq!(outcome.exit_code, 127);
    assert!(!outcome.timed_out);
    Ok(())
}

#[test]
fn no_capture_no_input_still_reaps() -> Result<()> {
    let outcome = SyncSpawn::new("true")
        .timeout(Duration::from_secs(5))
        .run()?;

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.stdin_written, 0);
    assert!(outcome.stdout.is_empty());
    assert!(outcome.stderr.is_empty());
    Ok(())
}

#[test]
fn empty_input_closes_stdin_immediately() -> Result<()> {
    // cat with empty stdin exits as soon as it sees EOF.
    let outcome = SyncSpawn::new("cat")
        .input(Vec::new())
        .capture_stdout(16)
        .timeout(Duration::from_secs(5))
        .run()?;

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.stdin_written, 0);
    assert!(outcome.stdout.is_empty());
    Ok(())
}

#[test]
fn capture_keeps_partial_output_on_timeout() -> Result<()> {
    let outcome = SyncSpawn::new("sh")
        .arg("-c")
        .arg("printf early; sleep 5")
        .capture_stdout(64)
        .timeout(Duration::from_millis(200))
        .run()?;

    assert!(outcome.timed_out);
    assert_eq!(outcome.stdout, b"early");
    Ok(())
}
