//! Child-process management core for an event-driven I/O runtime
//!
//! Two engines share one fork/exec primitive but differ in concurrency
//! model: the async engine wires pipe-backed stdio streams and reports
//! termination through a reactor callback; the sync engine blocks the
//! calling thread, feeding stdin and capturing stdout/stderr through its
//! own poll(2) loop with a timeout. Shared pieces decode wait statuses
//! and deliver signals.

pub mod errors;
mod pipe;
pub mod process;
pub mod reactor;
pub mod signal;
pub mod status;
pub mod stream;
pub mod sync;
mod utils;

// Re-export commonly used types
pub use errors::{SpawnError, SpawnResult};
pub use process::{spawn_count, Env, ExitCallback, Process, SpawnOptions, StdioBinding};
pub use reactor::{ChildWatch, StatusReporter};
pub use signal::send_signal;
pub use status::Termination;
pub use stream::{PipeStream, Stream, StreamDirection, StreamKind};
pub use sync::{SyncOutcome, SyncSpawn};
