//! Worker process internals.
//!
//! A worker holds one session loop against the coordinator, one heartbeat
//! ticker, and one executor. The executor runs dispatched code inside a
//! locked-down container and posts its result back into the session loop
//! over a single-producer channel.

pub mod executor;
pub mod heartbeat;
pub mod session;

pub use executor::JobExecutor;
pub use session::{WorkerClient, WorkerExit};
