pub mod dispatcher;
pub mod queue;

pub use dispatcher::{DispatchSignal, Scheduler};
pub use queue::ReadyQueue;
