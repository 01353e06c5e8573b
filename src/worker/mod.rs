//! Worker runtime: claims jobs and runs them through the stage pipeline.
//!
//! Core components:
//! - `task`: job contract resolution (task and exec payloads)
//! - `executor`: step executor trait and the timed attempt runner
//! - `command`: built-in shell executor
//! - `registry`: runtime name to executor mapping
//! - `self_heal`: failure classification and retry budgets
//! - `checkpoint`: per-step checkpoints and attempt records
//! - `heartbeat`: lease renewal and cancel/pause propagation
//! - `live_log`: step output streamed as `log` job events
//! - `worker`: claim loop and the prepare/execute/publish pipeline

pub mod checkpoint;
pub mod command;
pub mod executor;
pub mod heartbeat;
pub mod live_log;
pub mod registry;
pub mod self_heal;
pub mod task;
pub mod worker;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use command::CommandExecutor;
pub use executor::{ProgressSink, RetryContext, StepContext, StepExecutor, StepOutcome};
pub use heartbeat::{Heartbeat, JobControl, StopSignal};
pub use registry::ExecutorRegistry;
pub use self_heal::{FailureClass, SelfHealController, SelfHealStrategy};
pub use task::{JobSpec, PublishMode, StepSpec};
pub use worker::QueueWorker;
