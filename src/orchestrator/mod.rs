//! The fault-tolerant run loop.
//!
//! [`Orchestrator`] seeds, builds loaders and a model, snapshots the initial
//! weights and fits. A retryable failure (or a panic) inside fit cleans the
//! attempt's artifacts and starts over, up to `trainer.max_attempts`
//! attempts. On success [`PostRunValidator`] validates the best checkpoint
//! and writes `final.ckpt`.

mod environment;
mod run;
mod state;
mod validator;

pub use environment::{build_callbacks, build_loggers, BurnEnvironment};
pub use run::{error_chain, Orchestrator, RunEnvironment, RunReport};
pub use state::{resolve_seed, RetryPolicy, RunState};
pub use validator::PostRunValidator;
