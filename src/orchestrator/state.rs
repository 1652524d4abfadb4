use crate::error::ConfigError;

/// Seed for one run: the configured base plus the run index, so repeated
/// runs of one configuration diverge deterministically.
pub fn resolve_seed(base: u64, run: Option<i64>) -> Result<u64, ConfigError> {
    match run {
        None => Ok(base),
        Some(run) if run < 0 => Err(ConfigError::Validation(format!(
            "run number must be >= 0, got {run}"
        ))),
        Some(run) => Ok(base.wrapping_add(run as u64)),
    }
}

/// Where the retry loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    /// An attempt is running; `n_errors` attempts have failed before it.
    Attempt { n_errors: usize },
    Success { retries: usize },
    Exhausted { attempts: usize },
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Success { .. } | RunState::Exhausted { .. })
    }

    /// Attempt number, counted from 1, while an attempt runs.
    pub fn attempt(self) -> Option<usize> {
        match self {
            RunState::Attempt { n_errors } => Some(n_errors + 1),
            _ => None,
        }
    }
}

/// Bounds how many attempts a run may make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn start(self) -> RunState {
        RunState::Attempt { n_errors: 0 }
    }

    /// The running attempt failed with a retryable error.
    pub fn on_failure(self, state: RunState) -> RunState {
        match state {
            RunState::Attempt { n_errors } => {
                let n_errors = n_errors + 1;
                if n_errors >= self.max_attempts {
                    RunState::Exhausted { attempts: n_errors }
                } else {
                    RunState::Attempt { n_errors }
                }
            }
            other => other,
        }
    }

    /// The running attempt's fit returned normally.
    pub fn on_success(self, state: RunState) -> RunState {
        match state {
            RunState::Attempt { n_errors } => RunState::Success { retries: n_errors },
            other => other,
        }
    }
}
