use std::any::Any;
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::checkpoint::{ArtifactCleanup, FINAL_CHECKPOINT, INITIAL_CHECKPOINT};
use crate::config::RunConfig;
use crate::error::{FitError, RunError};
use crate::orchestrator::state::{resolve_seed, RetryPolicy, RunState};
use crate::orchestrator::validator::PostRunValidator;
use crate::training::{Trainer, ValidationMetrics};

/// Everything an attempt needs built, behind one seam so the retry loop can
/// run against real burn components or test fakes.
pub trait RunEnvironment {
    type Model: ?Sized;
    type Loader;
    type Trainer: Trainer<Model = Self::Model, Loader = Self::Loader>;

    /// Re-seed every random source before an attempt.
    fn seed_everything(&mut self, seed: u64);

    /// Train and validation loaders.
    fn build_loaders(&mut self, config: &RunConfig) -> Result<(Self::Loader, Self::Loader), RunError>;

    fn build_model(
        &mut self,
        config: &RunConfig,
        fold: Option<usize>,
        run: Option<usize>,
    ) -> Result<Box<Self::Model>, RunError>;

    /// Persist the untrained weights.
    fn save_initial(&mut self, model: &Self::Model, path: &Path) -> Result<(), RunError>;

    /// Trainer with its loggers and callbacks.
    fn build_trainer(&mut self, config: &RunConfig, seed: u64) -> Result<Self::Trainer, RunError>;
}

/// Summary of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub seed: u64,
    /// Attempts made, including the successful one.
    pub attempts: usize,
    pub retries: usize,
    pub initial_checkpoint: PathBuf,
    pub final_checkpoint: PathBuf,
    pub validation: ValidationMetrics,
}

/// Drives one training run: seed, build, fit with bounded retries, then
/// validate and snapshot.
pub struct Orchestrator<'a, E: RunEnvironment, C: ArtifactCleanup> {
    config: &'a RunConfig,
    env: E,
    cleaner: C,
    fold: Option<usize>,
    run: Option<i64>,
    verbose: bool,
}

impl<'a, E: RunEnvironment, C: ArtifactCleanup> Orchestrator<'a, E, C> {
    pub fn new(config: &'a RunConfig, env: E, cleaner: C) -> Self {
        Orchestrator {
            config,
            env,
            cleaner,
            fold: None,
            run: None,
            verbose: true,
        }
    }

    /// Fold and run indices; both are needed to load a pretrained checkpoint.
    pub fn with_indices(mut self, fold: Option<usize>, run: Option<i64>) -> Self {
        self.fold = fold;
        self.run = run;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn cleaner(&self) -> &C {
        &self.cleaner
    }

    pub fn run(&mut self) -> Result<RunReport, RunError> {
        let config = self.config;
        let seed = resolve_seed(config.seed, self.run)?;
        let run_index = self.run.map(|r| r as usize);
        let checkpoint_dir = config.callbacks.checkpoint_dir.clone();
        let initial_checkpoint = checkpoint_dir.join(INITIAL_CHECKPOINT);
        let resume_from = config
            .trainer
            .resume
            .then(|| checkpoint_dir.join(FINAL_CHECKPOINT));
        let policy = RetryPolicy::new(config.trainer.max_attempts);

        let mut state = RunState::Init;
        debug!(?state, "resolved run configuration");
        info!(
            seed,
            classifier = %config.model.classifier,
            max_attempts = policy.max_attempts,
            checkpoint_dir = %checkpoint_dir.display(),
            "fitting model on datamodule"
        );
        state = policy.start();

        loop {
            let attempt = state.attempt().unwrap_or(1);
            info!(attempt, max_attempts = policy.max_attempts, "starting attempt");

            self.env.seed_everything(seed);
            let (mut train, mut val) = self.env.build_loaders(config)?;
            let mut model = self.env.build_model(config, self.fold, run_index)?;
            self.env.save_initial(&*model, &initial_checkpoint)?;
            info!(path = %initial_checkpoint.display(), "saved initial weights");
            let mut trainer = self.env.build_trainer(config, seed)?;

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                trainer.fit(&mut *model, &mut train, &mut val, resume_from.as_deref())
            }));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) if err.is_retryable() => Some(err),
                Ok(Err(err)) => return Err(RunError::Fit(err)),
                Err(payload) => Some(FitError::Panicked(panic_message(&*payload))),
            };

            let Some(err) = failure else {
                state = policy.on_success(state);
                let retries = match state {
                    RunState::Success { retries } => retries,
                    _ => attempt - 1,
                };
                let validator = PostRunValidator::new(&checkpoint_dir).with_verbose(self.verbose);
                let (validation, final_checkpoint) = validator.finish(&mut trainer, &mut *model, &val)?;
                info!(attempts = attempt, retries, "training run complete");
                return Ok(RunReport {
                    seed,
                    attempts: attempt,
                    retries,
                    initial_checkpoint,
                    final_checkpoint,
                    validation,
                });
            };

            error!(attempt, error = %error_chain(&err), "training attempt failed");
            let cleanup = self.cleaner.clean(&checkpoint_dir);
            debug!(?cleanup, "cleaned failed attempt");

            state = policy.on_failure(state);
            if let RunState::Exhausted { attempts } = state {
                error!(attempts, "Training failed too many times. Exiting.");
                return Err(RunError::TrainingExhausted { attempts });
            }
        }
    }
}

/// `err: cause: cause ...`
pub fn error_chain(err: &dyn Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CheckpointError, DataError};

    #[test]
    fn test_error_chain_includes_sources() {
        let err = FitError::Checkpoint(CheckpointError::Io(std::io::Error::other("disk full")));
        let chain = error_chain(&err);
        assert!(chain.starts_with("checkpoint error"));
        assert!(chain.ends_with("disk full"));
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("kaboom")), "kaboom");
        assert_eq!(panic_message(&3u8), "unknown panic payload");
    }

    #[test]
    fn test_data_error_chain() {
        let err = FitError::Data(DataError::Empty(PathBuf::from("train")));
        assert!(error_chain(&err).contains("train"));
    }
}
