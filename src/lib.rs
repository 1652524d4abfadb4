//! # MIL Train
//!
//! Fault-tolerant training runs for multiple-instance-learning classifiers
//! over pre-extracted feature bags, built on the Burn ML framework.
//!
//! ## Modules
//!
//! - [`config`] - TOML run configuration, validation and run directories
//! - [`error`] - Structured error types
//! - [`models`] - Model families, registry, factory and the trainable wrapper
//! - [`data`] - Feature bag datasets, weighted sampling and loaders
//! - [`checkpoint`] - Checkpoint files and cleanup of failed attempts
//! - [`training`] - Trainer, callbacks, metric loggers and validation metrics
//! - [`orchestrator`] - Seeded run loop with bounded retries

#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod training;
