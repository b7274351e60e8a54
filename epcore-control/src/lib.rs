//! # `epcore-control`: the closed-loop extension pipeline
//!
//! This crate extends `epcore`'s real-time acquisition core with the
//! three collaborating pieces needed to run a closed-loop pacing
//! experiment: a generic command scheduler for "do this N milliseconds
//! from now" bookkeeping, a pulse-train stimulator built on top of it,
//! and an action-potential-duration detector/controller that paces,
//! measures, and perturbs the pacing interval in response.
//!
//! ## Navigating the crate
//!
//! - [`scheduler`] — the command scheduler: a per-handle min-heap of
//!   time-stamped AO-write/AI-read/callback commands, drained once per
//!   RT iteration.
//! - [`stimulator`] — pulse-train generation built on a private
//!   [`scheduler::CommandScheduler`]; handles single-train, multi-train,
//!   and continuous stimulation plus cancellation.
//! - [`apd`] — per-channel action-potential-duration detection and the
//!   proportional pacing-interval controller with automatic gain
//!   adaptation, registered into an `epcore` acquisition engine's
//!   callback registry.
//!
//! All three depend on `epcore`'s [`epcore::aio::AioDriver`] trait and
//! error taxonomy rather than owning any hardware access of their own.

pub mod apd;
pub mod scheduler;
pub mod stimulator;

pub use epcore::error::{Error, Result};
