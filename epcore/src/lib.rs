//! # `epcore`: the real-time core of a cardiac electrophysiology DAQ system
//!
//! This crate implements the hard-real-time half of a multichannel
//! data-acquisition and closed-loop-stimulation system used in cardiac
//! electrophysiology experiments: a deterministic periodic scan loop that
//! reads analog-input channels at a fixed sampling rate, detects spikes,
//! and streams samples to a non-realtime consumer, plus the shared
//! infrastructure (binary heap, driver facade, shared configuration
//! block, control-command dispatch, callback registry) the extension
//! pipeline in `epcore-control` builds on.
//!
//! ## Navigating the crate
//!
//! - [`heap`] — the binary min-heap the command scheduler in
//!   `epcore-control` is built on.
//! - [`rtos`]/[`aio`] — the two collaborators the core treats as opaque:
//!   the real-time substrate (clock, sleep, FIFOs) and the analog I/O
//!   driver (enumerate/read/write/convert).
//! - [`shared_state`] — the process-wide configuration block; the only
//!   writer is [`control_fifo::ControlFifoDispatcher`].
//! - [`registry`] — the callback registry the acquisition engine walks
//!   every scan.
//! - [`engine`] — the RT loop itself, and the three built-in callbacks
//!   that perform the scan (`scan_channels`, `detect_spikes`,
//!   `enqueue_for_userland`).
//! - [`config`] — environment-derived startup configuration.
//! - [`error`] — the error taxonomy shared across this crate and
//!   `epcore-control`.

pub mod aio;
pub mod config;
pub mod control_fifo;
pub mod engine;
pub mod error;
pub mod heap;
pub mod registry;
pub mod rtos;
pub mod shared_state;
pub mod types;

pub use error::{Error, Result};
