//! Shared State Region (C4): the process-wide configuration block mapped
//! by both the RT loop and the non-RT UI. Modeled here as a plain struct
//! behind a facade whose getters are total functions over a validated
//! snapshot and whose only writer is the Control FIFO Dispatcher (C5),
//! per the Design Notes in `spec.md` §9 ("do not expose the raw block to
//! plugins"). RT-only fields (scan index, jitter, wall clock, per-channel
//! spike running state) are mutated exclusively by the Acquisition Engine
//! (C6) through a separate, non-public path.

use crate::types::{AnalogReference, Chanspec, EnableMask, Namespace, Polarity, SpikeParams, MAX_SAMPLING_RATE_HZ, MIN_SAMPLING_RATE_HZ};

pub const SHARED_STATE_MAGIC: u32 = 0x5348_4452; // "SHDR"
pub const SHARED_STATE_VERSION: u16 = 1;

/// Sampling-rate normalization: clamp to `[MIN, MAX]`, then snap to a
/// multiple of 1000 for rates above 1000, or to an integer divisor of
/// 1000 for rates at or below 1000.
pub fn normalize_sampling_rate(requested: u32) -> u32 {
    let clamped = requested.clamp(MIN_SAMPLING_RATE_HZ, MAX_SAMPLING_RATE_HZ);
    if clamped > 1000 {
        let snapped = ((clamped + 500) / 1000) * 1000;
        snapped.clamp(MIN_SAMPLING_RATE_HZ, MAX_SAMPLING_RATE_HZ)
    } else {
        const DIVISORS: [u32; 16] = [1, 2, 4, 5, 8, 10, 20, 25, 40, 50, 100, 125, 200, 250, 500, 1000];
        DIVISORS
            .iter()
            .copied()
            .min_by_key(|&d| (d as i64 - clamped as i64).unsigned_abs())
            .unwrap()
    }
}

pub fn nanos_per_scan(sampling_rate_hz: u32) -> u64 {
    crate::types::BILLION / sampling_rate_hz.max(1) as u64
}

pub struct SharedState {
    magic: u32,
    version: u16,

    n_ai_channels: usize,
    n_ao_channels: usize,

    ai_chanspec: Vec<Chanspec>,
    ao_chanspec: Vec<Chanspec>,
    ai_enabled: EnableMask,
    ao_enabled: EnableMask,
    spike_params: Vec<SpikeParams>,

    sampling_rate_hz: u32,
    nanos_per_scan: u64,

    scan_index: u64,
    jitter_ns: u64,
    wall_clock_ms: u64,
    wall_clock_us: u64,

    attached_pid: Option<u32>,
}

impl SharedState {
    pub fn new(n_ai_channels: usize, n_ao_channels: usize, sampling_rate_hz: u32) -> Self {
        let rate = normalize_sampling_rate(sampling_rate_hz);
        SharedState {
            magic: SHARED_STATE_MAGIC,
            version: SHARED_STATE_VERSION,
            n_ai_channels,
            n_ao_channels,
            ai_chanspec: (0..n_ai_channels)
                .map(|c| Chanspec::new(Namespace::AnalogInput, c as u16, 0, AnalogReference::Ground))
                .collect(),
            ao_chanspec: (0..n_ao_channels)
                .map(|c| Chanspec::new(Namespace::AnalogOutput, c as u16, 0, AnalogReference::Ground))
                .collect(),
            ai_enabled: EnableMask::new(),
            ao_enabled: EnableMask::new(),
            spike_params: vec![SpikeParams::default(); n_ai_channels],
            sampling_rate_hz: rate,
            nanos_per_scan: nanos_per_scan(rate),
            scan_index: 0,
            jitter_ns: 0,
            wall_clock_ms: 0,
            wall_clock_us: 0,
            attached_pid: None,
        }
    }

    /// Validates the magic/version pair the way `check_basic_sanity` does
    /// in the original control-FIFO dispatch path.
    pub fn is_valid(&self) -> bool {
        self.magic == SHARED_STATE_MAGIC && self.version == SHARED_STATE_VERSION
    }

    pub fn n_ai_channels(&self) -> usize {
        self.n_ai_channels
    }
    pub fn n_ao_channels(&self) -> usize {
        self.n_ao_channels
    }
    pub fn sampling_rate_hz(&self) -> u32 {
        self.sampling_rate_hz
    }
    pub fn nanos_per_scan(&self) -> u64 {
        self.nanos_per_scan
    }
    pub fn scan_index(&self) -> u64 {
        self.scan_index
    }
    pub fn jitter_ns(&self) -> u64 {
        self.jitter_ns
    }
    pub fn wall_clock_ms(&self) -> u64 {
        self.wall_clock_ms
    }
    pub fn attached_pid(&self) -> Option<u32> {
        self.attached_pid
    }
    pub fn ai_chanspec(&self, chan: u16) -> Option<Chanspec> {
        self.ai_chanspec.get(chan as usize).copied()
    }
    pub fn ao_chanspec(&self, chan: u16) -> Option<Chanspec> {
        self.ao_chanspec.get(chan as usize).copied()
    }
    pub fn ai_enabled(&self) -> &EnableMask {
        &self.ai_enabled
    }
    pub fn ao_enabled(&self) -> &EnableMask {
        &self.ao_enabled
    }
    pub fn spike_params(&self, chan: u16) -> Option<&SpikeParams> {
        self.spike_params.get(chan as usize)
    }

    // -- Writers reachable only from `control_fifo::ControlFifoDispatcher`. --

    pub(crate) fn set_ai_enabled(&mut self, chan: u16, enabled: bool) {
        if (chan as usize) < self.n_ai_channels {
            self.ai_enabled.set(chan, enabled);
        }
    }

    pub(crate) fn set_ai_enabled_all(&mut self, enabled: bool) {
        for c in 0..self.n_ai_channels as u16 {
            self.ai_enabled.set(c, enabled);
        }
    }

    pub(crate) fn set_ai_range(&mut self, chan: u16, range: u16) {
        if let Some(cs) = self.ai_chanspec.get_mut(chan as usize) {
            cs.range = range;
        }
    }

    pub(crate) fn set_ai_aref(&mut self, chan: u16, aref: AnalogReference) {
        if let Some(cs) = self.ai_chanspec.get_mut(chan as usize) {
            cs.aref = aref;
        }
    }

    pub(crate) fn set_ai_aref_all(&mut self, aref: AnalogReference) {
        for cs in self.ai_chanspec.iter_mut() {
            cs.aref = aref;
        }
    }

    pub(crate) fn set_spike_enable(&mut self, chan: u16, enabled: bool) {
        if let Some(sp) = self.spike_params.get_mut(chan as usize) {
            sp.enabled = enabled;
        }
    }

    pub(crate) fn set_spike_enable_all(&mut self, enabled: bool) {
        for sp in self.spike_params.iter_mut() {
            sp.enabled = enabled;
        }
    }

    pub(crate) fn set_spike_polarity(&mut self, chan: u16, polarity: Polarity) {
        if let Some(sp) = self.spike_params.get_mut(chan as usize) {
            sp.polarity = polarity;
        }
    }

    pub(crate) fn set_spike_polarity_all(&mut self, polarity: Polarity) {
        for sp in self.spike_params.iter_mut() {
            sp.polarity = polarity;
        }
    }

    pub(crate) fn set_spike_blanking(&mut self, chan: u16, blanking_ms: f64) {
        if let Some(sp) = self.spike_params.get_mut(chan as usize) {
            sp.blanking_ms = blanking_ms;
        }
    }

    pub(crate) fn set_spike_blanking_all(&mut self, blanking_ms: f64) {
        for sp in self.spike_params.iter_mut() {
            sp.blanking_ms = blanking_ms;
        }
    }

    pub(crate) fn set_spike_threshold(&mut self, chan: u16, threshold: f64) {
        if let Some(sp) = self.spike_params.get_mut(chan as usize) {
            sp.threshold = threshold;
        }
    }

    pub(crate) fn set_spike_threshold_all(&mut self, threshold: f64) {
        for sp in self.spike_params.iter_mut() {
            sp.threshold = threshold;
        }
    }

    pub(crate) fn set_attached_pid(&mut self, pid: Option<u32>) {
        self.attached_pid = pid;
    }

    /// Sets the sampling rate, normalizing it first. Returns the new
    /// `nanos_per_scan` so the caller (the RT loop, next iteration) can
    /// re-derive its absolute deadline from the new period.
    pub(crate) fn set_sampling_rate(&mut self, requested_hz: u32) -> u64 {
        self.sampling_rate_hz = normalize_sampling_rate(requested_hz);
        self.nanos_per_scan = nanos_per_scan(self.sampling_rate_hz);
        self.nanos_per_scan
    }

    /// Dangerous: directly overwrites the scan index, as documented in the
    /// original `SET_SCAN_INDEX` handler.
    pub(crate) fn set_scan_index_dangerous(&mut self, scan_index: u64) {
        self.scan_index = scan_index;
    }

    // -- RT-only writers, used exclusively by the Acquisition Engine. --

    pub(crate) fn rt_increment_scan_index(&mut self) {
        self.scan_index += 1;
    }

    pub(crate) fn rt_set_jitter_if_larger(&mut self, candidate_ns: u64) {
        if candidate_ns > self.jitter_ns {
            self.jitter_ns = candidate_ns;
        }
    }

    pub(crate) fn rt_update_wall_clock(&mut self, elapsed_ns: u64) {
        self.wall_clock_ms = elapsed_ns / 1_000_000;
        self.wall_clock_us = elapsed_ns / 1_000;
    }

    pub(crate) fn rt_spike_params_mut(&mut self, chan: u16) -> Option<&mut SpikeParams> {
        self.spike_params.get_mut(chan as usize)
    }

    pub(crate) fn ai_chanspec_slice(&self) -> &[Chanspec] {
        &self.ai_chanspec
    }
}
