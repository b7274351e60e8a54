//! Core data model: channel identity, chanspecs, samples, spike parameters
//! and the krange cache. See `rtlab_defaults.h` / `rt_process.c` for the
//! original layouts this mirrors.

use std::fmt;

/// `MAX_CHANNELS` from the original `rtlab_defaults.h`.
pub const MAX_CHANNELS: usize = 256;

/// `STIM_PULSE_WIDTH` in milliseconds.
pub const STIM_PULSE_WIDTH_MS: u32 = 2;

/// APD peak-search window, in milliseconds.
pub const APD_PEAK_SEARCH_WINDOW_MS: u32 = 25;

pub const MC_DELTA_G_MIN: f64 = 0.001;
pub const MC_DELTA_G_MAX: f64 = 0.5;

pub const MIN_SAMPLING_RATE_HZ: u32 = 1;
pub const MAX_SAMPLING_RATE_HZ: u32 = 25_000;
pub const INITIAL_SAMPLING_RATE_HZ: u32 = 1000;
pub const REQUIRED_APD_SAMPLING_RATE_HZ: u32 = 1000;

pub const BILLION: u64 = 1_000_000_000;
pub const MILLION: u64 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    AnalogInput,
    AnalogOutput,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnalogReference {
    Ground,
    Common,
    Differential,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unit {
    Volt,
    MilliAmp,
}

/// Packed (channel, range-index, analog-reference) triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chanspec {
    pub namespace: Namespace,
    pub channel: u16,
    pub range: u16,
    pub aref: AnalogReference,
}

impl Chanspec {
    pub fn new(namespace: Namespace, channel: u16, range: u16, aref: AnalogReference) -> Self {
        Chanspec {
            namespace,
            channel,
            range,
            aref,
        }
    }
}

/// One voltage window associated with a range index of one channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Krange {
    pub min: f64,
    pub max: f64,
    pub unit: Unit,
}

/// Bit vector of `MAX_CHANNELS` bits, one per namespace.
#[derive(Clone, Debug)]
pub struct EnableMask {
    bits: [bool; MAX_CHANNELS],
}

impl Default for EnableMask {
    fn default() -> Self {
        EnableMask {
            bits: [false; MAX_CHANNELS],
        }
    }
}

impl EnableMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, chan: u16, enabled: bool) {
        self.bits[chan as usize] = enabled;
    }

    pub fn is_set(&self, chan: u16) -> bool {
        self.bits[chan as usize]
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = u16> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, &b)| b)
            .map(|(i, _)| i as u16)
    }

    /// A snapshot copy, mirroring `grabScanOffBoard`'s local copy of the
    /// live enable mask so the rest of the scan is insulated from
    /// concurrent control-FIFO edits mid-iteration.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }
}

/// Fixed sentinel used by the userland reader to resynchronize the sample
/// stream after loss.
pub const SAMPLE_MAGIC: u32 = 0xC0FF_EE01;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub channel: u16,
    pub scan_index: u64,
    pub volts: f64,
    pub spike: bool,
    pub spike_period_ms: f64,
    pub magic: u32,
}

impl Sample {
    pub fn new(channel: u16, scan_index: u64, volts: f64) -> Self {
        Sample {
            channel,
            scan_index,
            volts,
            spike: false,
            spike_period_ms: 0.0,
            magic: SAMPLE_MAGIC,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
}

/// Per-channel spike-detection configuration and RT-only running state.
/// See `detectSpikes` in `rt_process.c`.
#[derive(Clone, Copy, Debug)]
pub struct SpikeParams {
    pub enabled: bool,
    pub polarity: Polarity,
    pub blanking_ms: f64,
    pub threshold: f64,

    // RT-only state.
    pub in_spike: bool,
    pub last_spike_time_ns: u64,
    pub last_spike_ended_time_ns: u64,
    pub period_ms: f64,
    pub saved_polarity: Polarity,
    pub saved_threshold: f64,
}

impl Default for SpikeParams {
    fn default() -> Self {
        SpikeParams {
            enabled: false,
            polarity: Polarity::Positive,
            blanking_ms: 10.0,
            threshold: 0.0,
            in_spike: false,
            last_spike_time_ns: 0,
            last_spike_ended_time_ns: 0,
            period_ms: 0.0,
            saved_polarity: Polarity::Positive,
            saved_threshold: 0.0,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::AnalogInput => write!(f, "AI"),
            Namespace::AnalogOutput => write!(f, "AO"),
        }
    }
}
