//! AIO Driver Facade (C3): enumerate subdevices/channels/ranges, read/write
//! one sample, and convert raw samples to/from volts using a cached krange
//! table. Grounded in `rt_process.c`'s `sampl_to_volts`/`volts_to_sampl`/
//! `rtlab_find_and_set_best_range`, and in the pattern `nidaqmx.rs` uses to
//! wrap a vendor driver behind a narrow, fallible Rust surface
//! (`daqmx_call`), generalized here into a trait so the driver itself stays
//! an opaque collaborator a real hardware backend can be swapped behind.

use crate::error::{Error, Result};
use crate::types::{Chanspec, Krange, Namespace, Unit};

/// Per-channel range table, built once at init and read-only thereafter.
#[derive(Clone, Debug, Default)]
pub struct KrangeCache {
    /// `ranges[namespace][channel]` is that channel's list of `Krange`s.
    ai_ranges: Vec<Vec<Krange>>,
    ao_ranges: Vec<Vec<Krange>>,
    ai_maxdata: Vec<u32>,
    ao_maxdata: Vec<u32>,
}

impl KrangeCache {
    pub fn new(ai_ranges: Vec<Vec<Krange>>, ai_maxdata: Vec<u32>, ao_ranges: Vec<Vec<Krange>>, ao_maxdata: Vec<u32>) -> Self {
        KrangeCache {
            ai_ranges,
            ao_ranges,
            ai_maxdata,
            ao_maxdata,
        }
    }

    fn table(&self, ns: Namespace) -> &[Vec<Krange>] {
        match ns {
            Namespace::AnalogInput => &self.ai_ranges,
            Namespace::AnalogOutput => &self.ao_ranges,
        }
    }

    fn maxdata(&self, ns: Namespace, chan: u16) -> Option<u32> {
        match ns {
            Namespace::AnalogInput => self.ai_maxdata.get(chan as usize).copied(),
            Namespace::AnalogOutput => self.ao_maxdata.get(chan as usize).copied(),
        }
    }

    pub fn krange(&self, ns: Namespace, chan: u16, range: u16) -> Option<Krange> {
        self.table(ns)
            .get(chan as usize)
            .and_then(|rs| rs.get(range as usize))
            .copied()
    }

    pub fn n_ranges(&self, ns: Namespace, chan: u16) -> usize {
        self.table(ns).get(chan as usize).map_or(0, |rs| rs.len())
    }

    pub fn n_channels(&self, ns: Namespace) -> usize {
        self.table(ns).len()
    }
}

/// Unit-aware factor applied per krange tick, per `sampl_to_volts`: 1e-6 V
/// baseline, times an additional 1e-3 when the range's unit is mA.
fn unit_factor(unit: Unit) -> f64 {
    match unit {
        Unit::Volt => 1e-6,
        Unit::MilliAmp => 1e-6 * 1e-3,
    }
}

/// `raw_to_volts`: linear conversion against the cached `(min, max,
/// maxdata)` for a channel/range.
pub fn raw_to_volts(krange: Krange, maxdata: u32, raw: u32) -> f64 {
    let factor = unit_factor(krange.unit);
    ((krange.max - krange.min) * (raw as f64 / maxdata as f64) + krange.min) * factor
}

/// `volts_to_raw`: inverse of `raw_to_volts`. Returns 0 when `min == max`
/// (degenerate range), matching the source's div-by-zero guard.
pub fn volts_to_raw(krange: Krange, maxdata: u32, volts: f64) -> u32 {
    if (krange.max - krange.min).abs() < f64::EPSILON {
        return 0;
    }
    let factor = unit_factor(krange.unit);
    let scaled = volts / factor;
    let frac = (scaled - krange.min) / (krange.max - krange.min);
    (frac * maxdata as f64).round().clamp(0.0, maxdata as f64) as u32
}

/// Scans all ranges for a channel and picks the tightest one whose
/// `(min, max)` brackets `desired_voltage` within `tolerance`.
pub fn find_best_range(
    cache: &KrangeCache,
    ns: Namespace,
    chan: u16,
    desired_voltage: f64,
) -> Result<u16> {
    const TOLERANCE: f64 = 1e-4;
    let n = cache.n_ranges(ns, chan);
    let mut best: Option<(u16, f64)> = None;
    for r in 0..n {
        let kr = cache.krange(ns, chan, r as u16).unwrap();
        if desired_voltage >= kr.min - TOLERANCE && desired_voltage <= kr.max + TOLERANCE {
            let span = kr.max - kr.min;
            if best.map_or(true, |(_, best_span)| span < best_span) {
                best = Some((r as u16, span));
            }
        }
    }
    best.map(|(r, _)| r).ok_or(Error::RangeNotFound)
}

/// Opaque collaborator: enumerate channels/ranges, read/write one sample.
/// The real implementation (NI-DAQmx, comedi, ...) lives outside this
/// crate; `SimAioDriver` below is a deterministic stand-in used by tests
/// and the demo binary.
pub trait AioDriver: Send {
    fn krange_cache(&self) -> &KrangeCache;

    /// Reads one sample for `chanspec`, waiting at most `settling_ns`
    /// before sampling (the driver must not sleep beyond that delay).
    fn read_delayed(&mut self, chanspec: Chanspec, settling_ns: u64) -> Result<u32>;

    fn write(&mut self, chanspec: Chanspec, raw: u32) -> Result<()>;

    fn volts_to_raw(&self, chanspec: Chanspec, volts: f64) -> Result<u32> {
        let kr = self
            .krange_cache()
            .krange(chanspec.namespace, chanspec.channel, chanspec.range)
            .ok_or(Error::RangeNotFound)?;
        let maxdata = self
            .krange_cache()
            .maxdata(chanspec.namespace, chanspec.channel)
            .ok_or(Error::RangeNotFound)?;
        Ok(volts_to_raw(kr, maxdata, volts))
    }

    fn raw_to_volts(&self, chanspec: Chanspec, raw: u32) -> Result<f64> {
        let kr = self
            .krange_cache()
            .krange(chanspec.namespace, chanspec.channel, chanspec.range)
            .ok_or(Error::RangeNotFound)?;
        let maxdata = self
            .krange_cache()
            .maxdata(chanspec.namespace, chanspec.channel)
            .ok_or(Error::RangeNotFound)?;
        Ok(raw_to_volts(kr, maxdata, raw))
    }

    fn find_and_set_best_range(&self, ns: Namespace, chan: u16, desired_voltage: f64) -> Result<u16> {
        find_best_range(self.krange_cache(), ns, chan, desired_voltage)
    }
}

/// Software-loopback driver: AO writes echo directly into the AI side for
/// the same channel index, scaled through the krange tables. Good enough
/// to drive the scan loop, the stimulator and the APD controller in tests
/// without real hardware.
pub struct SimAioDriver {
    cache: KrangeCache,
    loopback: Vec<u32>,
}

impl SimAioDriver {
    /// A single bipolar +-10V range on every channel, 16-bit unsigned
    /// maxdata, for both namespaces -- a common default NI/comedi board
    /// range.
    pub fn with_uniform_range(n_channels: usize) -> Self {
        let maxdata = u16::MAX as u32;
        let kr = Krange {
            min: -10.0,
            max: 10.0,
            unit: Unit::Volt,
        };
        let ranges: Vec<Vec<Krange>> = (0..n_channels).map(|_| vec![kr]).collect();
        SimAioDriver {
            cache: KrangeCache::new(
                ranges.clone(),
                vec![maxdata; n_channels],
                ranges,
                vec![maxdata; n_channels],
            ),
            loopback: vec![0; n_channels],
        }
    }

    pub fn set_raw(&mut self, chan: u16, raw: u32) {
        self.loopback[chan as usize] = raw;
    }
}

impl AioDriver for SimAioDriver {
    fn krange_cache(&self) -> &KrangeCache {
        &self.cache
    }

    fn read_delayed(&mut self, chanspec: Chanspec, _settling_ns: u64) -> Result<u32> {
        self.loopback
            .get(chanspec.channel as usize)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("channel {} out of range", chanspec.channel)))
    }

    fn write(&mut self, chanspec: Chanspec, raw: u32) -> Result<()> {
        let slot = self
            .loopback
            .get_mut(chanspec.channel as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("channel {} out of range", chanspec.channel)))?;
        *slot = raw;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kr() -> Krange {
        Krange {
            min: -10.0,
            max: 10.0,
            unit: Unit::Volt,
        }
    }

    #[test]
    fn raw_volts_round_trip() {
        let maxdata = u16::MAX as u32;
        let v = 3.3;
        let raw = volts_to_raw(kr(), maxdata, v);
        let back = raw_to_volts(kr(), maxdata, raw);
        assert!((back - v).abs() < 1e-3, "back={} v={}", back, v);
    }

    #[test]
    fn degenerate_range_volts_to_raw_is_zero() {
        let degenerate = Krange {
            min: 1.0,
            max: 1.0,
            unit: Unit::Volt,
        };
        assert_eq!(volts_to_raw(degenerate, 100, 5.0), 0);
    }

    #[test]
    fn find_best_range_picks_tightest_bracket() {
        let cache = KrangeCache::new(
            vec![vec![
                Krange { min: -10.0, max: 10.0, unit: Unit::Volt },
                Krange { min: -1.0, max: 1.0, unit: Unit::Volt },
            ]],
            vec![u16::MAX as u32],
            vec![],
            vec![],
        );
        let r = find_best_range(&cache, Namespace::AnalogInput, 0, 0.5).unwrap();
        assert_eq!(r, 1);
    }

    #[test]
    fn find_best_range_not_found() {
        let cache = KrangeCache::new(
            vec![vec![Krange { min: -1.0, max: 1.0, unit: Unit::Volt }]],
            vec![u16::MAX as u32],
            vec![],
            vec![],
        );
        assert_eq!(
            find_best_range(&cache, Namespace::AnalogInput, 0, 5.0),
            Err(Error::RangeNotFound)
        );
    }
}
