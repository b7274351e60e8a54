//! Configuration knobs (§6), loaded from the process environment at
//! startup the way the original module read `insmod` parameters. A
//! present-but-unparsable variable is a startup error, not a silent
//! fallback to the default.

use std::env;

use crate::error::{Error, Result};

const DEFAULT_AI_SUBDEVICE: &str = "/dev/comedi0";
const DEFAULT_AO_SUBDEVICE: &str = "/dev/comedi0";
const DEFAULT_SAMPLING_RATE_HZ: u32 = 1000;
const DEFAULT_SETTLING_TIME_NS: u64 = 0;
const DEFAULT_FIFO_SECS: u32 = 5;

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub ai_subdevice: String,
    pub ao_subdevice: String,
    pub sampling_rate_hz: u32,
    pub settling_time_ns: u64,
    pub fifo_secs: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ai_subdevice: DEFAULT_AI_SUBDEVICE.to_string(),
            ao_subdevice: DEFAULT_AO_SUBDEVICE.to_string(),
            sampling_rate_hz: DEFAULT_SAMPLING_RATE_HZ,
            settling_time_ns: DEFAULT_SETTLING_TIME_NS,
            fifo_secs: DEFAULT_FIFO_SECS,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidArgument(format!("{} could not be parsed: {:?}", name, raw))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => {
            Err(Error::InvalidArgument(format!("{} is not valid unicode", name)))
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        if let Ok(v) = env::var("EPCORE_AI_SUBDEVICE") {
            cfg.ai_subdevice = v;
        }
        if let Ok(v) = env::var("EPCORE_AO_SUBDEVICE") {
            cfg.ao_subdevice = v;
        }
        if let Some(v) = parse_env::<u32>("EPCORE_SAMPLING_RATE_HZ")? {
            cfg.sampling_rate_hz = v;
        }
        if let Some(v) = parse_env::<u64>("EPCORE_SETTLING_TIME_NS")? {
            cfg.settling_time_ns = v;
        }
        if let Some(v) = parse_env::<u32>("EPCORE_FIFO_SECS")? {
            cfg.fifo_secs = v;
        }
        Ok(cfg)
    }

    /// Bytes the AI FIFO must accommodate, per §6:
    /// `fifo_secs * sampling_rate * n_ai_channels * sizeof(Sample)`.
    pub fn ai_fifo_capacity_samples(&self, n_ai_channels: usize) -> usize {
        self.fifo_secs as usize * self.sampling_rate_hz as usize * n_ai_channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.sampling_rate_hz, 1000);
        assert_eq!(cfg.settling_time_ns, 0);
        assert_eq!(cfg.fifo_secs, 5);
    }
}
