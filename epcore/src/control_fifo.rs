//! Control FIFO Dispatcher (C5): drains the control-command stream once
//! per RT iteration and mutates the Shared State Region (C4). Grounded in
//! `user_cmd.c`'s `do_user_commands`/`dispatch_command`/`check_basic_sanity`:
//! each record is bracketed by sentinels and carries the struct version;
//! malformed records are discarded, invalid channels are silently ignored
//! (the `CHKCHAN` macro's `break`), and every accepted command gets a
//! single acknowledgement byte on the reply FIFO.

use log::warn;

use crate::rtos::{FifoConsumer, FifoProducer};
use crate::shared_state::{SharedState, SHARED_STATE_VERSION};
use crate::types::{AnalogReference, Polarity};

pub const CONTROL_RECORD_BEGIN: u16 = 0xfade;
pub const CONTROL_RECORD_END: u16 = 0xedaf;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControlCommand {
    SetChannel { chan: u16, enabled: bool },
    SetChannelAll { enabled: bool },
    SetGain { chan: u16, range: u16 },
    SetGainAll { range: u16 },
    SetAref { chan: u16, aref: AnalogReference },
    SetArefAll { aref: AnalogReference },
    SetSpikeEnable { chan: u16, enabled: bool },
    SetSpikeEnableAll { enabled: bool },
    SetSpikePolarity { chan: u16, polarity: Polarity },
    SetSpikePolarityAll { polarity: Polarity },
    SetSpikeBlanking { chan: u16, blanking_ms: f64 },
    SetSpikeBlankingAll { blanking_ms: f64 },
    SetSpikeThreshold { chan: u16, threshold: f64 },
    SetSpikeThresholdAll { threshold: f64 },
    SetAttachedPid { pid: Option<u32> },
    SetSamplingRate { hz: u32 },
    /// Documented dangerous: overwrites the scan index directly.
    SetScanIndex { scan_index: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlRecord {
    pub begin: u16,
    pub version: u16,
    pub cmd: ControlCommand,
    pub end: u16,
}

impl ControlRecord {
    pub fn new(cmd: ControlCommand) -> Self {
        ControlRecord {
            begin: CONTROL_RECORD_BEGIN,
            version: SHARED_STATE_VERSION,
            cmd,
            end: CONTROL_RECORD_END,
        }
    }

    fn is_sane(&self) -> bool {
        self.begin == CONTROL_RECORD_BEGIN
            && self.end == CONTROL_RECORD_END
            && self.version == SHARED_STATE_VERSION
    }
}

pub struct ControlFifoDispatcher;

impl ControlFifoDispatcher {
    /// Drains every pending record this iteration, applying each to
    /// `shared` and acknowledging on `reply`. Returns the number of
    /// commands accepted.
    pub fn drain(
        shared: &mut SharedState,
        consumer: &FifoConsumer<ControlRecord>,
        reply: &FifoProducer<u8>,
    ) -> usize {
        let mut accepted = 0;
        while let Some(record) = consumer.try_recv() {
            if !record.is_sane() {
                warn!("control fifo: malformed record discarded: {:?}", record);
                continue;
            }
            if !Self::apply(shared, record.cmd) {
                // invalid channel: silently ignored per spec, no ack.
                continue;
            }
            accepted += 1;
            let _ = reply.try_send(1u8);
        }
        accepted
    }

    /// Returns `false` (no-op, no ack) when a channel argument is out of
    /// range, mirroring the `CHKCHAN` macro.
    fn apply(shared: &mut SharedState, cmd: ControlCommand) -> bool {
        use ControlCommand::*;
        match cmd {
            SetChannel { chan, enabled } => {
                if chan as usize >= shared.n_ai_channels() {
                    return false;
                }
                shared.set_ai_enabled(chan, enabled);
            }
            SetChannelAll { enabled } => shared.set_ai_enabled_all(enabled),
            SetGain { chan, range } => {
                if chan as usize >= shared.n_ai_channels() {
                    return false;
                }
                shared.set_ai_range(chan, range);
            }
            SetGainAll { range } => {
                for c in 0..shared.n_ai_channels() as u16 {
                    shared.set_ai_range(c, range);
                }
            }
            SetAref { chan, aref } => {
                if chan as usize >= shared.n_ai_channels() {
                    return false;
                }
                shared.set_ai_aref(chan, aref);
            }
            SetArefAll { aref } => shared.set_ai_aref_all(aref),
            SetSpikeEnable { chan, enabled } => {
                if chan as usize >= shared.n_ai_channels() {
                    return false;
                }
                shared.set_spike_enable(chan, enabled);
            }
            SetSpikeEnableAll { enabled } => shared.set_spike_enable_all(enabled),
            SetSpikePolarity { chan, polarity } => {
                if chan as usize >= shared.n_ai_channels() {
                    return false;
                }
                shared.set_spike_polarity(chan, polarity);
            }
            SetSpikePolarityAll { polarity } => shared.set_spike_polarity_all(polarity),
            SetSpikeBlanking { chan, blanking_ms } => {
                if chan as usize >= shared.n_ai_channels() {
                    return false;
                }
                shared.set_spike_blanking(chan, blanking_ms);
            }
            SetSpikeBlankingAll { blanking_ms } => shared.set_spike_blanking_all(blanking_ms),
            SetSpikeThreshold { chan, threshold } => {
                if chan as usize >= shared.n_ai_channels() {
                    return false;
                }
                shared.set_spike_threshold(chan, threshold);
            }
            SetSpikeThresholdAll { threshold } => shared.set_spike_threshold_all(threshold),
            SetAttachedPid { pid } => shared.set_attached_pid(pid),
            SetSamplingRate { hz } => {
                shared.set_sampling_rate(hz);
            }
            SetScanIndex { scan_index } => {
                warn!("control fifo: SET_SCAN_INDEX is dangerous, applying anyway");
                shared.set_scan_index_dangerous(scan_index);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtos::fifo_channel;

    #[test]
    fn round_trip_spike_enable_and_threshold() {
        let mut shared = SharedState::new(8, 2, 1000);
        let (tx, rx) = fifo_channel::<ControlRecord>(8);
        let (reply_tx, reply_rx) = fifo_channel::<u8>(8);

        tx.try_send(ControlRecord::new(ControlCommand::SetSpikeEnable { chan: 3, enabled: true }))
            .unwrap();
        tx.try_send(ControlRecord::new(ControlCommand::SetSpikeThreshold {
            chan: 3,
            threshold: 0.25,
        }))
        .unwrap();

        let n = ControlFifoDispatcher::drain(&mut shared, &rx, &reply_tx);
        assert_eq!(n, 2);
        assert_eq!(reply_rx.try_recv(), Some(1));
        assert_eq!(reply_rx.try_recv(), Some(1));

        let sp = shared.spike_params(3).unwrap();
        assert!(sp.enabled);
        assert_eq!(sp.threshold, 0.25);
    }

    #[test]
    fn invalid_channel_is_silently_ignored() {
        let mut shared = SharedState::new(4, 2, 1000);
        let (tx, rx) = fifo_channel::<ControlRecord>(8);
        let (reply_tx, reply_rx) = fifo_channel::<u8>(8);

        tx.try_send(ControlRecord::new(ControlCommand::SetSpikeEnable { chan: 99, enabled: true }))
            .unwrap();
        let n = ControlFifoDispatcher::drain(&mut shared, &rx, &reply_tx);
        assert_eq!(n, 0);
        assert_eq!(reply_rx.try_recv(), None);
    }

    #[test]
    fn malformed_record_is_discarded() {
        let mut shared = SharedState::new(4, 2, 1000);
        let (tx, rx) = fifo_channel::<ControlRecord>(8);
        let (reply_tx, _reply_rx) = fifo_channel::<u8>(8);

        let mut bad = ControlRecord::new(ControlCommand::SetSamplingRate { hz: 2000 });
        bad.version = 99;
        tx.try_send(bad).unwrap();
        assert_eq!(ControlFifoDispatcher::drain(&mut shared, &rx, &reply_tx), 0);
    }
}
