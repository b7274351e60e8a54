//! Acquisition Engine (C6): the periodic RT task. Each iteration
//! timestamps itself, drift-corrects, walks the callback registry (which
//! carries the three built-ins below plus anything the extension
//! pipeline registered), drains the control FIFO, and sleeps to the next
//! absolute deadline. Grounded in `rt_process.c`'s `daq_rt_task`,
//! `grabScanOffBoard`, `detectSpikes` and `putFullScanIntoAIFifo`.

use std::time::{Duration, Instant};

use log::warn;

use crate::aio::AioDriver;
use crate::control_fifo::{ControlFifoDispatcher, ControlRecord};
use crate::registry::CallbackRegistry;
use crate::rtos::{FifoConsumer, FifoProducer, RtosMiddleware};
use crate::shared_state::SharedState;
use crate::types::{Polarity, Sample};

/// Everything a registered callback needs: the driver, the shared state
/// facade, the AI FIFO producer, and the scan-local sample buffer that
/// `scan_channels`/`detect_spikes`/`enqueue_for_userland` pass data
/// through. Kept separate from [`AcquisitionEngine`] itself so the engine
/// can hand `&mut EngineState` to the registry while the registry is a
/// sibling field, not a self-borrow.
pub struct EngineState<D> {
    pub driver: D,
    pub shared: SharedState,
    pub ai_fifo: FifoProducer<Sample>,
    pub scan_samples: Vec<Sample>,
    pub acq_start_ns: u64,
    pub acq_end_ns: u64,
    pub settling_ns: u64,
    epoch: Instant,
}

impl<D: AioDriver> EngineState<D> {
    fn now_ns(&self) -> u64 {
        Instant::now().duration_since(self.epoch).as_nanos() as u64
    }
}

/// `scanChannels`: copies the live AI enable mask, reads every enabled
/// channel through the driver, and fills `scan_samples` in ascending
/// channel order (the enable mask iterator already yields indices in
/// order, matching §5's "ascending channel-id order" guarantee).
pub fn scan_channels<D: AioDriver>(state: &mut EngineState<D>) {
    let enabled = state.shared.ai_enabled().snapshot();
    state.scan_samples.clear();
    state.acq_start_ns = state.now_ns();
    let scan_index = state.shared.scan_index();
    for chan in enabled.enabled_channels() {
        let Some(chanspec) = state.shared.ai_chanspec(chan) else {
            continue;
        };
        match state.driver.read_delayed(chanspec, state.settling_ns) {
            Ok(raw) => {
                let volts = state.driver.raw_to_volts(chanspec, raw).unwrap_or(0.0);
                state.scan_samples.push(Sample::new(chan, scan_index, volts));
            }
            Err(e) => warn!("aio read failed on channel {}: {}", chan, e),
        }
    }
    state.acq_end_ns = state.now_ns();
}

/// `detectSpikes`: estimates each sample's acquisition time as a uniform
/// fraction of the scan's total acquisition window, rather than
/// timestamping every channel read individually, then runs the
/// per-channel spike state machine.
pub fn detect_spikes<D: AioDriver>(state: &mut EngineState<D>) {
    let n = state.scan_samples.len();
    if n == 0 {
        return;
    }
    let acq_start = state.acq_start_ns;
    let acq_end = state.acq_end_ns;
    let avg_chan_time = (acq_end.saturating_sub(acq_start)) / n as u64;

    for (i, sample) in state.scan_samples.iter_mut().enumerate() {
        let this_chan_time = acq_start + avg_chan_time * i as u64;
        let chan = sample.channel;
        let volts = sample.volts;
        let Some(sp) = state.shared.rt_spike_params_mut(chan) else {
            continue;
        };

        if sp.in_spike {
            let config_changed = sp.saved_polarity != sp.polarity || sp.saved_threshold != sp.threshold;
            let crossed_back = match sp.saved_polarity {
                Polarity::Positive => volts <= sp.saved_threshold,
                Polarity::Negative => volts >= sp.saved_threshold,
            };
            if config_changed || crossed_back {
                sp.last_spike_ended_time_ns = this_chan_time;
                sp.in_spike = false;
            }
            continue;
        }

        if !sp.enabled {
            continue;
        }
        let elapsed_ns = this_chan_time.saturating_sub(sp.last_spike_ended_time_ns);
        if (elapsed_ns as f64) < sp.blanking_ms * 1e6 {
            continue;
        }
        let crossed = match sp.polarity {
            Polarity::Positive => volts >= sp.threshold,
            Polarity::Negative => volts <= sp.threshold,
        };
        if crossed {
            let period_ms = this_chan_time.saturating_sub(sp.last_spike_time_ns) as f64 * 1e-6;
            sp.period_ms = period_ms;
            sp.last_spike_time_ns = this_chan_time;
            sp.in_spike = true;
            sp.saved_polarity = sp.polarity;
            sp.saved_threshold = sp.threshold;

            sample.spike = true;
            sample.spike_period_ms = period_ms;
        }
    }
}

/// `putFullScanIntoAIFifo`: writes every sample to the AI FIFO, stopping
/// at the first overrun (the producer failing its write).
pub fn enqueue_for_userland<D: AioDriver>(state: &mut EngineState<D>) {
    for sample in state.scan_samples.iter() {
        if state.ai_fifo.try_send(*sample).is_err() {
            warn!("ai fifo overrun: dropping rest of scan {}", sample.scan_index);
            break;
        }
    }
}

pub struct AcquisitionEngine<D, R> {
    pub state: EngineState<D>,
    pub registry: CallbackRegistry<EngineState<D>>,
    rtos: R,
    control_rx: FifoConsumer<ControlRecord>,
    reply_tx: FifoProducer<u8>,
    last_loop_start: Option<Instant>,
}

impl<D: AioDriver + 'static, R: RtosMiddleware> AcquisitionEngine<D, R> {
    pub fn new(
        driver: D,
        shared: SharedState,
        ai_fifo: FifoProducer<Sample>,
        control_rx: FifoConsumer<ControlRecord>,
        reply_tx: FifoProducer<u8>,
        settling_ns: u64,
        rtos: R,
    ) -> Self {
        let state = EngineState {
            driver,
            shared,
            ai_fifo,
            scan_samples: Vec::new(),
            acq_start_ns: 0,
            acq_end_ns: 0,
            settling_ns,
            epoch: Instant::now(),
        };
        let registry = CallbackRegistry::new();
        // Always-active built-ins, registered in the order the scan depends on.
        registry.register_builtin(0, scan_channels::<D>);
        registry.register_builtin(0, detect_spikes::<D>);
        registry.register_builtin(0, enqueue_for_userland::<D>);
        registry.mark_running();

        AcquisitionEngine {
            state,
            registry,
            rtos,
            control_rx,
            reply_tx,
            last_loop_start: None,
        }
    }

    /// Runs exactly one RT iteration, per `daq_rt_task`'s body.
    pub fn iterate(&mut self) {
        let loopstart = self.rtos.now();
        let scan_index = self.state.shared.scan_index();
        let nanos_per_scan = self.state.shared.nanos_per_scan();
        let period = Duration::from_nanos(nanos_per_scan);

        if scan_index > 1 {
            if let Some(last) = self.last_loop_start {
                let expected = last + period;
                let jitter = if loopstart > expected {
                    loopstart - expected
                } else {
                    expected - loopstart
                };
                self.state.shared.rt_set_jitter_if_larger(jitter.as_nanos() as u64);
            }
        }

        let deadline = loopstart + period;

        let elapsed_since_epoch = loopstart.duration_since(self.epoch());
        self.state
            .shared
            .rt_update_wall_clock(elapsed_since_epoch.as_nanos() as u64);

        if !self.registry.walk_if_uncontended(&mut self.state, scan_index, nanos_per_scan) {
            warn!("callback registry busy, skipping callbacks this scan");
        }

        ControlFifoDispatcher::drain(&mut self.state.shared, &self.control_rx, &self.reply_tx);

        self.state.shared.rt_increment_scan_index();
        self.last_loop_start = Some(loopstart);

        self.rtos.sleep_until_absolute(deadline);
    }

    fn epoch(&self) -> Instant {
        self.state.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::SimAioDriver;
    use crate::rtos::{fifo_channel, SimRtos};
    use crate::types::{AnalogReference, Chanspec, Namespace};

    fn engine_with(n_ai: usize) -> AcquisitionEngine<SimAioDriver, SimRtos> {
        let driver = SimAioDriver::with_uniform_range(n_ai.max(2));
        let shared = SharedState::new(n_ai, 2, 1000);
        let (ai_tx, _ai_rx) = fifo_channel(1024);
        let (_ctrl_tx, ctrl_rx) = fifo_channel(16);
        let (reply_tx, _reply_rx) = fifo_channel(16);
        AcquisitionEngine::new(driver, shared, ai_tx, ctrl_rx, reply_tx, 0, SimRtos)
    }

    #[test]
    fn scan_pushes_samples_in_ascending_channel_order() {
        let mut engine = engine_with(4);
        engine.state.shared.set_ai_enabled(0, true);
        engine.state.shared.set_ai_enabled(2, true);
        scan_channels(&mut engine.state);
        let chans: Vec<u16> = engine.state.scan_samples.iter().map(|s| s.channel).collect();
        assert_eq!(chans, vec![0, 2]);
    }

    #[test]
    fn single_channel_threshold_crossing_detected_as_spike() {
        let mut engine = engine_with(1);
        engine.state.shared.set_ai_enabled(0, true);
        engine
            .state
            .shared
            .rt_spike_params_mut(0)
            .unwrap()
            .enabled = true;
        engine.state.shared.rt_spike_params_mut(0).unwrap().threshold = 1.0;
        engine.state.shared.rt_spike_params_mut(0).unwrap().polarity = Polarity::Positive;

        let chanspec = Chanspec::new(Namespace::AnalogInput, 0, 0, AnalogReference::Ground);
        let raw = engine.state.driver.volts_to_raw(chanspec, 2.0).unwrap();
        engine.state.driver.set_raw(0, raw);

        scan_channels(&mut engine.state);
        detect_spikes(&mut engine.state);
        assert!(engine.state.scan_samples[0].spike);
    }

    #[test]
    fn registry_has_three_builtins_registered() {
        let engine = engine_with(2);
        assert_eq!(engine.registry.len(), 3);
    }
}
