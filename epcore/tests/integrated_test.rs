use epcore::aio::SimAioDriver;
use epcore::control_fifo::{ControlCommand, ControlFifoDispatcher, ControlRecord};
use epcore::engine::{detect_spikes, scan_channels, AcquisitionEngine};
use epcore::rtos::{fifo_channel, FifoConsumer, FifoProducer, SimRtos};
use epcore::shared_state::SharedState;
use epcore::types::{AnalogReference, Chanspec, Namespace, Polarity};

fn build_engine(
    n_ai: usize,
) -> (
    AcquisitionEngine<SimAioDriver, SimRtos>,
    FifoProducer<ControlRecord>,
    FifoConsumer<u8>,
) {
    let driver = SimAioDriver::with_uniform_range(n_ai.max(2));
    let shared = SharedState::new(n_ai, 2, 1000);
    let (ai_tx, _ai_rx) = fifo_channel(4096);
    let (ctrl_tx, ctrl_rx) = fifo_channel(16);
    let (reply_tx, reply_rx) = fifo_channel(16);
    let engine = AcquisitionEngine::new(driver, shared, ai_tx, ctrl_rx, reply_tx, 0, SimRtos);
    (engine, ctrl_tx, reply_rx)
}

/// Scenario 1 of the testable properties: a channel configured with
/// polarity=positive, threshold=1.0V should spike exactly once per drive
/// above threshold.
#[test]
fn single_channel_spike_detection() {
    let (mut engine, ctrl_tx, _reply_rx) = build_engine(1);

    ctrl_tx
        .try_send(ControlRecord::new(ControlCommand::SetChannel { chan: 0, enabled: true }))
        .unwrap();
    ctrl_tx
        .try_send(ControlRecord::new(ControlCommand::SetSpikeEnable { chan: 0, enabled: true }))
        .unwrap();
    ctrl_tx
        .try_send(ControlRecord::new(ControlCommand::SetSpikePolarity {
            chan: 0,
            polarity: Polarity::Positive,
        }))
        .unwrap();
    ctrl_tx
        .try_send(ControlRecord::new(ControlCommand::SetSpikeThreshold { chan: 0, threshold: 1.0 }))
        .unwrap();
    ctrl_tx
        .try_send(ControlRecord::new(ControlCommand::SetSpikeBlanking {
            chan: 0,
            blanking_ms: 10.0,
        }))
        .unwrap();
    engine.iterate();

    let chanspec = Chanspec::new(Namespace::AnalogInput, 0, 0, AnalogReference::Ground);

    // Below threshold: no spike.
    let low_raw = engine.state.driver.volts_to_raw(chanspec, 0.2).unwrap();
    engine.state.driver.set_raw(0, low_raw);
    scan_channels(&mut engine.state);
    detect_spikes(&mut engine.state);
    assert!(!engine.state.scan_samples[0].spike);

    // Above threshold: spike.
    let high_raw = engine.state.driver.volts_to_raw(chanspec, 2.0).unwrap();
    engine.state.driver.set_raw(0, high_raw);
    scan_channels(&mut engine.state);
    detect_spikes(&mut engine.state);
    assert!(engine.state.scan_samples[0].spike);

    // Still above threshold, but now in-spike: must not re-trigger.
    scan_channels(&mut engine.state);
    detect_spikes(&mut engine.state);
    assert!(!engine.state.scan_samples[0].spike);

    // Back below threshold: exits spike state.
    engine.state.driver.set_raw(0, low_raw);
    scan_channels(&mut engine.state);
    detect_spikes(&mut engine.state);
    assert!(!engine.state.scan_samples[0].spike);
    assert!(!engine.state.shared.spike_params(0).unwrap().in_spike);
}

/// Scenario 2: control-FIFO round-trip acknowledges two commands and both
/// land in shared state within one scan.
#[test]
fn control_fifo_round_trip_acks_and_applies() {
    let mut shared = SharedState::new(8, 2, 1000);
    let (tx, rx) = fifo_channel(8);
    let (reply_tx, reply_rx) = fifo_channel(8);

    tx.try_send(ControlRecord::new(ControlCommand::SetSpikeEnable { chan: 3, enabled: true }))
        .unwrap();
    tx.try_send(ControlRecord::new(ControlCommand::SetSpikeThreshold {
        chan: 3,
        threshold: 0.25,
    }))
    .unwrap();

    let accepted = ControlFifoDispatcher::drain(&mut shared, &rx, &reply_tx);
    assert_eq!(accepted, 2);
    assert_eq!(reply_rx.try_recv(), Some(1));
    assert_eq!(reply_rx.try_recv(), Some(1));
    assert_eq!(reply_rx.try_recv(), None);

    let sp = shared.spike_params(3).unwrap();
    assert!(sp.enabled);
    assert_eq!(sp.threshold, 0.25);
}

/// Scenario 5: a sampling-rate change from 1000Hz to 1733Hz normalizes to
/// 2000Hz with nanos_per_scan = 500_000.
#[test]
fn sampling_rate_change_normalizes_and_recomputes_period() {
    let mut shared = SharedState::new(4, 2, 1000);
    let (tx, rx) = fifo_channel(4);
    let (reply_tx, _reply_rx) = fifo_channel(4);

    tx.try_send(ControlRecord::new(ControlCommand::SetSamplingRate { hz: 1733 }))
        .unwrap();
    ControlFifoDispatcher::drain(&mut shared, &rx, &reply_tx);

    assert_eq!(shared.sampling_rate_hz(), 2000);
    assert_eq!(shared.nanos_per_scan(), 500_000);
}
