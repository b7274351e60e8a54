use epcore::aio::SimAioDriver;
use epcore::config::Config;
use epcore::control_fifo::{ControlCommand, ControlRecord};
use epcore::engine::AcquisitionEngine;
use epcore::rtos::{fifo_channel, SimRtos};
use epcore::shared_state::SharedState;
use epcore::types::{AnalogReference, Chanspec, Namespace};

use epcore_control::apd::{ApdController, AoChannelConfig};
use epcore_control::stimulator::{StimParams, Stimulator};

fn ao_chanspec(chan: u16) -> Chanspec {
    Chanspec::new(Namespace::AnalogOutput, chan, 0, AnalogReference::Ground)
}

fn main() {
    env_logger::init();

    let cfg = Config::from_env().expect("invalid configuration");
    let n_ai_channels = 2;
    let n_ao_channels = 2;

    let driver = SimAioDriver::with_uniform_range(n_ai_channels.max(n_ao_channels));
    let shared = SharedState::new(n_ai_channels, n_ao_channels, cfg.sampling_rate_hz);

    let (ai_tx, ai_rx) = fifo_channel(cfg.ai_fifo_capacity_samples(n_ai_channels));
    let (ctrl_tx, ctrl_rx) = fifo_channel(64);
    let (reply_tx, reply_rx) = fifo_channel(64);
    let (apd_tx, apd_rx) = fifo_channel(64);

    let mut engine = AcquisitionEngine::new(
        driver,
        shared,
        ai_tx,
        ctrl_rx,
        reply_tx,
        cfg.settling_time_ns,
        SimRtos,
    );

    ctrl_tx
        .try_send(ControlRecord::new(ControlCommand::SetChannelAll { enabled: true }))
        .ok();

    let mut ao_configs = vec![AoChannelConfig::new(ao_chanspec(0))];
    ao_configs[0].dependent_ai_chan = Some(0);
    ao_configs[0].pacing_on = true;
    ao_configs[0].control_on = true;

    let mut apd = ApdController::new(cfg.sampling_rate_hz, n_ai_channels, ao_configs, apd_tx)
        .expect("sampling rate below the APD controller's 1kHz floor");
    apd.set_apd_xx(0.1);

    engine
        .registry
        .register(0, move |state| apd.step(state))
        .expect("registry is running after AcquisitionEngine::new");

    let mut stim = Stimulator::new(ao_chanspec(1), 16);
    stim.stimulate(
        &engine.state.driver,
        StimParams {
            on_voltage: 5.0,
            off_voltage: 0.0,
            when_ms: 0,
            duration_ms: 1,
            spacing_ms: 4,
            end_silence_ms: 0,
            num_per_train: 3,
            num_trains: -1,
        },
        engine.state.shared.scan_index(),
        engine.state.shared.nanos_per_scan(),
    )
    .expect("stimulator setup");

    for _ in 0..50 {
        let scan_index = engine.state.shared.scan_index();
        let nanos_per_scan = engine.state.shared.nanos_per_scan();
        stim.iterate(&mut engine.state.driver, scan_index, nanos_per_scan);
        engine.iterate();
    }

    while let Some(ack) = reply_rx.try_recv() {
        log::info!("control ack: {}", ack);
    }
    let mut n_samples = 0;
    while ai_rx.try_recv().is_some() {
        n_samples += 1;
    }
    let mut n_apds = 0;
    while apd_rx.try_recv().is_some() {
        n_apds += 1;
    }
    println!(
        "ran {} scans, {} samples queued, {} APDs finalized",
        engine.state.shared.scan_index(),
        n_samples,
        n_apds
    );
}
