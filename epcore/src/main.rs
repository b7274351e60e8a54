use epcore::aio::SimAioDriver;
use epcore::config::Config;
use epcore::control_fifo::{ControlCommand, ControlRecord};
use epcore::engine::AcquisitionEngine;
use epcore::rtos::{fifo_channel, SimRtos};
use epcore::shared_state::SharedState;

fn main() {
    env_logger::init();

    let cfg = Config::from_env().expect("invalid configuration");
    let n_ai_channels = 4;
    let n_ao_channels = 2;

    let driver = SimAioDriver::with_uniform_range(n_ai_channels.max(n_ao_channels));
    let shared = SharedState::new(n_ai_channels, n_ao_channels, cfg.sampling_rate_hz);

    let (ai_tx, ai_rx) = fifo_channel(cfg.ai_fifo_capacity_samples(n_ai_channels));
    let (ctrl_tx, ctrl_rx) = fifo_channel(64);
    let (reply_tx, reply_rx) = fifo_channel(64);

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

    for _ in 0..10 {
        engine.iterate();
    }

    while let Some(ack) = reply_rx.try_recv() {
        log::info!("control ack: {}", ack);
    }
    let mut n_samples = 0;
    while ai_rx.try_recv().is_some() {
        n_samples += 1;
    }
    println!(
        "ran {} scans, {} samples queued",
        engine.state.shared.scan_index(),
        n_samples
    );
}
