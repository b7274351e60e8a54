//! APD Detector & Controller (C10): per-AI-channel action-potential-
//! duration detection and a per-AO-channel proportional pacing-interval
//! controller with automatic gain adaptation. Grounded in
//! `apd_control.c`'s `do_apd_control_stuff`/`do_pacing`/
//! `calculate_apd_and_control_perturbation`/`do_control`/
//! `automatically_adapt_g`/`out_to_fifo`.
//!
//! The original's peak-search loop (`while (find_peak && find_peak<25)`)
//! is a zero-delay `while` that, read literally, would run to completion
//! within the single scan that sets `find_peak`, collapsing the 25 ms
//! search window onto one sample. Since `do_apd_control_stuff` runs once
//! per scan from the RT loop, the only reading consistent with an
//! actual 25 ms window is a single increment per invocation; this is
//! implemented here as a per-scan `if`, spreading the search across 25
//! successive scans the way the surrounding prose ("ms after threshold")
//! describes.

use epcore::aio::AioDriver;
use epcore::engine::EngineState;
use epcore::error::{Error, Result};
use epcore::rtos::FifoProducer;
use epcore::types::{
    Chanspec, APD_PEAK_SEARCH_WINDOW_MS, MC_DELTA_G_MAX, MC_DELTA_G_MIN, REQUIRED_APD_SAMPLING_RATE_HZ,
    STIM_PULSE_WIDTH_MS,
};

const RESET_V_BASELINE: f64 = 999.0;
const RESET_V_APA: f64 = -999.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GAdjustmentMode {
    Manual,
    Automatic,
}

/// Running state for one AI channel's action-potential detector. See
/// `struct APDState` in `apd_control.c`.
#[derive(Clone, Copy, Debug)]
struct ApdState {
    find_peak: u32,
    v_baseline_since_last_thresh: f64,
    v_baseline_n_minus_1: f64,
    v_baseline_n_minus_2: f64,
    v_apa: f64,
    v_xx: f64,
    ap_ti: u64,
    ap_tf: u64,
    apd: i64,
    previous_apd: i64,
    di: i64,
    previous_di: i64,
}

impl Default for ApdState {
    fn default() -> Self {
        ApdState {
            find_peak: 0,
            v_baseline_since_last_thresh: RESET_V_BASELINE,
            v_baseline_n_minus_1: RESET_V_BASELINE,
            v_baseline_n_minus_2: RESET_V_BASELINE,
            v_apa: RESET_V_APA,
            v_xx: 0.0,
            ap_ti: 0,
            ap_tf: 0,
            apd: 0,
            previous_apd: 0,
            di: 0,
            previous_di: 0,
        }
    }
}

/// Running state for one AO channel's pacing/control stimulus. See
/// `struct StimState` in `apd_control.c`.
#[derive(Clone, Copy, Debug)]
struct StimState {
    pacing_pulse_width_counter: i64,
    pacing_interval_counter: i64,
    control_stimulus_called: bool,
    control_interval_counter: i64,
    control_pulse_width_counter: i64,
    delta_pi: i64,
    consec_alternating: u32,
    previous_perturbation_signs: [u8; 4],
}

impl Default for StimState {
    fn default() -> Self {
        StimState {
            pacing_pulse_width_counter: 0,
            pacing_interval_counter: 0,
            control_stimulus_called: false,
            control_interval_counter: 0,
            control_pulse_width_counter: -1,
            delta_pi: 0,
            consec_alternating: 0,
            previous_perturbation_signs: [1, 0, 1, 0],
        }
    }
}

/// Per-AO-channel configuration, user-settable via the non-RT side.
#[derive(Clone, Copy, Debug)]
pub struct AoChannelConfig {
    pub chanspec: Chanspec,
    pub on_voltage: f64,
    pub off_voltage: f64,
    pub nominal_pi: i64,
    pub pacing_on: bool,
    pub control_on: bool,
    pub continue_underlying: bool,
    pub only_negative_perturbations: bool,
    pub target_shorter: bool,
    pub g_adjustment_mode: GAdjustmentMode,
    pub g_val: f64,
    pub delta_g: f64,
    /// The AI channel whose finalized APDs drive this AO channel's
    /// control perturbation, or `None` ("-1" in the original).
    pub dependent_ai_chan: Option<u16>,
}

impl AoChannelConfig {
    pub fn new(chanspec: Chanspec) -> Self {
        AoChannelConfig {
            chanspec,
            on_voltage: 5.0,
            off_voltage: 0.0,
            nominal_pi: 500,
            pacing_on: false,
            control_on: false,
            continue_underlying: false,
            only_negative_perturbations: true,
            target_shorter: false,
            g_adjustment_mode: GAdjustmentMode::Manual,
            g_val: 0.5,
            delta_g: 0.01,
            dependent_ai_chan: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ApdAoSnapshot {
    pub ao_chan: u16,
    pub nominal_pi: i64,
    pub pi: i64,
    pub delta_pi: i64,
    pub control_on: bool,
    pub only_negative_perturbations: bool,
    pub pacing_on: bool,
    pub continue_underlying: bool,
    pub target_shorter: bool,
    pub consec_alternating: u32,
    pub delta_g: f64,
    pub g_val: f64,
}

/// One finalized-AP record, written to the APD FIFO. See `out_to_fifo`.
#[derive(Clone, Copy, Debug)]
pub struct ApdSnapshot {
    pub apd_channel: u16,
    pub scan_index: u64,
    pub apd_xx_percent: i32,
    pub v_apa: f64,
    pub v_baseline: f64,
    pub ap_ti: u64,
    pub ap_tf: u64,
    pub apd: i64,
    pub di: i64,
    pub link_to_ao0: bool,
    pub ao0_ao1_cond_time_ms: i64,
    pub ao: Option<ApdAoSnapshot>,
}

/// Invoked from the callback registry at 1 kHz, per §4.9. Owns per-AI-
/// channel detector state, per-AO-channel pacing/control state, and the
/// shared controller parameters (`apd_xx`, AO1-to-AO0 linking).
pub struct ApdController {
    apd_xx: f64,
    link_ao1_to_ao0: bool,
    ao0_ao1_cond_time_ms: i64,
    ai_states: Vec<ApdState>,
    ao_configs: Vec<AoChannelConfig>,
    ao_states: Vec<StimState>,
    snapshot_tx: FifoProducer<ApdSnapshot>,
}

impl ApdController {
    /// Fails `RateTooLow` if `sampling_rate_hz` is below the 1 kHz this
    /// controller's ms-granularity counters assume, matching
    /// `apd_control_init`'s own startup check.
    pub fn new(
        sampling_rate_hz: u32,
        n_ai_channels: usize,
        ao_configs: Vec<AoChannelConfig>,
        snapshot_tx: FifoProducer<ApdSnapshot>,
    ) -> Result<Self> {
        if sampling_rate_hz < REQUIRED_APD_SAMPLING_RATE_HZ {
            return Err(Error::RateTooLow);
        }
        let n_ao = ao_configs.len();
        Ok(ApdController {
            apd_xx: 0.1, // APD90 by default, matching INIT_APD_XX=90.
            link_ao1_to_ao0: false,
            ao0_ao1_cond_time_ms: 5,
            ai_states: vec![ApdState::default(); n_ai_channels],
            ao_configs,
            ao_states: vec![StimState::default(); n_ao],
            snapshot_tx,
        })
    }

    pub fn set_apd_xx(&mut self, fraction: f64) {
        self.apd_xx = fraction.clamp(0.0, 1.0);
    }

    pub fn set_link_ao1_to_ao0(&mut self, link: bool, cond_time_ms: i64) {
        self.link_ao1_to_ao0 = link;
        self.ao0_ao1_cond_time_ms = cond_time_ms;
    }

    pub fn ao_config_mut(&mut self, ao_idx: usize) -> Option<&mut AoChannelConfig> {
        self.ao_configs.get_mut(ao_idx)
    }

    pub fn g_val(&self, ao_idx: usize) -> Option<f64> {
        self.ao_configs.get(ao_idx).map(|c| c.g_val)
    }

    pub fn consec_alternating(&self, ao_idx: usize) -> Option<u32> {
        self.ao_states.get(ao_idx).map(|s| s.consec_alternating)
    }

    /// `do_apd_control_stuff`: the per-scan entry point, registered into
    /// the acquisition engine's callback registry.
    pub fn step<D: AioDriver>(&mut self, state: &mut EngineState<D>) {
        let scan_index = state.shared.scan_index();

        for cfg in &mut self.ao_configs {
            cfg.delta_g = cfg.delta_g.clamp(MC_DELTA_G_MIN, MC_DELTA_G_MAX);
        }

        for ao_idx in 0..self.ao_configs.len() {
            self.do_pacing(ao_idx, &mut state.driver);
        }

        for sample in &state.scan_samples {
            let idx = sample.channel as usize;
            if idx >= self.ai_states.len() {
                continue;
            }
            if self.calculate_apd(idx, sample.volts, sample.spike, scan_index) {
                let dependent_ao = self
                    .ao_configs
                    .iter()
                    .position(|c| c.dependent_ai_chan == Some(sample.channel));
                if let Some(ao_idx) = dependent_ao {
                    if self.ao_configs[ao_idx].control_on {
                        self.do_control_perturbation(ao_idx, idx);
                    }
                }
                self.emit_snapshot(idx, dependent_ao, scan_index);
            }
        }

        for ao_idx in 0..self.ao_configs.len() {
            if self.ao_states[ao_idx].control_stimulus_called {
                self.do_control(ao_idx, &mut state.driver);
            }
        }
    }

    /// `do_pacing`: periodic pacing independent of APD control.
    fn do_pacing<D: AioDriver>(&mut self, ao_idx: usize, driver: &mut D) {
        let cfg = self.ao_configs[ao_idx];
        let ss = &mut self.ao_states[ao_idx];

        if ss.pacing_interval_counter == 0 && cfg.pacing_on {
            if let Ok(raw) = driver.volts_to_raw(cfg.chanspec, cfg.on_voltage) {
                let _ = driver.write(cfg.chanspec, raw);
            }
            ss.pacing_interval_counter = cfg.nominal_pi;
            ss.pacing_pulse_width_counter = STIM_PULSE_WIDTH_MS as i64;
        }
        if ss.pacing_pulse_width_counter == 0 {
            if let Ok(raw) = driver.volts_to_raw(cfg.chanspec, cfg.off_voltage) {
                let _ = driver.write(cfg.chanspec, raw);
            }
        }
        if ss.pacing_interval_counter > 0 {
            ss.pacing_interval_counter -= 1;
        }
        if ss.pacing_pulse_width_counter > 0 {
            ss.pacing_pulse_width_counter -= 1;
        }
    }

    /// `calculate_apd_and_control_perturbation`'s detection half. Returns
    /// `true` exactly on the scan an action potential finalizes.
    fn calculate_apd(&mut self, idx: usize, voltage: f64, spiked: bool, scan_index: u64) -> bool {
        let apd_xx = self.apd_xx;
        let apd = &mut self.ai_states[idx];

        if voltage < apd.v_baseline_since_last_thresh {
            apd.v_baseline_since_last_thresh = voltage;
        }

        if spiked {
            apd.find_peak = 1;
            apd.ap_ti = scan_index;
            apd.v_baseline_n_minus_2 = apd.v_baseline_n_minus_1;
            apd.v_baseline_n_minus_1 = apd.v_baseline_since_last_thresh;
            apd.v_baseline_since_last_thresh = RESET_V_BASELINE;
            apd.v_apa = RESET_V_APA;
        }

        if apd.find_peak >= 1 && apd.find_peak < APD_PEAK_SEARCH_WINDOW_MS {
            if voltage > apd.v_apa {
                apd.v_apa = voltage;
            }
            apd.find_peak += 1;
            if apd.find_peak == APD_PEAK_SEARCH_WINDOW_MS {
                // Open question, preserved as canonical: use the larger
                // of the two previous baselines, not the more recent one.
                let baseline = apd.v_baseline_n_minus_1.max(apd.v_baseline_n_minus_2);
                apd.v_xx = apd_xx * (apd.v_apa - baseline) + baseline;
            }
        }

        if apd.find_peak == APD_PEAK_SEARCH_WINDOW_MS && voltage < apd.v_xx {
            apd.find_peak = 0;
            apd.previous_apd = apd.apd;
            apd.previous_di = apd.di;
            apd.di = apd.ap_ti as i64 - apd.ap_tf as i64;
            apd.ap_tf = scan_index;
            apd.apd = apd.ap_tf as i64 - apd.ap_ti as i64;
            return true;
        }
        false
    }

    /// `calculate_apd_and_control_perturbation`'s control half: runs only
    /// when the finalizing channel drives an AO channel with control on.
    fn do_control_perturbation(&mut self, ao_idx: usize, ai_idx: usize) {
        let (previous_apd, apd) = {
            let a = &self.ai_states[ai_idx];
            (a.previous_apd, a.apd)
        };

        {
            let ss = &mut self.ao_states[ao_idx];
            ss.previous_perturbation_signs[0] = ss.previous_perturbation_signs[1];
            ss.previous_perturbation_signs[1] = ss.previous_perturbation_signs[2];
            ss.previous_perturbation_signs[2] = ss.previous_perturbation_signs[3];
        }

        let g_val = self.ao_configs[ao_idx].g_val;
        let delta_pi = -((g_val * (previous_apd - apd) as f64).round() as i64);
        self.ao_states[ao_idx].delta_pi = delta_pi;

        // Open question, preserved as canonical: gating checks only the
        // `only_negative_perturbations` flag, not `target_shorter`.
        let only_negative = self.ao_configs[ao_idx].only_negative_perturbations;
        let arm = !only_negative || delta_pi <= -1;

        if arm {
            let pacing_ctr = self.ao_states[ao_idx].pacing_interval_counter;
            self.ao_states[ao_idx].control_stimulus_called = true;
            self.ao_states[ao_idx].control_interval_counter = pacing_ctr + delta_pi;

            if ao_idx == 1 && self.link_ao1_to_ao0 && self.ao_configs.len() > 1 {
                let cond = self.ao0_ao1_cond_time_ms;
                let mut dp1 = self.ao_states[1].delta_pi;
                if dp1 > cond {
                    dp1 = cond - 1;
                }
                if dp1 < -cond {
                    dp1 = 1 - cond;
                }
                self.ao_states[1].delta_pi = dp1;
                let pi0 = self.ao_states[0].pacing_interval_counter;
                let dp0 = self.ao_states[0].delta_pi;
                self.ao_states[1].control_interval_counter = pi0 + dp0 + dp1;
            }

            if delta_pi >= 1 && !self.ao_configs[ao_idx].continue_underlying {
                let ctrl_ctr = self.ao_states[ao_idx].control_interval_counter;
                self.ao_states[ao_idx].pacing_interval_counter = ctrl_ctr + 1;
            }
            self.ao_states[ao_idx].previous_perturbation_signs[3] = 0;
        } else {
            self.ao_states[ao_idx].previous_perturbation_signs[3] = 1;
        }

        if self.ao_configs[ao_idx].g_adjustment_mode == GAdjustmentMode::Automatic {
            self.adapt_g(ao_idx);
        }
    }

    /// `automatically_adapt_g`: decrease `g` unless the last four
    /// perturbation signs alternated perfectly, in which case increase.
    fn adapt_g(&mut self, ao_idx: usize) {
        let signs = self.ao_states[ao_idx].previous_perturbation_signs;
        let perfectly_alternating = signs[3] != signs[2] && signs[2] != signs[1] && signs[1] != signs[0];
        let delta_g = self.ao_configs[ao_idx].delta_g;

        if perfectly_alternating {
            self.ao_configs[ao_idx].g_val += delta_g;
            self.ao_states[ao_idx].consec_alternating = 4;
        } else {
            self.ao_configs[ao_idx].g_val = (self.ao_configs[ao_idx].g_val - delta_g).max(0.0);
            self.ao_states[ao_idx].consec_alternating = 0;
        }
    }

    /// `do_control`: emits (or retires) the control stimulus armed by
    /// [`Self::do_control_perturbation`].
    fn do_control<D: AioDriver>(&mut self, ao_idx: usize, driver: &mut D) {
        let cfg = self.ao_configs[ao_idx];
        let ss = &mut self.ao_states[ao_idx];

        if ss.control_interval_counter == 0 {
            if let Ok(raw) = driver.volts_to_raw(cfg.chanspec, cfg.on_voltage) {
                let _ = driver.write(cfg.chanspec, raw);
            }
            ss.control_pulse_width_counter = STIM_PULSE_WIDTH_MS as i64;
            if !cfg.continue_underlying {
                ss.pacing_interval_counter = cfg.nominal_pi;
            }
        }
        if ss.control_pulse_width_counter == 0 {
            if let Ok(raw) = driver.volts_to_raw(cfg.chanspec, cfg.off_voltage) {
                let _ = driver.write(cfg.chanspec, raw);
            }
            ss.control_stimulus_called = false;
        }
        if ss.control_interval_counter >= 0 {
            ss.control_interval_counter -= 1;
        }
        if ss.control_pulse_width_counter >= 0 {
            ss.control_pulse_width_counter -= 1;
        }
    }

    /// `out_to_fifo`: pushes a snapshot for every finalized AP, whether
    /// or not it drives an AO channel.
    fn emit_snapshot(&mut self, ai_idx: usize, ao_idx: Option<usize>, scan_index: u64) {
        let apd = self.ai_states[ai_idx];
        let ao = ao_idx.map(|ao_idx| {
            let cfg = self.ao_configs[ao_idx];
            let ss = self.ao_states[ao_idx];
            ApdAoSnapshot {
                ao_chan: ao_idx as u16,
                nominal_pi: cfg.nominal_pi,
                pi: apd.previous_apd + apd.di,
                delta_pi: ss.delta_pi,
                control_on: cfg.control_on,
                only_negative_perturbations: cfg.only_negative_perturbations,
                pacing_on: cfg.pacing_on,
                continue_underlying: cfg.continue_underlying,
                target_shorter: cfg.target_shorter,
                consec_alternating: ss.consec_alternating,
                delta_g: cfg.delta_g,
                g_val: cfg.g_val,
            }
        });

        let snapshot = ApdSnapshot {
            apd_channel: ai_idx as u16,
            scan_index,
            apd_xx_percent: (100.0 * (1.0 - self.apd_xx)).round() as i32,
            v_apa: apd.v_apa,
            v_baseline: apd.v_baseline_n_minus_1,
            ap_ti: apd.ap_ti,
            ap_tf: apd.ap_tf,
            apd: apd.apd,
            di: apd.di,
            link_to_ao0: self.link_ao1_to_ao0,
            ao0_ao1_cond_time_ms: self.ao0_ao1_cond_time_ms,
            ao,
        };

        if self.snapshot_tx.try_send(snapshot).is_err() {
            log::warn!("apd fifo overrun: dropping snapshot for channel {}", ai_idx);
        }
    }
}
