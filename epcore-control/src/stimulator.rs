//! Stimulator (C9): expands a pulse-train specification into `2N + 1`
//! alternating AO-write commands terminated by a CALLBACK, submitted to a
//! [`CommandScheduler`] the stimulator owns outright. Grounded in
//! `stimulator.c`'s `rtlab_stimulator`/`stim_create_cmds`/`stim_reaper`.
//!
//! The original's `stim_reaper` re-registers itself when the (non-RT)
//! stim list lock is contended, and otherwise decrements the train
//! counter, rebuilds the next train, or runs the completion callback.
//! Here that whole dance collapses into [`Stimulator::poll`]: the caller
//! drains the owned scheduler once per RT iteration and calls `poll`
//! exactly when the scheduler reports a fired CALLBACK, so there is no
//! separate "list busy" case to defer around — the scheduler is private
//! to this one stimulator and never contended by anything else.

use epcore::aio::AioDriver;
use epcore::error::{Error, Result};
use epcore::types::Chanspec;

use crate::scheduler::{CommandScheduler, CommandSpec};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StimParams {
    pub on_voltage: f64,
    pub off_voltage: f64,
    pub when_ms: i64,
    pub duration_ms: i64,
    pub spacing_ms: i64,
    pub end_silence_ms: i64,
    pub num_per_train: u32,
    /// `> 0`: fire that many trains. `< 0`: continuous (rearms forever
    /// until cancelled). `0` is rejected by [`Stimulator::stimulate`].
    pub num_trains: i32,
}

/// Owns one chanspec, one command handle sized for `2*max_train_sz + 1`,
/// an active flag, and an optional completion callback, per §3/§4.8.
pub struct Stimulator {
    chanspec: Chanspec,
    scheduler: CommandScheduler,
    max_train_sz: u32,
    active: bool,
    params: Option<StimParams>,
    completion: Option<Box<dyn FnMut() + Send>>,
}

impl Stimulator {
    pub fn new(chanspec: Chanspec, max_train_sz: u32) -> Self {
        Stimulator {
            chanspec,
            scheduler: CommandScheduler::alloc((max_train_sz as usize) * 2 + 1),
            max_train_sz,
            active: false,
            params: None,
            completion: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_completion_callback(&mut self, cb: Box<dyn FnMut() + Send>) {
        self.completion = Some(cb);
    }

    /// Allowed only when inactive. The closed error taxonomy has no
    /// distinct EAGAIN; an in-flight stimulator reports `Busy`, same as
    /// `stimulate` does.
    pub fn set_context(&mut self, chanspec: Chanspec) -> Result<()> {
        if self.active {
            return Err(Error::Busy);
        }
        self.chanspec = chanspec;
        Ok(())
    }

    /// Builds and registers the `2N + 1` command sequence for one train,
    /// per §4.8's index layout.
    fn create_cmds<D: AioDriver>(&mut self, driver: &D, current_scan: u64, nanos_per_scan: u64) -> Result<()> {
        let p = self.params.expect("create_cmds called without params");
        let on_raw = driver.volts_to_raw(self.chanspec, p.on_voltage)?;
        let off_raw = driver.volts_to_raw(self.chanspec, p.off_voltage)?;

        let mut specs = Vec::with_capacity(p.num_per_train as usize * 2 + 1);
        let mut time = p.when_ms;
        let mut is_attack = true;
        let total_ao = p.num_per_train as usize * 2;

        for i in 0..total_ao {
            let raw = if is_attack { on_raw } else { off_raw };
            specs.push(CommandSpec::AoWrite { chanspec: self.chanspec, raw, when_ms: time });
            is_attack = !is_attack;
            let remaining_after = total_ao - (i + 1);
            if remaining_after == 0 {
                time += p.end_silence_ms;
            } else if is_attack {
                time += p.spacing_ms;
            } else {
                time += p.duration_ms;
            }
        }
        specs.push(CommandSpec::Callback { when_ms: time });

        self.scheduler.register(&specs, current_scan, nanos_per_scan)?;
        Ok(())
    }

    /// `rtlab_stimulate`: validates and arms the stimulator for one run.
    pub fn stimulate<D: AioDriver>(
        &mut self,
        driver: &D,
        params: StimParams,
        current_scan: u64,
        nanos_per_scan: u64,
    ) -> Result<()> {
        if self.active {
            return Err(Error::Busy);
        }
        driver.find_and_set_best_range(self.chanspec.namespace, self.chanspec.channel, params.on_voltage)?;
        if params.when_ms < 0 {
            return Err(Error::InvalidArgument("when_ms must be >= 0".into()));
        }
        if params.num_per_train > self.max_train_sz {
            return Err(Error::InvalidArgument(format!(
                "num_per_train {} exceeds max_train_sz {}",
                params.num_per_train, self.max_train_sz
            )));
        }
        if params.num_trains == 0 {
            return Err(Error::InvalidArgument("num_trains must be nonzero".into()));
        }

        self.params = Some(params);
        self.create_cmds(driver, current_scan, nanos_per_scan)?;
        self.active = true;
        Ok(())
    }

    /// `rtlab_cancel_stim`: the next reaper invocation performs cleanup
    /// and runs the completion callback.
    pub fn cancel(&mut self) -> Result<()> {
        if !self.active {
            return Err(Error::InvalidArgument("stimulator is not active".into()));
        }
        self.active = false;
        Ok(())
    }

    /// Drains the stimulator's own command scheduler and reaps any fired
    /// train-completion callback. Must be called once per RT iteration.
    pub fn iterate<D: AioDriver>(&mut self, driver: &mut D, current_scan: u64, nanos_per_scan: u64) {
        let callbacks = self.scheduler.process(driver, current_scan);
        for _ in 0..callbacks {
            self.reap(driver, current_scan, nanos_per_scan);
        }
    }

    /// `stim_reaper`: decrements the train counter, runs the completion
    /// callback at train/continuous boundaries, and rebuilds the command
    /// sequence for the next train when more remain.
    fn reap<D: AioDriver>(&mut self, driver: &mut D, current_scan: u64, nanos_per_scan: u64) {
        if !self.active {
            // Cancelled while this reaper call was pending.
            if let Some(cb) = self.completion.as_mut() {
                cb();
            }
            return;
        }

        let mut p = self.params.expect("reap called without params");

        if p.num_trains > 0 {
            p.num_trains -= 1;
        }

        if p.num_trains == 0 {
            self.active = false;
            self.params = Some(p);
            if let Some(cb) = self.completion.as_mut() {
                cb();
            }
            return;
        }

        if p.num_trains < 0 {
            if let Some(cb) = self.completion.as_mut() {
                cb();
            }
        }

        p.when_ms = 0;
        self.params = Some(p);

        if self.active {
            if self.create_cmds(&*driver, current_scan, nanos_per_scan).is_err() {
                self.active = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epcore::aio::SimAioDriver;
    use epcore::types::{AnalogReference, Namespace};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn chanspec() -> Chanspec {
        Chanspec::new(Namespace::AnalogOutput, 0, 0, AnalogReference::Ground)
    }

    fn params(num_per_train: u32, num_trains: i32) -> StimParams {
        StimParams {
            on_voltage: 5.0,
            off_voltage: 0.0,
            when_ms: 0,
            duration_ms: 1,
            spacing_ms: 4,
            end_silence_ms: 0,
            num_per_train,
            num_trains,
        }
    }

    /// Scenario 3: N=3, T=1 fires AO writes at 0,1,5,6,10,11 and the
    /// completion callback at 11ms.
    #[test]
    fn single_train_fires_expected_edges_and_completes() {
        let mut driver = SimAioDriver::with_uniform_range(4);
        let mut stim = Stimulator::new(chanspec(), 8);
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = done.clone();
        stim.set_completion_callback(Box::new(move || {
            done2.fetch_add(1, Ordering::SeqCst);
        }));

        stim.stimulate(&driver, params(3, 1), 0, 1_000_000).unwrap();
        assert!(stim.is_active());

        for scan in 0..=11u64 {
            stim.iterate(&mut driver, scan, 1_000_000);
        }

        assert!(!stim.is_active());
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    /// Universal invariant: for `num_per_train = N, num_trains = T > 0`,
    /// the total number of on-edges equals `N*T`.
    #[test]
    fn pulse_count_matches_num_per_train_times_num_trains() {
        let mut driver = SimAioDriver::with_uniform_range(2);
        let mut stim = Stimulator::new(chanspec(), 8);
        let on_raw = driver.volts_to_raw(chanspec(), 5.0).unwrap();
        let mut on_edges = 0;
        let mut was_on = false;

        stim.stimulate(&driver, params(2, 3), 0, 1_000_000).unwrap();
        for scan in 0..200u64 {
            stim.iterate(&mut driver, scan, 1_000_000);
            let now_on = driver.read_delayed(chanspec(), 0).unwrap() == on_raw;
            if now_on && !was_on {
                on_edges += 1;
            }
            was_on = now_on;
        }
        assert_eq!(on_edges, 2 * 3);
        assert!(!stim.is_active());
    }

    /// Scenario 6: cancelling mid-silence-phase must not cut off the
    /// pending on/off edges already queued for the in-flight train, must
    /// not rearm a next train, and must fire the completion callback
    /// exactly once.
    #[test]
    fn cancel_continuous_stim_runs_completion_once() {
        let mut driver = SimAioDriver::with_uniform_range(2);
        let mut stim = Stimulator::new(chanspec(), 8);
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = done.clone();
        stim.set_completion_callback(Box::new(move || {
            done2.fetch_add(1, Ordering::SeqCst);
        }));
        let on_raw = driver.volts_to_raw(chanspec(), 5.0).unwrap();
        let off_raw = driver.volts_to_raw(chanspec(), 0.0).unwrap();

        // params(2, -1)'s first train fires on@0, off@1, on@5, off@6,
        // callback@6. Cancel during the silence phase between off@1 and
        // on@5, while on@5/off@6 are already queued ahead of the cancel.
        stim.stimulate(&driver, params(2, -1), 0, 1_000_000).unwrap();
        for scan in 0..4u64 {
            stim.iterate(&mut driver, scan, 1_000_000);
        }
        assert_eq!(done.load(Ordering::SeqCst), 0, "must not have completed yet");

        stim.cancel().unwrap();

        stim.iterate(&mut driver, 5, 1_000_000);
        assert_eq!(driver.read_delayed(chanspec(), 0).unwrap(), on_raw, "pending on-edge must still fire");

        stim.iterate(&mut driver, 6, 1_000_000);
        assert_eq!(driver.read_delayed(chanspec(), 0).unwrap(), off_raw, "pending off-edge must still fire");
        assert!(!stim.is_active());
        assert_eq!(done.load(Ordering::SeqCst), 1, "cancellation fires completion exactly once");

        // No further AO writes after the pending edges finish: the
        // channel must stay at its last (off) value forever after, and
        // no train is rearmed.
        for scan in 7..40u64 {
            stim.iterate(&mut driver, scan, 1_000_000);
            assert_eq!(driver.read_delayed(chanspec(), 0).unwrap(), off_raw);
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stimulate_while_active_is_rejected() {
        let driver = SimAioDriver::with_uniform_range(2);
        let mut stim = Stimulator::new(chanspec(), 8);
        stim.stimulate(&driver, params(1, 1), 0, 1_000_000).unwrap();
        assert_eq!(stim.stimulate(&driver, params(1, 1), 0, 1_000_000), Err(Error::Busy));
    }

    #[test]
    fn num_per_train_over_capacity_is_rejected() {
        let driver = SimAioDriver::with_uniform_range(2);
        let mut stim = Stimulator::new(chanspec(), 2);
        assert!(matches!(
            stim.stimulate(&driver, params(3, 1), 0, 1_000_000),
            Err(Error::InvalidArgument(_))
        ));
    }
}
