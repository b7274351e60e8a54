//! Command Scheduler (C8): a per-handle min-heap of time-stamped
//! commands (AO-write, AI-read, callback), drained once per RT iteration.
//! Grounded directly in `rtlab_cmd.c`: a fixed-capacity command array, a
//! free-slot bitmap (here a `Vec<bool>`), [`epcore::heap::BinaryHeap`] as
//! the priority structure, and a batch buffer that defers CALLBACK
//! commands past the heap-mutation phase, so a callback that reacts by
//! re-registering more commands into the same handle (as the stimulator's
//! reaper does) never mutates the heap while it is still being drained.
//!
//! Unlike the original's `(function_ptr, arg)` pair, a fired callback is
//! reported back to the caller as a plain count rather than invoked
//! in-place: the only callback consumer in this workspace is the
//! stimulator's own reaper, which is easiest to express as "the handle's
//! owner polls `process`'s return value and reacts", avoiding a
//! self-referential closure that would need to borrow the handle it
//! lives inside of.

use epcore::aio::AioDriver;
use epcore::error::{Error, Result};
use epcore::heap::BinaryHeap;
use epcore::types::Chanspec;

/// What the caller wants to happen at `when_ms` after registration.
#[derive(Clone, Copy, Debug)]
pub enum CommandSpec {
    AoWrite { chanspec: Chanspec, raw: u32, when_ms: i64 },
    AiRead { chanspec: Chanspec, when_ms: i64 },
    Callback { when_ms: i64 },
}

#[derive(Clone, Copy, Debug)]
enum CommandKind {
    AoWrite { chanspec: Chanspec, raw: u32 },
    AiRead { chanspec: Chanspec },
    Callback,
}

pub struct CommandScheduler {
    cmds: Vec<Option<CommandKind>>,
    free: Vec<bool>,
    heap: BinaryHeap,
    results: Vec<Option<u32>>,
    n_used: usize,
}

impl CommandScheduler {
    pub fn alloc(max_cmds: usize) -> Self {
        CommandScheduler {
            cmds: vec![None; max_cmds],
            free: vec![true; max_cmds],
            heap: BinaryHeap::alloc(max_cmds),
            results: vec![None; max_cmds],
            n_used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cmds.len()
    }

    pub fn in_use(&self) -> usize {
        self.n_used
    }

    fn alloc_slot(&mut self) -> Option<usize> {
        let pos = self.free.iter().position(|&f| f)?;
        self.free[pos] = false;
        self.n_used += 1;
        Some(pos)
    }

    fn free_slot(&mut self, slot: usize) {
        if !self.free[slot] {
            self.free[slot] = true;
            self.n_used -= 1;
        }
        self.cmds[slot] = None;
    }

    /// Registers a batch of commands, returning the allocated slot ids.
    /// Fails with `NoSpace` if there are not enough free slots for the
    /// whole batch, matching `rtlab_cmd_register`'s all-or-nothing `E2BIG`.
    pub fn register(&mut self, specs: &[CommandSpec], current_scan: u64, nanos_per_scan: u64) -> Result<Vec<usize>> {
        if specs.len() > self.capacity() - self.n_used {
            return Err(Error::NoSpace);
        }
        let mut slots = Vec::with_capacity(specs.len());
        for spec in specs {
            let (when_ms, kind) = match *spec {
                CommandSpec::AoWrite { chanspec, raw, when_ms } => {
                    (when_ms, CommandKind::AoWrite { chanspec, raw })
                }
                CommandSpec::AiRead { chanspec, when_ms } => (when_ms, CommandKind::AiRead { chanspec }),
                CommandSpec::Callback { when_ms } => (when_ms, CommandKind::Callback),
            };
            let when_ms = when_ms.max(0) as u64;
            let nanos_per_scan = nanos_per_scan.max(1);
            // round(when_ms * 1e6 / nanos_per_scan), not truncating division:
            // at sampling rates where nanos_per_scan doesn't evenly divide
            // when_ms * 1e6, truncation would fire a scan early.
            let fire_scan = current_scan + (when_ms * 1_000_000 + nanos_per_scan / 2) / nanos_per_scan;

            // alloc_slot cannot fail here: the capacity check above already
            // guarantees enough free slots for the whole batch.
            let slot = self.alloc_slot().ok_or(Error::NoSpace)?;
            self.cmds[slot] = Some(kind);
            self.heap.insert(slot, fire_scan)?;
            slots.push(slot);
        }
        Ok(slots)
    }

    /// Reads back (and clears) the most recent AI-read result for `slot`.
    pub fn take_result(&mut self, slot: usize) -> Option<u32> {
        self.results[slot].take()
    }

    /// Drains every command whose fire-scan is at or before
    /// `current_scan`, in non-decreasing fire-scan order. Returns the
    /// number of CALLBACK-type commands that fired this pass.
    pub fn process<D: AioDriver>(&mut self, driver: &mut D, current_scan: u64) -> usize {
        let mut callbacks_fired = 0;

        while let (Some(slot), Some(key)) = (self.heap.min(), self.heap.min_key()) {
            if key > current_scan {
                break;
            }
            let kind = self.cmds[slot].take();
            self.free_slot(slot);
            self.heap.delete(slot);

            match kind {
                Some(CommandKind::AoWrite { chanspec, raw }) => {
                    if let Err(e) = driver.write(chanspec, raw) {
                        log::warn!("scheduler: AO write failed on slot {}: {}", slot, e);
                    }
                }
                Some(CommandKind::AiRead { chanspec }) => match driver.read_delayed(chanspec, 0) {
                    Ok(raw) => self.results[slot] = Some(raw),
                    Err(e) => log::warn!("scheduler: AI read failed on slot {}: {}", slot, e),
                },
                Some(CommandKind::Callback) => callbacks_fired += 1,
                None => {}
            }
        }

        callbacks_fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epcore::aio::SimAioDriver;
    use epcore::types::{AnalogReference, Namespace};

    fn cs(chan: u16) -> Chanspec {
        Chanspec::new(Namespace::AnalogOutput, chan, 0, AnalogReference::Ground)
    }

    #[test]
    fn fires_in_nondecreasing_scan_order_exactly_once() {
        let mut driver = SimAioDriver::with_uniform_range(4);
        let mut sched = CommandScheduler::alloc(8);
        sched
            .register(
                &[
                    CommandSpec::AoWrite { chanspec: cs(0), raw: 1, when_ms: 5 },
                    CommandSpec::AoWrite { chanspec: cs(1), raw: 2, when_ms: 1 },
                ],
                0,
                1_000_000, // 1ms/scan
            )
            .unwrap();

        sched.process(&mut driver, 0);
        assert_eq!(sched.in_use(), 2); // neither fires yet at scan 0

        sched.process(&mut driver, 1);
        assert_eq!(sched.in_use(), 1); // the 1ms-out one fired

        sched.process(&mut driver, 5);
        assert_eq!(sched.in_use(), 0); // the 5ms-out one fired
    }

    #[test]
    fn callback_fires_after_heap_drain() {
        let mut driver = SimAioDriver::with_uniform_range(2);
        let mut sched = CommandScheduler::alloc(8);
        sched
            .register(&[CommandSpec::Callback { when_ms: 0 }], 0, 1_000_000)
            .unwrap();

        assert_eq!(sched.process(&mut driver, 0), 1);
        assert_eq!(sched.process(&mut driver, 0), 0);
    }

    #[test]
    fn fire_scan_rounds_rather_than_truncates_at_non_1khz_rates() {
        // 200Hz: nanos_per_scan = 5_000_000. when_ms=3 -> 3e6/5e6 = 0.6,
        // which must round up to fire-scan offset 1, not truncate to 0.
        let mut driver = SimAioDriver::with_uniform_range(2);
        let mut sched = CommandScheduler::alloc(4);
        sched
            .register(&[CommandSpec::AoWrite { chanspec: cs(0), raw: 1, when_ms: 3 }], 0, 5_000_000)
            .unwrap();

        assert_eq!(sched.process(&mut driver, 0), 0);
        assert_eq!(sched.in_use(), 1, "truncation would have fired this at scan 0 already");

        assert_eq!(sched.process(&mut driver, 1), 0);
        assert_eq!(sched.in_use(), 0, "rounding puts the fire scan at offset 1");
    }

    #[test]
    fn register_over_capacity_fails() {
        let mut sched = CommandScheduler::alloc(1);
        let res = sched.register(
            &[
                CommandSpec::AoWrite { chanspec: cs(0), raw: 1, when_ms: 0 },
                CommandSpec::AoWrite { chanspec: cs(0), raw: 1, when_ms: 0 },
            ],
            0,
            1_000_000,
        );
        assert_eq!(res.unwrap_err(), Error::NoSpace);
    }

    #[test]
    fn ai_read_result_is_retrievable_after_process() {
        let mut driver = SimAioDriver::with_uniform_range(2);
        driver.set_raw(0, 1234);
        let mut sched = CommandScheduler::alloc(4);
        let slots = sched
            .register(&[CommandSpec::AiRead { chanspec: cs(0), when_ms: 0 }], 0, 1_000_000)
            .unwrap();
        sched.process(&mut driver, 0);
        assert_eq!(sched.take_result(slots[0]), Some(1234));
    }
}
