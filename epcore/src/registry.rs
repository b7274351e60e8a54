//! Callback Registry (C7): an ordered list of user-registered functions,
//! each with an active flag and a callback frequency, called from the RT
//! loop when due. Modeled after `rt_process.c`'s `rt_function_list`
//! circular linked list, but as a `Vec` -- registration order is call
//! order either way, and a `Vec` avoids the original's hand-rolled
//! pointer-chasing list without changing the observable ordering
//! invariant.
//!
//! Registration/deregistration acquire `parking_lot::Mutex`; the RT loop
//! uses `try_lock` and skips the whole pass when the lock is held, per
//! §5's "does not block on these mutexes" policy.

use parking_lot::Mutex;

use crate::error::{Error, Result};

pub type CallbackId = u64;

struct Entry<C> {
    id: CallbackId,
    active: bool,
    /// Desired callback period in microseconds; 0 means "every scan".
    period_us: u64,
    next_fire_index: u64,
    func: Box<dyn FnMut(&mut C) + Send>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ModuleState {
    Initializing,
    Running,
    TearingDown,
}

pub struct CallbackRegistry<C> {
    entries: Mutex<Vec<Entry<C>>>,
    next_id: Mutex<CallbackId>,
    state: Mutex<ModuleState>,
}

impl<C> Default for CallbackRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> CallbackRegistry<C> {
    pub fn new() -> Self {
        CallbackRegistry {
            entries: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
            state: Mutex::new(ModuleState::Initializing),
        }
    }

    /// Marks initialization complete; registration is rejected before this
    /// is called and after `begin_teardown`.
    pub fn mark_running(&self) {
        *self.state.lock() = ModuleState::Running;
    }

    pub fn begin_teardown(&self) {
        *self.state.lock() = ModuleState::TearingDown;
    }

    pub fn register<F>(&self, period_us: u64, func: F) -> Result<CallbackId>
    where
        F: FnMut(&mut C) + Send + 'static,
    {
        if *self.state.lock() != ModuleState::Running {
            return Err(Error::NotReady);
        }
        let mut next_id = self.next_id.lock();
        let id = *next_id;
        *next_id += 1;
        drop(next_id);

        self.entries.lock().push(Entry {
            id,
            active: true,
            period_us,
            next_fire_index: 0,
            func: Box::new(func),
        });
        Ok(id)
    }

    /// Registers without the running-state check, for the engine's own
    /// built-in callbacks installed during construction.
    pub(crate) fn register_builtin<F>(&self, period_us: u64, func: F) -> CallbackId
    where
        F: FnMut(&mut C) + Send + 'static,
    {
        let mut next_id = self.next_id.lock();
        let id = *next_id;
        *next_id += 1;
        drop(next_id);
        self.entries.lock().push(Entry {
            id,
            active: true,
            period_us,
            next_fire_index: 0,
            func: Box::new(func),
        });
        id
    }

    pub fn unregister(&self, id: CallbackId) {
        self.entries.lock().retain(|e| e.id != id);
    }

    pub fn set_active(&self, id: CallbackId, active: bool) {
        if let Some(e) = self.entries.lock().iter_mut().find(|e| e.id == id) {
            e.active = active;
        }
    }

    /// `set_frequency(freq_hz)`: stores `1e6 / normalize(freq_hz)` into the
    /// period, matching `rtp_set_callback_frequency`.
    pub fn set_frequency(&self, id: CallbackId, freq_hz: u32) {
        let period_us = crate::shared_state::normalize_sampling_rate(freq_hz) as u64;
        let period_us = 1_000_000 / period_us.max(1);
        if let Some(e) = self.entries.lock().iter_mut().find(|e| e.id == id) {
            e.period_us = period_us;
        }
    }

    /// Walks the registry in registration order, invoking every active
    /// entry that is due. Returns `false` without touching `ctx` if the
    /// lock is currently held (the non-blocking try-lock policy of §5).
    pub fn walk_if_uncontended(&self, ctx: &mut C, current_scan_index: u64, nanos_per_scan: u64) -> bool {
        let Some(mut entries) = self.entries.try_lock() else {
            return false;
        };
        for e in entries.iter_mut() {
            if !e.active {
                continue;
            }
            let due = e.period_us == 0 || e.next_fire_index <= current_scan_index;
            if due {
                if e.period_us != 0 {
                    let scans_per_period = (e.period_us * 1000) / nanos_per_scan.max(1);
                    e.next_fire_index = current_scan_index + scans_per_period.max(1);
                }
                (e.func)(ctx);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_order_is_call_order() {
        let reg: CallbackRegistry<Vec<i32>> = CallbackRegistry::new();
        reg.mark_running();
        reg.register(0, |ctx: &mut Vec<i32>| ctx.push(1)).unwrap();
        reg.register(0, |ctx: &mut Vec<i32>| ctx.push(2)).unwrap();
        reg.register(0, |ctx: &mut Vec<i32>| ctx.push(3)).unwrap();

        let mut observed = Vec::new();
        reg.walk_if_uncontended(&mut observed, 0, 1_000_000);
        assert_eq!(observed, vec![1, 2, 3]);
    }

    #[test]
    fn registration_before_running_is_rejected() {
        let reg: CallbackRegistry<Vec<i32>> = CallbackRegistry::new();
        assert_eq!(reg.register(0, |_: &mut Vec<i32>| {}).unwrap_err(), Error::NotReady);
    }

    #[test]
    fn inactive_entries_are_skipped() {
        let reg: CallbackRegistry<Vec<i32>> = CallbackRegistry::new();
        reg.mark_running();
        let id = reg.register(0, |ctx: &mut Vec<i32>| ctx.push(1)).unwrap();
        reg.set_active(id, false);
        let mut observed = Vec::new();
        reg.walk_if_uncontended(&mut observed, 0, 1_000_000);
        assert!(observed.is_empty());
    }

    #[test]
    fn held_lock_causes_skip() {
        let reg: CallbackRegistry<Vec<i32>> = CallbackRegistry::new();
        reg.mark_running();
        let _guard = reg.entries.lock();
        let mut observed = Vec::new();
        assert!(!reg.walk_if_uncontended(&mut observed, 0, 1_000_000));
    }
}
