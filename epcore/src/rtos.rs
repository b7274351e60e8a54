//! RTOS Middleware (C2): the opaque real-time substrate the acquisition
//! engine runs on -- a monotonic clock, absolute-time sleep, and
//! lock-free-in-spirit byte/record FIFOs. The original system got these
//! from RTAI/RTLinux; here they are a trait so the engine itself never
//! depends on a concrete OS, and `SimRtos` backs the test suite and demo
//! binary with `std::time` and bounded `crossbeam` channels, the same
//! channel primitive `worker_cmd_chan.rs` reaches for in its cross-thread
//! command path.

use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError};

pub trait RtosMiddleware {
    fn now(&self) -> Instant;
    fn sleep_until_absolute(&self, deadline: Instant);
    fn log(&self, level: log::Level, msg: &str) {
        log::log!(level, "{}", msg);
    }
}

/// Single-producer/single-consumer bounded FIFO. `try_send`/`try_recv`
/// never block; a full producer-side write is the overrun policy for this
/// FIFO -- the RT side drops the record and continues rather than stall.
pub struct FifoProducer<T> {
    tx: Sender<T>,
}

pub struct FifoConsumer<T> {
    rx: Receiver<T>,
}

impl<T> FifoProducer<T> {
    /// Returns `Err(item)` on overrun (FIFO full) so the caller can count
    /// the drop without losing the item's identity for logging.
    pub fn try_send(&self, item: T) -> Result<(), T> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => Err(item),
            Err(TrySendError::Disconnected(item)) => Err(item),
        }
    }
}

impl<T> FifoConsumer<T> {
    pub fn try_recv(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

pub fn fifo_channel<T>(capacity: usize) -> (FifoProducer<T>, FifoConsumer<T>) {
    let (tx, rx) = channel::bounded(capacity);
    (FifoProducer { tx }, FifoConsumer { rx })
}

/// Default middleware backed by the standard library's monotonic clock.
pub struct SimRtos;

impl RtosMiddleware for SimRtos {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until_absolute(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}

/// Convenience for computing the next absolute deadline from a period.
pub fn next_deadline(previous: Instant, period: Duration) -> Instant {
    previous + period
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_overrun_returns_item_back() {
        let (tx, _rx) = fifo_channel::<u32>(1);
        tx.try_send(1).unwrap();
        assert_eq!(tx.try_send(2), Err(2));
    }

    #[test]
    fn fifo_round_trip() {
        let (tx, rx) = fifo_channel::<u32>(4);
        tx.try_send(7).unwrap();
        assert_eq!(rx.try_recv(), Some(7));
        assert_eq!(rx.try_recv(), None);
    }
}
