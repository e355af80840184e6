//! Bounded FIFO message queue.
//!
//! The shape follows the kernel's counting primitives: a spin-locked
//! `VecDeque` for the data, one wakeup cell per direction for blocking.
//! Senders may wait for space with a bounded timeout, the receiver may
//! wait for a message; ISR senders never wait at all.

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use spin::Mutex;

use crate::port::{Rtos, Signal};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendError {
    Full,
}

pub struct MessageQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Box<dyn Signal>,
    not_full: Box<dyn Signal>,
}

impl<T> MessageQueue<T> {
    pub fn new(capacity: usize, rtos: &dyn Rtos) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: rtos.make_signal(),
            not_full: rtos.make_signal(),
        }
    }

    /// Append `msg`, waiting up to `timeout_ticks` for space. A lost race
    /// after a wakeup restarts the wait, so total blocking can exceed the
    /// timeout when other senders keep winning; the bound holds for the
    /// uncontended case, which is the only one the callers rely on.
    pub fn send_back(&self, msg: T, timeout_ticks: Option<u32>) -> Result<(), SendError> {
        let mut msg = Some(msg);
        loop {
            {
                let mut q = self.inner.lock();
                if q.len() < self.capacity {
                    if let Some(m) = msg.take() {
                        q.push_back(m);
                    }
                    drop(q);
                    self.not_empty.notify();
                    return Ok(());
                }
            }
            if !self.not_full.wait(timeout_ticks) {
                return Err(SendError::Full);
            }
        }
    }

    /// ISR-safe append: never blocks, fails when the queue is at capacity
    /// or the lock is held by the interrupted task. On success
    /// `higher_prio_woken` reports whether the receive side outranks the
    /// running task.
    pub fn send_back_from_isr(&self, msg: T, higher_prio_woken: &mut bool) -> Result<(), SendError> {
        let Some(mut q) = self.inner.try_lock() else {
            return Err(SendError::Full);
        };
        if q.len() >= self.capacity {
            return Err(SendError::Full);
        }
        q.push_back(msg);
        drop(q);
        *higher_prio_woken = self.not_empty.notify_from_isr();
        Ok(())
    }

    /// Pop the oldest message, waiting up to `timeout_ticks` for one to
    /// arrive (`None` waits forever).
    pub fn receive(&self, timeout_ticks: Option<u32>) -> Option<T> {
        loop {
            {
                let mut q = self.inner.lock();
                if let Some(msg) = q.pop_front() {
                    drop(q);
                    self.not_full.notify();
                    return Some(msg);
                }
            }
            if !self.not_empty.wait(timeout_ticks) {
                return None;
            }
        }
    }

    /// Discard everything queued. Senders blocked on a full queue get one
    /// wakeup.
    pub fn reset(&self) {
        let drained = {
            let mut q = self.inner.lock();
            let n = q.len();
            q.clear();
            n
        };
        if drained > 0 {
            self.not_full.notify();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
