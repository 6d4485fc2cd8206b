//! BusyGate - per-worker mutual exclusion with a polite takeover
//!
//! Ordinary work queues on the gate in FIFO order. An operator-level action
//! (swap the account right now) may skip the queue, but only when nobody is
//! queued: it must never starve a waiting acquirer or grab a gate that is
//! about to be handed over.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard};

/// Exclusive access to a worker's session state
pub struct BusyGate<T> {
    inner: Mutex<T>,
    /// Tasks currently suspended in [`BusyGate::acquire`]
    waiting: AtomicUsize,
}

/// Holding this means the gate is busy; dropping it releases the gate.
#[derive(Debug)]
pub struct BusyGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

/// Decrements the waiter count even if the acquiring future is dropped.
struct WaitTicket<'a> {
    waiting: &'a AtomicUsize,
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T> BusyGate<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Wait (fairly) until the gate is free, then hold it
    pub async fn acquire(&self) -> BusyGuard<'_, T> {
        if let Ok(guard) = self.inner.try_lock() {
            if self.waiting.load(Ordering::Acquire) == 0 {
                return BusyGuard { guard };
            }
            // Someone queued between our check and the lock; let them go first
            drop(guard);
        }

        self.waiting.fetch_add(1, Ordering::AcqRel);
        let _ticket = WaitTicket {
            waiting: &self.waiting,
        };
        let guard = self.inner.lock().await;
        BusyGuard { guard }
    }

    /// Take the gate immediately, only if it is free and nobody is waiting
    pub fn try_takeover(&self) -> Option<BusyGuard<'_, T>> {
        if self.waiting.load(Ordering::Acquire) > 0 {
            return None;
        }
        let guard = self.inner.try_lock().ok()?;
        if self.waiting.load(Ordering::Acquire) > 0 {
            return None;
        }
        Some(BusyGuard { guard })
    }

    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    pub fn waiters(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }
}

impl<T> BusyGuard<'_, T> {
    /// Release the gate, waking the oldest waiter
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Deref for BusyGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for BusyGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_takeover_when_idle() {
        let gate = BusyGate::new(0u32);
        let mut guard = gate.try_takeover().expect("idle gate");
        *guard += 1;
        assert!(gate.is_busy());
        guard.release();
        assert!(!gate.is_busy());
        assert_eq!(*gate.try_takeover().unwrap(), 1);
    }

    #[test]
    fn test_takeover_fails_while_held() {
        let gate = BusyGate::new(());
        let _held = gate.try_takeover().unwrap();
        assert!(gate.try_takeover().is_none());
    }

    #[test]
    fn test_takeover_fails_while_someone_waits() {
        let gate = BusyGate::new(());
        let held = gate.try_takeover().unwrap();

        let mut waiter = task::spawn(gate.acquire());
        assert_pending!(waiter.poll());
        assert_eq!(gate.waiters(), 1);

        // Releasing hands the gate to the waiter; a takeover in between must
        // not steal it.
        held.release();
        assert!(gate.try_takeover().is_none());

        assert!(waiter.is_woken());
        let guard = assert_ready!(waiter.poll());
        assert_eq!(gate.waiters(), 0);
        drop(guard);
        assert!(gate.try_takeover().is_some());
    }

    #[test]
    fn test_dropped_waiter_is_forgotten() {
        let gate = BusyGate::new(());
        let held = gate.try_takeover().unwrap();

        let mut waiter = task::spawn(gate.acquire());
        assert_pending!(waiter.poll());
        drop(waiter);
        assert_eq!(gate.waiters(), 0);

        held.release();
        assert!(gate.try_takeover().is_some());
    }

    #[tokio::test]
    async fn test_release_after_takeover_wakes_oldest_waiter() {
        let gate = Arc::new(BusyGate::new(Vec::<u32>::new()));
        let takeover = gate.try_takeover().expect("idle gate");

        let mut handles = Vec::new();
        for id in 1..=3u32 {
            let task_gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                let mut order = task_gate.acquire().await;
                order.push(id);
            }));
            // Let each task reach the queue before spawning the next
            while gate.waiters() < id as usize {
                tokio::task::yield_now().await;
            }
        }

        drop(takeover);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*gate.acquire().await, vec![1, 2, 3]);
    }
}
