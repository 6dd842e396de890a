//! Mutual exclusion between the interrupt-driven slot engine and foreground
//! code mutating schedule, queue and neighbor state.
//!
//! The foreground requests the lock and spins until any in-flight slot
//! completes; the slot engine refuses to start a new slot while a request
//! or the lock itself is outstanding. On a single-core target this
//! request/observe protocol is sufficient; the atomics keep it correct if
//! foreground and interrupt contexts ever observe each other mid-update.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::log::{debug, warn};

pub struct LockArbiter {
    locked: AtomicBool,
    lock_requested: AtomicBool,
    in_slot_operation: AtomicBool,
}

impl LockArbiter {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            lock_requested: AtomicBool::new(false),
            in_slot_operation: AtomicBool::new(false),
        }
    }

    /// Is the foreground currently holding the lock?
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Is a foreground acquisition pending?
    pub fn is_lock_requested(&self) -> bool {
        self.lock_requested.load(Ordering::Acquire)
    }

    /// Is the slot engine currently executing a slot?
    pub fn in_slot_operation(&self) -> bool {
        self.in_slot_operation.load(Ordering::Acquire)
    }

    /// Mark slot execution entry/exit. Slot engine only.
    pub(crate) fn set_in_slot_operation(&self, active: bool) {
        self.in_slot_operation.store(active, Ordering::Release);
    }

    /// Acquire the lock from foreground context.
    ///
    /// Flags the request so no new slot starts, waits out any slot in
    /// progress, then takes the lock if still free. Returns false on the
    /// rare race where another foreground path won; callers may retry.
    pub fn acquire(&self) -> bool {
        if !self.is_locked() {
            self.lock_requested.store(true, Ordering::Release);

            if self.in_slot_operation() {
                debug!("waiting for slot operation to end");
                while self.in_slot_operation() {
                    core::hint::spin_loop();
                }
            }

            if !self.is_locked() {
                self.locked.store(true, Ordering::Release);
                self.lock_requested.store(false, Ordering::Release);
                return true;
            }
        }

        warn!("failed to take the slot engine lock");
        false
    }

    /// Release the lock from foreground context
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn acquire_release() {
        let lock = LockArbiter::new();

        assert!(lock.acquire());
        assert!(lock.is_locked());
        assert!(!lock.is_lock_requested());

        lock.release();
        assert!(!lock.is_locked());
    }

    #[test]
    fn acquire_fails_when_held() {
        let lock = LockArbiter::new();

        assert!(lock.acquire());
        assert!(!lock.acquire());

        lock.release();
        assert!(lock.acquire());
    }
}
