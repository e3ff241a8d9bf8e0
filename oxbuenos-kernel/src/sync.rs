//! Mutual exclusion on a single CPU.
//!
//! Fault handlers and the scheduler can run on top of any kernel code, so a
//! lock is only safe when interrupts stay masked for as long as it is held.
//! [`SpinLock`] ties the two together: locking masks interrupts, and dropping
//! the guard releases the lock and then restores the interrupt state that was
//! found on entry.

use crate::platform::{Interrupts, IntrStatus};
use core::ops::{Deref, DerefMut};
use spin::mutex::{Mutex, MutexGuard};

/// Interrupts stay disabled while this guard lives
#[must_use = "interrupts are restored as soon as the guard is dropped"]
pub struct InterruptGuard<'a, I: Interrupts + ?Sized> {
    interrupts: &'a I,
    saved: IntrStatus,
}

impl<'a, I: Interrupts + ?Sized> InterruptGuard<'a, I> {
    pub fn new(interrupts: &'a I) -> Self {
        let saved = interrupts.interrupt_disable();
        Self { interrupts, saved }
    }
}

impl<I: Interrupts + ?Sized> Drop for InterruptGuard<'_, I> {
    fn drop(&mut self) {
        self.interrupts.interrupt_set_state(self.saved);
    }
}

/// A non-reentrant lock whose critical sections run with interrupts masked.
/// Critical sections must be short and must never block.
#[derive(Debug)]
pub struct SpinLock<T> {
    inner: Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Mask interrupts and take the lock
    pub fn lock<'a, I: Interrupts + ?Sized>(&'a self, interrupts: &'a I) -> SpinLockGuard<'a, T, I> {
        let masked = InterruptGuard::new(interrupts);
        SpinLockGuard {
            data: self.inner.lock(),
            _masked: masked,
        }
    }

    /// Take the lock inside a section whose interrupts are already masked by `_masked`.
    /// Dropping the returned guard leaves interrupts masked, so the lock can be
    /// released and reacquired around a sleep.
    pub fn lock_masked<'a, I: Interrupts + ?Sized>(
        &'a self,
        _masked: &'a InterruptGuard<'_, I>,
    ) -> MutexGuard<'a, T> {
        self.inner.lock()
    }
}

pub struct SpinLockGuard<'a, T, I: Interrupts + ?Sized> {
    // Field order matters: the lock is released before interrupts are restored.
    data: MutexGuard<'a, T>,
    _masked: InterruptGuard<'a, I>,
}

impl<T, I: Interrupts + ?Sized> Deref for SpinLockGuard<'_, T, I> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T, I: Interrupts + ?Sized> DerefMut for SpinLockGuard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[derive(Default)]
    struct FakeInterrupts {
        enabled: Cell<bool>,
        disables: Cell<u32>,
    }

    impl Interrupts for FakeInterrupts {
        fn interrupt_disable(&self) -> IntrStatus {
            self.disables.set(self.disables.get() + 1);
            IntrStatus::from_raw(u32::from(self.enabled.replace(false)))
        }

        fn interrupt_set_state(&self, status: IntrStatus) {
            self.enabled.set(status.raw() != 0);
        }
    }

    fn enabled() -> FakeInterrupts {
        let interrupts = FakeInterrupts::default();
        interrupts.enabled.set(true);
        interrupts
    }

    #[test]
    fn lock_masks_and_restores() {
        let interrupts = enabled();
        let lock = SpinLock::new(5);
        {
            let mut guard = lock.lock(&interrupts);
            assert!(!interrupts.enabled.get());
            *guard += 1;
        }
        assert!(interrupts.enabled.get());
        assert_eq!(*lock.lock(&interrupts), 6);
    }

    #[test]
    fn nested_sections_restore_outer_state() {
        let interrupts = enabled();
        let outer = SpinLock::new(());
        let inner = SpinLock::new(());
        let outer_guard = outer.lock(&interrupts);
        {
            let _inner_guard = inner.lock(&interrupts);
        }
        assert!(!interrupts.enabled.get(), "inner guard must not re-enable");
        drop(outer_guard);
        assert!(interrupts.enabled.get());
        assert_eq!(interrupts.disables.get(), 2);
    }

    #[test]
    fn early_return_restores_state() {
        fn bump_if_positive(lock: &SpinLock<i32>, interrupts: &FakeInterrupts) -> Option<i32> {
            let mut guard = lock.lock(interrupts);
            if *guard < 0 {
                return None;
            }
            *guard += 1;
            Some(*guard)
        }

        let interrupts = enabled();
        let lock = SpinLock::new(-1);
        assert_eq!(bump_if_positive(&lock, &interrupts), None);
        assert!(interrupts.enabled.get());
    }

    #[test]
    fn lock_masked_keeps_interrupts_off() {
        let interrupts = enabled();
        let lock = SpinLock::new(0);
        let masked = InterruptGuard::new(&interrupts);
        let mut guard = lock.lock_masked(&masked);
        *guard = 3;
        drop(guard);
        assert!(!interrupts.enabled.get());
        let guard = lock.lock_masked(&masked);
        assert_eq!(*guard, 3);
        drop(guard);
        drop(masked);
        assert!(interrupts.enabled.get());
    }
}
