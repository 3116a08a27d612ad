//! OS thread affinity for namespace operations
//!
//! Switching network namespace affects only the calling OS thread, so every
//! step of one cross-connect operation must run on the same thread and no
//! other operation may interleave on it. `ThreadAffinity` marks the current
//! thread as owned for the lifetime of the guard. The guard cannot be sent to
//! another thread.

use std::cell::Cell;
use std::marker::PhantomData;
use thiserror::Error;

thread_local! {
    static PINNED: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("current thread is already pinned by another namespace operation")]
pub struct AlreadyPinned;

/// Exclusive claim on the current OS thread
#[derive(Debug)]
pub struct ThreadAffinity {
    _not_send: PhantomData<*const ()>,
}

impl ThreadAffinity {
    /// Claim the current thread; nested claims are refused
    pub fn acquire() -> Result<Self, AlreadyPinned> {
        PINNED.with(|pinned| {
            if pinned.replace(true) {
                return Err(AlreadyPinned);
            }
            Ok(Self {
                _not_send: PhantomData,
            })
        })
    }

    pub fn is_pinned() -> bool {
        PINNED.with(Cell::get)
    }
}

impl Drop for ThreadAffinity {
    fn drop(&mut self) {
        PINNED.with(|pinned| pinned.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_acquire_is_refused() {
        let guard = ThreadAffinity::acquire().unwrap();
        assert!(ThreadAffinity::is_pinned());
        assert_eq!(ThreadAffinity::acquire().unwrap_err(), AlreadyPinned);

        drop(guard);
        assert!(!ThreadAffinity::is_pinned());
        let _again = ThreadAffinity::acquire().unwrap();
    }

    #[test]
    fn test_pins_are_per_thread() {
        let _guard = ThreadAffinity::acquire().unwrap();
        let other = std::thread::spawn(|| ThreadAffinity::acquire().map(drop))
            .join()
            .unwrap();
        assert!(other.is_ok());
    }
}
