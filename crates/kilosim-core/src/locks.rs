//! Low-level synchronization: a futex-backed manual lock and the
//! sentinel-word primitive the phase barrier blocks on.
//!
//! [`FutexLock`] is deliberately not RAII. Coherence accesses hand lock
//! ownership across call frames (a parent releases its child's lock on
//! entry and reacquires it before releasing its own), which a scoped guard
//! cannot express. On Linux both primitives sleep in the kernel via
//! `futex(2)`; elsewhere they fall back to spinning with yields, which is
//! enough for tests but not for production runs.

use std::sync::atomic::{AtomicU32, Ordering};

/// Waits time out after this many seconds; we die rather than deadlock.
const TIMEOUT_SECS: i64 = 20;
/// Consecutive timeouts tolerated before giving up.
const MAX_TIMEOUTS: u32 = 10;

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32, timed: bool) -> i64 {
    let ts = libc::timespec {
        tv_sec: TIMEOUT_SECS,
        tv_nsec: 0,
    };
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            if timed { &ts as *const libc::timespec } else { std::ptr::null() },
            0usize,
            0u32,
        ) as i64
    }
}

#[cfg(target_os = "linux")]
fn futex_wake(word: &AtomicU32, count: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
            0usize,
            0usize,
            0u32,
        );
    }
}

/// A mutex with explicit `lock`/`unlock`, in the classic three-state futex
/// formulation (0 free, 1 held, 2 held with waiters).
#[derive(Debug, Default)]
pub struct FutexLock {
    word: AtomicU32,
}

impl FutexLock {
    pub const fn new() -> Self {
        FutexLock {
            word: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) {
        if self
            .word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_contended();
    }

    #[cfg(target_os = "linux")]
    fn lock_contended(&self) {
        loop {
            // Mark contended; if the lock was actually free, we own it now.
            if self.word.swap(2, Ordering::Acquire) == 0 {
                return;
            }
            futex_wait(&self.word, 2, false);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn lock_contended(&self) {
        let mut spins = 0u32;
        while self
            .word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins > 64 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    pub fn unlock(&self) {
        let prev = self.word.swap(0, Ordering::Release);
        debug_assert_ne!(prev, 0, "unlock of a free FutexLock");
        #[cfg(target_os = "linux")]
        if prev == 2 {
            futex_wake(&self.word, 1);
        }
    }

    /// Run `f` with the lock held. Convenience for callers that do not
    /// need manual hand-over-hand transfer.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let r = f();
        self.unlock();
        r
    }
}

/// The barrier's per-thread sentinel word.
///
/// Protocol: the scheduler arms the word to 1 before the thread blocks; the
/// waker CASes it 1 → 0 (a failed CAS means a wakeup race, which is a bug)
/// and then wakes the sleeper. Spuriously woken sleepers re-check the word
/// and go back to sleep while it still reads 1.
#[derive(Debug, Default)]
pub struct FutexWord {
    word: AtomicU32,
}

impl FutexWord {
    pub const fn new() -> Self {
        FutexWord {
            word: AtomicU32::new(0),
        }
    }

    /// Arm the sentinel: the owning thread must block until cleared.
    pub fn arm(&self) {
        self.word.store(1, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.word.load(Ordering::SeqCst) == 1
    }

    /// Clear the sentinel (1 → 0) and wake the sleeping owner. Panics if
    /// the word was not armed: two wakers raced, which the scheduler lock
    /// is supposed to rule out.
    pub fn clear_and_wake(&self) {
        if self
            .word
            .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            panic!("wakeup race on barrier sentinel word");
        }
        #[cfg(target_os = "linux")]
        futex_wake(&self.word, 1);
    }

    /// Block the calling thread while the word reads 1. `who` is reported
    /// if the wait times out fatally.
    pub fn wait_while_armed(&self, who: u32) {
        let mut timeouts = 0u32;
        loop {
            if self.word.load(Ordering::SeqCst) != 1 {
                return;
            }
            #[cfg(target_os = "linux")]
            {
                let res = futex_wait(&self.word, 1, true);
                if res == 0 || self.word.load(Ordering::SeqCst) != 1 {
                    return;
                }
                let err = std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(0);
                if err == libc::ETIMEDOUT {
                    timeouts += 1;
                    if timeouts >= MAX_TIMEOUTS {
                        panic!(
                            "thread {who} stuck on barrier sentinel for {}s, dying",
                            TIMEOUT_SECS * MAX_TIMEOUTS as i64
                        );
                    }
                    log::warn!("thread {who} futex wait timed out ({timeouts}/{MAX_TIMEOUTS})");
                }
                // EINTR / EAGAIN: loop and re-check the word.
            }
            #[cfg(not(target_os = "linux"))]
            {
                timeouts += 1;
                if timeouts > 1_000_000 * MAX_TIMEOUTS {
                    panic!("thread {who} stuck on barrier sentinel, dying");
                }
                std::thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_excludes() {
        let lock = Arc::new(FutexLock::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    lock.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    lock.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 40_000);
    }

    #[test]
    fn sentinel_blocks_until_cleared() {
        let word = Arc::new(FutexWord::new());
        word.arm();
        let w = Arc::clone(&word);
        let h = thread::spawn(move || {
            w.wait_while_armed(0);
            true
        });
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(word.is_armed());
        word.clear_and_wake();
        assert!(h.join().unwrap());
    }

    #[test]
    #[should_panic(expected = "wakeup race")]
    fn double_wake_panics() {
        let word = FutexWord::new();
        word.arm();
        word.clear_and_wake();
        word.clear_and_wake();
    }
}
