//! Blocking synchronization primitives shared by the directory and the queue.
//!
//! - `Semaphore`: a counting semaphore whose permits may be released by a
//!   thread other than the one that acquired them.
//! - `ReaderPreferringLock`: a shared/exclusive lock built from two gates,
//!   where readers never wait for each other.
//!
//! ## Reader preference
//!
//! The first reader to arrive takes the writer gate on behalf of every
//! reader, and the last reader to leave hands it back. As long as at least
//! one reader holds the lock, new readers walk straight in, so a continuous
//! stream of lookups can delay an insert or remove indefinitely. This
//! starvation is part of the contract of `ClientDirectory`.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

/// Counting semaphore backed by a mutex and condition variable.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `permits` initial permits.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Take one permit, blocking while none are available.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Return one permit and wake a single waiter.
    pub fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        drop(permits);
        self.available.notify_one();
    }

    /// Number of permits currently available.
    pub fn available(&self) -> usize {
        *self.permits.lock()
    }
}

/// Reader-preferring shared/exclusive lock.
///
/// The raw `acquire_*`/`release_*` calls are exposed for callers that need
/// to hold the gate across a scope they manage themselves; `read()` and
/// `write()` wrap them in RAII guards.
pub struct ReaderPreferringLock<T> {
    /// Number of readers currently inside, guarded by its own mutex.
    readers: Mutex<usize>,
    /// Held by a writer, or by the reader group as a whole.
    writer: Semaphore,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by the gates: shared references are
// only handed out while the reader group holds `writer`, and a mutable
// reference only while a single writer holds it.
unsafe impl<T: Send> Send for ReaderPreferringLock<T> {}
unsafe impl<T: Send + Sync> Sync for ReaderPreferringLock<T> {}

impl<T> ReaderPreferringLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            readers: Mutex::new(0),
            writer: Semaphore::new(1),
            data: UnsafeCell::new(data),
        }
    }

    /// Enter as a reader. The first reader in takes the writer gate.
    pub fn acquire_read(&self) {
        let mut readers = self.readers.lock();
        *readers += 1;
        if *readers == 1 {
            // Later readers queue on `readers` until the gate is ours.
            self.writer.acquire();
        }
    }

    /// Leave as a reader. The last reader out releases the writer gate.
    pub fn release_read(&self) {
        let mut readers = self.readers.lock();
        *readers -= 1;
        if *readers == 0 {
            self.writer.release();
        }
    }

    pub fn acquire_write(&self) {
        self.writer.acquire();
    }

    pub fn release_write(&self) {
        self.writer.release();
    }

    /// Acquire shared access.
    pub fn read(&self) -> ReadGuard<'_, T> {
        self.acquire_read();
        ReadGuard { lock: self }
    }

    /// Acquire exclusive access.
    pub fn write(&self) -> WriteGuard<'_, T> {
        self.acquire_write();
        WriteGuard { lock: self }
    }

    /// Number of readers currently holding the lock.
    #[cfg(test)]
    pub fn reader_count(&self) -> usize {
        *self.readers.lock()
    }
}

/// Shared access to the data of a `ReaderPreferringLock`.
pub struct ReadGuard<'a, T> {
    lock: &'a ReaderPreferringLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the reader group holds the writer gate for our lifetime.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive access to the data of a `ReaderPreferringLock`.
pub struct WriteGuard<'a, T> {
    lock: &'a ReaderPreferringLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the writer gate exclusively.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the writer gate exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_semaphore_counts() {
        let sem = Semaphore::new(2);
        sem.acquire();
        sem.acquire();
        assert_eq!(sem.available(), 0);
        sem.release();
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn test_semaphore_release_from_other_thread() {
        let sem = Arc::new(Semaphore::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let waiter = {
            let sem = Arc::clone(&sem);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                sem.acquire();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        sem.release();
        waiter.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn test_readers_do_not_block_readers() {
        let lock = Arc::new(ReaderPreferringLock::new(7u32));
        let first = lock.read();

        let (tx, rx) = mpsc::channel();
        let other = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let guard = lock.read();
                tx.send(*guard).unwrap();
            })
        };

        // The second reader gets in while the first still holds the lock.
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        other.join().unwrap();
        assert_eq!(*first, 7);
        drop(first);
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let lock = Arc::new(ReaderPreferringLock::new(Vec::<u32>::new()));
        let reader = lock.read();

        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.write().push(1);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(reader.is_empty());
        drop(reader);

        writer.join().unwrap();
        assert_eq!(*lock.read(), vec![1]);
    }

    #[test]
    fn test_overlapping_readers_starve_writer() {
        let lock = Arc::new(ReaderPreferringLock::new(0u32));
        let written = Arc::new(AtomicBool::new(false));

        let mut held = lock.read();
        let writer = {
            let lock = Arc::clone(&lock);
            let written = Arc::clone(&written);
            thread::spawn(move || {
                *lock.write() = 1;
                written.store(true, Ordering::SeqCst);
            })
        };

        // Hand the read side from one guard to the next without ever letting
        // the reader count drop to zero.
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(20));
            let next = lock.read();
            drop(held);
            held = next;
            assert!(!written.load(Ordering::SeqCst));
        }

        drop(held);
        writer.join().unwrap();
        assert_eq!(*lock.read(), 1);
    }

    #[test]
    fn test_concurrent_writers_are_exclusive() {
        let lock = Arc::new(ReaderPreferringLock::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.write() += 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.read(), 8000);
    }
}
