//! A fixed-capacity, single-producer/multi-consumer work-stealing deque.
//!
//! The owning thread pushes and pops from the bottom (LIFO); any other
//! thread may steal from the top (FIFO). Ported from the Chase-Lev
//! algorithm, the same one `JobQueue` in the original engine implements,
//! but sized to a fixed ring buffer instead of the resizable buffer some
//! older Rust implementations of this algorithm use.

use crate::job::Job;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

struct Buffer {
    mask: isize,
    slots: Box<[UnsafeCell<*mut Job>]>,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "deque capacity must be a power of two");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(std::ptr::null_mut()));
        Self {
            mask: capacity as isize - 1,
            slots: slots.into_boxed_slice(),
        }
    }

    unsafe fn write(&self, index: isize, job: *mut Job) {
        (*self.slots[(index & self.mask) as usize].get()) = job;
    }

    unsafe fn read(&self, index: isize) -> *mut Job {
        *self.slots[(index & self.mask) as usize].get()
    }
}

// The buffer's slots are only ever written by the deque owner (push/pop)
// and read by the owner or a thief after winning the top-index CAS race,
// which is exactly the synchronization the Chase-Lev algorithm relies on.
unsafe impl Sync for Buffer {}

struct Inner {
    // Padded apart: `top` is hammered by thieves on every steal attempt,
    // `bottom` by the owner on every push/pop. Sharing a cache line between
    // them would turn independent-thread traffic into contention.
    top: CachePadded<AtomicIsize>,
    bottom: CachePadded<AtomicIsize>,
    buffer: Buffer,
}

/// The owning end of the deque. Not `Sync`: only the owning thread may hold
/// and use a `Worker`.
pub struct Worker {
    inner: Arc<Inner>,
}

/// A cloneable, shareable end of the deque usable from any thread to steal
/// from the owner.
#[derive(Clone)]
pub struct Stealer {
    inner: Arc<Inner>,
}

/// Creates a fixed-capacity deque, returning its owning `Worker` end. Call
/// [`Worker::stealer`] to hand out `Stealer`s to other threads.
pub fn new(capacity: usize) -> Worker {
    Worker {
        inner: Arc::new(Inner {
            top: CachePadded::new(AtomicIsize::new(0)),
            bottom: CachePadded::new(AtomicIsize::new(0)),
            buffer: Buffer::new(capacity),
        }),
    }
}

impl Worker {
    pub fn stealer(&self) -> Stealer {
        Stealer {
            inner: self.inner.clone(),
        }
    }

    /// Pushes a job onto the bottom of the deque.
    ///
    /// # Safety
    /// The caller must not push more jobs than the deque's capacity allows
    /// without intervening pops/steals; doing so silently overwrites a slot
    /// still reachable by a concurrent steal.
    pub fn push(&self, job: *mut Job) {
        let b = self.inner.bottom.load(Ordering::Relaxed);
        unsafe {
            self.inner.buffer.write(b, job);
        }
        // The write above must be visible before bottom is published.
        self.inner.bottom.store(b + 1, Ordering::Release);
    }

    /// Pops a job from the bottom of the deque (LIFO), returning `None` if
    /// it is empty or lost a race against a concurrent steal on the last
    /// element.
    pub fn pop(&self) -> Option<*mut Job> {
        let b = self.inner.bottom.load(Ordering::Relaxed) - 1;
        self.inner.bottom.store(b, Ordering::Relaxed);

        // Full fence between the bottom store above and the top load
        // below: a self-CAS on bottom, matching the original's
        // compiler-barrier-plus-x86-TSO trick, expressed portably.
        let top_before = self.inner.top.load(Ordering::Relaxed);
        let _ = self.inner.top.compare_exchange(
            top_before,
            top_before,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        let t = self.inner.top.load(Ordering::Relaxed);
        if t <= b {
            let job = unsafe { self.inner.buffer.read(b) };
            if t != b {
                return Some(job);
            }

            // Last element: race against any concurrent steal.
            let won = self
                .inner
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            self.inner.bottom.store(t + 1, Ordering::Relaxed);
            if won {
                Some(job)
            } else {
                None
            }
        } else {
            // Already empty.
            self.inner.bottom.store(t, Ordering::Relaxed);
            None
        }
    }
}

// SAFETY: a `Worker` is only ever used by a single owning thread (this is
// a discipline enforced by `jobsystem::worker`, not by the type itself),
// but the `Arc<Inner>` it wraps is safe to move to the thread that will own
// it.
unsafe impl Send for Worker {}

impl Stealer {
    /// Steals a job from the top of the deque (FIFO), returning `None` if
    /// it is empty or lost a race against the owner's `pop` or another
    /// thief.
    pub fn steal(&self) -> Option<*mut Job> {
        let t = self.inner.top.load(Ordering::Acquire);
        let b = self.inner.bottom.load(Ordering::Acquire);
        if t < b {
            let job = unsafe { self.inner.buffer.read(t) };
            if self
                .inner
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                Some(job)
            } else {
                None
            }
        } else {
            None
        }
    }
}

unsafe impl Send for Stealer {}
unsafe impl Sync for Stealer {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn sentinel(n: usize) -> *mut Job {
        (n | 1) as *mut Job
    }

    #[test]
    fn push_pop_lifo_single_thread() {
        let w = new(16);
        for i in 1..=4 {
            w.push(sentinel(i * 2));
        }
        assert_eq!(w.pop(), Some(sentinel(8)));
        assert_eq!(w.pop(), Some(sentinel(6)));
        assert_eq!(w.pop(), Some(sentinel(4)));
        assert_eq!(w.pop(), Some(sentinel(2)));
        assert_eq!(w.pop(), None);
    }

    #[test]
    fn steal_is_fifo_and_exhaustive_with_owner() {
        let w = new(1024);
        let s = w.stealer();
        const N: usize = 500;
        for i in 0..N {
            w.push(sentinel(i * 2 + 2));
        }

        let stolen = AtomicUsize::new(0);
        let popped = AtomicUsize::new(0);
        thread::scope(|scope| {
            scope.spawn(|| {
                while stolen.load(Ordering::Relaxed) + popped.load(Ordering::Relaxed) < N {
                    if s.steal().is_some() {
                        stolen.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
            while stolen.load(Ordering::Relaxed) + popped.load(Ordering::Relaxed) < N {
                if w.pop().is_some() {
                    popped.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        assert_eq!(stolen.load(Ordering::Relaxed) + popped.load(Ordering::Relaxed), N);
    }
}
