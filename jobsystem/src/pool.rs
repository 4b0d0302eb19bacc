//! Per-thread job pool: a fixed ring buffer of preallocated [`Job`] slots.
//!
//! Each worker thread (and the calling "main" thread) owns exactly one
//! `JobPool`, from which it alone allocates. Other threads only ever read
//! pool slots through raw pointers resolved from a `JobId`, never allocate
//! from a pool they do not own.

use crate::job::Job;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct JobPool {
    mask: usize,
    slots: Box<[UnsafeCell<Job>]>,
    next: AtomicUsize,
}

impl JobPool {
    /// `thread_id` is only meaningful (and only used) when the
    /// `packed-ids` feature is enabled, to precompute each slot's packed id.
    pub fn new(capacity: usize, thread_id: u16) -> Self {
        assert!(capacity.is_power_of_two(), "pool capacity must be a power of two");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(Job::empty()));

        #[cfg(feature = "packed-ids")]
        {
            for (i, slot) in slots.iter().enumerate() {
                // SAFETY: slots are freshly created and not yet shared.
                unsafe {
                    (*slot.get()).self_id = crate::job::JobId::pack(thread_id, i as u16).into_raw();
                }
            }
        }

        Self {
            mask: capacity - 1,
            slots: slots.into_boxed_slice(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.mask + 1
    }

    /// Resolves a pool index (as packed into a `JobId`) back to the slot
    /// pointer. Valid from any thread; the pointer is only safe to
    /// dereference mutably by the slot's owning thread.
    pub fn slot_ptr(&self, index: u16) -> *mut Job {
        self.slots[index as usize & self.mask].get()
    }

    /// Claims the next slot in round-robin order. Returns `None` if that
    /// slot is still occupied by an unfinished job, matching the pool's
    /// wraparound contract: allocation simply fails rather than blocking or
    /// overwriting live state.
    ///
    /// # Safety
    /// Must only be called by the thread that owns this pool.
    pub fn try_acquire(&self) -> Option<(*mut Job, u16)> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) & self.mask;
        let ptr = self.slots[index].get();
        // SAFETY: only the owning thread ever calls `try_acquire`, and reads
        // here are limited to the atomic finished-state check.
        let slot = unsafe { &*ptr };
        if slot.is_free() {
            Some((ptr, index as u16))
        } else {
            None
        }
    }
}

// Slots are mutated only by their owning thread; cross-thread access is
// limited to reading the atomic fields through a resolved pointer.
unsafe impl Sync for JobPool {}
