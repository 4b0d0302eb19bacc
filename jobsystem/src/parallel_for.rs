//! A `parallel_for` driver built out of [`JobSystem::create_job_as_child`]:
//! a range is recursively halved into child jobs until a [`Splitter`]
//! policy decides a chunk is small enough to run in place.

use crate::{global, JobId, PAYLOAD_CAPACITY};
use std::mem::size_of;

/// Decides whether a range of `count` elements should still be split in
/// two rather than processed directly.
pub trait Splitter: Copy + Send + 'static {
    fn should_split(&self, count: usize) -> bool;
}

/// Splits as long as a chunk holds more than `threshold` elements.
#[derive(Copy, Clone)]
pub struct CountSplitter {
    threshold: usize,
}

impl CountSplitter {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }
}

impl Splitter for CountSplitter {
    fn should_split(&self, count: usize) -> bool {
        count > self.threshold
    }
}

/// The function applied to each leaf chunk once a `Splitter` decides it is
/// small enough.
pub type ParallelForFn<T> = fn(&mut [T]);

#[repr(C)]
struct Range<T, S: Splitter> {
    ptr: *mut T,
    count: usize,
    splitter: S,
    func: ParallelForFn<T>,
}

fn as_bytes<T>(value: &T) -> &[u8] {
    // SAFETY: `T` here is always a `#[repr(C)]`, plain-data `Range<T, S>`.
    unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), size_of::<T>()) }
}

fn parallel_for_job<T: Send + 'static, S: Splitter>(id: JobId, data: *const u8) {
    // SAFETY: this function is only ever installed as the job function for
    // a payload written by `parallel_for` or by itself, below.
    let range = unsafe { &*data.cast::<Range<T, S>>() };

    if range.splitter.should_split(range.count) {
        let left_count = range.count / 2;
        let right_count = range.count - left_count;

        let left = Range {
            ptr: range.ptr,
            count: left_count,
            splitter: range.splitter,
            func: range.func,
        };
        // SAFETY: `left_count <= range.count`, so this stays within the
        // original slice.
        let right_ptr = unsafe { range.ptr.add(left_count) };
        let right = Range {
            ptr: right_ptr,
            count: right_count,
            splitter: range.splitter,
            func: range.func,
        };

        let system = global();
        let left_job =
            system.create_job_as_child_with_data(id, parallel_for_job::<T, S>, as_bytes(&left));
        let right_job =
            system.create_job_as_child_with_data(id, parallel_for_job::<T, S>, as_bytes(&right));
        system.run(left_job);
        system.run(right_job);
    } else {
        // SAFETY: `range.ptr`/`range.count` describe a subrange of the
        // slice `parallel_for` was called with, which outlives this job
        // because the caller waits on the root job before returning.
        let slice = unsafe { std::slice::from_raw_parts_mut(range.ptr, range.count) };
        (range.func)(slice);
    }
}

/// Runs `func` over disjoint chunks of `data` in parallel, splitting chunks
/// according to `splitter` until they are small enough to run directly.
/// Blocks the calling thread until every chunk has completed.
pub fn parallel_for<T: Send + 'static, S: Splitter>(data: &mut [T], func: ParallelForFn<T>, splitter: S) {
    debug_assert!(
        size_of::<Range<T, S>>() <= PAYLOAD_CAPACITY,
        "parallel_for range descriptor exceeds job payload capacity"
    );

    if data.is_empty() {
        return;
    }

    let system = global();
    let root = Range {
        ptr: data.as_mut_ptr(),
        count: data.len(),
        splitter,
        func,
    };
    let root_id = system.create_job_with_data(parallel_for_job::<T, S>, as_bytes(&root));
    system.run(root_id);
    system.wait(root_id);
}
