//! A single-threaded job system with the exact same public contract as
//! [`crate::JobSystem`], used for tests and as a fallback where spawning
//! worker threads isn't desired.
//!
//! Grounded on the original engine's serial variant, with two corrections
//! noted there as open problems: continuations here write to
//! `continuations[count]` (the original serial variant had an off-by-one,
//! writing `continuations[count - 1]`, that the multi-threaded variant did
//! not share), and `finish()` here actually dispatches continuations,
//! which the original serial variant left commented out.

use crate::job::{Job, JobFn, JobId, CONTINUATION_CAPACITY, NULL_JOB_ID, PAYLOAD_CAPACITY};
use crate::pool::JobPool;
use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

pub struct SerialJobSystem {
    pool: JobPool,
    queue: RefCell<Vec<*mut Job>>,
}

impl Default for SerialJobSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialJobSystem {
    pub fn new() -> Self {
        Self {
            pool: JobPool::new(crate::DEFAULT_JOBS_PER_POOL, 0),
            queue: RefCell::new(Vec::new()),
        }
    }

    pub fn create_job(&self, function: JobFn) -> JobId {
        self.create_job_with_data(function, &[])
    }

    pub fn create_job_with_data(&self, function: JobFn, data: &[u8]) -> JobId {
        self.allocate_job(function, std::ptr::null_mut(), data)
    }

    pub fn create_job_as_child(&self, parent: JobId, function: JobFn) -> JobId {
        self.create_job_as_child_with_data(parent, function, &[])
    }

    pub fn create_job_as_child_with_data(&self, parent: JobId, function: JobFn, data: &[u8]) -> JobId {
        let parent_ptr = self.resolve(parent);
        if !parent_ptr.is_null() {
            // SAFETY: single-threaded; no concurrent mutation of this job.
            unsafe {
                (*parent_ptr).unfinished_count.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.allocate_job(function, parent_ptr, data)
    }

    fn allocate_job(&self, function: JobFn, parent: *mut Job, data: &[u8]) -> JobId {
        debug_assert!(data.len() <= PAYLOAD_CAPACITY, "job payload exceeds capacity");

        let Some((ptr, _index)) = self.pool.try_acquire() else {
            return NULL_JOB_ID;
        };

        // SAFETY: this slot was just claimed from the only pool this
        // system owns.
        unsafe {
            (*ptr).function = Some(function);
            (*ptr).parent = parent;
            (*ptr).unfinished_count = AtomicI32::new(1);
            (*ptr).continuation_count = AtomicU32::new(0);
            (*ptr).continuations = [std::ptr::null_mut(); CONTINUATION_CAPACITY];
            (*ptr).data[..data.len()].copy_from_slice(data);

            self.job_id_for(ptr)
        }
    }

    pub fn add_continuation(&self, ancestor: JobId, continuation: JobId) -> bool {
        let ancestor_ptr = self.resolve(ancestor);
        let continuation_ptr = self.resolve(continuation);
        if ancestor_ptr.is_null() || continuation_ptr.is_null() {
            return false;
        }

        // SAFETY: single-threaded; no concurrent mutation of this job.
        unsafe {
            let count = (*ancestor_ptr).continuation_count.fetch_add(1, Ordering::SeqCst);
            if (count as usize) < CONTINUATION_CAPACITY {
                (*ancestor_ptr).continuations[count as usize] = continuation_ptr;
                true
            } else {
                (*ancestor_ptr).continuation_count.fetch_sub(1, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn run(&self, job: JobId) {
        let ptr = self.resolve(job);
        if ptr.is_null() {
            return;
        }
        self.queue.borrow_mut().push(ptr);
    }

    pub fn wait(&self, job: JobId) {
        let ptr = self.resolve(job);
        if ptr.is_null() {
            return;
        }

        // SAFETY: reading the atomic unfinished count never races.
        while unsafe { (*ptr).unfinished_count.load(Ordering::SeqCst) } > 0 {
            if let Some(next) = self.pop() {
                self.execute(next);
            }
        }
    }

    pub fn unfinished_jobs(&self, job: JobId) -> i32 {
        let ptr = self.resolve(job);
        if ptr.is_null() {
            0
        } else {
            // SAFETY: reading the atomic unfinished count never races.
            unsafe { (*ptr).unfinished_count.load(Ordering::SeqCst) }
        }
    }

    pub fn is_valid(&self, job: JobId) -> bool {
        let ptr = self.resolve(job);
        !ptr.is_null() && unsafe { (*ptr).function.is_some() }
    }

    fn pop(&self) -> Option<*mut Job> {
        self.queue.borrow_mut().pop()
    }

    fn execute(&self, job: *mut Job) {
        // SAFETY: `job` came off the queue, so it is a live, assigned slot.
        unsafe {
            let id = self.job_id_for(job);
            let function = (*job).function.expect("scheduled job has no function");
            let data_ptr = (*job).data.as_ptr();
            function(id, data_ptr);
            self.finish(job);
        }
    }

    fn finish(&self, job: *mut Job) {
        // SAFETY: see `execute`; mutation of `function` and continuation
        // slots happens only once `unfinished_count` has reached zero.
        unsafe {
            let remaining = (*job).unfinished_count.fetch_sub(1, Ordering::SeqCst) - 1;
            if remaining != 0 {
                return;
            }

            (*job).function = None;

            let parent = (*job).parent;
            if !parent.is_null() {
                self.finish(parent);
            }

            let count = ((*job).continuation_count.load(Ordering::SeqCst) as usize)
                .min(CONTINUATION_CAPACITY);
            for continuation in (*job).continuations.iter().take(count) {
                if !continuation.is_null() {
                    self.queue.borrow_mut().push(*continuation);
                }
            }
        }
    }

    #[cfg(not(feature = "packed-ids"))]
    fn resolve(&self, id: JobId) -> *mut Job {
        id.as_ptr()
    }

    #[cfg(feature = "packed-ids")]
    fn resolve(&self, id: JobId) -> *mut Job {
        if id.is_null() {
            return std::ptr::null_mut();
        }
        self.pool.slot_ptr(id.pool_index())
    }

    #[cfg(not(feature = "packed-ids"))]
    fn job_id_for(&self, ptr: *mut Job) -> JobId {
        JobId::from_ptr(ptr)
    }

    #[cfg(feature = "packed-ids")]
    fn job_id_for(&self, ptr: *mut Job) -> JobId {
        // SAFETY: `self_id` is written once at pool construction.
        JobId::from_raw(unsafe { (*ptr).self_id })
    }
}
