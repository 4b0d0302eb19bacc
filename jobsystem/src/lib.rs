//! A multi-threaded, work-stealing job system with parent/child jobs and
//! continuations, plus a single-threaded fallback ([`serial`]) with the
//! identical contract.
//!
//! Jobs are plain function pointers over an inline payload
//! (`fn(JobId, *const u8)`), not closures: see [`job::Job`] for why. To
//! spawn further jobs from inside a running job (which only receives a
//! [`JobId`] and a payload pointer, not a `&JobSystem`), register the
//! system with [`initialize_global`] and call [`global`] from the job body.

mod deque;
pub mod job;
pub mod parallel_for;
mod pool;
pub mod serial;
#[cfg(test)]
mod tests;
mod worker;

pub use job::{JobFn, JobId, CONTINUATION_CAPACITY, NULL_JOB_ID, PAYLOAD_CAPACITY};
pub use parallel_for::{parallel_for, CountSplitter, ParallelForFn, Splitter};

use jobsystem_core::{log_info, log_warn};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Default number of preallocated job slots per thread pool. Must stay a
/// power of two; see [`JobSystemConfig::jobs_per_pool`].
pub const DEFAULT_JOBS_PER_POOL: usize = 2048;

/// Construction-time configuration for a [`JobSystem`].
#[derive(Clone, Debug)]
pub struct JobSystemConfig {
    /// Total number of participating threads, including the thread that
    /// constructs the system. Clamped to `1..=cpu_thread_count()`.
    pub num_threads: usize,
    /// Number of preallocated job slots per thread. Rounded up to the next
    /// power of two, and additionally capped at 2048 when the `packed-ids`
    /// feature is enabled.
    pub jobs_per_pool: usize,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            num_threads: JobSystem::cpu_thread_count(),
            jobs_per_pool: DEFAULT_JOBS_PER_POOL,
        }
    }
}

/// A stealing job system.
pub struct JobSystem {
    num_threads: usize,
    pools: Vec<pool::JobPool>,
    stealers: Vec<deque::Stealer>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    wake_condvar: Condvar,
    wake_mutex: Mutex<()>,
}

impl JobSystem {
    /// Builds a job system with the default configuration (one thread per
    /// logical CPU, including the calling thread).
    pub fn new() -> Arc<Self> {
        Self::with_config(JobSystemConfig::default())
    }

    pub fn with_config(config: JobSystemConfig) -> Arc<Self> {
        let hardware = Self::cpu_thread_count();
        let mut num_threads = config.num_threads.clamp(1, hardware);
        #[cfg(feature = "packed-ids")]
        {
            // Thread id `NULL_THREAD_ID` is reserved for `NULL_JOB_ID`, so
            // packed mode can only address `NULL_THREAD_ID` usable threads.
            num_threads = num_threads.min(job::NULL_THREAD_ID as usize);
        }
        if num_threads != config.num_threads {
            worker::warn_clamped_threads(config.num_threads, num_threads);
        }

        let mut jobs_per_pool = config.jobs_per_pool.next_power_of_two().max(2);
        #[cfg(feature = "packed-ids")]
        {
            jobs_per_pool = jobs_per_pool.min(job::MAX_POOL_SIZE);
        }

        log_info!("creating job system with {} threads", num_threads);

        let mut queues = Vec::with_capacity(num_threads);
        let mut stealers = Vec::with_capacity(num_threads);
        let mut pools = Vec::with_capacity(num_threads);
        for thread_id in 0..num_threads {
            let worker = deque::new(jobs_per_pool);
            stealers.push(worker.stealer());
            queues.push(worker);
            pools.push(pool::JobPool::new(jobs_per_pool, thread_id as u16));
        }

        let system = Arc::new(Self {
            num_threads,
            pools,
            stealers,
            threads: Mutex::new(Vec::with_capacity(num_threads.saturating_sub(1))),
            shutting_down: AtomicBool::new(false),
            wake_condvar: Condvar::new(),
            wake_mutex: Mutex::new(()),
        });

        // The calling thread always takes the highest thread id, matching
        // the convention that the main thread is the last participant.
        let main_thread_id = (num_threads - 1) as u16;
        let main_worker = queues.pop().expect("at least one thread in job system");

        let mut handles = Vec::with_capacity(queues.len());
        for (thread_id, worker) in queues.into_iter().enumerate() {
            let thread_id = thread_id as u16;
            let system = system.clone();
            let handle = thread::Builder::new()
                .name(format!("JobThread{}", thread_id))
                .spawn(move || worker::worker_main(system, thread_id, worker))
                .expect("failed to spawn job system worker thread");
            handles.push(handle);
        }
        *system.threads.lock() = handles;

        jobsystem_core::thread::set_thread_name(
            thread::current().id(),
            format!("JobThread{} (main)", main_thread_id),
        );
        worker::init_current(main_thread_id, main_worker);

        system
    }

    /// Creates a job with no payload.
    pub fn create_job(&self, function: JobFn) -> JobId {
        self.create_job_with_data(function, &[])
    }

    /// Creates a job, copying `data` (which must fit in
    /// [`PAYLOAD_CAPACITY`] bytes) into its inline payload.
    pub fn create_job_with_data(&self, function: JobFn, data: &[u8]) -> JobId {
        self.allocate_job(function, std::ptr::null_mut(), data)
    }

    /// Creates a job as a child of `parent`: `parent` cannot finish until
    /// this job (and all its own descendants) finish too.
    pub fn create_job_as_child(&self, parent: JobId, function: JobFn) -> JobId {
        self.create_job_as_child_with_data(parent, function, &[])
    }

    pub fn create_job_as_child_with_data(
        &self,
        parent: JobId,
        function: JobFn,
        data: &[u8],
    ) -> JobId {
        let parent_ptr = self.resolve(parent);
        if !parent_ptr.is_null() {
            // SAFETY: the parent job cannot be recycled while its
            // unfinished count is nonzero, which this increment keeps true.
            unsafe {
                (*parent_ptr)
                    .unfinished_count
                    .fetch_add(1, Ordering::SeqCst);
            }
        }
        self.allocate_job(function, parent_ptr, data)
    }

    fn allocate_job(&self, function: JobFn, parent: *mut job::Job, data: &[u8]) -> JobId {
        debug_assert!(data.len() <= PAYLOAD_CAPACITY, "job payload exceeds capacity");

        let thread_id = self.current_thread_id();
        let Some((ptr, _index)) = self.pools[thread_id as usize].try_acquire() else {
            return NULL_JOB_ID;
        };

        // SAFETY: this slot was just claimed from the pool this thread
        // owns, and no other thread will touch it until it is scheduled.
        unsafe {
            (*ptr).function = Some(function);
            (*ptr).parent = parent;
            (*ptr).unfinished_count = std::sync::atomic::AtomicI32::new(1);
            (*ptr).continuation_count = std::sync::atomic::AtomicU32::new(0);
            (*ptr).continuations = [std::ptr::null_mut(); CONTINUATION_CAPACITY];
            (*ptr).data[..data.len()].copy_from_slice(data);

            self.job_id_for(ptr)
        }
    }

    /// Registers `continuation` to be scheduled automatically when
    /// `ancestor` finishes. Returns `false` (without scheduling anything)
    /// if `ancestor` already has [`CONTINUATION_CAPACITY`] continuations.
    pub fn add_continuation(&self, ancestor: JobId, continuation: JobId) -> bool {
        let ancestor_ptr = self.resolve(ancestor);
        let continuation_ptr = self.resolve(continuation);
        if ancestor_ptr.is_null() || continuation_ptr.is_null() {
            return false;
        }

        // SAFETY: each successful `fetch_add` yields a unique index, so
        // concurrent callers never write the same slot.
        unsafe {
            let count = (*ancestor_ptr)
                .continuation_count
                .fetch_add(1, Ordering::SeqCst);
            if (count as usize) < CONTINUATION_CAPACITY {
                (*ancestor_ptr).continuations[count as usize] = continuation_ptr;
                true
            } else {
                (*ancestor_ptr)
                    .continuation_count
                    .fetch_sub(1, Ordering::SeqCst);
                false
            }
        }
    }

    /// Pushes `job` onto the calling thread's own queue and wakes any
    /// sleeping workers.
    pub fn run(&self, job: JobId) {
        let ptr = self.resolve(job);
        if ptr.is_null() {
            return;
        }
        self.current_worker().push(ptr);
        self.wake_all();
    }

    /// Blocks the calling thread until `job` has finished, helping drain
    /// the job graph (by running other jobs) rather than sleeping.
    pub fn wait(&self, job: JobId) {
        let ptr = self.resolve(job);
        if ptr.is_null() {
            return;
        }

        // SAFETY: reading the atomic unfinished count never races.
        while unsafe { (*ptr).unfinished_count.load(Ordering::SeqCst) } > 0 {
            if let Some(next) = worker::get_job(self) {
                worker::execute(self, next);
            } else {
                thread::yield_now();
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
        // SAFETY: `function` is only read here, never mutated concurrently
        // with this check in a way that would matter for a liveness probe.
        !ptr.is_null() && unsafe { (*ptr).function.is_some() }
    }

    /// Total number of participating threads, including the one that built
    /// this job system.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// The calling thread's id within this job system. Panics if the
    /// calling thread never registered with one (it did not build this
    /// system and is not one of its workers).
    pub fn current_thread_id(&self) -> u16 {
        worker::current_thread_id()
    }

    pub fn cpu_thread_count() -> usize {
        num_cpus::get()
    }

    fn current_worker(&self) -> &deque::Worker {
        // Only reachable through a thread registered by `with_config` or
        // `worker::worker_main`, both of which call `init_current` first.
        worker::current_worker()
    }

    #[cfg(not(feature = "packed-ids"))]
    fn resolve(&self, id: JobId) -> *mut job::Job {
        id.as_ptr()
    }

    #[cfg(feature = "packed-ids")]
    fn resolve(&self, id: JobId) -> *mut job::Job {
        if id.is_null() {
            return std::ptr::null_mut();
        }
        self.pools[id.thread_id() as usize].slot_ptr(id.pool_index())
    }

    #[cfg(not(feature = "packed-ids"))]
    fn job_id_for(&self, ptr: *mut job::Job) -> JobId {
        JobId::from_ptr(ptr)
    }

    #[cfg(feature = "packed-ids")]
    fn job_id_for(&self, ptr: *mut job::Job) -> JobId {
        // SAFETY: `self_id` is written once at pool construction and never
        // mutated afterward.
        JobId::from_raw(unsafe { (*ptr).self_id })
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn wake_all(&self) {
        self.wake_condvar.notify_all();
    }

    fn park(&self) {
        let mut guard = self.wake_mutex.lock();
        // A short timeout bounds how long a worker can sleep through a
        // wake notification it raced with missing.
        self.wake_condvar
            .wait_for(&mut guard, std::time::Duration::from_millis(10));
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.wake_condvar.notify_all();

        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            while !handle.is_finished() {
                self.wake_condvar.notify_all();
            }
            let _ = handle.join();
        }

        log_info!("job system torn down");
    }
}

static GLOBAL_JOB_SYSTEM: OnceCell<Arc<JobSystem>> = OnceCell::new();

/// Returns the process-wide job system registered with
/// [`initialize_global`].
///
/// Because job functions only receive a [`JobId`] and a payload pointer
/// (no `&JobSystem`), spawning further jobs from inside a running job goes
/// through this global accessor rather than a parameter.
///
/// # Panics
/// Panics if no job system has been registered yet.
pub fn global() -> &'static Arc<JobSystem> {
    GLOBAL_JOB_SYSTEM
        .get()
        .expect("global job system was not initialized")
}

pub fn initialize_global(system: Arc<JobSystem>) {
    GLOBAL_JOB_SYSTEM
        .set(system)
        .unwrap_or_else(|_| {
            log_warn!("global job system was already initialized");
        });
}
