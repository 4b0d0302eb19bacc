//! Per-thread execution context and the scheduler core: `get_job`,
//! `execute`, `finish`.

use crate::job::{Job, CONTINUATION_CAPACITY};
use crate::{deque, JobSystem};
use jobsystem_core::{log_info, log_warn};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::atomic::Ordering;
use std::thread;

pub(crate) struct Context {
    pub thread_id: u16,
    pub worker: deque::Worker,
}

thread_local! {
    static CONTEXT: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };
}

/// Registers the calling thread as a participant of a job system, giving it
/// its own deque end to push onto and pop from.
///
/// # Safety
/// Must be called at most once per thread, before that thread calls any
/// other function in this module.
pub(crate) fn init_current(thread_id: u16, worker: deque::Worker) {
    let ctx = Box::new(Context { thread_id, worker });
    CONTEXT.with(|cell| {
        debug_assert!(cell.get().is_null(), "thread already registered with a job system");
        cell.set(Box::into_raw(ctx));
    });
}

fn current() -> &'static Context {
    CONTEXT.with(|cell| {
        let ptr = cell.get();
        debug_assert!(!ptr.is_null(), "current thread is not registered with a job system");
        // SAFETY: set once by `init_current` and never freed while the
        // thread is alive.
        unsafe { &*ptr }
    })
}

pub(crate) fn current_thread_id() -> u16 {
    current().thread_id
}

pub(crate) fn current_worker() -> &'static deque::Worker {
    &current().worker
}

/// Pops from the calling thread's own deque, falling back to stealing from
/// every other thread in round-robin order starting just past itself.
pub(crate) fn get_job(system: &JobSystem) -> Option<*mut Job> {
    let ctx = current();
    if let Some(job) = ctx.worker.pop() {
        return Some(job);
    }

    let n = system.num_threads();
    for i in 1..n {
        let steal_index = (ctx.thread_id as usize + i) % n;
        if steal_index == ctx.thread_id as usize {
            continue;
        }
        if let Some(job) = system.stealers[steal_index].steal() {
            return Some(job);
        }
    }
    None
}

/// Decrements the job's outstanding-work count; when it reaches zero,
/// propagates up to the parent and schedules any continuations onto the
/// executing thread's own deque.
pub(crate) fn finish(system: &JobSystem, job: *mut Job) {
    // SAFETY: `job` is a live pool slot; mutation of `function` and the
    // continuation slots below happens only after `unfinished_count` has
    // reached zero, at which point no other thread still holds a reference
    // expecting to read them.
    unsafe {
        let remaining = (*job).unfinished_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining != 0 {
            return;
        }

        (*job).function = None;

        let parent = (*job).parent;
        if !parent.is_null() {
            finish(system, parent);
        }

        let count = ((*job).continuation_count.load(Ordering::SeqCst) as usize).min(CONTINUATION_CAPACITY);
        for continuation in (*job).continuations.iter().take(count) {
            if !continuation.is_null() {
                current().worker.push(*continuation);
            }
        }

        system.wake_all();
    }
}

/// Runs a job's function with its own id and payload, then finishes it.
/// A panicking job function aborts the process: an unwind crossing the
/// dispatch boundary would leave `unfinished_count` permanently nonzero on
/// every ancestor, deadlocking anyone waiting on them.
pub(crate) fn execute(system: &JobSystem, job: *mut Job) {
    // SAFETY: `job` was returned by `get_job`, so it is a live, assigned
    // slot with `function` set.
    unsafe {
        let id = system.job_id_for(job);
        let function = (*job).function.expect("scheduled job has no function");
        let data_ptr = (*job).data.as_ptr();

        let result = panic::catch_unwind(AssertUnwindSafe(|| function(id, data_ptr)));
        if result.is_err() {
            process::abort();
        }

        finish(system, job);
    }
}

/// Entry point for a spawned worker OS thread: registers its context, then
/// loops pulling and executing jobs until the system is torn down.
pub(crate) fn worker_main(system: std::sync::Arc<JobSystem>, thread_id: u16, worker: deque::Worker) {
    jobsystem_core::thread::set_thread_name(
        thread::current().id(),
        format!("JobThread{}", thread_id),
    );
    init_current(thread_id, worker);

    log_info!("worker thread {} starting", thread_id);

    loop {
        if system.is_shutting_down() {
            break;
        }

        if let Some(job) = get_job(&system) {
            execute(&system, job);
        } else {
            system.park();
        }
    }

    log_info!("worker thread {} exiting", thread_id);
}

pub(crate) fn warn_clamped_threads(requested: usize, clamped: usize) {
    log_warn!(
        "requested {} threads, clamped to {} (hardware concurrency)",
        requested,
        clamped
    );
}
