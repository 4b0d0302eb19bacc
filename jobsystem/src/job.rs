use std::fmt::{self, Debug, Formatter};
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU32};

/// Payload bytes available to a job's closure/data, inline in the `Job` record.
pub const PAYLOAD_CAPACITY: usize = 52;
/// Maximum number of continuations a single job can carry.
pub const CONTINUATION_CAPACITY: usize = 6;

/// A job's entry point: given its own id and a pointer to its inline payload.
pub type JobFn = fn(JobId, *const u8);

/// A single unit of work in the graph.
///
/// Laid out to occupy a full cache line (128 bytes) so that two jobs living
/// in neighboring pool slots never cause false sharing between the threads
/// that own them.
#[repr(align(128))]
pub struct Job {
    pub(crate) function: Option<JobFn>,
    /// Non-owning back reference to the parent job, null when there is none.
    pub(crate) parent: *mut Job,
    pub(crate) unfinished_count: AtomicI32,
    pub(crate) data: [u8; PAYLOAD_CAPACITY],
    pub(crate) continuation_count: AtomicU32,
    /// Written once per successful `add_continuation` call, each index owned
    /// by whichever caller won the `fetch_add` on `continuation_count`.
    pub(crate) continuations: [*mut Job; CONTINUATION_CAPACITY],
    #[cfg(feature = "packed-ids")]
    pub(crate) self_id: u16,
}

impl Debug for Job {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("unfinished_count", &self.unfinished_count)
            .field("continuation_count", &self.continuation_count)
            .finish()
    }
}

impl Job {
    pub(crate) fn empty() -> Self {
        Self {
            function: None,
            parent: ptr::null_mut(),
            unfinished_count: AtomicI32::new(0),
            data: [0; PAYLOAD_CAPACITY],
            continuation_count: AtomicU32::new(0),
            continuations: [ptr::null_mut(); CONTINUATION_CAPACITY],
            #[cfg(feature = "packed-ids")]
            self_id: 0,
        }
    }

    /// A pool slot is free for reuse once its function pointer has been
    /// cleared by `finish()` and its refcount of outstanding work is zero.
    pub(crate) fn is_free(&self) -> bool {
        self.function.is_none()
    }
}

// Mutation of a `Job` is only ever performed by the thread that currently
// owns it (its creator, or the worker executing it); cross-thread reads are
// limited to the atomics. Jobs are moved between threads only as raw
// pointers, never as owned values, so this mirrors the single-writer
// discipline the rest of the scheduler relies on.
unsafe impl Send for Job {}
unsafe impl Sync for Job {}

#[cfg(not(feature = "packed-ids"))]
mod repr {
    use super::Job;

    /// Opaque handle to a job. In this build it wraps a raw pointer to the
    /// job's pool slot directly.
    #[derive(Copy, Clone, PartialEq, Eq, Hash)]
    pub struct JobId(*mut Job);

    pub const NULL_JOB_ID: JobId = JobId(std::ptr::null_mut());

    impl JobId {
        pub(crate) fn from_ptr(ptr: *mut Job) -> Self {
            JobId(ptr)
        }

        pub(crate) fn as_ptr(self) -> *mut Job {
            self.0
        }

        pub fn is_null(self) -> bool {
            self.0.is_null()
        }
    }

    impl std::fmt::Debug for JobId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "JobId({:p})", self.0)
        }
    }

    unsafe impl Send for JobId {}
    unsafe impl Sync for JobId {}
}

#[cfg(feature = "packed-ids")]
mod repr {
    const THREAD_ID_BITS: u32 = 5;
    const POOL_INDEX_BITS: u32 = 11;
    const POOL_INDEX_MASK: u16 = (1u16 << POOL_INDEX_BITS) - 1;

    /// Thread id 31 is never assigned to a real worker; it is reserved so
    /// `NULL_JOB_ID` has a bit pattern distinct from any live job, capping
    /// packed-id mode at 31 participating threads rather than 32.
    pub const NULL_THREAD_ID: u16 = (1u16 << THREAD_ID_BITS) - 1;
    pub const MAX_POOL_SIZE: usize = 1 << POOL_INDEX_BITS;

    /// Opaque handle to a job, packed into 16 bits: 5 bits thread id, 11
    /// bits pool index.
    #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
    pub struct JobId(u16);

    pub const NULL_JOB_ID: JobId = JobId((NULL_THREAD_ID as u16) << POOL_INDEX_BITS);

    impl JobId {
        pub(crate) fn pack(thread_id: u16, pool_index: u16) -> Self {
            debug_assert!(thread_id < NULL_THREAD_ID, "thread id exceeds packed-id range");
            debug_assert!(pool_index <= POOL_INDEX_MASK, "pool index exceeds packed-id range");
            JobId((thread_id << POOL_INDEX_BITS) | pool_index)
        }

        pub(crate) fn thread_id(self) -> u16 {
            self.0 >> POOL_INDEX_BITS
        }

        pub(crate) fn pool_index(self) -> u16 {
            self.0 & POOL_INDEX_MASK
        }

        pub(crate) fn into_raw(self) -> u16 {
            self.0
        }

        pub(crate) fn from_raw(raw: u16) -> Self {
            JobId(raw)
        }

        pub fn is_null(self) -> bool {
            self == NULL_JOB_ID
        }
    }
}

pub use repr::{JobId, NULL_JOB_ID};
#[cfg(feature = "packed-ids")]
pub use repr::{MAX_POOL_SIZE, NULL_THREAD_ID};
