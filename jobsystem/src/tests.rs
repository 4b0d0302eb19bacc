use crate::{parallel_for, CountSplitter, JobId, JobSystem, JobSystemConfig};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

fn ptr_to_bytes<T>(value: &T) -> [u8; 8] {
    (value as *const T as usize).to_ne_bytes()
}

unsafe fn bytes_to_ref<'a, T>(data: *const u8) -> &'a T {
    let addr = usize::from_ne_bytes(*(data.cast::<[u8; 8]>()));
    &*(addr as *const T)
}

fn empty_job(_id: JobId, _data: *const u8) {}

fn increment_job(_id: JobId, data: *const u8) {
    let counter: &AtomicU32 = unsafe { bytes_to_ref(data) };
    counter.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn s1_empty_root_finishes_immediately() {
    let system = JobSystem::with_config(JobSystemConfig {
        num_threads: 2,
        ..Default::default()
    });
    let job = system.create_job(empty_job);
    system.run(job);
    system.wait(job);
    assert_eq!(system.unfinished_jobs(job), 0);
}

#[test]
fn s2_fan_out_256_children() {
    let system = JobSystem::with_config(JobSystemConfig {
        num_threads: 4,
        ..Default::default()
    });
    let counter = AtomicU32::new(0);

    let parent = system.create_job(empty_job);
    for _ in 0..256 {
        let child = system.create_job_as_child_with_data(parent, increment_job, &ptr_to_bytes(&counter));
        system.run(child);
    }
    system.run(parent);
    system.wait(parent);

    assert_eq!(counter.load(Ordering::SeqCst), 256);
}

fn sum_chunk(chunk: &mut [u64]) {
    for v in chunk {
        // Mark each element as visited by doubling it; the test verifies
        // every element was reached exactly once.
        *v *= 2;
    }
}

#[test]
fn s3_parallel_for_covers_every_element_exactly_once() {
    let system = JobSystem::with_config(JobSystemConfig {
        num_threads: 4,
        ..Default::default()
    });
    crate::initialize_global(system);

    let mut data: Vec<u64> = (0..4096).collect();
    let expected_sum: u64 = data.iter().map(|v| v * 2).sum();

    parallel_for(&mut data, sum_chunk, CountSplitter::new(128));

    let total: u64 = data.iter().sum();
    assert_eq!(total, expected_sum);
}

#[test]
fn s4_continuation_capacity_rejects_the_seventh() {
    let system = JobSystem::with_config(JobSystemConfig {
        num_threads: 2,
        ..Default::default()
    });
    let counter = AtomicU32::new(0);

    let ancestor = system.create_job(empty_job);
    let continuations: Vec<JobId> = (0..7)
        .map(|_| system.create_job_with_data(increment_job, &ptr_to_bytes(&counter)))
        .collect();

    let mut accepted = 0;
    for &continuation in &continuations {
        if system.add_continuation(ancestor, continuation) {
            accepted += 1;
        }
    }

    assert_eq!(accepted, 6, "only 6 continuations should be accepted");

    system.run(ancestor);
    system.wait(ancestor);
    for &continuation in continuations.iter().take(6) {
        system.wait(continuation);
    }

    assert_eq!(counter.load(Ordering::SeqCst), 6);
}

/// Builds a three-level, 10-wide job tree under `parent`. Only the leaves
/// (the third level) increment `counter`; the two levels above them are
/// purely structural, so the final count is exactly 10*10*10.
fn build_graph_level(counter: &Arc<AtomicU32>, system: &JobSystem, parent: JobId, levels_remaining: usize) {
    for _ in 0..10 {
        if levels_remaining == 1 {
            let leaf = system.create_job_as_child_with_data(
                parent,
                increment_job,
                &ptr_to_bytes(counter.as_ref()),
            );
            system.run(leaf);
        } else {
            let child = system.create_job_as_child(parent, empty_job);
            system.run(child);
            build_graph_level(counter, system, child, levels_remaining - 1);
        }
    }
}

#[test]
fn s5_three_level_ten_by_ten_by_ten_graph() {
    let system = JobSystem::with_config(JobSystemConfig {
        num_threads: 4,
        ..Default::default()
    });
    let counter = Arc::new(AtomicU32::new(0));

    let root = system.create_job(empty_job);
    build_graph_level(&counter, &system, root, 3);
    system.run(root);
    system.wait(root);

    assert_eq!(counter.load(Ordering::SeqCst), 1000);
}

/// Tracks both the total number of jobs executed and, per worker thread,
/// how many of them it executed — so a test can assert stealing actually
/// spreads work across workers, not just that the total count is right.
struct StealStats {
    counter: AtomicU64,
    per_thread: [AtomicU32; 4],
}

fn increment_stats_job(_id: JobId, data: *const u8) {
    let stats: &StealStats = unsafe { bytes_to_ref(data) };
    stats.counter.fetch_add(1, Ordering::SeqCst);
    let thread_id = crate::worker::current_thread_id() as usize;
    if let Some(slot) = stats.per_thread.get(thread_id) {
        slot.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn s6_stealing_drains_1024_independent_jobs_with_four_threads() {
    let system = JobSystem::with_config(JobSystemConfig {
        num_threads: 4,
        ..Default::default()
    });
    let stats = Arc::new(StealStats {
        counter: AtomicU64::new(0),
        per_thread: [
            AtomicU32::new(0),
            AtomicU32::new(0),
            AtomicU32::new(0),
            AtomicU32::new(0),
        ],
    });

    let root = system.create_job(empty_job);
    let mut jobs = Vec::with_capacity(1024);
    for _ in 0..1024 {
        let job = system.create_job_as_child_with_data(root, increment_stats_job, &ptr_to_bytes(stats.as_ref()));
        system.run(job);
        jobs.push(job);
    }
    system.run(root);
    system.wait(root);

    assert_eq!(stats.counter.load(Ordering::SeqCst), 1024);
    for job in jobs {
        assert_eq!(system.unfinished_jobs(job), 0);
    }

    for (thread_id, count) in stats.per_thread.iter().enumerate() {
        assert!(
            count.load(Ordering::SeqCst) > 0,
            "worker thread {} never executed a job; stealing did not reach it",
            thread_id
        );
    }
}
