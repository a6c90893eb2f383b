use std::sync::atomic::{AtomicUsize, Ordering};

// Default heuristic values. Can be adjusted at runtime for unusual workloads.
const DEFAULT_BIN_COUNT_LIMIT: usize = 128;
const DEFAULT_MAX_STENCIL_RADIUS: usize = 50;
const DEFAULT_PARALLEL_TASKS_PER_THREAD: usize = 64;
const DEFAULT_PROGRESS_BATCH_SIZE: usize = 1024;

static BIN_COUNT_LIMIT: AtomicUsize = AtomicUsize::new(DEFAULT_BIN_COUNT_LIMIT);
static MAX_STENCIL_RADIUS: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_STENCIL_RADIUS);
static PARALLEL_TASKS_PER_THREAD: AtomicUsize = AtomicUsize::new(DEFAULT_PARALLEL_TASKS_PER_THREAD);
static PROGRESS_BATCH_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_PROGRESS_BATCH_SIZE);

/// Upper bound on the number of grid bins along one cell axis.
pub fn get_bin_count_limit() -> usize {
    BIN_COUNT_LIMIT.load(Ordering::Relaxed)
}

pub fn set_bin_count_limit(val: usize) {
    BIN_COUNT_LIMIT.store(val.max(1), Ordering::Relaxed);
}

/// Cap on the bin-offset stencil of the cutoff finder, per axis. A periodic
/// axis needing a wider stencil than this cannot be searched.
pub fn get_max_stencil_radius() -> usize {
    MAX_STENCIL_RADIUS.load(Ordering::Relaxed)
}

pub fn set_max_stencil_radius(val: usize) {
    MAX_STENCIL_RADIUS.store(val.max(1), Ordering::Relaxed);
}

/// Number of work chunks each rayon thread should see in a parallel pass.
pub fn get_parallel_tasks_per_thread() -> usize {
    PARALLEL_TASKS_PER_THREAD.load(Ordering::Relaxed)
}

pub fn set_parallel_tasks_per_thread(val: usize) {
    PARALLEL_TASKS_PER_THREAD.store(val.max(1), Ordering::Relaxed);
}

/// Particles processed between two cancellation checks / progress updates.
pub fn get_progress_batch_size() -> usize {
    PROGRESS_BATCH_SIZE.load(Ordering::Relaxed)
}

pub fn set_progress_batch_size(val: usize) {
    PROGRESS_BATCH_SIZE.store(val.max(1), Ordering::Relaxed);
}
