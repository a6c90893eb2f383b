use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::config;

/// Shared handle through which a caller cancels a running computation and
/// observes its progress. Cheap to clone; all clones refer to the same flags.
#[derive(Clone, Debug, Default)]
pub struct ComputeContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug, Default)]
struct ContextInner {
    canceled: AtomicBool,
    progress: AtomicUsize,
}

impl ComputeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Workers notice at the next batch boundary.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Relaxed)
    }

    /// Number of work items finished so far (updated per batch, not per item).
    pub fn progress(&self) -> usize {
        self.inner.progress.load(Ordering::Relaxed)
    }

    pub fn add_progress(&self, amount: usize) {
        self.inner.progress.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn reset_progress(&self) {
        self.inner.progress.store(0, Ordering::Relaxed);
    }
}

/// Terminal state of a cancelable computation. Cancellation is an ordinary
/// outcome, not an error; canceled runs make no promise about partial output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Outcome::Canceled)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Canceled => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::Canceled => Outcome::Canceled,
        }
    }
}

/// Runs `f(i)` for every index in `0..n` on the rayon pool and collects the
/// results. Cancellation is polled once per batch; remaining batches turn
/// into no-ops once it fires, and the partially filled buffer is discarded.
pub fn par_map_particles<T, F>(n: usize, ctx: &ComputeContext, f: F) -> Outcome<Vec<T>>
where
    T: Clone + Default + Send,
    F: Fn(usize) -> T + Sync,
{
    let batch = config::get_progress_batch_size();
    let num_batches = n.div_ceil(batch);
    let num_threads = rayon::current_num_threads();
    let batches_per_task =
        (num_batches / (num_threads * config::get_parallel_tasks_per_thread())).max(1);

    let mut out = vec![T::default(); n];
    out.par_chunks_mut(batch)
        .enumerate()
        .with_min_len(batches_per_task)
        .for_each(|(batch_idx, chunk)| {
            if ctx.is_canceled() {
                return;
            }
            let start = batch_idx * batch;
            for (k, slot) in chunk.iter_mut().enumerate() {
                *slot = f(start + k);
            }
            ctx.add_progress(chunk.len());
        });

    if ctx.is_canceled() {
        Outcome::Canceled
    } else {
        Outcome::Completed(out)
    }
}
