//! Tree-structured parallel aggregation on top of [`WorkerPool`].
//!
//! A batch aggregation splits its inputs into batches of [`AGG_BATCH_SIZE`],
//! folds each batch on the pool and pushes the partial result onto a shared
//! queue. Every time the queue holds a full batch of partials, those are
//! drained and folded again as a new job. A wait counter tracks jobs in
//! flight; the job that drops it to zero folds whatever partials remain and
//! fires the completion callback.
//!
//! Job state lives in an `Arc` shared by the pool closures, so the last
//! closure to finish releases it. Inputs are copied into an `Arc<Vec<T>>`
//! up front and the caller's storage is free immediately.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bls::{Aggregatable, PublicKey};
use crate::worker::{Done, WorkerPool};

pub const AGG_BATCH_SIZE: usize = 16;

/// Folds `items` in order. `None` for empty input.
pub fn aggregate_sync<T: Aggregatable>(items: &[T]) -> Option<T> {
    let (first, rest) = items.split_first()?;
    let mut acc = first.clone();
    for item in rest {
        acc.aggregate(item);
    }
    Some(acc)
}

struct BatchAggregator<T: Aggregatable> {
    pool: Arc<WorkerPool>,
    pending: Mutex<Vec<T>>,
    wait_count: AtomicUsize,
    done: Mutex<Option<Done<Option<T>>>>,
}

impl<T: Aggregatable> BatchAggregator<T> {
    fn start(self: Arc<Self>, inputs: Arc<Vec<T>>) {
        // The extra count held here keeps early finishers from completing the
        // job before every batch has been submitted.
        self.wait_count.fetch_add(1, Ordering::AcqRel);
        let len = inputs.len();
        let mut start = 0;
        while start < len {
            let end = (start + AGG_BATCH_SIZE).min(len);
            self.clone().submit_batch(inputs.clone(), start..end);
            start = end;
        }
        self.check_done();
    }

    fn submit_batch(self: Arc<Self>, items: Arc<Vec<T>>, range: Range<usize>) {
        self.wait_count.fetch_add(1, Ordering::AcqRel);
        let pool = self.pool.clone();
        pool.spawn(move || {
            if let Some(partial) = aggregate_sync(&items[range]) {
                self.push_partial(partial);
            }
            self.check_done();
        });
    }

    fn push_partial(self: &Arc<Self>, partial: T) {
        let regroup = {
            let mut pending = self.pending.lock();
            pending.push(partial);
            if pending.len() >= AGG_BATCH_SIZE {
                Some(pending.drain(..AGG_BATCH_SIZE).collect::<Vec<T>>())
            } else {
                None
            }
        };
        if let Some(batch) = regroup {
            let len = batch.len();
            self.clone().submit_batch(Arc::new(batch), 0..len);
        }
    }

    fn check_done(&self) {
        if self.wait_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let remaining = std::mem::take(&mut *self.pending.lock());
        let result = match remaining.len() {
            0 => None,
            1 => remaining.into_iter().next(),
            _ => aggregate_sync(&remaining),
        };
        if let Some(done) = self.done.lock().take() {
            done(result);
        }
    }
}

/// Aggregates `inputs` and calls `done` exactly once with the result.
///
/// Serial mode, and single-element input, fold inline on the caller's
/// thread. `done` receives `None` only for empty input.
pub fn aggregate_async<T: Aggregatable>(
    pool: &Arc<WorkerPool>,
    inputs: Vec<T>,
    parallel: bool,
    done: Done<Option<T>>,
) {
    if inputs.is_empty() {
        done(None);
        return;
    }
    if !parallel || inputs.len() == 1 {
        done(aggregate_sync(&inputs));
        return;
    }
    let job = Arc::new(BatchAggregator {
        pool: pool.clone(),
        pending: Mutex::new(Vec::with_capacity(AGG_BATCH_SIZE)),
        wait_count: AtomicUsize::new(0),
        done: Mutex::new(Some(done)),
    });
    job.start(Arc::new(inputs));
}

struct VectorAggregator<T: Aggregatable> {
    results: Mutex<Vec<Option<T>>>,
    done_count: AtomicUsize,
    done: Mutex<Option<Done<Option<Vec<T>>>>>,
}

impl<T: Aggregatable> VectorAggregator<T> {
    fn column_done(&self, column: usize, value: Option<T>) {
        let total = {
            let mut results = self.results.lock();
            results[column] = value;
            results.len()
        };
        if self.done_count.fetch_add(1, Ordering::AcqRel) + 1 != total {
            return;
        }
        let results = std::mem::take(&mut *self.results.lock());
        let out: Option<Vec<T>> = results.into_iter().collect();
        if let Some(done) = self.done.lock().take() {
            done(out);
        }
    }
}

/// Column-wise aggregation of equally sized vectors.
///
/// # Panics
///
/// If `vectors` is empty or the vectors differ in length. Both are caller
/// bugs, never network input.
pub fn aggregate_vectors_async<T: Aggregatable>(
    pool: &Arc<WorkerPool>,
    vectors: &[Arc<Vec<T>>],
    parallel: bool,
    done: Done<Option<Vec<T>>>,
) {
    assert!(!vectors.is_empty(), "vector aggregation needs at least one vector");
    let width = vectors[0].len();
    assert!(
        vectors.iter().all(|v| v.len() == width),
        "vector aggregation needs vectors of equal length"
    );
    if width == 0 {
        done(Some(Vec::new()));
        return;
    }

    let job = Arc::new(VectorAggregator {
        results: Mutex::new(vec![None; width]),
        done_count: AtomicUsize::new(0),
        done: Mutex::new(Some(done)),
    });
    for column in 0..width {
        let items: Vec<T> = vectors.iter().map(|v| v[column].clone()).collect();
        let job = job.clone();
        aggregate_async(
            pool,
            items,
            parallel,
            Box::new(move |value| job.column_done(column, value)),
        );
    }
}

/// Checks the invariants every verification vector must hold: non-empty,
/// all entries valid and pairwise distinct.
pub fn verify_verification_vector(vvec: &[PublicKey]) -> bool {
    if vvec.is_empty() {
        return false;
    }
    let mut seen = std::collections::HashSet::with_capacity(vvec.len());
    vvec.iter()
        .all(|pk| pk.is_valid() && seen.insert(pk.content_hash()))
}

pub fn verify_verification_vectors(vvecs: &[Arc<Vec<PublicKey>>]) -> bool {
    vvecs.iter().all(|v| verify_verification_vector(v))
}

/// Validity-checking wrapper used by the typed aggregation entry points.
///
/// Empty input, an invalid element or a duplicated element yields `None`.
pub fn aggregate_checked_async<T: Aggregatable>(
    pool: &Arc<WorkerPool>,
    inputs: Vec<T>,
    parallel: bool,
    done: Done<Option<T>>,
) {
    let mut seen = std::collections::HashSet::with_capacity(inputs.len());
    let well_formed = !inputs.is_empty()
        && inputs
            .iter()
            .all(|item| item.is_valid() && seen.insert(item.content_hash()));
    if !well_formed {
        done(None);
        return;
    }
    aggregate_async(pool, inputs, parallel, done);
}
