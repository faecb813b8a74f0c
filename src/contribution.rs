//! Secret-key contribution generation and batched share verification.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand_core::RngCore;

use crate::aggregator::{aggregate_async, aggregate_vectors_async};
use crate::bls::{public_key_share, secret_key_share, BlsId, PublicKey, SecretKey};
use crate::types::Error;
use crate::worker::{Done, WorkerPool};

pub const CONTRIBUTION_BATCH_SIZE: usize = 8;

/// Public commitments to the coefficients of a member's secret polynomial.
pub type VerificationVector = Arc<Vec<PublicKey>>;

/// Draws a random polynomial of `threshold` coefficients and evaluates it
/// at every id.
pub fn generate_contributions<R: RngCore + ?Sized>(
    threshold: usize,
    ids: &[BlsId],
    rng: &mut R,
) -> Result<(VerificationVector, Vec<SecretKey>), Error> {
    if threshold == 0 {
        return Err(Error::InvalidParams("threshold must be positive".into()));
    }
    let coeffs: Vec<SecretKey> = (0..threshold).map(|_| SecretKey::random(rng)).collect();
    let vvec: Vec<PublicKey> = coeffs.iter().map(SecretKey::public_key).collect();
    let shares = ids
        .iter()
        .map(|id| secret_key_share(&coeffs, id).ok_or(Error::InvalidShare))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((Arc::new(vvec), shares))
}

/// `sk_share` is the evaluation at `id` of the polynomial committed to by `vvec`.
pub fn verify_contribution_share(id: &BlsId, vvec: &[PublicKey], sk_share: &SecretKey) -> bool {
    if !sk_share.is_valid() {
        return false;
    }
    match public_key_share(vvec, id) {
        Some(pk) => pk.is_valid() && pk == sk_share.public_key(),
        None => false,
    }
}

struct AggregatedBatch {
    range: Range<usize>,
    vvec: Mutex<Option<Vec<PublicKey>>>,
    sk: Mutex<Option<SecretKey>>,
    pending: AtomicUsize,
}

struct ContributionVerifier {
    pool: Arc<WorkerPool>,
    id: BlsId,
    vvecs: Vec<VerificationVector>,
    sk_shares: Vec<SecretKey>,
    parallel: bool,
    results: Mutex<Vec<bool>>,
    batch_count: usize,
    batches_done: AtomicUsize,
    done: Mutex<Option<Done<Vec<bool>>>>,
}

impl ContributionVerifier {
    fn start(self: Arc<Self>, aggregated: bool) {
        let len = self.vvecs.len();
        let batch_size = if aggregated { CONTRIBUTION_BATCH_SIZE } else { len };
        let mut start = 0;
        while start < len {
            let end = (start + batch_size).min(len);
            if aggregated && end - start > 1 {
                self.verify_aggregated(start..end);
            } else {
                self.verify_one_by_one(start..end);
            }
            start = end;
        }
    }

    fn verify_aggregated(self: &Arc<Self>, range: Range<usize>) {
        let vvecs = &self.vvecs[range.clone()];
        let width = vvecs[0].len();
        if width == 0 || vvecs.iter().any(|v| v.len() != width) {
            self.finish_batch(range, false);
            return;
        }
        // A zero share can hide inside a passing sum; judge such batches per item.
        if self.sk_shares[range.clone()].iter().any(|sk| !sk.is_valid()) {
            self.verify_one_by_one(range);
            return;
        }
        let batch = Arc::new(AggregatedBatch {
            range: range.clone(),
            vvec: Mutex::new(None),
            sk: Mutex::new(None),
            pending: AtomicUsize::new(2),
        });

        let (this, state) = (self.clone(), batch.clone());
        aggregate_vectors_async(
            &self.pool,
            vvecs,
            self.parallel,
            Box::new(move |vvec| {
                *state.vvec.lock() = vvec;
                this.aggregation_done(&state);
            }),
        );
        let (this, state) = (self.clone(), batch);
        aggregate_async(
            &self.pool,
            self.sk_shares[range].to_vec(),
            self.parallel,
            Box::new(move |sk| {
                *state.sk.lock() = sk;
                this.aggregation_done(&state);
            }),
        );
    }

    fn aggregation_done(self: &Arc<Self>, batch: &AggregatedBatch) {
        if batch.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let vvec = batch.vvec.lock().take();
        let sk = batch.sk.lock().take();
        let (vvec, sk) = match (vvec, sk) {
            (Some(vvec), Some(sk)) if !vvec.is_empty() => (vvec, sk),
            // Malformed batch input fails the whole batch.
            _ => return self.finish_batch(batch.range.clone(), false),
        };
        if verify_contribution_share(&self.id, &vvec, &sk) {
            self.finish_batch(batch.range.clone(), true);
        } else {
            self.verify_one_by_one(batch.range.clone());
        }
    }

    fn verify_one_by_one(self: &Arc<Self>, range: Range<usize>) {
        let remaining = Arc::new(AtomicUsize::new(range.len()));
        for idx in range {
            let this = self.clone();
            let remaining = remaining.clone();
            let job = move || {
                let ok = verify_contribution_share(&this.id, &this.vvecs[idx], &this.sk_shares[idx]);
                this.results.lock()[idx] = ok;
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    this.batch_done();
                }
            };
            if self.parallel {
                self.pool.spawn(job);
            } else {
                job();
            }
        }
    }

    fn finish_batch(&self, range: Range<usize>, valid: bool) {
        {
            let mut results = self.results.lock();
            for idx in range {
                results[idx] = valid;
            }
        }
        self.batch_done();
    }

    fn batch_done(&self) {
        if self.batches_done.fetch_add(1, Ordering::AcqRel) + 1 != self.batch_count {
            return;
        }
        let results = std::mem::take(&mut *self.results.lock());
        if let Some(done) = self.done.lock().take() {
            done(results);
        }
    }
}

/// Verifies `sk_shares[i]` against `vvecs[i]` for the member `id`.
///
/// With `aggregated`, items are checked in batches of
/// [`CONTRIBUTION_BATCH_SIZE`]: the batch's vvecs and shares are summed and
/// checked once, and only a failing batch is re-checked item by item. A
/// passing sum proves every item valid only if each share is the output of
/// [`secret_key_share`] for `id`, i.e. it came from decrypting a
/// contribution addressed to `id`. Callers must not feed arbitrary scalars.
pub fn verify_contribution_shares_async(
    pool: &Arc<WorkerPool>,
    id: BlsId,
    vvecs: Vec<VerificationVector>,
    sk_shares: Vec<SecretKey>,
    parallel: bool,
    aggregated: bool,
    done: Done<Vec<bool>>,
) {
    let len = vvecs.len();
    if len == 0 {
        done(Vec::new());
        return;
    }
    if sk_shares.len() != len {
        done(vec![false; len]);
        return;
    }
    let batch_size = if aggregated { CONTRIBUTION_BATCH_SIZE } else { len };
    let verifier = Arc::new(ContributionVerifier {
        pool: pool.clone(),
        id,
        vvecs,
        sk_shares,
        parallel,
        results: Mutex::new(vec![false; len]),
        batch_count: len.div_ceil(batch_size),
        batches_done: AtomicUsize::new(0),
        done: Mutex::new(Some(done)),
    });
    verifier.start(aggregated);
}
