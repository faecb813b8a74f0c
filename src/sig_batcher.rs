//! Opportunistic batching of signature verifications.
//!
//! Requests queue up while a batch is in flight. A batch is checked with a
//! single aggregated pairing equation; when that fails, every item is
//! verified on its own since the aggregate cannot tell which one is bad.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::bls::{PublicKey, Signature};
use crate::types::Hash256;
use crate::worker::{Done, WorkerPool};

pub const SIG_VERIFY_BATCH_SIZE: usize = 32;

/// Returns true once the requester no longer wants the result.
pub type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

struct SigVerifyJob {
    sig: Signature,
    pk: PublicKey,
    hash: Hash256,
    done: Done<bool>,
    cancel: Option<CancelCheck>,
}

impl SigVerifyJob {
    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c())
    }
}

/// Verdicts for one batch of (signature, key, hash) items.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchVerdict {
    pub aggregate_ok: bool,
    pub results: Vec<bool>,
}

/// Aggregated check with per-item fallback.
pub fn verify_signature_batch(items: &[(Signature, PublicKey, Hash256)]) -> BatchVerdict {
    if items.len() == 1 {
        let (sig, pk, hash) = &items[0];
        let ok = sig.verify(pk, hash);
        return BatchVerdict {
            aggregate_ok: ok,
            results: vec![ok],
        };
    }
    let sigs: Vec<Signature> = items.iter().map(|(sig, _, _)| *sig).collect();
    let agg = Signature::aggregate_insecure(&sigs);
    let pks: Vec<PublicKey> = items.iter().map(|(_, pk, _)| *pk).collect();
    let hashes: Vec<Hash256> = items.iter().map(|(_, _, h)| *h).collect();
    if !items.is_empty() && agg.verify_aggregated(&pks, &hashes) {
        return BatchVerdict {
            aggregate_ok: true,
            results: vec![true; items.len()],
        };
    }
    BatchVerdict {
        aggregate_ok: false,
        results: items
            .iter()
            .map(|(sig, pk, hash)| sig.verify(pk, hash))
            .collect(),
    }
}

#[derive(Default)]
struct BatcherState {
    queue: Vec<SigVerifyJob>,
    in_progress: usize,
}

pub struct SigVerifyBatcher {
    pool: Arc<WorkerPool>,
    state: Mutex<BatcherState>,
}

impl SigVerifyBatcher {
    pub fn new(pool: Arc<WorkerPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            state: Mutex::new(BatcherState::default()),
        })
    }

    /// Queues a verification. `done` is never called for a request whose
    /// `cancel` check fires before its batch runs.
    pub fn submit(
        self: &Arc<Self>,
        sig: Signature,
        pk: PublicKey,
        hash: Hash256,
        done: Done<bool>,
        cancel: Option<CancelCheck>,
    ) {
        if !sig.is_valid() || !pk.is_valid() {
            done(false);
            return;
        }
        let mut state = self.state.lock();
        // Two signatures over one hash cannot share an aggregate.
        if state.queue.iter().any(|job| job.hash == hash) {
            self.push_batch(&mut state);
        }
        state.queue.push(SigVerifyJob {
            sig,
            pk,
            hash,
            done,
            cancel,
        });
        if state.in_progress == 0 || state.queue.len() >= SIG_VERIFY_BATCH_SIZE {
            self.push_batch(&mut state);
        }
    }

    /// True while requests are queued or a batch is running.
    pub fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state.in_progress > 0 || !state.queue.is_empty()
    }

    fn push_batch(self: &Arc<Self>, state: &mut BatcherState) {
        if state.queue.is_empty() {
            return;
        }
        let jobs = std::mem::take(&mut state.queue);
        state.in_progress += 1;
        let this = self.clone();
        let accepted = self.pool.spawn(move || {
            let verdicts = run_batch(jobs);
            {
                let mut state = this.state.lock();
                state.in_progress -= 1;
                if !state.queue.is_empty() {
                    this.push_batch(&mut state);
                }
            }
            // Requesters only hear back once the batch no longer counts as running.
            for (done, ok) in verdicts {
                done(ok);
            }
        });
        if !accepted {
            // The dropped jobs take their callbacks with them.
            state.in_progress -= 1;
        }
    }
}

fn run_batch(jobs: Vec<SigVerifyJob>) -> Vec<(Done<bool>, bool)> {
    let live: Vec<SigVerifyJob> = jobs.into_iter().filter(|job| !job.cancelled()).collect();
    if live.is_empty() {
        return Vec::new();
    }
    let items: Vec<(Signature, PublicKey, Hash256)> =
        live.iter().map(|job| (job.sig, job.pk, job.hash)).collect();
    let verdict = verify_signature_batch(&items);
    trace!(
        batch = items.len(),
        aggregate_ok = verdict.aggregate_ok,
        "verified signature batch"
    );
    live.into_iter()
        .map(|job| job.done)
        .zip(verdict.results)
        .collect()
}
