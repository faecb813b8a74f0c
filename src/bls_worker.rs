//! Facade over the worker pool for all bulk BLS operations.
//!
//! Every operation comes in an asynchronous flavour taking a [`Done`]
//! callback and a blocking flavour built on [`completion`] handles. The
//! blocking calls must be made from outside the pool.

use std::sync::Arc;

use rand_core::OsRng;

use crate::aggregator::{
    aggregate_checked_async, aggregate_vectors_async, verify_verification_vector,
    verify_verification_vectors,
};
use crate::bls::{public_key_share, BlsId, PublicKey, SecretKey, Signature};
use crate::config::WorkerConfig;
use crate::contribution::{
    generate_contributions, verify_contribution_share, verify_contribution_shares_async,
    VerificationVector,
};
use crate::sig_batcher::{CancelCheck, SigVerifyBatcher};
use crate::types::{Error, Hash256};
use crate::worker::{completion, Done, StopMode, WorkHandle, WorkerPool};

pub struct BlsWorker {
    pool: Arc<WorkerPool>,
    sig_batcher: Arc<SigVerifyBatcher>,
}

impl BlsWorker {
    pub fn new(config: &WorkerConfig) -> Result<Self, Error> {
        let pool = Arc::new(WorkerPool::new(config)?);
        let sig_batcher = SigVerifyBatcher::new(pool.clone());
        Ok(Self { pool, sig_batcher })
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn stop(&self, mode: StopMode) {
        self.pool.stop(mode);
    }

    /// Fresh polynomial of `threshold` coefficients evaluated at `ids`.
    pub fn generate_contributions(
        &self,
        threshold: usize,
        ids: &[BlsId],
    ) -> Result<(VerificationVector, Vec<SecretKey>), Error> {
        generate_contributions(threshold, ids, &mut OsRng)
    }

    pub fn async_build_quorum_verification_vector(
        &self,
        vvecs: &[VerificationVector],
        parallel: bool,
        done: Done<Option<VerificationVector>>,
    ) {
        let width = match vvecs.first() {
            Some(v) => v.len(),
            None => return done(None),
        };
        if width == 0 || vvecs.iter().any(|v| v.len() != width) {
            return done(None);
        }
        aggregate_vectors_async(
            &self.pool,
            vvecs,
            parallel,
            Box::new(move |vvec| done(vvec.map(Arc::new))),
        );
    }

    /// Column-wise sum of the members' verification vectors.
    pub fn build_quorum_verification_vector(
        &self,
        vvecs: &[VerificationVector],
        parallel: bool,
    ) -> Option<VerificationVector> {
        let (done, handle) = completion();
        self.async_build_quorum_verification_vector(vvecs, parallel, done);
        handle.wait().ok().flatten()
    }

    pub fn async_aggregate_secret_keys(
        &self,
        sks: Vec<SecretKey>,
        parallel: bool,
        done: Done<Option<SecretKey>>,
    ) {
        aggregate_checked_async(&self.pool, sks, parallel, done);
    }

    pub fn aggregate_secret_keys(&self, sks: Vec<SecretKey>, parallel: bool) -> Option<SecretKey> {
        let (done, handle) = completion();
        self.async_aggregate_secret_keys(sks, parallel, done);
        handle.wait().ok().flatten()
    }

    pub fn async_aggregate_public_keys(
        &self,
        pks: Vec<PublicKey>,
        parallel: bool,
        done: Done<Option<PublicKey>>,
    ) {
        aggregate_checked_async(&self.pool, pks, parallel, done);
    }

    pub fn aggregate_public_keys(&self, pks: Vec<PublicKey>, parallel: bool) -> Option<PublicKey> {
        let (done, handle) = completion();
        self.async_aggregate_public_keys(pks, parallel, done);
        handle.wait().ok().flatten()
    }

    pub fn async_aggregate_sigs(
        &self,
        sigs: Vec<Signature>,
        parallel: bool,
        done: Done<Option<Signature>>,
    ) {
        aggregate_checked_async(&self.pool, sigs, parallel, done);
    }

    pub fn aggregate_sigs(&self, sigs: Vec<Signature>, parallel: bool) -> Option<Signature> {
        let (done, handle) = completion();
        self.async_aggregate_sigs(sigs, parallel, done);
        handle.wait().ok().flatten()
    }

    pub fn build_pub_key_share(&self, vvec: &[PublicKey], id: &BlsId) -> Option<PublicKey> {
        public_key_share(vvec, id)
    }

    /// See [`verify_contribution_shares_async`] for the batching precondition.
    pub fn async_verify_contribution_shares(
        &self,
        id: BlsId,
        vvecs: Vec<VerificationVector>,
        sk_shares: Vec<SecretKey>,
        parallel: bool,
        aggregated: bool,
        done: Done<Vec<bool>>,
    ) {
        verify_contribution_shares_async(
            &self.pool, id, vvecs, sk_shares, parallel, aggregated, done,
        );
    }

    /// Blocking form; a stopped pool reports every item as invalid.
    pub fn verify_contribution_shares(
        &self,
        id: BlsId,
        vvecs: Vec<VerificationVector>,
        sk_shares: Vec<SecretKey>,
        parallel: bool,
        aggregated: bool,
    ) -> Vec<bool> {
        let len = vvecs.len();
        let (done, handle) = completion();
        self.async_verify_contribution_shares(id, vvecs, sk_shares, parallel, aggregated, done);
        handle.wait().unwrap_or_else(|_| vec![false; len])
    }

    pub fn async_verify_contribution_share(
        &self,
        id: BlsId,
        vvec: VerificationVector,
        sk_share: SecretKey,
    ) -> WorkHandle<bool> {
        self.pool
            .submit(move || verify_contribution_share(&id, &vvec, &sk_share))
    }

    pub fn verify_verification_vector(&self, vvec: &[PublicKey]) -> bool {
        verify_verification_vector(vvec)
    }

    pub fn verify_verification_vectors(&self, vvecs: &[VerificationVector]) -> bool {
        verify_verification_vectors(vvecs)
    }

    pub fn async_sign(&self, sk: SecretKey, hash: Hash256, done: Done<Signature>) {
        self.pool.spawn(move || done(sk.sign(&hash)));
    }

    pub fn async_verify_sig(
        &self,
        sig: Signature,
        pk: PublicKey,
        hash: Hash256,
        done: Done<bool>,
        cancel: Option<CancelCheck>,
    ) {
        self.sig_batcher.submit(sig, pk, hash, done, cancel);
    }

    pub fn verify_sig_handle(
        &self,
        sig: Signature,
        pk: PublicKey,
        hash: Hash256,
        cancel: Option<CancelCheck>,
    ) -> WorkHandle<bool> {
        let (done, handle) = completion();
        self.async_verify_sig(sig, pk, hash, done, cancel);
        handle
    }

    pub fn is_async_verify_in_progress(&self) -> bool {
        self.sig_batcher.is_busy()
    }
}
