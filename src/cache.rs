//! Per-session memo of quorum vvec, secret-key-share and public-key-share builds.
//!
//! Keys are derived from the member-index set the inputs were collected
//! for, so commitments that agree on `valid_members` share one build.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bls::{BlsId, PublicKey, SecretKey};
use crate::bls_worker::BlsWorker;
use crate::contribution::VerificationVector;
use crate::types::Hash256;

pub struct BlsWorkerCache {
    worker: Arc<BlsWorker>,
    vvecs: Mutex<HashMap<Hash256, VerificationVector>>,
    sk_shares: Mutex<HashMap<Hash256, SecretKey>>,
    pk_shares: Mutex<HashMap<(Hash256, [u8; 32]), PublicKey>>,
}

impl BlsWorkerCache {
    pub fn new(worker: Arc<BlsWorker>) -> Self {
        Self {
            worker,
            vvecs: Mutex::new(HashMap::new()),
            sk_shares: Mutex::new(HashMap::new()),
            pk_shares: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_key(member_indexes: &[usize]) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"quorum-dkg/cache-key");
        for idx in member_indexes {
            hasher.update(&(*idx as u32).to_be_bytes());
        }
        *hasher.finalize().as_bytes()
    }

    pub fn build_quorum_verification_vector(
        &self,
        key: Hash256,
        vvecs: &[VerificationVector],
        parallel: bool,
    ) -> Option<VerificationVector> {
        if let Some(hit) = self.vvecs.lock().get(&key) {
            return Some(hit.clone());
        }
        let built = self.worker.build_quorum_verification_vector(vvecs, parallel)?;
        self.vvecs.lock().insert(key, built.clone());
        Some(built)
    }

    pub fn aggregate_secret_keys(
        &self,
        key: Hash256,
        sks: Vec<SecretKey>,
        parallel: bool,
    ) -> Option<SecretKey> {
        if let Some(hit) = self.sk_shares.lock().get(&key) {
            return Some(*hit);
        }
        let built = self.worker.aggregate_secret_keys(sks, parallel)?;
        self.sk_shares.lock().insert(key, built);
        Some(built)
    }

    /// Public key share of `id` under the vvec cached as `key`.
    pub fn build_pub_key_share(
        &self,
        key: Hash256,
        vvec: &[PublicKey],
        id: &BlsId,
    ) -> Option<PublicKey> {
        let slot = (key, id.scalar().to_bytes_be());
        if let Some(hit) = self.pk_shares.lock().get(&slot) {
            return Some(*hit);
        }
        let built = self.worker.build_pub_key_share(vvec, id)?;
        self.pk_shares.lock().insert(slot, built);
        Some(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::BlsId;
    use crate::config::WorkerConfig;

    #[test]
    fn cached_build_is_reused() {
        let worker = Arc::new(BlsWorker::new(&WorkerConfig::with_workers(1)).expect("worker"));
        let cache = BlsWorkerCache::new(worker.clone());
        let ids = [BlsId::from_member_id(&[1; 32])];
        let (a, _) = worker.generate_contributions(2, &ids).expect("a");
        let (b, _) = worker.generate_contributions(2, &ids).expect("b");
        let key = BlsWorkerCache::cache_key(&[0, 1]);
        let first = cache
            .build_quorum_verification_vector(key, &[a.clone(), b], false)
            .expect("build");
        // Different inputs under the same key return the memoized value.
        let second = cache
            .build_quorum_verification_vector(key, &[a], false)
            .expect("hit");
        assert!(Arc::ptr_eq(&first, &second));
        assert_ne!(BlsWorkerCache::cache_key(&[0, 1]), BlsWorkerCache::cache_key(&[1, 0]));
    }

    #[test]
    fn public_key_shares_are_kept_per_member() {
        let worker = Arc::new(BlsWorker::new(&WorkerConfig::with_workers(1)).expect("worker"));
        let cache = BlsWorkerCache::new(worker.clone());
        let ids = [BlsId::from_member_id(&[1; 32]), BlsId::from_member_id(&[2; 32])];
        let (vvec, sks) = worker.generate_contributions(3, &ids).expect("contribution");
        let (other, _) = worker.generate_contributions(3, &ids).expect("other");
        let key = BlsWorkerCache::cache_key(&[0]);

        let first = cache.build_pub_key_share(key, &vvec, &ids[0]).expect("share");
        assert_eq!(first, sks[0].public_key());
        let second = cache.build_pub_key_share(key, &vvec, &ids[1]).expect("share");
        assert_eq!(second, sks[1].public_key());
        // Same key and member hit the memo even for another vvec.
        assert_eq!(cache.build_pub_key_share(key, &other, &ids[0]), Some(first));
    }
}
