use std::sync::Arc;

use quorum_dkg::bls::{PublicKey, SecretKey, Signature};
use quorum_dkg::sig_batcher::{verify_signature_batch, SigVerifyBatcher, SIG_VERIFY_BATCH_SIZE};
use quorum_dkg::worker::{completion, WorkerPool};
use quorum_dkg::{BlsWorker, Hash256, WorkerConfig};
use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;

fn signed_items(n: usize, seed: u64) -> Vec<(Signature, PublicKey, Hash256)> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let sk = SecretKey::random(&mut rng);
            let mut hash = [0u8; 32];
            hash[..8].copy_from_slice(&(i as u64).to_be_bytes());
            (sk.sign(&hash), sk.public_key(), hash)
        })
        .collect()
}

#[test]
fn one_bad_signature_falls_back_to_individual_checks() {
    let mut items = signed_items(11, 1);
    let mut rng = ChaCha20Rng::seed_from_u64(99);
    let intruder = SecretKey::random(&mut rng);
    items[10].0 = intruder.sign(&items[10].2);

    let verdict = verify_signature_batch(&items);
    assert!(!verdict.aggregate_ok);
    let mut expected = vec![true; 11];
    expected[10] = false;
    assert_eq!(verdict.results, expected);

    let clean = verify_signature_batch(&items[..10]);
    assert!(clean.aggregate_ok);
    assert_eq!(clean.results, vec![true; 10]);
}

#[test]
fn batcher_reports_each_request() {
    let worker = BlsWorker::new(&WorkerConfig::with_workers(2)).expect("worker");
    let mut items = signed_items(2 * SIG_VERIFY_BATCH_SIZE + 5, 2);
    let bad = 37;
    items[bad].2[31] ^= 1;

    let handles: Vec<_> = items
        .iter()
        .map(|(sig, pk, hash)| worker.verify_sig_handle(*sig, *pk, *hash, None))
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.wait().expect("verdict"), i != bad, "item {i}");
    }
    assert!(!worker.is_async_verify_in_progress());
}

#[test]
fn batcher_is_idle_once_every_verdict_is_in() {
    let worker = BlsWorker::new(&WorkerConfig::with_workers(3)).expect("worker");
    for round in 0..50u64 {
        let items = signed_items(3, 100 + round);
        let handles: Vec<_> = items
            .iter()
            .map(|(sig, pk, hash)| worker.verify_sig_handle(*sig, *pk, *hash, None))
            .collect();
        for handle in handles {
            assert!(handle.wait().expect("verdict"));
        }
        assert!(!worker.is_async_verify_in_progress(), "round {round}");
    }
}

#[test]
fn same_hash_signatures_are_split_into_batches() {
    let pool = Arc::new(WorkerPool::new(&WorkerConfig::with_workers(1)).expect("pool"));
    let batcher = SigVerifyBatcher::new(pool);
    let mut rng = ChaCha20Rng::seed_from_u64(3);
    let hash = [5u8; 32];
    let mut handles = Vec::new();
    for _ in 0..6 {
        let sk = SecretKey::random(&mut rng);
        let (done, handle) = completion();
        batcher.submit(sk.sign(&hash), sk.public_key(), hash, done, None);
        handles.push(handle);
    }
    for handle in handles {
        assert!(handle.wait().expect("verdict"));
    }
}

#[test]
fn signature_over_other_hash_fails() {
    let worker = BlsWorker::new(&WorkerConfig::with_workers(1)).expect("worker");
    let items = signed_items(2, 4);
    let (sig, pk, _) = items[0];
    let other = items[1].2;
    assert!(!worker
        .verify_sig_handle(sig, pk, other, None)
        .wait()
        .expect("verdict"));
}
