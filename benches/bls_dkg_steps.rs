use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use quorum_dkg::bls::{BlsId, PublicKey, SecretKey};
use quorum_dkg::contribution::VerificationVector;
use quorum_dkg::provider::{
    AllConnected, LocalOperatorKey, MemoryContributionStore, NoFaults, OperatorKey, RosterEntry,
    StaticRoster,
};
use quorum_dkg::sig_batcher::verify_signature_batch;
use quorum_dkg::transport::InMemoryRelay;
use quorum_dkg::{
    BlsWorker, DkgSession, QuorumParams, SessionConfig, SessionContext, SessionHandler,
    WorkerConfig,
};
use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;
use std::sync::Arc;
use std::time::Duration;

fn ids(n: usize) -> Vec<BlsId> {
    (0..n)
        .map(|i| {
            let mut member_id = [0u8; 32];
            member_id[..8].copy_from_slice(&(i as u64 + 1).to_be_bytes());
            BlsId::from_member_id(&member_id)
        })
        .collect()
}

fn contributions(
    worker: &BlsWorker,
    n: usize,
    threshold: usize,
) -> (Vec<VerificationVector>, Vec<SecretKey>) {
    let ids = ids(n);
    let mut vvecs = Vec::with_capacity(n);
    let mut shares = Vec::with_capacity(n);
    for _ in 0..n {
        let (vvec, sks) = worker
            .generate_contributions(threshold, &ids)
            .expect("contributions");
        vvecs.push(vvec);
        shares.push(sks[0]);
    }
    (vvecs, shares)
}

struct BenchNode {
    session: DkgSession,
    handler: SessionHandler,
    relay: Arc<InMemoryRelay>,
}

fn network(params: &QuorumParams, worker: &Arc<BlsWorker>) -> Vec<BenchNode> {
    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let keys: Vec<SecretKey> = (0..params.size)
        .map(|_| SecretKey::random(&mut rng))
        .collect();
    let entries: Vec<RosterEntry> = keys
        .iter()
        .enumerate()
        .map(|(i, sk)| {
            let mut member_id = [0u8; 32];
            member_id[..8].copy_from_slice(&(i as u64 + 1).to_be_bytes());
            RosterEntry {
                member_id,
                operator_key: sk.public_key(),
            }
        })
        .collect();
    let roster = Arc::new(StaticRoster {
        entries: entries.clone(),
    });
    let config = SessionConfig::default();
    keys.into_iter()
        .zip(entries)
        .map(|(sk, entry)| {
            let relay = Arc::new(InMemoryRelay::new());
            let ctx = SessionContext {
                worker: worker.clone(),
                roster: roster.clone(),
                store: Arc::new(MemoryContributionStore::new()),
                relay: relay.clone(),
                operator: Some(Arc::new(LocalOperatorKey::new(sk)) as Arc<dyn OperatorKey>),
                faults: Arc::new(NoFaults),
                connectivity: Arc::new(AllConnected),
            };
            let session = DkgSession::init(
                params.clone(),
                [1; 32],
                0,
                Some(entry.member_id),
                ctx,
                config.clone(),
            )
            .expect("session");
            let handler = SessionHandler::new(worker.clone(), relay.clone(), &config);
            BenchNode {
                session,
                handler,
                relay,
            }
        })
        .collect()
}

fn exchange(nodes: &mut [BenchNode]) {
    let mut outgoing = Vec::new();
    for (from, node) in nodes.iter().enumerate() {
        for (_, msg) in node.relay.take_outbox() {
            outgoing.push((from, msg));
        }
    }
    for (from, msg) in outgoing {
        for (to, node) in nodes.iter_mut().enumerate() {
            let peer = (to != from).then_some(from as u64);
            node.handler.push_pending(peer, msg.clone());
        }
    }
    for node in nodes.iter_mut() {
        node.handler.process_pending(&mut node.session);
    }
}

fn run_round(nodes: &mut [BenchNode]) -> usize {
    for step in [
        DkgSession::contribute,
        DkgSession::verify_and_complain,
        DkgSession::verify_and_justify,
        DkgSession::verify_and_commit,
    ] {
        for node in nodes.iter_mut() {
            step(&mut node.session).expect("phase");
        }
        exchange(nodes);
    }
    nodes
        .iter_mut()
        .map(|node| node.session.finalize_commitments().expect("finalize").len())
        .sum()
}

fn bench_bls_dkg_steps(c: &mut Criterion) {
    let worker = Arc::new(BlsWorker::new(&WorkerConfig::half_of_hardware()).expect("worker"));

    let mut group = c.benchmark_group("bls_worker");
    group.sample_size(10);
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(2));

    let mut rng = ChaCha20Rng::seed_from_u64(1);
    let pks: Vec<PublicKey> = (0..400)
        .map(|_| SecretKey::random(&mut rng).public_key())
        .collect();
    for parallel in [false, true] {
        group.bench_function(format!("aggregate_400_pks_parallel_{parallel}"), |b| {
            b.iter(|| worker.aggregate_public_keys(pks.clone(), parallel));
        });
    }

    let (vvecs, shares) = contributions(&worker, 50, 30);
    group.bench_function("quorum_vvec_50x30", |b| {
        b.iter(|| worker.build_quorum_verification_vector(&vvecs, true));
    });
    for aggregated in [false, true] {
        group.bench_function(format!("verify_50_shares_aggregated_{aggregated}"), |b| {
            b.iter(|| {
                worker.verify_contribution_shares(
                    ids(1)[0],
                    vvecs.clone(),
                    shares.clone(),
                    true,
                    aggregated,
                )
            });
        });
    }

    let items: Vec<_> = (0..32u8)
        .map(|i| {
            let sk = SecretKey::random(&mut rng);
            let hash = [i; 32];
            (sk.sign(&hash), sk.public_key(), hash)
        })
        .collect();
    group.bench_function("signature_batch_32", |b| {
        b.iter(|| verify_signature_batch(&items));
    });
    group.finish();

    let mut group = c.benchmark_group("dkg_round");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));
    let params = QuorumParams::llmq_devnet();
    group.bench_function("llmq_devnet_full_round", |b| {
        b.iter_batched(
            || network(&params, &worker),
            |mut nodes| run_round(&mut nodes),
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_bls_dkg_steps);
criterion_main!(benches);
